//! PostgreSQL store tests. They need a database reachable through
//! `DATABASE_URL`; run them with `cargo test -- --ignored`.

use chrono::{NaiveDate, NaiveDateTime};
use grader_etl::db::PgStore;
use grader_etl::metrics::Metric;
use grader_etl::models::{Correctness, ValidatedAttempt};
use grader_etl::store::{AttemptStore, StoreError, TableName};
use sqlx::PgPool;

async fn store(pool: &PgPool) -> PgStore {
    let conn = pool.acquire().await.unwrap().detach();
    let mut store = PgStore::from_connection(conn, TableName::new("grader").unwrap());
    store.ensure_schema().await.unwrap();
    store
}

fn at(day: u32, second: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, day)
        .unwrap()
        .and_hms_micro_opt(10, 0, second, 250_000)
        .unwrap()
}

fn attempt(user: &str, created_at: NaiveDateTime, kind: &str, ok: Option<Correctness>) -> ValidatedAttempt {
    ValidatedAttempt {
        user_id: user.into(),
        oauth_consumer_key: Some(String::new()),
        lis_result_sourcedid: "course-v1:1".into(),
        lis_outcome_service_url: "https://lms.example/grade".into(),
        is_correct: ok,
        attempt_type: kind.into(),
        created_at,
    }
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_schema_setup_is_idempotent(pool: PgPool) {
    let mut store = store(&pool).await;
    store.ensure_schema().await.unwrap();

    let index: (String,) = sqlx::query_as(
        "SELECT indexdef FROM pg_indexes WHERE indexname = 'grader_user_created_idx'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(index.0.contains("UNIQUE"));
    store.close().await;
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_duplicate_pair_in_batch_yields_one_row(pool: PgPool) {
    let mut store = store(&pool).await;
    let a = attempt("u1", at(1, 1), "submit", Some(Correctness::Correct));
    let report = store.replace_batch(&[a.clone(), a]).await.unwrap();
    assert_eq!((report.inserted, report.duplicates), (1, 1));
    assert_eq!(store.rows().await.unwrap().len(), 1);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_correctness_persists_as_nullable_boolean(pool: PgPool) {
    let mut store = store(&pool).await;
    store
        .replace_batch(&[
            attempt("u1", at(1, 1), "submit", Some(Correctness::Correct)),
            attempt("u1", at(1, 2), "submit", Some(Correctness::Incorrect)),
            attempt("u1", at(1, 3), "run", None),
        ])
        .await
        .unwrap();
    let rows = store.rows().await.unwrap();
    let flags: Vec<_> = rows.iter().map(|r| r.is_correct).collect();
    assert_eq!(flags, vec![Some(true), Some(false), None]);
    assert_eq!(rows[0].created_at, at(1, 1));
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_second_load_replaces_first(pool: PgPool) {
    let mut store = store(&pool).await;
    store
        .replace_batch(&[attempt("u1", at(1, 1), "submit", None), attempt("u2", at(1, 2), "run", None)])
        .await
        .unwrap();
    store.replace_batch(&[attempt("u3", at(2, 1), "run", None)]).await.unwrap();

    let users: Vec<_> = store.rows().await.unwrap().into_iter().map(|r| r.user_id).collect();
    assert_eq!(users, vec!["u3"]);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_failed_load_keeps_previous_batch(pool: PgPool) {
    let mut store = store(&pool).await;
    store.replace_batch(&[attempt("u1", at(1, 1), "submit", None)]).await.unwrap();

    let too_long = "x".repeat(300);
    let err = store
        .replace_batch(&[attempt("u2", at(2, 1), "run", None), attempt(&too_long, at(2, 2), "run", None)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Load { .. }));

    let users: Vec<_> = store.rows().await.unwrap().into_iter().map(|r| r.user_id).collect();
    assert_eq!(users, vec!["u1"]);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_metrics_on_empty_table_are_zero(pool: PgPool) {
    let mut store = store(&pool).await;
    let metrics = store.daily_metrics().await.unwrap();
    let values: Vec<_> = metrics.iter().map(|m| (m.metric, m.value)).collect();
    assert_eq!(
        values,
        vec![
            (Metric::SubmitAttempts, 0),
            (Metric::SuccessfulSubmits, 0),
            (Metric::DistinctUsers, 0),
        ]
    );
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_metrics_over_loaded_batch(pool: PgPool) {
    let mut store = store(&pool).await;
    store
        .replace_batch(&[
            attempt("u1", at(1, 1), "submit", Some(Correctness::Correct)),
            attempt("u1", at(1, 2), "submit", Some(Correctness::Incorrect)),
            attempt("u2", at(1, 3), "run", Some(Correctness::Correct)),
            attempt("u3", at(1, 4), "submit", None),
        ])
        .await
        .unwrap();
    let values: Vec<_> = store
        .daily_metrics()
        .await
        .unwrap()
        .iter()
        .map(|m| m.value)
        .collect();
    assert_eq!(values, vec![3, 1, 3]);
}

#[sqlx::test(migrations = false)]
#[ignore = "requires DATABASE_URL"]
async fn test_closed_store_is_not_connected(pool: PgPool) {
    let mut store = store(&pool).await;
    store.close().await;
    store.close().await;
    assert!(matches!(store.daily_metrics().await, Err(StoreError::NotConnected)));
}
