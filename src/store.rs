use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::metrics::{Metric, MetricRow, SUBMIT};
use crate::models::{StoredAttempt, ValidatedAttempt};

pub const DEFAULT_TABLE: &str = "grader";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database connection is not available")]
    NotConnected,
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("schema setup for table {table} failed: {source}")]
    Schema { table: String, source: sqlx::Error },
    #[error("load into table {table} failed: {source}")]
    Load { table: String, source: sqlx::Error },
    #[error("aggregation over table {table} failed: {source}")]
    Aggregate { table: String, source: sqlx::Error },
    #[error("query on table {table} failed: {source}")]
    Query { table: String, source: sqlx::Error },
}

/// A table name usable verbatim in SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: &str) -> Result<Self, StoreError> {
        let mut chars = name.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if head_ok && tail_ok && name.len() <= 63 {
            Ok(Self(name.to_string()))
        } else {
            Err(StoreError::InvalidTable(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TableName {
    fn default() -> Self {
        Self(DEFAULT_TABLE.to_string())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    /// Rows skipped because their (user_id, created_at) was already in the batch.
    pub duplicates: usize,
}

/// Storage for the latest day's attempts.
///
/// `replace_batch` must leave the table holding exactly the given batch
/// (deduplicated on user and creation time), or untouched on failure.
#[async_trait]
pub trait AttemptStore: Send {
    fn table(&self) -> &TableName;
    async fn ensure_schema(&mut self) -> Result<(), StoreError>;
    async fn replace_batch(&mut self, batch: &[ValidatedAttempt]) -> Result<LoadReport, StoreError>;
    async fn daily_metrics(&mut self) -> Result<Vec<MetricRow>, StoreError>;
    async fn rows(&mut self) -> Result<Vec<StoredAttempt>, StoreError>;
    /// Release the underlying connection. Safe to call more than once.
    async fn close(&mut self);
}

/// In-process store with the same replace and dedupe semantics.
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: TableName,
    rows: Vec<StoredAttempt>,
    next_id: i32,
    schema_ready: bool,
    closed: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::NotConnected)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    fn table(&self) -> &TableName {
        &self.table
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        self.check_open()?;
        self.schema_ready = true;
        Ok(())
    }

    async fn replace_batch(&mut self, batch: &[ValidatedAttempt]) -> Result<LoadReport, StoreError> {
        self.check_open()?;
        let mut seen: HashSet<(&str, NaiveDateTime)> = HashSet::new();
        let mut rows = Vec::with_capacity(batch.len());
        let mut report = LoadReport::default();
        for attempt in batch {
            if !seen.insert(attempt.natural_key()) {
                report.duplicates += 1;
                continue;
            }
            self.next_id += 1;
            rows.push(StoredAttempt::from_validated(self.next_id, attempt));
            report.inserted += 1;
        }
        self.rows = rows;
        Ok(report)
    }

    async fn daily_metrics(&mut self) -> Result<Vec<MetricRow>, StoreError> {
        self.check_open()?;
        let submits = self.rows.iter().filter(|r| r.attempt_type == SUBMIT);
        let (total, successful) = submits.fold((0, 0), |(t, s), r| {
            (t + 1, s + i64::from(r.is_correct == Some(true)))
        });
        let users: HashSet<&str> = self.rows.iter().map(|r| r.user_id.as_str()).collect();
        Ok(vec![
            MetricRow { metric: Metric::SubmitAttempts, value: total },
            MetricRow { metric: Metric::SuccessfulSubmits, value: successful },
            MetricRow { metric: Metric::DistinctUsers, value: users.len() as i64 },
        ])
    }

    async fn rows(&mut self) -> Result<Vec<StoredAttempt>, StoreError> {
        self.check_open()?;
        Ok(self.rows.clone())
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Correctness;
    use chrono::NaiveDate;

    fn attempt(user: &str, second: u32, kind: &str, ok: Option<Correctness>) -> ValidatedAttempt {
        ValidatedAttempt {
            user_id: user.into(),
            oauth_consumer_key: Some(String::new()),
            lis_result_sourcedid: "src".into(),
            lis_outcome_service_url: "https://lms.example".into(),
            is_correct: ok,
            attempt_type: kind.into(),
            created_at: NaiveDate::from_ymd_opt(2024, 5, 1)
                .unwrap()
                .and_hms_opt(10, 0, second)
                .unwrap(),
        }
    }

    #[test]
    fn test_table_name_validation() {
        assert!(TableName::new("grader").is_ok());
        assert!(TableName::new("_daily_2024").is_ok());
        assert!(TableName::new("").is_err());
        assert!(TableName::new("1grader").is_err());
        assert!(TableName::new("grader; DROP TABLE x").is_err());
        assert!(TableName::new(&"a".repeat(64)).is_err());
        assert_eq!(TableName::default().as_str(), "grader");
    }

    #[tokio::test]
    async fn test_duplicate_natural_key_stored_once() {
        let mut store = MemoryStore::new();
        let a = attempt("u1", 1, "submit", Some(Correctness::Correct));
        let report = store.replace_batch(&[a.clone(), a]).await.unwrap();
        assert_eq!(report, LoadReport { inserted: 1, duplicates: 1 });
        assert_eq!(store.rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_load_replaces_first() {
        let mut store = MemoryStore::new();
        store.replace_batch(&[attempt("u1", 1, "run", None)]).await.unwrap();
        store
            .replace_batch(&[attempt("u2", 2, "run", None), attempt("u3", 3, "run", None)])
            .await
            .unwrap();
        let users: Vec<_> = store.rows().await.unwrap().into_iter().map(|r| r.user_id).collect();
        assert_eq!(users, vec!["u2", "u3"]);
    }

    #[tokio::test]
    async fn test_correctness_persists_as_tri_state() {
        let mut store = MemoryStore::new();
        store
            .replace_batch(&[
                attempt("u1", 1, "submit", Some(Correctness::Correct)),
                attempt("u1", 2, "submit", Some(Correctness::Incorrect)),
                attempt("u1", 3, "submit", None),
            ])
            .await
            .unwrap();
        let flags: Vec<_> = store.rows().await.unwrap().into_iter().map(|r| r.is_correct).collect();
        assert_eq!(flags, vec![Some(true), Some(false), None]);
    }

    #[tokio::test]
    async fn test_metrics_on_empty_store_are_zero() {
        let mut store = MemoryStore::new();
        let values: Vec<_> = store.daily_metrics().await.unwrap().iter().map(|m| m.value).collect();
        assert_eq!(values, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_distinct_users_counts_all_attempt_types() {
        let mut store = MemoryStore::new();
        store
            .replace_batch(&[
                attempt("u1", 1, "submit", Some(Correctness::Correct)),
                attempt("u2", 2, "run", None),
            ])
            .await
            .unwrap();
        let values: Vec<_> = store.daily_metrics().await.unwrap().iter().map(|m| m.value).collect();
        assert_eq!(values, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_closed_store_refuses_operations() {
        let mut store = MemoryStore::new();
        store.close().await;
        store.close().await;
        assert!(store.is_closed());
        assert!(matches!(store.ensure_schema().await, Err(StoreError::NotConnected)));
    }
}
