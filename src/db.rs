use async_trait::async_trait;
use sqlx::{Connection, PgConnection};

use crate::metrics::{self, MetricRow};
use crate::models::{StoredAttempt, ValidatedAttempt};
use crate::store::{AttemptStore, LoadReport, StoreError, TableName};

/// PostgreSQL-backed store owning one connection for the whole run.
pub struct PgStore {
    conn: Option<PgConnection>,
    table: TableName,
}

impl PgStore {
    pub async fn connect(url: &str, table: TableName) -> Result<Self, StoreError> {
        let conn = PgConnection::connect(url).await.map_err(StoreError::Connect)?;
        tracing::info!(table = %table, "database connection established");
        Ok(Self { conn: Some(conn), table })
    }

    /// Like `connect`, but a failure is only logged: the store comes back
    /// disconnected and every later operation returns `NotConnected`.
    pub async fn open(url: &str, table: TableName) -> Self {
        match Self::connect(url, table.clone()).await {
            Ok(store) => store,
            Err(e) => {
                tracing::error!(error = %e, table = %table, "database unavailable");
                Self::disconnected(table)
            }
        }
    }

    pub fn disconnected(table: TableName) -> Self {
        Self { conn: None, table }
    }

    pub fn from_connection(conn: PgConnection, table: TableName) -> Self {
        Self { conn: Some(conn), table }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::NotConnected)
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {t} (
                id SERIAL PRIMARY KEY,
                user_id VARCHAR(255) NOT NULL,
                oauth_consumer_key VARCHAR(255),
                lis_result_sourcedid TEXT NOT NULL,
                lis_outcome_service_url TEXT NOT NULL,
                is_correct BOOLEAN,
                attempt_type TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            )
            "#,
            t = self.table
        )
    }

    fn create_index_sql(&self) -> String {
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {t}_user_created_idx ON {t} (user_id, created_at)",
            t = self.table
        )
    }

    fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {t} (user_id, oauth_consumer_key, lis_result_sourcedid,
                lis_outcome_service_url, is_correct, attempt_type, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7)
            ON CONFLICT (user_id, created_at) DO NOTHING
            "#,
            t = self.table
        )
    }
}

async fn load(
    conn: &mut PgConnection,
    truncate: &str,
    insert: &str,
    batch: &[ValidatedAttempt],
) -> Result<LoadReport, sqlx::Error> {
    // one transaction: readers see either the previous batch or the new one
    let mut tx = conn.begin().await?;
    sqlx::query(truncate).execute(&mut *tx).await?;

    let mut report = LoadReport::default();
    for a in batch {
        let res = sqlx::query(insert)
            .bind(&a.user_id)
            .bind(&a.oauth_consumer_key)
            .bind(&a.lis_result_sourcedid)
            .bind(&a.lis_outcome_service_url)
            .bind(a.is_correct.map(|c| c.as_bool()))
            .bind(&a.attempt_type)
            .bind(a.created_at)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            tracing::debug!(user = %a.user_id, created_at = %a.created_at, "duplicate attempt skipped");
            report.duplicates += 1;
        } else {
            report.inserted += 1;
        }
    }

    tx.commit().await?;
    Ok(report)
}

#[async_trait]
impl AttemptStore for PgStore {
    fn table(&self) -> &TableName {
        &self.table
    }

    async fn ensure_schema(&mut self) -> Result<(), StoreError> {
        let table = self.table.to_string();
        let create_table = self.create_table_sql();
        let create_index = self.create_index_sql();
        let conn = self.conn()?;
        let schema_err = |source| StoreError::Schema { table: table.clone(), source };

        sqlx::query(&create_table).execute(&mut *conn).await.map_err(schema_err)?;
        tracing::info!(table = %table, "table ready");
        sqlx::query(&create_index).execute(&mut *conn).await.map_err(schema_err)?;
        tracing::info!(table = %table, "unique (user_id, created_at) index ready");
        Ok(())
    }

    async fn replace_batch(&mut self, batch: &[ValidatedAttempt]) -> Result<LoadReport, StoreError> {
        let table = self.table.to_string();
        let truncate = format!("TRUNCATE TABLE {table}");
        let insert = self.insert_sql();
        let report = load(self.conn()?, &truncate, &insert, batch)
            .await
            .map_err(|source| StoreError::Load { table: table.clone(), source })?;
        tracing::info!(
            table = %table,
            inserted = report.inserted,
            duplicates = report.duplicates,
            "batch loaded"
        );
        Ok(report)
    }

    async fn daily_metrics(&mut self) -> Result<Vec<MetricRow>, StoreError> {
        let table = self.table.to_string();
        let sql = metrics::aggregation_sql(&table);
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .fetch_all(self.conn()?)
            .await
            .map_err(|source| StoreError::Aggregate { table, source })?;
        Ok(metrics::collect_rows(rows))
    }

    async fn rows(&mut self) -> Result<Vec<StoredAttempt>, StoreError> {
        let table = self.table.to_string();
        let sql = format!("SELECT * FROM {table} ORDER BY id");
        sqlx::query_as::<_, StoredAttempt>(&sql)
            .fetch_all(self.conn()?)
            .await
            .map_err(|source| StoreError::Query { table, source })
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.close().await {
                Ok(()) => tracing::info!("database connection closed"),
                Err(e) => tracing::warn!(error = %e, "database connection closed uncleanly"),
            }
        }
    }
}
