use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    SubmitAttempts,
    SuccessfulSubmits,
    DistinctUsers,
}

impl Metric {
    /// Report order.
    pub const ALL: [Metric; 3] = [
        Metric::SubmitAttempts,
        Metric::SuccessfulSubmits,
        Metric::DistinctUsers,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Metric::SubmitAttempts => "submit_attempts",
            Metric::SuccessfulSubmits => "successful_submits",
            Metric::DistinctUsers => "distinct_users",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::SubmitAttempts => "Submit attempts",
            Metric::SuccessfulSubmits => "Successful submit attempts",
            Metric::DistinctUsers => "Distinct users",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Metric::ALL.into_iter().find(|m| m.key() == key)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricRow {
    pub metric: Metric,
    pub value: i64,
}

impl MetricRow {
    pub fn name(&self) -> &'static str {
        self.metric.label()
    }
}

pub const SUBMIT: &str = "submit";

/// The single aggregation query, keyed rows `(metric, value)`.
///
/// `table` must already be a validated identifier.
pub fn aggregation_sql(table: &str) -> String {
    format!(
        r#"
        WITH submits AS (
            SELECT user_id, is_correct
            FROM {table}
            WHERE attempt_type = '{SUBMIT}'
        )
        SELECT 'submit_attempts' AS metric, COUNT(*) AS value FROM submits
        UNION ALL
        SELECT 'successful_submits', COUNT(*) FILTER (WHERE is_correct) FROM submits
        UNION ALL
        SELECT 'distinct_users', COUNT(DISTINCT user_id) FROM {table}
        "#
    )
}

/// Put keyed query rows into report order; metrics with no row count as 0.
pub fn collect_rows<I>(rows: I) -> Vec<MetricRow>
where
    I: IntoIterator<Item = (String, i64)>,
{
    let mut found: HashMap<Metric, i64> = HashMap::new();
    for (key, value) in rows {
        match Metric::from_key(&key) {
            Some(m) => {
                found.insert(m, value.max(0));
            }
            None => tracing::warn!(metric = %key, "ignoring unknown metric row"),
        }
    }
    Metric::ALL
        .into_iter()
        .map(|metric| MetricRow {
            metric,
            value: found.get(&metric).copied().unwrap_or(0),
        })
        .collect()
}
