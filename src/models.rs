use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One attempt object exactly as the statistics API returned it.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct RawAttempt(pub Map<String, Value>);

impl RawAttempt {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Identifying token used in diagnostics, even when the record is broken.
    pub fn user_token(&self) -> String {
        match self.0.get("lti_user_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Null) | None => "<unknown>".into(),
            Some(other) => other.to_string(),
        }
    }
}

/// Correctness flag as reported upstream (`0` or `1`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correctness {
    Incorrect,
    Correct,
}

impl Correctness {
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            0 => Some(Correctness::Incorrect),
            1 => Some(Correctness::Correct),
            _ => None,
        }
    }

    pub fn as_bool(self) -> bool {
        matches!(self, Correctness::Correct)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ValidatedAttempt {
    pub user_id: String,
    pub oauth_consumer_key: Option<String>,
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
    pub is_correct: Option<Correctness>,
    pub attempt_type: String,
    pub created_at: NaiveDateTime,
}

impl ValidatedAttempt {
    /// Natural key: one stored row per user and creation timestamp.
    pub fn natural_key(&self) -> (&str, NaiveDateTime) {
        (&self.user_id, self.created_at)
    }
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredAttempt {
    pub id: i32,
    pub user_id: String,
    pub oauth_consumer_key: Option<String>,
    pub lis_result_sourcedid: String,
    pub lis_outcome_service_url: String,
    pub is_correct: Option<bool>,
    pub attempt_type: String,
    pub created_at: NaiveDateTime,
}

impl StoredAttempt {
    pub fn from_validated(id: i32, a: &ValidatedAttempt) -> Self {
        Self {
            id,
            user_id: a.user_id.clone(),
            oauth_consumer_key: a.oauth_consumer_key.clone(),
            lis_result_sourcedid: a.lis_result_sourcedid.clone(),
            lis_outcome_service_url: a.lis_outcome_service_url.clone(),
            is_correct: a.is_correct.map(Correctness::as_bool),
            attempt_type: a.attempt_type.clone(),
            created_at: a.created_at,
        }
    }
}
