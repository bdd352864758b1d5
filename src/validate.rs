// Field-level validation of raw attempts.
//
// Every field is described by one `FieldRule`; `validate_attempt` walks the
// table uniformly and collects one `FieldError` per failing field.

use chrono::NaiveDateTime;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

use crate::models::{Correctness, RawAttempt, ValidatedAttempt};

/// A literal dot followed by exactly six fraction digits.
pub const CREATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S.%6f";
pub const PASSBACK_KEY: &str = "passback_params";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    UserId,
    OauthConsumerKey,
    LisResultSourcedid,
    LisOutcomeServiceUrl,
    IsCorrect,
    AttemptType,
    CreatedAt,
}

impl Field {
    /// Key under which the upstream record carries this field.
    pub fn key(self) -> &'static str {
        match self {
            Field::UserId => "lti_user_id",
            Field::OauthConsumerKey => "oauth_consumer_key",
            Field::LisResultSourcedid => "lis_result_sourcedid",
            Field::LisOutcomeServiceUrl => "lis_outcome_service_url",
            Field::IsCorrect => "is_correct",
            Field::AttemptType => "attempt_type",
            Field::CreatedAt => "created_at",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FieldError {
    #[error("{field} is missing")]
    Missing { field: Field },
    #[error("wrong type for {field}: expected {expected}, found {found}")]
    WrongType {
        field: Field,
        expected: &'static str,
        found: &'static str,
    },
    #[error("{field} is empty")]
    Empty { field: Field },
    #[error("is_correct must be 0, 1 or null, found {found}")]
    BadFlag { found: String },
    #[error("created_at {value:?} is not in YYYY-MM-DD HH:MM:SS.ffffff format")]
    BadTimestamp { value: String },
    #[error("passback_params could not be decoded: {reason}")]
    MalformedParams { reason: String },
    #[error("passback_params has no {key} key")]
    MissingParam { key: &'static str },
}

impl FieldError {
    /// Decode errors concern the embedded parameter payload.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            FieldError::MalformedParams { .. } | FieldError::MissingParam { .. }
        )
    }
}

/// A dropped record: the user token it carried and every field that failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("attempt of user {user} rejected ({} field error(s))", .errors.len())]
pub struct Rejection {
    pub user: String,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Attempt,
    Passback,
}

#[derive(Debug, Clone, PartialEq)]
enum Parsed {
    Text(String),
    Flag(Correctness),
    Timestamp(NaiveDateTime),
}

type Check = fn(Field, &Value) -> Result<Parsed, FieldError>;

struct FieldRule {
    field: Field,
    source: Source,
    required: bool,
    check: Check,
}

const RULES: &[FieldRule] = &[
    FieldRule { field: Field::UserId, source: Source::Attempt, required: true, check: non_empty_text },
    FieldRule { field: Field::OauthConsumerKey, source: Source::Passback, required: false, check: any_text },
    FieldRule { field: Field::LisResultSourcedid, source: Source::Passback, required: true, check: non_empty_text },
    FieldRule { field: Field::LisOutcomeServiceUrl, source: Source::Passback, required: true, check: non_empty_text },
    FieldRule { field: Field::IsCorrect, source: Source::Attempt, required: false, check: correctness_flag },
    FieldRule { field: Field::AttemptType, source: Source::Attempt, required: true, check: non_empty_text },
    FieldRule { field: Field::CreatedAt, source: Source::Attempt, required: true, check: timestamp },
];

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn any_text(field: Field, v: &Value) -> Result<Parsed, FieldError> {
    match v {
        Value::String(s) => Ok(Parsed::Text(s.clone())),
        other => Err(FieldError::WrongType {
            field,
            expected: "string",
            found: json_type(other),
        }),
    }
}

fn non_empty_text(field: Field, v: &Value) -> Result<Parsed, FieldError> {
    match any_text(field, v)? {
        Parsed::Text(s) if s.is_empty() => Err(FieldError::Empty { field }),
        parsed => Ok(parsed),
    }
}

fn correctness_flag(_: Field, v: &Value) -> Result<Parsed, FieldError> {
    v.as_i64()
        .and_then(Correctness::from_flag)
        .map(Parsed::Flag)
        .ok_or_else(|| FieldError::BadFlag { found: v.to_string() })
}

fn timestamp(field: Field, v: &Value) -> Result<Parsed, FieldError> {
    let Parsed::Text(s) = non_empty_text(field, v)? else {
        return Err(FieldError::Missing { field });
    };
    NaiveDateTime::parse_from_str(&s, CREATED_AT_FORMAT)
        .map(Parsed::Timestamp)
        .map_err(|_| FieldError::BadTimestamp { value: s })
}

/// Decode the embedded callback parameters.
///
/// Upstream serializes them with single quotes, so a strict JSON parse is
/// tried first and a quote-swapped parse second.
pub fn decode_passback(raw: &RawAttempt) -> Result<Map<String, Value>, FieldError> {
    let value = match raw.get(PASSBACK_KEY) {
        None | Some(Value::Null) => {
            return Err(FieldError::MalformedParams {
                reason: "payload is absent".into(),
            })
        }
        Some(Value::Object(map)) => return Ok(map.clone()),
        Some(Value::String(s)) => serde_json::from_str::<Value>(s)
            .or_else(|_| serde_json::from_str::<Value>(&s.replace('\'', "\"")))
            .map_err(|e| FieldError::MalformedParams { reason: e.to_string() })?,
        Some(other) => {
            return Err(FieldError::MalformedParams {
                reason: format!("expected a string payload, found {}", json_type(other)),
            })
        }
    };

    match value {
        Value::Object(map) => Ok(map),
        other => Err(FieldError::MalformedParams {
            reason: format!("expected an object, found {}", json_type(&other)),
        }),
    }
}

#[derive(Default)]
struct Draft {
    user_id: Option<String>,
    oauth_consumer_key: Option<String>,
    lis_result_sourcedid: Option<String>,
    lis_outcome_service_url: Option<String>,
    is_correct: Option<Correctness>,
    attempt_type: Option<String>,
    created_at: Option<NaiveDateTime>,
}

impl Draft {
    fn set(&mut self, field: Field, parsed: Parsed) {
        match (field, parsed) {
            (Field::UserId, Parsed::Text(s)) => self.user_id = Some(s),
            (Field::OauthConsumerKey, Parsed::Text(s)) => self.oauth_consumer_key = Some(s),
            (Field::LisResultSourcedid, Parsed::Text(s)) => self.lis_result_sourcedid = Some(s),
            (Field::LisOutcomeServiceUrl, Parsed::Text(s)) => self.lis_outcome_service_url = Some(s),
            (Field::IsCorrect, Parsed::Flag(c)) => self.is_correct = Some(c),
            (Field::AttemptType, Parsed::Text(s)) => self.attempt_type = Some(s),
            (Field::CreatedAt, Parsed::Timestamp(t)) => self.created_at = Some(t),
            _ => {}
        }
    }

    fn finish(self) -> Result<ValidatedAttempt, FieldError> {
        let missing = |field| FieldError::Missing { field };
        Ok(ValidatedAttempt {
            user_id: self.user_id.ok_or(missing(Field::UserId))?,
            oauth_consumer_key: self.oauth_consumer_key,
            lis_result_sourcedid: self
                .lis_result_sourcedid
                .ok_or(missing(Field::LisResultSourcedid))?,
            lis_outcome_service_url: self
                .lis_outcome_service_url
                .ok_or(missing(Field::LisOutcomeServiceUrl))?,
            is_correct: self.is_correct,
            attempt_type: self.attempt_type.ok_or(missing(Field::AttemptType))?,
            created_at: self.created_at.ok_or(missing(Field::CreatedAt))?,
        })
    }
}

/// Validate and normalize one raw attempt.
///
/// Each failing field is logged once and returned in the `Rejection`.
pub fn validate_attempt(raw: &RawAttempt) -> Result<ValidatedAttempt, Rejection> {
    let user = raw.user_token();
    let mut errors = Vec::new();
    let mut draft = Draft::default();

    let params = match decode_passback(raw) {
        Ok(map) => Some(map),
        Err(e) => {
            errors.push(e);
            None
        }
    };

    for rule in RULES {
        let value = match rule.source {
            Source::Attempt => match raw.get(rule.field.key()) {
                Some(v) if !v.is_null() => Some(v),
                _ if rule.required => {
                    errors.push(FieldError::Missing { field: rule.field });
                    continue;
                }
                _ => None,
            },
            Source::Passback => {
                // a payload that failed to decode was already reported once
                let Some(params) = params.as_ref() else { continue };
                match params.get(rule.field.key()) {
                    Some(v) if !v.is_null() => Some(v),
                    // every embedded key must be present, even when its value may be null
                    None => {
                        errors.push(FieldError::MissingParam { key: rule.field.key() });
                        continue;
                    }
                    Some(_) if rule.required => {
                        errors.push(FieldError::Missing { field: rule.field });
                        continue;
                    }
                    _ => None,
                }
            }
        };

        if let Some(v) = value {
            match (rule.check)(rule.field, v) {
                Ok(parsed) => draft.set(rule.field, parsed),
                Err(e) => errors.push(e),
            }
        }
    }

    let result = if errors.is_empty() {
        draft.finish().map_err(|e| vec![e])
    } else {
        Err(errors)
    };

    result.map_err(|errors| {
        for e in &errors {
            tracing::error!(user = %user, error = %e, "invalid attempt field");
        }
        Rejection { user, errors }
    })
}
