use crate::models::{RawAttempt, ValidatedAttempt};
use crate::validate::{validate_attempt, FieldError, Rejection};

/// Outcome of preparing one day's batch.
#[derive(Debug, Default, Clone)]
pub struct PreparedBatch {
    pub accepted: Vec<ValidatedAttempt>,
    pub rejected: Vec<Rejection>,
}

impl PreparedBatch {
    /// Total number of field errors across rejected records.
    pub fn failure_count(&self) -> usize {
        self.rejected.iter().map(|r| r.errors.len()).sum()
    }

    /// Rejected records whose embedded parameters could not be used.
    pub fn decode_failure_count(&self) -> usize {
        self.rejected
            .iter()
            .filter(|r| r.errors.iter().any(FieldError::is_decode_error))
            .count()
    }
}

/// Validate every raw attempt independently, keeping input order.
///
/// A broken record never aborts the batch; it lands in `rejected`.
pub fn prepare_batch(raw: &[RawAttempt]) -> PreparedBatch {
    let mut batch = PreparedBatch::default();
    for attempt in raw {
        match validate_attempt(attempt) {
            Ok(a) => batch.accepted.push(a),
            Err(r) => batch.rejected.push(r),
        }
    }
    tracing::info!(
        received = raw.len(),
        accepted = batch.accepted.len(),
        rejected = batch.rejected.len(),
        undecodable = batch.decode_failure_count(),
        "batch prepared"
    );
    batch
}
