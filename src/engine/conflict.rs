use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{EngineError, FieldError};

/// Field errors of an appointment interval: in range, non-empty, at most a day long.
pub(crate) fn span_errors(start: Ms, end: Ms) -> Vec<FieldError> {
    let mut errors = Vec::new();
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&start) {
        errors.push(FieldError::new("start_at", OUTSIDE_WINDOW));
    }
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&end) {
        errors.push(FieldError::new("end_at", OUTSIDE_WINDOW));
    }
    if errors.is_empty() {
        if end <= start {
            errors.push(FieldError::new("end_at", "must be greater than start_at"));
        } else if end - start > MAX_SPAN_DURATION_MS {
            errors.push(FieldError::new("end_at", SPAN_TOO_LONG));
        }
    }
    errors
}

pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let errors = span_errors(start, end);
    if errors.is_empty() {
        Ok(Span::new(start, end))
    } else {
        Err(EngineError::Validation(errors))
    }
}

/// One async mutex per practitioner. Held across the overlap check and the
/// write it guards, so two bookings for the same practitioner never both pass
/// the check against a stale agenda.
#[derive(Default)]
pub(crate) struct PractitionerLocks {
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl PractitionerLocks {
    pub(crate) async fn acquire(&self, practitioner_id: Ulid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(practitioner_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }
}
