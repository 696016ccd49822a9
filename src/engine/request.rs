//! Turning raw caller input into typed requests.
//!
//! Every field of a request is checked and all failures are reported together.
//! Identifiers are ULIDs, instants are RFC 3339 with an offset (normalized to
//! UTC milliseconds), days are `YYYY-MM-DD` in UTC.

use chrono::{DateTime, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::span_errors;
use super::error::{EngineError, FieldError};

const DAY_MS: Ms = 86_400_000;

#[derive(Debug, Default)]
struct Fields {
    errors: Vec<FieldError>,
}

impl Fields {
    fn reject(&mut self, field: &'static str, reason: impl Into<String>) {
        self.errors.push(FieldError::new(field, reason));
    }

    fn id(&mut self, field: &'static str, raw: &str) -> Option<Ulid> {
        match Ulid::from_string(raw.trim()) {
            Ok(id) => Some(id),
            Err(_) => {
                self.reject(field, "invalid id");
                None
            }
        }
    }

    fn instant(&mut self, field: &'static str, raw: &str) -> Option<Ms> {
        match DateTime::parse_from_rfc3339(raw.trim()) {
            Ok(t) => {
                let ms = t.timestamp_millis();
                if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&ms) {
                    self.reject(field, OUTSIDE_WINDOW);
                    return None;
                }
                Some(ms)
            }
            Err(_) => {
                self.reject(field, "invalid timestamp (expected RFC 3339)");
                None
            }
        }
    }

    fn optional_instant(&mut self, field: &'static str, raw: Option<&str>) -> Option<Option<Ms>> {
        match raw {
            None => Some(None),
            Some(raw) => self.instant(field, raw).map(Some),
        }
    }

    fn day(&mut self, field: &'static str, raw: &str) -> Option<Span> {
        let start = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t.and_utc().timestamp_millis());
        match start {
            Some(start) if (MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&start) => {
                Some(Span::new(start, start + DAY_MS))
            }
            Some(_) => {
                self.reject(field, OUTSIDE_WINDOW);
                None
            }
            None => {
                self.reject(field, "invalid date (expected YYYY-MM-DD)");
                None
            }
        }
    }

    /// Trimmed free text; blank becomes `None`.
    fn text(&mut self, field: &'static str, raw: Option<&str>, max: usize) -> Option<Option<String>> {
        let Some(v) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
            return Some(None);
        };
        if v.len() > max {
            self.reject(field, format!("longer than {max} bytes"));
            return None;
        }
        Some(Some(v.to_string()))
    }

    fn quantity(&mut self, field: &'static str, raw: i64, min: i64, max: u32) -> Option<u32> {
        if raw < min {
            self.reject(field, format!("must be >= {min}"));
            return None;
        }
        match u32::try_from(raw) {
            Ok(q) if q <= max => Some(q),
            _ => {
                self.reject(field, format!("must be <= {max}"));
                None
            }
        }
    }

    /// Interval checks, once both ends parsed, reported with the other field errors.
    fn interval(&mut self, start: Option<Ms>, end: Option<Ms>) {
        if let (Some(start), Some(end)) = (start, end) {
            self.errors.extend(span_errors(start, end));
        }
    }

    fn into_error(self) -> EngineError {
        EngineError::Validation(self.errors)
    }
}

/// Clamp a caller-supplied list size: absent or non-positive → default, above max → max.
pub fn clamp_limit(raw: Option<i64>) -> usize {
    match raw {
        Some(n) if n > 0 => (n as usize).min(MAX_LIST_LIMIT),
        _ => DEFAULT_LIST_LIMIT,
    }
}

// ── Scheduler requests ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAppointment {
    pub practitioner_id: Ulid,
    pub patient_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub notes: Option<String>,
}

impl CreateAppointment {
    pub fn parse(
        practitioner_id: &str,
        patient_id: &str,
        start_at: &str,
        end_at: &str,
        notes: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let practitioner_id = f.id("practitioner_id", practitioner_id);
        let patient_id = f.id("patient_id", patient_id);
        let start = f.instant("start_at", start_at);
        let end = f.instant("end_at", end_at);
        f.interval(start, end);
        let notes = f.text("notes", notes, MAX_NOTE_LEN);
        match (practitioner_id, patient_id, start, end, notes) {
            (Some(practitioner_id), Some(patient_id), Some(start), Some(end), Some(notes))
                if f.errors.is_empty() =>
            {
                Ok(Self {
                    practitioner_id,
                    patient_id,
                    start,
                    end,
                    notes,
                })
            }
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub appointment_id: Ulid,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl Reschedule {
    pub fn parse(
        appointment_id: &str,
        start_at: Option<&str>,
        end_at: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let appointment_id = f.id("appointment_id", appointment_id);
        let start = f.optional_instant("start_at", start_at);
        let end = f.optional_instant("end_at", end_at);
        match (appointment_id, start, end) {
            (Some(appointment_id), Some(start), Some(end)) => Ok(Self {
                appointment_id,
                start,
                end,
            }),
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStatus {
    pub appointment_id: Ulid,
    pub status: AppointmentStatus,
    pub cancelled_reason: Option<String>,
}

impl SetStatus {
    pub fn parse(
        appointment_id: &str,
        status: &str,
        cancelled_reason: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let appointment_id = f.id("appointment_id", appointment_id);
        let status = AppointmentStatus::parse(status.trim());
        if status.is_none() {
            f.reject("status", "must be one of: scheduled, cancelled");
        }
        let cancelled_reason = f.text("cancelled_reason", cancelled_reason, MAX_NOTE_LEN);
        match (appointment_id, status, cancelled_reason) {
            (Some(appointment_id), Some(status), Some(cancelled_reason)) => Ok(Self {
                appointment_id,
                status,
                cancelled_reason,
            }),
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotes {
    pub appointment_id: Ulid,
    pub notes: Option<String>,
}

impl UpdateNotes {
    pub fn parse(appointment_id: &str, notes: Option<&str>) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let appointment_id = f.id("appointment_id", appointment_id);
        let notes = f.text("notes", notes, MAX_NOTE_LEN);
        match (appointment_id, notes) {
            (Some(appointment_id), Some(notes)) => Ok(Self {
                appointment_id,
                notes,
            }),
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PractitionerDay {
    pub practitioner_id: Ulid,
    /// `[date 00:00 UTC, next day 00:00 UTC)`.
    pub day: Span,
}

impl PractitionerDay {
    pub fn parse(practitioner_id: &str, date: &str) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let practitioner_id = f.id("practitioner_id", practitioner_id);
        let day = f.day("date", date);
        match (practitioner_id, day) {
            (Some(practitioner_id), Some(day)) => Ok(Self {
                practitioner_id,
                day,
            }),
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientRange {
    pub patient_id: Ulid,
    pub from: Ms,
    pub to: Ms,
}

impl PatientRange {
    pub fn parse(patient_id: &str, from: &str, to: &str) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let patient_id = f.id("patient_id", patient_id);
        let from = f.instant("from", from);
        let to = f.instant("to", to);
        if let (Some(from), Some(to)) = (from, to)
            && to < from
        {
            f.reject("to", "must not be before from");
        }
        match (patient_id, from, to) {
            (Some(patient_id), Some(from), Some(to)) if f.errors.is_empty() => Ok(Self {
                patient_id,
                from,
                to,
            }),
            _ => Err(f.into_error()),
        }
    }
}

// ── Ledger requests ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMaterial {
    pub name: String,
    pub description: Option<String>,
    pub total_qty: u32,
}

impl CreateMaterial {
    pub fn parse(name: &str, description: Option<&str>, total_qty: i64) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let name = match f.text("name", Some(name), MAX_NAME_LEN) {
            Some(Some(name)) => Some(name),
            Some(None) => {
                f.reject("name", "required");
                None
            }
            None => None,
        };
        let description = f.text("description", description, MAX_NOTE_LEN);
        let total_qty = f.quantity("total_qty", total_qty, 0, MAX_TOTAL_QTY);
        match (name, description, total_qty) {
            (Some(name), Some(description), Some(total_qty)) => Ok(Self {
                name,
                description,
                total_qty,
            }),
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanRequest {
    pub material_id: Ulid,
    pub patient_id: Ulid,
    pub practitioner_id: Ulid,
    pub qty: u32,
    pub notes: Option<String>,
}

impl LoanRequest {
    pub fn parse(
        material_id: &str,
        patient_id: &str,
        practitioner_id: &str,
        qty: i64,
        notes: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        let material_id = f.id("material_id", material_id);
        let patient_id = f.id("patient_id", patient_id);
        let practitioner_id = f.id("practitioner_id", practitioner_id);
        let qty = f.quantity("qty", qty, 1, MAX_LOAN_QTY);
        let notes = f.text("notes", notes, MAX_NOTE_LEN);
        match (material_id, patient_id, practitioner_id, qty, notes) {
            (Some(material_id), Some(patient_id), Some(practitioner_id), Some(qty), Some(notes)) => {
                Ok(Self {
                    material_id,
                    patient_id,
                    practitioner_id,
                    qty,
                    notes,
                })
            }
            _ => Err(f.into_error()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientLoans {
    pub patient_id: Ulid,
    pub only_active: bool,
    pub limit: usize,
}

impl PatientLoans {
    pub fn parse(patient_id: &str, only_active: bool, limit: Option<i64>) -> Result<Self, EngineError> {
        let mut f = Fields::default();
        match f.id("patient_id", patient_id) {
            Some(patient_id) => Ok(Self {
                patient_id,
                only_active,
                limit: clamp_limit(limit),
            }),
            None => Err(f.into_error()),
        }
    }
}

/// Parse a bare identifier, e.g. for point reads or returns.
pub fn parse_id(field: &'static str, raw: &str) -> Result<Ulid, EngineError> {
    let mut f = Fields::default();
    f.id(field, raw).ok_or_else(|| f.into_error())
}
