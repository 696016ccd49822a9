use std::sync::Arc;

use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;
use crate::observability::CONFLICTS_TOTAL;
use crate::store::AppointmentStore;

use super::conflict::{validate_span, PractitionerLocks};
use super::error::{Conflict, EngineError};
use super::request::*;

/// Practitioner agendas: booking, moving, cancelling and listing appointments.
pub struct Scheduler<S> {
    store: Arc<S>,
    locks: PractitionerLocks,
}

impl<S: AppointmentStore> Scheduler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            locks: PractitionerLocks::default(),
        }
    }

    pub async fn create(&self, req: CreateAppointment) -> Result<Appointment, EngineError> {
        let span = validate_span(req.start, req.end)?;
        let _lock = self.locks.acquire(req.practitioner_id).await;
        self.ensure_free(req.practitioner_id, span, None).await?;

        let appointment = self
            .store
            .insert_appointment(NewAppointment {
                id: Ulid::new(),
                practitioner_id: req.practitioner_id,
                patient_id: req.patient_id,
                span,
                notes: req.notes,
            })
            .await?;
        info!(
            "appointment {} booked for practitioner {} [{}, {})",
            appointment.id, appointment.practitioner_id, span.start, span.end
        );
        Ok(appointment)
    }

    pub async fn get(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.store
            .get_appointment(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "appointment",
                id,
            })
    }

    /// Move an appointment. A missing bound keeps its current value.
    pub async fn reschedule(&self, req: Reschedule) -> Result<Appointment, EngineError> {
        if req.start.is_none() && req.end.is_none() {
            return Err(EngineError::invalid("start_at", "start_at or end_at required"));
        }
        let id = req.appointment_id;
        let practitioner_id = self.get(id).await?.practitioner_id;
        let _lock = self.locks.acquire(practitioner_id).await;
        // Re-read under the practitioner lock; the interval may have moved meanwhile.
        let current = self.get(id).await?;
        let span = validate_span(
            req.start.unwrap_or(current.span.start),
            req.end.unwrap_or(current.span.end),
        )?;
        self.ensure_free(practitioner_id, span, Some(id)).await?;

        let updated = self
            .store
            .reschedule_appointment(id, span)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "appointment",
                id,
            })?;
        info!("appointment {id} moved to [{}, {})", span.start, span.end);
        Ok(updated)
    }

    /// Change status. Reactivating a cancelled appointment re-checks its interval
    /// against the agenda and drops the cancellation reason. Cancelling without a
    /// reason leaves an earlier reason in place.
    pub async fn set_status(&self, req: SetStatus) -> Result<Appointment, EngineError> {
        let id = req.appointment_id;
        let practitioner_id = self.get(id).await?.practitioner_id;
        let _lock = self.locks.acquire(practitioner_id).await;
        let current = self.get(id).await?;

        let reason = match req.status {
            AppointmentStatus::Scheduled => {
                if !current.is_scheduled() {
                    self.ensure_free(practitioner_id, current.span, Some(id)).await?;
                }
                None
            }
            // An absent reason keeps whatever was recorded before.
            AppointmentStatus::Cancelled => req
                .cancelled_reason
                .or_else(|| current.cancelled_reason.clone()),
        };

        let updated = self
            .store
            .set_appointment_status(id, req.status, reason)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "appointment",
                id,
            })?;
        if current.status != updated.status {
            info!(
                "appointment {id} {} -> {}",
                current.status.as_str(),
                updated.status.as_str()
            );
        }
        Ok(updated)
    }

    pub async fn cancel(
        &self,
        appointment_id: Ulid,
        cancelled_reason: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.set_status(SetStatus {
            appointment_id,
            status: AppointmentStatus::Cancelled,
            cancelled_reason,
        })
        .await
    }

    pub async fn update_notes(&self, req: UpdateNotes) -> Result<Appointment, EngineError> {
        let id = req.appointment_id;
        self.store
            .set_appointment_notes(id, req.notes)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "appointment",
                id,
            })
    }

    /// Every appointment, any status, starting within the UTC day. Ordered by start.
    pub async fn list_for_practitioner_day(
        &self,
        query: PractitionerDay,
    ) -> Result<Vec<Appointment>, EngineError> {
        Ok(self
            .store
            .list_by_practitioner(query.practitioner_id, query.day)
            .await?)
    }

    /// Every appointment, any status, starting in `[from, to]`. Ordered by start.
    pub async fn list_for_patient_in_range(
        &self,
        query: PatientRange,
    ) -> Result<Vec<Appointment>, EngineError> {
        if query.to < query.from {
            return Err(EngineError::invalid("to", "must not be before from"));
        }
        Ok(self
            .store
            .list_by_patient(query.patient_id, query.from, query.to)
            .await?)
    }

    async fn ensure_free(
        &self,
        practitioner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<(), EngineError> {
        if let Some(existing) = self.store.find_overlap(practitioner_id, span, exclude).await? {
            metrics::counter!(CONFLICTS_TOTAL, "kind" => "overlap").increment(1);
            debug!("practitioner {practitioner_id}: [{}, {}) overlaps {existing}", span.start, span.end);
            return Err(EngineError::Conflict(Conflict::Overlap(existing)));
        }
        Ok(())
    }
}
