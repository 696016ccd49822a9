use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{apply_to_agenda, AppointmentStore, Store, StoreError};

impl Store {
    /// Lock the appointment's agenda, build the event from `(practitioner_id, now)`,
    /// journal it and apply it. `None` if the appointment does not exist.
    async fn update_appointment(
        &self,
        id: Ulid,
        make_event: impl FnOnce(Ulid, Ms) -> Event + Send,
    ) -> Result<Option<Appointment>, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let Some(practitioner_id) = self.appointment_owner.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(agenda) = self.agenda(&practitioner_id) else {
            return Ok(None);
        };
        let mut guard = agenda.write().await;
        if guard.get(id).is_none() {
            return Ok(None);
        }
        let event = make_event(practitioner_id, now_ms());
        self.journal(&event).await?;
        apply_to_agenda(&mut guard, &event);
        Ok(guard.get(id).cloned())
    }
}

#[async_trait]
impl AppointmentStore for Store {
    async fn insert_appointment(&self, new: NewAppointment) -> Result<Appointment, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let now = now_ms();
        let appointment = Appointment {
            id: new.id,
            practitioner_id: new.practitioner_id,
            patient_id: new.patient_id,
            span: new.span,
            status: AppointmentStatus::Scheduled,
            notes: new.notes,
            cancelled_reason: None,
            created_at: now,
            updated_at: now,
        };
        let agenda = self.agenda_or_create(new.practitioner_id);
        let mut guard = agenda.write().await;
        if guard.get(new.id).is_some() {
            return Err(StoreError::UniqueViolation("appointments.id"));
        }
        let event = Event::AppointmentCreated(appointment.clone());
        self.journal(&event).await?;
        apply_to_agenda(&mut guard, &event);
        self.index_event(&event);
        Ok(appointment)
    }

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError> {
        let Some(practitioner_id) = self.appointment_owner.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(agenda) = self.agenda(&practitioner_id) else {
            return Ok(None);
        };
        let guard = agenda.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn find_overlap(
        &self,
        practitioner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, StoreError> {
        let Some(agenda) = self.agenda(&practitioner_id) else {
            return Ok(None);
        };
        let guard = agenda.read().await;
        let hit = guard
            .overlapping(&span)
            .filter(|a| a.is_scheduled() && Some(a.id) != exclude)
            .map(|a| a.id)
            .next();
        Ok(hit)
    }

    async fn reschedule_appointment(
        &self,
        id: Ulid,
        span: Span,
    ) -> Result<Option<Appointment>, StoreError> {
        self.update_appointment(id, |practitioner_id, at| Event::AppointmentRescheduled {
            id,
            practitioner_id,
            span,
            at,
        })
        .await
    }

    async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        cancelled_reason: Option<String>,
    ) -> Result<Option<Appointment>, StoreError> {
        self.update_appointment(id, |practitioner_id, at| Event::AppointmentStatusChanged {
            id,
            practitioner_id,
            status,
            cancelled_reason,
            at,
        })
        .await
    }

    async fn set_appointment_notes(
        &self,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<Option<Appointment>, StoreError> {
        self.update_appointment(id, |practitioner_id, at| Event::AppointmentNotesChanged {
            id,
            practitioner_id,
            notes,
            at,
        })
        .await
    }

    async fn list_by_practitioner(
        &self,
        practitioner_id: Ulid,
        window: Span,
    ) -> Result<Vec<Appointment>, StoreError> {
        let Some(agenda) = self.agenda(&practitioner_id) else {
            return Ok(Vec::new());
        };
        let guard = agenda.read().await;
        Ok(guard.starting_within(&window).to_vec())
    }

    async fn list_by_patient(
        &self,
        patient_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, StoreError> {
        let ids = self
            .patient_appointments
            .get(&patient_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            if let Some(a) = self.get_appointment(id).await?
                && a.span.start >= from
                && a.span.start <= to
            {
                out.push(a);
            }
        }
        out.sort_by_key(|a| (a.span.start, a.id));
        Ok(out)
    }
}
