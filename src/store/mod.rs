//! The storage port used by the scheduler and the ledger, and the reference
//! implementation [`Store`]: in-memory tables, optionally journaled to a WAL.
//!
//! Every conditional write takes the owning row's write lock, evaluates its
//! predicate, journals the resulting [`Event`] and only then applies it, so the
//! predicate and the write are atomic with respect to other writers.

mod appointments;
mod materials;
#[cfg(test)]
mod tests;

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique index rejected the write. Carries the index name.
    UniqueViolation(&'static str),
    /// The write references a row that does not exist.
    MissingReference(&'static str),
    /// The journal could not durably record the write. Nothing was applied.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UniqueViolation(index) => write!(f, "unique violation on {index}"),
            StoreError::MissingReference(what) => write!(f, "missing reference: {what}"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    async fn insert_appointment(&self, new: NewAppointment) -> Result<Appointment, StoreError>;

    async fn get_appointment(&self, id: Ulid) -> Result<Option<Appointment>, StoreError>;

    /// First `scheduled` appointment of the practitioner intersecting `span`, skipping `exclude`.
    async fn find_overlap(
        &self,
        practitioner_id: Ulid,
        span: Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, StoreError>;

    async fn reschedule_appointment(
        &self,
        id: Ulid,
        span: Span,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        cancelled_reason: Option<String>,
    ) -> Result<Option<Appointment>, StoreError>;

    async fn set_appointment_notes(
        &self,
        id: Ulid,
        notes: Option<String>,
    ) -> Result<Option<Appointment>, StoreError>;

    /// Appointments (any status) starting in `[window.start, window.end)`, by start.
    async fn list_by_practitioner(
        &self,
        practitioner_id: Ulid,
        window: Span,
    ) -> Result<Vec<Appointment>, StoreError>;

    /// Appointments (any status) starting in `[from, to]`, by start.
    async fn list_by_patient(
        &self,
        patient_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Appointment>, StoreError>;
}

#[async_trait]
pub trait MaterialStore: Send + Sync {
    async fn insert_material(&self, new: NewMaterial) -> Result<Material, StoreError>;

    async fn get_material(&self, id: Ulid) -> Result<Option<Material>, StoreError>;

    /// Ordered by name.
    async fn list_materials(&self, limit: usize) -> Result<Vec<Material>, StoreError>;

    /// `available_qty -= qty` only if `available_qty >= qty`. Returns whether a row changed.
    async fn decrement_available(&self, material_id: Ulid, qty: u32) -> Result<bool, StoreError>;

    /// Unconditional `available_qty += qty`. Returns whether a row changed.
    async fn increment_available(&self, material_id: Ulid, qty: u32) -> Result<bool, StoreError>;

    async fn insert_loan(&self, new: NewLoan) -> Result<MaterialLoan, StoreError>;

    async fn get_loan(&self, id: Ulid) -> Result<Option<MaterialLoan>, StoreError>;

    /// `returned_at = at` only if `returned_at` is null. Returns whether a row changed.
    async fn mark_returned(&self, loan_id: Ulid, at: Ms) -> Result<bool, StoreError>;

    /// Ordered by `loaned_at`, newest first.
    async fn list_loans_by_patient(
        &self,
        patient_id: Ulid,
        only_active: bool,
        limit: usize,
    ) -> Result<Vec<MaterialLoan>, StoreError>;

    /// The material row together with the summed `qty` of its active loans,
    /// both read under one lock so no write lands between them.
    async fn stock_snapshot(&self, material_id: Ulid)
        -> Result<Option<(Material, u32)>, StoreError>;
}

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block for the first append, drain whatever else is already queued,
/// then one fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_err = batch
        .iter()
        .find_map(|(event, _)| wal.append_buffered(event).err());
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Store ────────────────────────────────────────────────

pub type SharedAgenda = Arc<RwLock<Agenda>>;
pub type SharedMaterial = Arc<RwLock<MaterialState>>;

/// A material row together with every loan drawn against it.
#[derive(Debug, Clone)]
pub struct MaterialState {
    pub material: Material,
    pub loans: Vec<MaterialLoan>,
}

impl MaterialState {
    fn loan_mut(&mut self, id: Ulid) -> Option<&mut MaterialLoan> {
        self.loans.iter_mut().find(|l| l.id == id)
    }
}

pub struct Store {
    agendas: DashMap<Ulid, SharedAgenda>,
    /// Reverse lookup: appointment id → practitioner id.
    appointment_owner: DashMap<Ulid, Ulid>,
    patient_appointments: DashMap<Ulid, Vec<Ulid>>,
    materials: DashMap<Ulid, SharedMaterial>,
    /// Unique index on material name (exact, case-sensitive).
    material_names: DashMap<String, Ulid>,
    /// Reverse lookup: loan id → material id.
    loan_owner: DashMap<Ulid, Ulid>,
    patient_loans: DashMap<Ulid, Vec<Ulid>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Writers hold this shared; compaction holds it exclusively so no
    /// committed event can slip between the snapshot and the log swap.
    compaction_gate: RwLock<()>,
}

impl Store {
    fn empty(wal_tx: Option<mpsc::Sender<WalCommand>>) -> Self {
        Self {
            agendas: DashMap::new(),
            appointment_owner: DashMap::new(),
            patient_appointments: DashMap::new(),
            materials: DashMap::new(),
            material_names: DashMap::new(),
            loan_owner: DashMap::new(),
            patient_loans: DashMap::new(),
            wal_tx,
            compaction_gate: RwLock::new(()),
        }
    }

    /// A store with no journal. Writes are atomic but not durable.
    pub fn in_memory() -> Self {
        Self::empty(None)
    }

    /// Open a journaled store: replay the WAL at `path`, then spawn its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let replay = Wal::replay(path)?;
        if replay.discarded > 0 {
            warn!(
                "discarding {} untrusted trailing bytes from {}",
                replay.discarded,
                path.display()
            );
        }
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self::empty(Some(wal_tx));
        for event in &replay.events {
            store.replay_event(event)?;
        }
        info!("replayed {} events from {}", replay.events.len(), path.display());
        Ok(store)
    }

    /// Apply a journaled event at startup. Nothing else holds the locks yet.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: lock contended");
        match event {
            Event::AppointmentCreated(a) => {
                let agenda = self.agenda_or_create(a.practitioner_id);
                let mut guard = agenda.try_write().map_err(|_| contended())?;
                apply_to_agenda(&mut guard, event);
            }
            Event::AppointmentRescheduled { practitioner_id, .. }
            | Event::AppointmentStatusChanged { practitioner_id, .. }
            | Event::AppointmentNotesChanged { practitioner_id, .. } => {
                if let Some(agenda) = self.agenda(practitioner_id) {
                    let mut guard = agenda.try_write().map_err(|_| contended())?;
                    apply_to_agenda(&mut guard, event);
                }
            }
            Event::MaterialCreated(m) => {
                self.materials.insert(
                    m.id,
                    Arc::new(RwLock::new(MaterialState {
                        material: m.clone(),
                        loans: Vec::new(),
                    })),
                );
            }
            Event::StockDecremented { material_id, .. }
            | Event::StockIncremented { material_id, .. }
            | Event::LoanReturned { material_id, .. } => {
                if let Some(state) = self.material(material_id) {
                    let mut guard = state.try_write().map_err(|_| contended())?;
                    apply_to_material(&mut guard, event);
                }
            }
            Event::LoanCreated(l) => {
                if let Some(state) = self.material(&l.material_id) {
                    let mut guard = state.try_write().map_err(|_| contended())?;
                    apply_to_material(&mut guard, event);
                }
            }
        }
        self.index_event(event);
        Ok(())
    }

    /// Maintain lookup indexes for events that create rows.
    fn index_event(&self, event: &Event) {
        match event {
            Event::AppointmentCreated(a) => {
                self.appointment_owner.insert(a.id, a.practitioner_id);
                let mut ids = self.patient_appointments.entry(a.patient_id).or_default();
                if !ids.contains(&a.id) {
                    ids.push(a.id);
                }
            }
            Event::MaterialCreated(m) => {
                self.material_names.insert(m.name.clone(), m.id);
            }
            Event::LoanCreated(l) => {
                self.loan_owner.insert(l.id, l.material_id);
                let mut ids = self.patient_loans.entry(l.patient_id).or_default();
                if !ids.contains(&l.id) {
                    ids.push(l.id);
                }
            }
            _ => {}
        }
    }

    /// Durably record an event before it is applied. No-op without a journal.
    async fn journal(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub(crate) fn agenda(&self, practitioner_id: &Ulid) -> Option<SharedAgenda> {
        self.agendas.get(practitioner_id).map(|e| e.value().clone())
    }

    fn agenda_or_create(&self, practitioner_id: Ulid) -> SharedAgenda {
        self.agendas
            .entry(practitioner_id)
            .or_insert_with(|| Arc::new(RwLock::new(Agenda::new(practitioner_id))))
            .value()
            .clone()
    }

    pub(crate) fn material(&self, material_id: &Ulid) -> Option<SharedMaterial> {
        self.materials.get(material_id).map(|e| e.value().clone())
    }

    /// Rewrite the journal with the minimal event set that recreates current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.compaction_gate.write().await;
        let events = self.snapshot_events().await;
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        let agendas: Vec<SharedAgenda> = self.agendas.iter().map(|e| e.value().clone()).collect();
        for agenda in agendas {
            let guard = agenda.read().await;
            events.extend(guard.appointments.iter().cloned().map(Event::AppointmentCreated));
        }
        let materials: Vec<SharedMaterial> =
            self.materials.iter().map(|e| e.value().clone()).collect();
        for state in materials {
            let guard = state.read().await;
            events.push(Event::MaterialCreated(guard.material.clone()));
            events.extend(guard.loans.iter().cloned().map(Event::LoanCreated));
        }
        events
    }
}

/// Apply an appointment event to the owning agenda (caller holds the lock).
fn apply_to_agenda(agenda: &mut Agenda, event: &Event) {
    match event {
        Event::AppointmentCreated(a) => {
            agenda.remove(a.id);
            agenda.insert(a.clone());
        }
        Event::AppointmentRescheduled { id, span, at, .. } => {
            // Re-insert so the agenda stays sorted by start.
            if let Some(mut a) = agenda.remove(*id) {
                a.span = *span;
                a.updated_at = *at;
                agenda.insert(a);
            }
        }
        Event::AppointmentStatusChanged {
            id,
            status,
            cancelled_reason,
            at,
            ..
        } => {
            if let Some(a) = agenda.get_mut(*id) {
                a.status = *status;
                a.cancelled_reason = cancelled_reason.clone();
                a.updated_at = *at;
            }
        }
        Event::AppointmentNotesChanged { id, notes, at, .. } => {
            if let Some(a) = agenda.get_mut(*id) {
                a.notes = notes.clone();
                a.updated_at = *at;
            }
        }
        _ => {}
    }
}

/// Apply a stock or loan event to the owning material (caller holds the lock).
fn apply_to_material(state: &mut MaterialState, event: &Event) {
    match event {
        Event::StockDecremented { qty, at, .. } => {
            state.material.available_qty = state.material.available_qty.saturating_sub(*qty);
            state.material.updated_at = *at;
        }
        Event::StockIncremented { qty, at, .. } => {
            state.material.available_qty = state.material.available_qty.saturating_add(*qty);
            state.material.updated_at = *at;
        }
        Event::LoanCreated(l) => {
            if state.loan_mut(l.id).is_none() {
                state.loans.push(l.clone());
            }
        }
        Event::LoanReturned { id, at, .. } => {
            if let Some(loan) = state.loan_mut(*id) {
                loan.returned_at = Some(*at);
            }
        }
        _ => {}
    }
}
