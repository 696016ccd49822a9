use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, always UTC. The only time type past the input boundary.
pub type Ms = i64;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub practitioner_id: Ulid,
    pub patient_id: Ulid,
    pub span: Span,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub cancelled_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Appointment {
    pub fn is_scheduled(&self) -> bool {
        self.status == AppointmentStatus::Scheduled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub total_qty: u32,
    pub available_qty: u32,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialLoan {
    pub id: Ulid,
    pub material_id: Ulid,
    pub patient_id: Ulid,
    pub practitioner_id: Ulid,
    pub qty: u32,
    pub notes: Option<String>,
    pub loaned_at: Ms,
    /// `None` while the loan is active. Set exactly once.
    pub returned_at: Option<Ms>,
}

impl MaterialLoan {
    pub fn is_active(&self) -> bool {
        self.returned_at.is_none()
    }
}

// ── Insert payloads ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub id: Ulid,
    pub practitioner_id: Ulid,
    pub patient_id: Ulid,
    pub span: Span,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMaterial {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub total_qty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLoan {
    pub id: Ulid,
    pub material_id: Ulid,
    pub patient_id: Ulid,
    pub practitioner_id: Ulid,
    pub qty: u32,
    pub notes: Option<String>,
    pub loaned_at: Ms,
}

/// All appointments of one practitioner, any status, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct Agenda {
    pub practitioner_id: Ulid,
    pub appointments: Vec<Appointment>,
}

impl Agenda {
    pub fn new(practitioner_id: Ulid) -> Self {
        Self {
            practitioner_id,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments whose span intersects the query window.
    /// Uses binary search to skip appointments starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Appointments whose start falls in `[window.start, window.end)`, in start order.
    pub fn starting_within(&self, window: &Span) -> &[Appointment] {
        let lo = self
            .appointments
            .partition_point(|a| a.span.start < window.start);
        let hi = self
            .appointments
            .partition_point(|a| a.span.start < window.end);
        &self.appointments[lo..hi]
    }
}

/// The journal record format. Each variant is one committed store write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentCreated(Appointment),
    AppointmentRescheduled {
        id: Ulid,
        practitioner_id: Ulid,
        span: Span,
        at: Ms,
    },
    AppointmentStatusChanged {
        id: Ulid,
        practitioner_id: Ulid,
        status: AppointmentStatus,
        cancelled_reason: Option<String>,
        at: Ms,
    },
    AppointmentNotesChanged {
        id: Ulid,
        practitioner_id: Ulid,
        notes: Option<String>,
        at: Ms,
    },
    MaterialCreated(Material),
    StockDecremented {
        material_id: Ulid,
        qty: u32,
        at: Ms,
    },
    StockIncremented {
        material_id: Ulid,
        qty: u32,
        at: Ms,
    },
    LoanCreated(MaterialLoan),
    LoanReturned {
        id: Ulid,
        material_id: Ulid,
        at: Ms,
    },
}
