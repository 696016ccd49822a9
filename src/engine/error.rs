use ulid::Ulid;

use crate::store::StoreError;

/// One rejected input field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// A domain rule violated at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The interval intersects this scheduled appointment of the same practitioner.
    Overlap(Ulid),
    InsufficientStock { material_id: Ulid, requested: u32 },
    DuplicateName(String),
    AlreadyReturned(Ulid),
}

impl Conflict {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Conflict::Overlap(_) => "overlap",
            Conflict::InsufficientStock { .. } => "insufficient_stock",
            Conflict::DuplicateName(_) => "duplicate_name",
            Conflict::AlreadyReturned(_) => "already_returned",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(Vec<FieldError>),
    NotFound { entity: &'static str, id: Ulid },
    Conflict(Conflict),
    Store(StoreError),
    /// Stock was taken but could be neither committed to a loan nor put back.
    /// Needs operator reconciliation.
    StockInconsistent {
        material_id: Ulid,
        qty: u32,
        cause: String,
    },
}

impl EngineError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldError::new(field, reason)])
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound { .. } => "not_found",
            EngineError::Conflict(c) => c.code(),
            EngineError::Store(_) => "store",
            EngineError::StockInconsistent { .. } => "stock_inconsistent",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(fields) => {
                write!(f, "validation error:")?;
                for (i, fe) in fields.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{}: {}", fe.field, fe.reason)?;
                }
                Ok(())
            }
            EngineError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            EngineError::Conflict(c) => match c {
                Conflict::Overlap(id) => write!(f, "overlap: conflicts with appointment {id}"),
                Conflict::InsufficientStock {
                    material_id,
                    requested,
                } => write!(
                    f,
                    "insufficient_stock: cannot lend {requested} of material {material_id}"
                ),
                Conflict::DuplicateName(name) => write!(f, "duplicate_name: {name}"),
                Conflict::AlreadyReturned(id) => write!(f, "already_returned: loan {id}"),
            },
            EngineError::Store(e) => write!(f, "{e}"),
            EngineError::StockInconsistent {
                material_id,
                qty,
                cause,
            } => write!(
                f,
                "stock of material {material_id} is short by {qty} and needs reconciliation: {cause}"
            ),
        }
    }
}

impl std::error::Error for EngineError {}
