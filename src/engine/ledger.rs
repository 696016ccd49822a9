use std::sync::Arc;

use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{COMPENSATIONS_TOTAL, CONFLICTS_TOTAL};
use crate::store::{MaterialStore, StoreError};

use super::error::{Conflict, EngineError};
use super::request::*;

/// A material whose counters disagree with its active loans:
/// `available_qty != total_qty - outstanding_qty`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockDrift {
    pub material_id: Ulid,
    pub total_qty: u32,
    pub available_qty: u32,
    pub outstanding_qty: u32,
}

impl StockDrift {
    /// Units missing from `available_qty` (negative when there is a surplus).
    pub fn shortfall(&self) -> i64 {
        self.total_qty as i64 - self.outstanding_qty as i64 - self.available_qty as i64
    }
}

/// Lending of clinic materials against a finite stock.
pub struct Ledger<S> {
    store: Arc<S>,
}

impl<S: MaterialStore> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn create_material(&self, req: CreateMaterial) -> Result<Material, EngineError> {
        let name = req.name.clone();
        let material = self
            .store
            .insert_material(NewMaterial {
                id: Ulid::new(),
                name: req.name,
                description: req.description,
                total_qty: req.total_qty,
            })
            .await
            .map_err(|e| match e {
                StoreError::UniqueViolation("materials.name") => {
                    metrics::counter!(CONFLICTS_TOTAL, "kind" => "duplicate_name").increment(1);
                    EngineError::Conflict(Conflict::DuplicateName(name))
                }
                other => EngineError::Store(other),
            })?;
        info!(
            "material {} \"{}\" created with {} units",
            material.id, material.name, material.total_qty
        );
        Ok(material)
    }

    pub async fn get_material(&self, id: Ulid) -> Result<Material, EngineError> {
        self.store
            .get_material(id)
            .await?
            .ok_or(EngineError::NotFound {
                entity: "material",
                id,
            })
    }

    pub async fn list_materials(&self, limit: Option<i64>) -> Result<Vec<Material>, EngineError> {
        Ok(self.store.list_materials(clamp_limit(limit)).await?)
    }

    /// Reserve `qty` units and record the loan. If the loan cannot be recorded
    /// the reservation is handed back.
    pub async fn loan(&self, req: LoanRequest) -> Result<MaterialLoan, EngineError> {
        if req.qty == 0 {
            return Err(EngineError::invalid("qty", "must be > 0"));
        }
        let material_id = req.material_id;
        let qty = req.qty;
        let material = self.get_material(material_id).await?;
        if material.available_qty < qty {
            return Err(insufficient(material_id, qty));
        }
        // Lost the race to a concurrent loan when no row changes.
        if !self.store.decrement_available(material_id, qty).await? {
            return Err(insufficient(material_id, qty));
        }

        let new = NewLoan {
            id: Ulid::new(),
            material_id,
            patient_id: req.patient_id,
            practitioner_id: req.practitioner_id,
            qty,
            notes: req.notes,
            loaned_at: now_ms(),
        };
        match self.store.insert_loan(new).await {
            Ok(loan) => {
                info!(
                    "loan {} of {qty} x material {material_id} to patient {}",
                    loan.id, loan.patient_id
                );
                Ok(loan)
            }
            Err(cause) => Err(self.compensate(material_id, qty, cause).await),
        }
    }

    /// Put back units reserved by a loan that was never recorded.
    async fn compensate(&self, material_id: Ulid, qty: u32, cause: StoreError) -> EngineError {
        warn!("loan for material {material_id} failed after reserving {qty}: {cause}");
        let outcome = self.store.increment_available(material_id, qty).await;
        match outcome {
            Ok(true) => {
                metrics::counter!(COMPENSATIONS_TOTAL, "outcome" => "restored").increment(1);
                info!("restored {qty} units of material {material_id}");
                EngineError::Store(cause)
            }
            Ok(false) => {
                metrics::counter!(COMPENSATIONS_TOTAL, "outcome" => "failed").increment(1);
                error!("cannot restore {qty} units: material {material_id} is gone");
                EngineError::StockInconsistent {
                    material_id,
                    qty,
                    cause: format!("{cause}; material missing during compensation"),
                }
            }
            Err(e) => {
                metrics::counter!(COMPENSATIONS_TOTAL, "outcome" => "failed").increment(1);
                error!("cannot restore {qty} units of material {material_id}: {e}");
                EngineError::StockInconsistent {
                    material_id,
                    qty,
                    cause: format!("{cause}; compensation failed: {e}"),
                }
            }
        }
    }

    /// Close a loan, then put its units back in stock.
    pub async fn return_loan(&self, loan_id: Ulid) -> Result<MaterialLoan, EngineError> {
        let loan = self.get_loan(loan_id).await?;
        if !loan.is_active() {
            return Err(already_returned(loan_id));
        }
        // A concurrent return got there first when no row changes.
        if !self.store.mark_returned(loan_id, now_ms()).await? {
            return Err(already_returned(loan_id));
        }

        let restocked = self.store.increment_available(loan.material_id, loan.qty).await;
        match restocked {
            Ok(true) => {}
            Ok(false) => return Err(self.restock_failed(&loan, "material missing".into())),
            Err(e) => return Err(self.restock_failed(&loan, e.to_string())),
        }
        info!(
            "loan {loan_id} returned, {} units back to material {}",
            loan.qty, loan.material_id
        );
        self.get_loan(loan_id).await
    }

    fn restock_failed(&self, loan: &MaterialLoan, cause: String) -> EngineError {
        metrics::counter!(COMPENSATIONS_TOTAL, "outcome" => "restock_failed").increment(1);
        error!(
            "loan {} marked returned but {} units of material {} not restocked: {cause}",
            loan.id, loan.qty, loan.material_id
        );
        EngineError::StockInconsistent {
            material_id: loan.material_id,
            qty: loan.qty,
            cause,
        }
    }

    pub async fn get_loan(&self, id: Ulid) -> Result<MaterialLoan, EngineError> {
        self.store
            .get_loan(id)
            .await?
            .ok_or(EngineError::NotFound { entity: "loan", id })
    }

    pub async fn list_loans_by_patient(
        &self,
        query: PatientLoans,
    ) -> Result<Vec<MaterialLoan>, EngineError> {
        Ok(self
            .store
            .list_loans_by_patient(query.patient_id, query.only_active, query.limit)
            .await?)
    }

    /// Compare every material's counters against its active loans. Each material
    /// is judged from a single snapshot; the listing only supplies the ids.
    pub async fn audit_stock(&self) -> Result<Vec<StockDrift>, EngineError> {
        let ids: Vec<Ulid> = self
            .store
            .list_materials(usize::MAX)
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        let mut drift = Vec::new();
        for id in ids {
            let Some((m, outstanding_qty)) = self.store.stock_snapshot(id).await? else {
                continue;
            };
            let d = StockDrift {
                material_id: m.id,
                total_qty: m.total_qty,
                available_qty: m.available_qty,
                outstanding_qty,
            };
            if d.shortfall() != 0 {
                drift.push(d);
            }
        }
        Ok(drift)
    }
}

fn insufficient(material_id: Ulid, requested: u32) -> EngineError {
    metrics::counter!(CONFLICTS_TOTAL, "kind" => "insufficient_stock").increment(1);
    EngineError::Conflict(Conflict::InsufficientStock {
        material_id,
        requested,
    })
}

fn already_returned(loan_id: Ulid) -> EngineError {
    metrics::counter!(CONFLICTS_TOTAL, "kind" => "already_returned").increment(1);
    EngineError::Conflict(Conflict::AlreadyReturned(loan_id))
}
