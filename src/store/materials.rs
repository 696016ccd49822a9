use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::{apply_to_material, MaterialState, MaterialStore, Store, StoreError};

#[async_trait]
impl MaterialStore for Store {
    async fn insert_material(&self, new: NewMaterial) -> Result<Material, StoreError> {
        let _gate = self.compaction_gate.read().await;
        if self.materials.contains_key(&new.id) {
            return Err(StoreError::UniqueViolation("materials.id"));
        }
        // Reserve the name first; the DashMap entry must not be held across the journal await.
        match self.material_names.entry(new.name.clone()) {
            Entry::Occupied(_) => return Err(StoreError::UniqueViolation("materials.name")),
            Entry::Vacant(slot) => {
                slot.insert(new.id);
            }
        }

        let now = now_ms();
        let material = Material {
            id: new.id,
            name: new.name,
            description: new.description,
            total_qty: new.total_qty,
            available_qty: new.total_qty,
            created_at: now,
            updated_at: now,
        };
        let event = Event::MaterialCreated(material.clone());
        if let Err(e) = self.journal(&event).await {
            self.material_names.remove(&material.name);
            return Err(e);
        }
        self.materials.insert(
            material.id,
            Arc::new(RwLock::new(MaterialState {
                material: material.clone(),
                loans: Vec::new(),
            })),
        );
        Ok(material)
    }

    async fn get_material(&self, id: Ulid) -> Result<Option<Material>, StoreError> {
        let Some(state) = self.material(&id) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(Some(guard.material.clone()))
    }

    async fn list_materials(&self, limit: usize) -> Result<Vec<Material>, StoreError> {
        let states: Vec<_> = self.materials.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for state in states {
            out.push(state.read().await.material.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out.truncate(limit);
        Ok(out)
    }

    async fn decrement_available(&self, material_id: Ulid, qty: u32) -> Result<bool, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let Some(state) = self.material(&material_id) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        if guard.material.available_qty < qty {
            return Ok(false);
        }
        let event = Event::StockDecremented { material_id, qty, at: now_ms() };
        self.journal(&event).await?;
        apply_to_material(&mut guard, &event);
        Ok(true)
    }

    async fn increment_available(&self, material_id: Ulid, qty: u32) -> Result<bool, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let Some(state) = self.material(&material_id) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        let event = Event::StockIncremented { material_id, qty, at: now_ms() };
        self.journal(&event).await?;
        apply_to_material(&mut guard, &event);
        Ok(true)
    }

    async fn insert_loan(&self, new: NewLoan) -> Result<MaterialLoan, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let state = self
            .material(&new.material_id)
            .ok_or(StoreError::MissingReference("loans.material_id"))?;
        let mut guard = state.write().await;
        if self.loan_owner.contains_key(&new.id) {
            return Err(StoreError::UniqueViolation("loans.id"));
        }
        let loan = MaterialLoan {
            id: new.id,
            material_id: new.material_id,
            patient_id: new.patient_id,
            practitioner_id: new.practitioner_id,
            qty: new.qty,
            notes: new.notes,
            loaned_at: new.loaned_at,
            returned_at: None,
        };
        let event = Event::LoanCreated(loan.clone());
        self.journal(&event).await?;
        apply_to_material(&mut guard, &event);
        self.index_event(&event);
        Ok(loan)
    }

    async fn get_loan(&self, id: Ulid) -> Result<Option<MaterialLoan>, StoreError> {
        let Some(material_id) = self.loan_owner.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(state) = self.material(&material_id) else {
            return Ok(None);
        };
        let guard = state.read().await;
        Ok(guard.loans.iter().find(|l| l.id == id).cloned())
    }

    async fn mark_returned(&self, loan_id: Ulid, at: Ms) -> Result<bool, StoreError> {
        let _gate = self.compaction_gate.read().await;
        let Some(material_id) = self.loan_owner.get(&loan_id).map(|e| *e.value()) else {
            return Ok(false);
        };
        let Some(state) = self.material(&material_id) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        let still_active = guard
            .loans
            .iter()
            .any(|l| l.id == loan_id && l.is_active());
        if !still_active {
            return Ok(false);
        }
        let event = Event::LoanReturned { id: loan_id, material_id, at };
        self.journal(&event).await?;
        apply_to_material(&mut guard, &event);
        Ok(true)
    }

    async fn list_loans_by_patient(
        &self,
        patient_id: Ulid,
        only_active: bool,
        limit: usize,
    ) -> Result<Vec<MaterialLoan>, StoreError> {
        let ids = self
            .patient_loans
            .get(&patient_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut out = Vec::new();
        for id in ids {
            if let Some(loan) = self.get_loan(id).await?
                && (!only_active || loan.is_active())
            {
                out.push(loan);
            }
        }
        out.sort_by(|a, b| b.loaned_at.cmp(&a.loaned_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn stock_snapshot(
        &self,
        material_id: Ulid,
    ) -> Result<Option<(Material, u32)>, StoreError> {
        let Some(state) = self.material(&material_id) else {
            return Ok(None);
        };
        let guard = state.read().await;
        let outstanding = guard
            .loans
            .iter()
            .filter(|l| l.is_active())
            .map(|l| l.qty)
            .sum();
        Ok(Some((guard.material.clone(), outstanding)))
    }
}
