//! Domain core: the appointment [`Scheduler`] and the material [`Ledger`],
//! both written against the storage ports in [`crate::store`].

mod conflict;
mod error;
mod ledger;
pub mod request;
mod scheduler;
#[cfg(test)]
mod tests;

pub use error::{Conflict, EngineError, FieldError};
pub use ledger::{Ledger, StockDrift};
pub use scheduler::Scheduler;

use std::sync::Arc;

use crate::store::Store;

/// Both components over one shared [`Store`].
pub struct Engine {
    pub scheduler: Scheduler<Store>,
    pub ledger: Ledger<Store>,
}

impl Engine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()),
            ledger: Ledger::new(store),
        }
    }
}
