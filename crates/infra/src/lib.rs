//! Infrastructure layer: onhand ledger, document store, engine orchestration.

pub mod audit;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod linkage;
pub mod repository;
pub mod retry;


pub use audit::{ONHAND_STREAM, OnhandChanged, TransitionRejected};
pub use config::EngineConfig;
pub use engine::InventoryEngine;
pub use errors::EngineError;
pub use ledger::{InMemoryOnhandLedger, OnhandLedger};
pub use repository::{DocumentRepository, DocumentStoreError, InMemoryDocumentRepository};
pub use retry::{BackoffStrategy, RetryPolicy};
