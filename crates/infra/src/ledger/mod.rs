//! Onhand ledger boundary.
//!
//! The ledger is the only shared mutable state in the engine. Each
//! (warehouse, location, model) key is its own serialization domain: deltas to
//! one key run one at a time, deltas to disjoint keys run in parallel.

pub mod in_memory;

pub use in_memory::InMemoryOnhandLedger;

use stockflow_core::WarehouseCode;
use stockflow_inventory::{
    LedgerDelta, LedgerError, LedgerPosting, LotBalance, OnhandKey, OnhandRecord, SerialState,
    StockAvailability,
};

pub trait OnhandLedger: StockAvailability + Send + Sync {
    /// Apply every posting or none. Postings for the same key apply in order.
    fn post_batch(&self, postings: &[LedgerPosting]) -> Result<Vec<OnhandRecord>, LedgerError>;

    /// Single-key delta.
    fn apply_delta(
        &self,
        key: &OnhandKey,
        delta: &LedgerDelta,
    ) -> Result<OnhandRecord, LedgerError> {
        let posting = LedgerPosting {
            key: key.clone(),
            delta: delta.clone(),
        };
        let mut records = self.post_batch(std::slice::from_ref(&posting))?;
        Ok(records.pop().unwrap_or_else(|| OnhandRecord::empty(key.clone())))
    }

    /// Current record; an untouched key reads as all zeros.
    fn get(&self, key: &OnhandKey) -> OnhandRecord {
        self.balance(key).record().clone()
    }

    /// Every touched record in a warehouse, ordered by key.
    fn list(&self, wh_code: &WarehouseCode) -> Vec<OnhandRecord>;

    fn serials_at(&self, key: &OnhandKey) -> Vec<(String, SerialState)> {
        self.balance(key)
            .serials()
            .map(|(serial, state)| (serial.to_string(), state))
            .collect()
    }

    fn lots_at(&self, key: &OnhandKey) -> Vec<LotBalance> {
        self.balance(key).lots().cloned().collect()
    }
}
