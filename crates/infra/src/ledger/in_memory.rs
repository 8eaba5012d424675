use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use stockflow_core::WarehouseCode;
use stockflow_inventory::{
    LedgerDelta, LedgerError, LedgerPosting, OnhandBalance, OnhandKey, OnhandRecord,
    StockAvailability,
};

use super::OnhandLedger;

type Slot = Arc<Mutex<OnhandBalance>>;

/// In-memory onhand ledger with one mutex per key.
///
/// A batch locks its keys in `OnhandKey` order, stages every delta on copies,
/// then commits all of them. Serial numbers are globally unique: batches that
/// move serials also take the serial registry lock, always after the key
/// locks.
#[derive(Debug)]
pub struct InMemoryOnhandLedger {
    records: RwLock<HashMap<OnhandKey, Slot>>,
    serials: Mutex<HashMap<String, OnhandKey>>,
    lock_timeout: Duration,
}

impl Default for InMemoryOnhandLedger {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl InMemoryOnhandLedger {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            serials: Mutex::new(HashMap::new()),
            lock_timeout,
        }
    }

    fn slot(&self, key: &OnhandKey) -> Slot {
        if let Some(slot) = self.records.read().get(key) {
            return slot.clone();
        }
        self.records
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(OnhandBalance::empty(key.clone()))))
            .clone()
    }
}

impl StockAvailability for InMemoryOnhandLedger {
    fn balance(&self, key: &OnhandKey) -> OnhandBalance {
        let slot = self.records.read().get(key).cloned();
        match slot {
            Some(slot) => slot.lock().clone(),
            None => OnhandBalance::empty(key.clone()),
        }
    }

    fn serial_location(&self, serial_no: &str) -> Option<OnhandKey> {
        self.serials.lock().get(serial_no).cloned()
    }
}

impl OnhandLedger for InMemoryOnhandLedger {
    fn post_batch(&self, postings: &[LedgerPosting]) -> Result<Vec<OnhandRecord>, LedgerError> {
        if postings.is_empty() {
            return Ok(Vec::new());
        }

        let mut grouped: BTreeMap<&OnhandKey, Vec<&LedgerDelta>> = BTreeMap::new();
        for posting in postings {
            grouped.entry(&posting.key).or_default().push(&posting.delta);
        }

        let slots: Vec<(&OnhandKey, Slot)> =
            grouped.keys().map(|key| (*key, self.slot(key))).collect();

        // Global key order: two batches can never wait on each other in a cycle.
        let mut guards = Vec::with_capacity(slots.len());
        for (key, slot) in &slots {
            let guard = slot
                .try_lock_for(self.lock_timeout)
                .ok_or_else(|| LedgerError::LedgerBusy { key: (*key).clone() })?;
            guards.push(guard);
        }

        let mut staged = Vec::with_capacity(guards.len());
        let mut added: Vec<(String, OnhandKey)> = Vec::new();
        let mut removed: Vec<String> = Vec::new();
        for ((key, deltas), guard) in grouped.iter().zip(guards.iter()) {
            let mut balance = (**guard).clone();
            for delta in deltas {
                let applied = balance.apply(delta)?;
                balance = applied.balance;
                added.extend(applied.serials_added.into_iter().map(|s| (s, (*key).clone())));
                removed.extend(applied.serials_removed);
            }
            staged.push(balance);
        }

        let moves_serials = postings.iter().any(|p| p.delta.has_serial_ops());
        let mut registry = if moves_serials {
            let first = slots[0].0.clone();
            Some(
                self.serials
                    .try_lock_for(self.lock_timeout)
                    .ok_or(LedgerError::LedgerBusy { key: first })?,
            )
        } else {
            None
        };

        if let Some(registry) = registry.as_deref() {
            let leaving: HashSet<&str> = removed.iter().map(String::as_str).collect();
            let mut arriving = HashSet::with_capacity(added.len());
            for (serial, key) in &added {
                let live_elsewhere =
                    registry.contains_key(serial) && !leaving.contains(serial.as_str());
                if live_elsewhere || !arriving.insert(serial.as_str()) {
                    return Err(LedgerError::SerialUnavailable {
                        key: key.clone(),
                        serial_no: serial.clone(),
                        reason: "already on hand elsewhere".to_string(),
                    });
                }
            }
        }

        let mut records = Vec::with_capacity(staged.len());
        for (guard, balance) in guards.iter_mut().zip(staged) {
            records.push(balance.record().clone());
            **guard = balance;
        }
        if let Some(registry) = registry.as_deref_mut() {
            for serial in &removed {
                registry.remove(serial);
            }
            for (serial, key) in added {
                registry.insert(serial, key);
            }
        }

        tracing::debug!(keys = records.len(), postings = postings.len(), "ledger batch committed");
        Ok(records)
    }

    fn list(&self, wh_code: &WarehouseCode) -> Vec<OnhandRecord> {
        let slots: Vec<Slot> = self
            .records
            .read()
            .iter()
            .filter(|(key, _)| &key.wh_code == wh_code)
            .map(|(_, slot)| slot.clone())
            .collect();

        let mut records: Vec<OnhandRecord> = slots
            .iter()
            .map(|slot| slot.lock().record().clone())
            .filter(|record| record.version > 0)
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{LocationCode, ModelCode};
    use stockflow_inventory::{SerialState, TrackingDetail, TrackingType};

    fn key(loc: &str, model: &str) -> OnhandKey {
        OnhandKey::new(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse(loc).unwrap(),
            ModelCode::parse(model).unwrap(),
        )
    }

    fn posting(key: OnhandKey, delta: LedgerDelta) -> LedgerPosting {
        LedgerPosting { key, delta }
    }

    #[test]
    fn untouched_keys_read_as_zero() {
        let ledger = InMemoryOnhandLedger::default();
        let record = ledger.get(&key("L1", "M1"));
        assert_eq!((record.onhand_qty, record.allocated_qty, record.version), (0, 0, 0));
        assert!(ledger.list(&WarehouseCode::parse("W1").unwrap()).is_empty());
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let ledger = InMemoryOnhandLedger::default();
        ledger.apply_delta(&key("L1", "A"), &LedgerDelta::quantity(5, 0)).unwrap();

        let err = ledger
            .post_batch(&[
                posting(key("L1", "A"), LedgerDelta::quantity(0, 5)),
                posting(key("L1", "B"), LedgerDelta::quantity(0, 1)),
            ])
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(ledger.get(&key("L1", "A")).allocated_qty, 0);
    }

    #[test]
    fn busy_key_times_out_as_ledger_busy() {
        let ledger = InMemoryOnhandLedger::new(Duration::from_millis(5));
        let k = key("L1", "A");
        let slot = ledger.slot(&k);
        let _held = slot.lock();

        let err = ledger.apply_delta(&k, &LedgerDelta::quantity(1, 0)).unwrap_err();
        assert_eq!(err, LedgerError::LedgerBusy { key: k });
    }

    #[test]
    fn serials_are_unique_across_locations() {
        let ledger = InMemoryOnhandLedger::default();
        let detail = TrackingDetail::serials(&["S1"]);
        ledger
            .apply_delta(&key("L1", "A"), &LedgerDelta::receipt(TrackingType::Serial, 1, &detail))
            .unwrap();
        assert_eq!(ledger.serial_location("S1"), Some(key("L1", "A")));

        let err = ledger
            .apply_delta(&key("L2", "A"), &LedgerDelta::receipt(TrackingType::Serial, 1, &detail))
            .unwrap_err();
        assert!(matches!(err, LedgerError::SerialUnavailable { .. }));
        assert_eq!(ledger.get(&key("L2", "A")).onhand_qty, 0);
    }

    #[test]
    fn consumed_serial_leaves_the_registry() {
        let ledger = InMemoryOnhandLedger::default();
        let k = key("L1", "A");
        let detail = TrackingDetail::serials(&["S1", "S2"]);
        let one = TrackingDetail::serials(&["S1"]);
        ledger.apply_delta(&k, &LedgerDelta::receipt(TrackingType::Serial, 2, &detail)).unwrap();
        ledger
            .post_batch(&[
                posting(k.clone(), LedgerDelta::reserve(TrackingType::Serial, 1, &one)),
                posting(k.clone(), LedgerDelta::consume(TrackingType::Serial, 1, &one)),
            ])
            .unwrap();

        assert_eq!(ledger.serial_location("S1"), None);
        assert_eq!(ledger.serials_at(&k), vec![("S2".to_string(), SerialState::Available)]);
        assert_eq!(ledger.list(&WarehouseCode::parse("W1").unwrap()).len(), 1);
    }
}
