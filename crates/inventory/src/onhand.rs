//! Onhand balances and ledger deltas (pure).
//!
//! [`OnhandBalance::apply`] is the only way a balance changes. It never
//! mutates in place: it returns the next state, so a caller holding the key's
//! critical section can stage several deltas and commit all or none.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::{LocationCode, ModelCode, WarehouseCode};

use crate::tracking::{TrackingDetail, TrackingType};

/// Ledger key: one onhand record per (warehouse, location, model).
///
/// `Ord` gives the global lock order used when one posting spans several keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OnhandKey {
    pub wh_code: WarehouseCode,
    pub loc_code: LocationCode,
    pub model_code: ModelCode,
}

impl OnhandKey {
    pub fn new(wh_code: WarehouseCode, loc_code: LocationCode, model_code: ModelCode) -> Self {
        Self {
            wh_code,
            loc_code,
            model_code,
        }
    }
}

impl core::fmt::Display for OnhandKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.wh_code, self.loc_code, self.model_code)
    }
}

/// Quantities at one key. `available_qty()` is derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnhandRecord {
    pub key: OnhandKey,
    pub tracking_type: TrackingType,
    pub onhand_qty: i64,
    pub allocated_qty: i64,
    /// Number of deltas applied; 0 means the record has never been touched.
    pub version: u64,
}

impl OnhandRecord {
    pub fn empty(key: OnhandKey) -> Self {
        Self {
            key,
            tracking_type: TrackingType::None,
            onhand_qty: 0,
            allocated_qty: 0,
            version: 0,
        }
    }

    pub fn available_qty(&self) -> i64 {
        self.onhand_qty - self.allocated_qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialState {
    Available,
    Allocated,
}

/// One lot's quantities at a key. Lot rows are keyed by (key, lot_code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotBalance {
    pub lot_code: String,
    pub qty: i64,
    pub allocated_qty: i64,
    pub expiry_date: Option<NaiveDate>,
}

impl LotBalance {
    pub fn available_qty(&self) -> i64 {
        self.qty - self.allocated_qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialAction {
    /// New serial arrives (available).
    Receive,
    /// Available → allocated.
    Reserve,
    /// Allocated → available.
    Release,
    /// Allocated serial leaves (shipped).
    Consume,
    /// Available serial leaves (count adjustment).
    WriteOff,
    /// A consumed serial comes back still allocated (undoes `Consume`).
    Reinstate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialOp {
    pub serial_no: String,
    pub action: SerialAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotDelta {
    pub lot_code: String,
    pub qty_delta: i64,
    pub allocated_delta: i64,
    pub expiry_date: Option<NaiveDate>,
}

/// Detail-level part of a delta.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ops", rename_all = "lowercase")]
pub enum TrackingDelta {
    #[default]
    None,
    Serials(Vec<SerialOp>),
    Lots(Vec<LotDelta>),
}

/// A change to one onhand key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDelta {
    pub tracking_type: TrackingType,
    pub qty_delta: i64,
    pub allocated_delta: i64,
    pub tracking: TrackingDelta,
}

impl LedgerDelta {
    /// Bare quantity delta for an untracked item.
    pub fn quantity(qty_delta: i64, allocated_delta: i64) -> Self {
        Self {
            tracking_type: TrackingType::None,
            qty_delta,
            allocated_delta,
            tracking: TrackingDelta::None,
        }
    }

    /// Goods arrive: onhand += qty.
    pub fn receipt(tracking_type: TrackingType, qty: i64, detail: &TrackingDetail) -> Self {
        Self::movement(tracking_type, qty, 0, SerialAction::Receive, detail)
    }

    /// Pick: allocated += qty.
    pub fn reserve(tracking_type: TrackingType, qty: i64, detail: &TrackingDetail) -> Self {
        Self::movement(tracking_type, 0, qty, SerialAction::Reserve, detail)
    }

    /// Undo a pick: allocated -= qty.
    pub fn release(tracking_type: TrackingType, qty: i64, detail: &TrackingDetail) -> Self {
        Self::movement(tracking_type, 0, -qty, SerialAction::Release, detail)
    }

    /// Confirmed shipment of reserved stock: onhand -= qty, allocated -= qty.
    pub fn consume(tracking_type: TrackingType, qty: i64, detail: &TrackingDetail) -> Self {
        Self::movement(tracking_type, -qty, -qty, SerialAction::Consume, detail)
    }

    fn movement(
        tracking_type: TrackingType,
        qty_delta: i64,
        allocated_delta: i64,
        serial_action: SerialAction,
        detail: &TrackingDetail,
    ) -> Self {
        let tracking = match tracking_type {
            TrackingType::None => TrackingDelta::None,
            TrackingType::Serial => TrackingDelta::Serials(
                detail
                    .serial_numbers()
                    .iter()
                    .map(|s| SerialOp {
                        serial_no: s.clone(),
                        action: serial_action,
                    })
                    .collect(),
            ),
            TrackingType::Lot => TrackingDelta::Lots(
                detail
                    .lot_entries()
                    .iter()
                    .map(|lot| LotDelta {
                        lot_code: lot.lot_code.clone(),
                        qty_delta: qty_delta.signum() * lot.qty,
                        allocated_delta: allocated_delta.signum() * lot.qty,
                        expiry_date: lot.expiry_date,
                    })
                    .collect(),
            ),
        };
        Self {
            tracking_type,
            qty_delta,
            allocated_delta,
            tracking,
        }
    }

    pub fn has_serial_ops(&self) -> bool {
        matches!(&self.tracking, TrackingDelta::Serials(ops) if !ops.is_empty())
    }

    /// The delta that undoes this one.
    pub fn inverse(&self) -> Self {
        let tracking = match &self.tracking {
            TrackingDelta::None => TrackingDelta::None,
            TrackingDelta::Serials(ops) => TrackingDelta::Serials(
                ops.iter()
                    .map(|op| SerialOp {
                        serial_no: op.serial_no.clone(),
                        action: match op.action {
                            SerialAction::Receive => SerialAction::WriteOff,
                            SerialAction::WriteOff => SerialAction::Receive,
                            SerialAction::Reserve => SerialAction::Release,
                            SerialAction::Release => SerialAction::Reserve,
                            SerialAction::Consume => SerialAction::Reinstate,
                            SerialAction::Reinstate => SerialAction::Consume,
                        },
                    })
                    .collect(),
            ),
            TrackingDelta::Lots(lots) => TrackingDelta::Lots(
                lots.iter()
                    .map(|l| LotDelta {
                        lot_code: l.lot_code.clone(),
                        qty_delta: -l.qty_delta,
                        allocated_delta: -l.allocated_delta,
                        expiry_date: l.expiry_date,
                    })
                    .collect(),
            ),
        };
        Self {
            tracking_type: self.tracking_type,
            qty_delta: -self.qty_delta,
            allocated_delta: -self.allocated_delta,
            tracking,
        }
    }
}

/// A delta addressed to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub key: OnhandKey,
    pub delta: LedgerDelta,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error(
        "insufficient stock at {key}: onhand {onhand_qty}, allocated {allocated_qty}, \
         requested onhand {qty_delta:+}, allocated {allocated_delta:+}"
    )]
    InsufficientStock {
        key: OnhandKey,
        onhand_qty: i64,
        allocated_qty: i64,
        qty_delta: i64,
        allocated_delta: i64,
    },

    #[error("ledger key {key} is busy; retry later")]
    LedgerBusy { key: OnhandKey },

    #[error("tracking type of {key} is {existing:?}, delta is {requested:?}")]
    TrackingTypeMismatch {
        key: OnhandKey,
        existing: TrackingType,
        requested: TrackingType,
    },

    #[error("serial {serial_no} at {key}: {reason}")]
    SerialUnavailable {
        key: OnhandKey,
        serial_no: String,
        reason: String,
    },

    #[error("lot {lot_code} at {key}: {available} available, {requested} requested")]
    InsufficientLotQty {
        key: OnhandKey,
        lot_code: String,
        requested: i64,
        available: i64,
    },

    #[error("tracking detail inconsistent at {key}: {reason}")]
    TrackingInconsistent { key: OnhandKey, reason: String },
}

impl LedgerError {
    /// Only contention is worth retrying; everything else is final for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LedgerBusy { .. })
    }

    pub fn key(&self) -> &OnhandKey {
        match self {
            LedgerError::InsufficientStock { key, .. }
            | LedgerError::LedgerBusy { key }
            | LedgerError::TrackingTypeMismatch { key, .. }
            | LedgerError::SerialUnavailable { key, .. }
            | LedgerError::InsufficientLotQty { key, .. }
            | LedgerError::TrackingInconsistent { key, .. } => key,
        }
    }
}

/// Full state of one key: quantities plus serial and lot rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnhandBalance {
    record: OnhandRecord,
    serials: BTreeMap<String, SerialState>,
    lots: BTreeMap<String, LotBalance>,
}

/// Result of staging a delta: the next balance and serial registry changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedDelta {
    pub balance: OnhandBalance,
    pub serials_added: Vec<String>,
    pub serials_removed: Vec<String>,
}

impl OnhandBalance {
    pub fn empty(key: OnhandKey) -> Self {
        Self {
            record: OnhandRecord::empty(key),
            serials: BTreeMap::new(),
            lots: BTreeMap::new(),
        }
    }

    pub fn record(&self) -> &OnhandRecord {
        &self.record
    }

    pub fn key(&self) -> &OnhandKey {
        &self.record.key
    }

    pub fn serial_state(&self, serial_no: &str) -> Option<SerialState> {
        self.serials.get(serial_no).copied()
    }

    pub fn serials(&self) -> impl Iterator<Item = (&str, SerialState)> {
        self.serials.iter().map(|(s, st)| (s.as_str(), *st))
    }

    pub fn lots(&self) -> impl Iterator<Item = &LotBalance> {
        self.lots.values()
    }

    pub fn lot_available(&self, lot_code: &str) -> i64 {
        self.lots.get(lot_code).map(LotBalance::available_qty).unwrap_or(0)
    }

    /// Stage `delta` against this balance.
    pub fn apply(&self, delta: &LedgerDelta) -> Result<AppliedDelta, LedgerError> {
        let key = self.record.key.clone();

        if self.record.version > 0 && self.record.tracking_type != delta.tracking_type {
            return Err(LedgerError::TrackingTypeMismatch {
                key,
                existing: self.record.tracking_type,
                requested: delta.tracking_type,
            });
        }

        let onhand_qty = self.record.onhand_qty + delta.qty_delta;
        let allocated_qty = self.record.allocated_qty + delta.allocated_delta;
        if onhand_qty < 0 || allocated_qty < 0 || onhand_qty - allocated_qty < 0 {
            return Err(LedgerError::InsufficientStock {
                key,
                onhand_qty: self.record.onhand_qty,
                allocated_qty: self.record.allocated_qty,
                qty_delta: delta.qty_delta,
                allocated_delta: delta.allocated_delta,
            });
        }

        let mut next = self.clone();
        next.record.tracking_type = delta.tracking_type;
        next.record.onhand_qty = onhand_qty;
        next.record.allocated_qty = allocated_qty;
        next.record.version += 1;

        let mut serials_added = Vec::new();
        let mut serials_removed = Vec::new();

        match (&delta.tracking, delta.tracking_type) {
            (TrackingDelta::None, TrackingType::None) => {}
            (TrackingDelta::Serials(ops), TrackingType::Serial) => {
                for op in ops {
                    next.apply_serial_op(op, &mut serials_added, &mut serials_removed)?;
                }
            }
            (TrackingDelta::Lots(lots), TrackingType::Lot) => {
                for lot in lots {
                    next.apply_lot_delta(lot)?;
                }
            }
            (TrackingDelta::None, _) if delta.qty_delta == 0 && delta.allocated_delta == 0 => {}
            (tracking, tracking_type) => {
                return Err(LedgerError::TrackingInconsistent {
                    key,
                    reason: format!("{tracking_type:?} delta carries {tracking:?}"),
                });
            }
        }

        next.check_consistency()?;

        Ok(AppliedDelta {
            balance: next,
            serials_added,
            serials_removed,
        })
    }

    fn apply_serial_op(
        &mut self,
        op: &SerialOp,
        added: &mut Vec<String>,
        removed: &mut Vec<String>,
    ) -> Result<(), LedgerError> {
        let current = self.serials.get(&op.serial_no).copied();
        let key = self.record.key.clone();
        let unavailable = |reason: &str| LedgerError::SerialUnavailable {
            key: key.clone(),
            serial_no: op.serial_no.clone(),
            reason: reason.to_string(),
        };

        match (op.action, current) {
            (SerialAction::Receive, None) => {
                self.serials.insert(op.serial_no.clone(), SerialState::Available);
                added.push(op.serial_no.clone());
            }
            (SerialAction::Reinstate, None) => {
                self.serials.insert(op.serial_no.clone(), SerialState::Allocated);
                added.push(op.serial_no.clone());
            }
            (SerialAction::Receive | SerialAction::Reinstate, Some(_)) => {
                return Err(unavailable("already on hand"));
            }
            (SerialAction::Reserve, Some(SerialState::Available)) => {
                self.serials.insert(op.serial_no.clone(), SerialState::Allocated);
            }
            (SerialAction::Release, Some(SerialState::Allocated)) => {
                self.serials.insert(op.serial_no.clone(), SerialState::Available);
            }
            (SerialAction::Consume, Some(SerialState::Allocated))
            | (SerialAction::WriteOff, Some(SerialState::Available)) => {
                self.serials.remove(&op.serial_no);
                removed.push(op.serial_no.clone());
            }
            (SerialAction::Reserve | SerialAction::WriteOff, _) => {
                return Err(unavailable("not available"));
            }
            (SerialAction::Release | SerialAction::Consume, _) => {
                return Err(unavailable("not allocated"));
            }
        }
        Ok(())
    }

    fn apply_lot_delta(&mut self, delta: &LotDelta) -> Result<(), LedgerError> {
        let key = self.record.key.clone();
        let current = self.lots.get(&delta.lot_code).cloned().unwrap_or(LotBalance {
            lot_code: delta.lot_code.clone(),
            qty: 0,
            allocated_qty: 0,
            expiry_date: delta.expiry_date,
        });

        let qty = current.qty + delta.qty_delta;
        let allocated_qty = current.allocated_qty + delta.allocated_delta;
        if qty < 0 || allocated_qty < 0 || qty - allocated_qty < 0 {
            return Err(LedgerError::InsufficientLotQty {
                key,
                lot_code: delta.lot_code.clone(),
                requested: -(delta.qty_delta.min(0)) + delta.allocated_delta.max(0),
                available: current.available_qty(),
            });
        }

        if qty == 0 && allocated_qty == 0 {
            self.lots.remove(&delta.lot_code);
        } else {
            self.lots.insert(
                delta.lot_code.clone(),
                LotBalance {
                    lot_code: delta.lot_code.clone(),
                    qty,
                    allocated_qty,
                    expiry_date: current.expiry_date.or(delta.expiry_date),
                },
            );
        }
        Ok(())
    }

    fn check_consistency(&self) -> Result<(), LedgerError> {
        let mismatch = |reason: String| LedgerError::TrackingInconsistent {
            key: self.record.key.clone(),
            reason,
        };

        match self.record.tracking_type {
            TrackingType::None => Ok(()),
            TrackingType::Serial => {
                let live = self.serials.len() as i64;
                let allocated = self
                    .serials
                    .values()
                    .filter(|s| **s == SerialState::Allocated)
                    .count() as i64;
                if live != self.record.onhand_qty || allocated != self.record.allocated_qty {
                    return Err(mismatch(format!(
                        "{live} serials ({allocated} allocated) for onhand {} (allocated {})",
                        self.record.onhand_qty, self.record.allocated_qty
                    )));
                }
                Ok(())
            }
            TrackingType::Lot => {
                let qty: i64 = self.lots.values().map(|l| l.qty).sum();
                let allocated: i64 = self.lots.values().map(|l| l.allocated_qty).sum();
                if qty != self.record.onhand_qty || allocated != self.record.allocated_qty {
                    return Err(mismatch(format!(
                        "lots sum to {qty} ({allocated} allocated) for onhand {} (allocated {})",
                        self.record.onhand_qty, self.record.allocated_qty
                    )));
                }
                Ok(())
            }
        }
    }
}
