//! Serial / lot detail validation.
//!
//! A line's detail list is a tagged union resolved once, against the line's
//! frozen [`TrackingType`]. Nothing downstream re-infers the tracking mode from
//! the shape of the data.

use std::collections::{BTreeMap, HashSet};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::onhand::{OnhandBalance, OnhandKey, SerialState};

/// How an item is tracked. A property of the model, frozen on every line and
/// on every onhand record once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingType {
    /// Bulk quantity only.
    #[default]
    None,
    /// Unit-level identity.
    Serial,
    /// Batch-level identity with quantity.
    Lot,
}

/// One lot within a lot-tracked line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotEntry {
    pub lot_code: String,
    pub qty: i64,
    pub expiry_date: Option<NaiveDate>,
}

impl LotEntry {
    pub fn new(lot_code: impl Into<String>, qty: i64) -> Self {
        Self {
            lot_code: lot_code.into(),
            qty,
            expiry_date: None,
        }
    }

    pub fn with_expiry(mut self, expiry_date: NaiveDate) -> Self {
        self.expiry_date = Some(expiry_date);
        self
    }
}

/// Tracking detail attached to a line.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "entries", rename_all = "lowercase")]
pub enum TrackingDetail {
    #[default]
    None,
    Serial(Vec<String>),
    Lot(Vec<LotEntry>),
}

impl TrackingDetail {
    pub fn serials(list: &[&str]) -> Self {
        Self::Serial(list.iter().map(|s| s.to_string()).collect())
    }

    pub fn lots(entries: Vec<LotEntry>) -> Self {
        Self::Lot(entries)
    }

    /// The tracking mode this detail list is shaped for. An empty `None`
    /// detail is compatible with any tracked line whose quantity is zero.
    pub fn kind(&self) -> TrackingType {
        match self {
            TrackingDetail::None => TrackingType::None,
            TrackingDetail::Serial(_) => TrackingType::Serial,
            TrackingDetail::Lot(_) => TrackingType::Lot,
        }
    }

    pub fn serial_numbers(&self) -> &[String] {
        match self {
            TrackingDetail::Serial(list) => list,
            _ => &[],
        }
    }

    pub fn lot_entries(&self) -> &[LotEntry] {
        match self {
            TrackingDetail::Lot(list) => list,
            _ => &[],
        }
    }

    /// Quantity the detail list accounts for.
    pub fn total_qty(&self) -> i64 {
        match self {
            TrackingDetail::None => 0,
            TrackingDetail::Serial(list) => list.len() as i64,
            TrackingDetail::Lot(list) => list.iter().map(|l| l.qty).sum(),
        }
    }
}

/// Which way stock moves for the operation being validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Receipt: serials must be new, lots may be new.
    Inbound,
    /// Issue / transfer-out: serials and lots must be available at the source.
    Outbound,
    /// Count entry: only internal consistency is checked.
    Count,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetailError {
    #[error("line {line_no}: serial {serial_no} is duplicated")]
    DuplicateSerial { line_no: u32, serial_no: String },

    #[error("line {line_no}: serial {serial_no} is not available at {location}")]
    SerialNotAvailable {
        line_no: u32,
        serial_no: String,
        location: String,
    },

    #[error("line {line_no}: {actual} serial numbers for declared quantity {declared}")]
    SerialCountMismatch {
        line_no: u32,
        declared: i64,
        actual: i64,
    },

    #[error("line {line_no}: lot quantities sum to {actual}, declared quantity is {declared}")]
    LotQtyMismatch {
        line_no: u32,
        declared: i64,
        actual: i64,
    },

    #[error("line {line_no}: lot {lot_code} has {available} available, {requested} requested")]
    InsufficientLotQty {
        line_no: u32,
        lot_code: String,
        requested: i64,
        available: i64,
    },

    #[error("line {line_no}: lot {lot_code} has invalid quantity {qty}")]
    InvalidLotQty {
        line_no: u32,
        lot_code: String,
        qty: i64,
    },

    #[error("line {line_no}: lot {lot_code} is listed more than once")]
    DuplicateLot { line_no: u32, lot_code: String },

    #[error("line {line_no}: blank serial number or lot code")]
    BlankCode { line_no: u32 },

    #[error("line {line_no}: {tracking:?}-tracked line cannot carry {found:?} details")]
    DetailKindMismatch {
        line_no: u32,
        tracking: TrackingType,
        found: TrackingType,
    },
}

/// Read access to live stock, used for availability checks.
pub trait StockAvailability {
    /// Snapshot of one onhand key (an empty balance if never touched).
    fn balance(&self, key: &OnhandKey) -> OnhandBalance;

    /// Where a live serial currently sits, if anywhere.
    fn serial_location(&self, serial_no: &str) -> Option<OnhandKey>;
}

/// Shape checks that need no ledger access: kind matches tracking type,
/// codes are non-blank and unique, quantities add up to `declared_qty`.
pub fn validate_shape(
    line_no: u32,
    tracking: TrackingType,
    declared_qty: i64,
    detail: &TrackingDetail,
) -> Result<(), DetailError> {
    let kind_ok = match (tracking, detail) {
        (TrackingType::None, TrackingDetail::None) => true,
        (TrackingType::None, _) => false,
        (TrackingType::Serial, TrackingDetail::Serial(_) | TrackingDetail::None) => true,
        (TrackingType::Lot, TrackingDetail::Lot(_) | TrackingDetail::None) => true,
        (TrackingType::Serial | TrackingType::Lot, _) => false,
    };
    if !kind_ok {
        return Err(DetailError::DetailKindMismatch {
            line_no,
            tracking,
            found: detail.kind(),
        });
    }

    match tracking {
        TrackingType::None => Ok(()),
        TrackingType::Serial => {
            let serials = detail.serial_numbers();
            let mut seen = HashSet::with_capacity(serials.len());
            for serial in serials {
                if serial.trim().is_empty() {
                    return Err(DetailError::BlankCode { line_no });
                }
                if !seen.insert(serial.as_str()) {
                    return Err(DetailError::DuplicateSerial {
                        line_no,
                        serial_no: serial.clone(),
                    });
                }
            }
            let actual = serials.len() as i64;
            if actual != declared_qty {
                return Err(DetailError::SerialCountMismatch {
                    line_no,
                    declared: declared_qty,
                    actual,
                });
            }
            Ok(())
        }
        TrackingType::Lot => {
            let lots = detail.lot_entries();
            let mut seen = HashSet::with_capacity(lots.len());
            for lot in lots {
                if lot.lot_code.trim().is_empty() {
                    return Err(DetailError::BlankCode { line_no });
                }
                if lot.qty <= 0 {
                    return Err(DetailError::InvalidLotQty {
                        line_no,
                        lot_code: lot.lot_code.clone(),
                        qty: lot.qty,
                    });
                }
                if !seen.insert(lot.lot_code.as_str()) {
                    return Err(DetailError::DuplicateLot {
                        line_no,
                        lot_code: lot.lot_code.clone(),
                    });
                }
            }
            let actual = detail.total_qty();
            if actual != declared_qty {
                return Err(DetailError::LotQtyMismatch {
                    line_no,
                    declared: declared_qty,
                    actual,
                });
            }
            Ok(())
        }
    }
}

/// Full validation of one line's details for a ledger-affecting operation.
///
/// Errors are reported, never corrected. The ledger re-checks the same
/// conditions inside its critical section, so a pass here is advisory.
pub fn validate_details(
    line_no: u32,
    tracking: TrackingType,
    declared_qty: i64,
    detail: &TrackingDetail,
    direction: Direction,
    source: &OnhandKey,
    stock: &dyn StockAvailability,
) -> Result<(), DetailError> {
    validate_shape(line_no, tracking, declared_qty, detail)?;

    match (tracking, direction) {
        (TrackingType::None, _) | (_, Direction::Count) => Ok(()),
        (TrackingType::Serial, Direction::Inbound) => {
            for serial in detail.serial_numbers() {
                if stock.serial_location(serial).is_some() {
                    return Err(DetailError::DuplicateSerial {
                        line_no,
                        serial_no: serial.clone(),
                    });
                }
            }
            Ok(())
        }
        (TrackingType::Serial, Direction::Outbound) => {
            let balance = stock.balance(source);
            for serial in detail.serial_numbers() {
                if balance.serial_state(serial) != Some(SerialState::Available) {
                    return Err(DetailError::SerialNotAvailable {
                        line_no,
                        serial_no: serial.clone(),
                        location: source.to_string(),
                    });
                }
            }
            Ok(())
        }
        (TrackingType::Lot, Direction::Inbound) => Ok(()),
        (TrackingType::Lot, Direction::Outbound) => {
            let balance = stock.balance(source);
            for lot in detail.lot_entries() {
                let available = balance.lot_available(&lot.lot_code);
                if available < lot.qty {
                    return Err(DetailError::InsufficientLotQty {
                        line_no,
                        lot_code: lot.lot_code.clone(),
                        requested: lot.qty,
                        available,
                    });
                }
            }
            Ok(())
        }
    }
}

/// Serial numbers must also be unique across all lines of one document.
pub fn ensure_unique_serials<'a>(
    lines: impl IntoIterator<Item = (u32, &'a TrackingDetail)>,
) -> Result<(), DetailError> {
    let mut owners: BTreeMap<&str, u32> = BTreeMap::new();
    for (line_no, detail) in lines {
        for serial in detail.serial_numbers() {
            if owners.insert(serial.as_str(), line_no).is_some() {
                return Err(DetailError::DuplicateSerial {
                    line_no,
                    serial_no: serial.clone(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onhand::{LedgerDelta, OnhandBalance};
    use std::collections::HashMap;

    use proptest::prelude::*;
    use stockflow_core::{LocationCode, ModelCode, WarehouseCode};

    fn key(model: &str) -> OnhandKey {
        OnhandKey::new(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse("L1").unwrap(),
            ModelCode::parse(model).unwrap(),
        )
    }

    #[derive(Default)]
    struct FakeStock {
        balances: HashMap<OnhandKey, OnhandBalance>,
    }

    impl FakeStock {
        fn receive(
            &mut self,
            key: &OnhandKey,
            tracking: TrackingType,
            qty: i64,
            detail: &TrackingDetail,
        ) {
            let balance = self
                .balances
                .remove(key)
                .unwrap_or_else(|| OnhandBalance::empty(key.clone()));
            let applied = balance
                .apply(&LedgerDelta::receipt(tracking, qty, detail))
                .unwrap();
            self.balances.insert(key.clone(), applied.balance);
        }
    }

    impl StockAvailability for FakeStock {
        fn balance(&self, key: &OnhandKey) -> OnhandBalance {
            self.balances
                .get(key)
                .cloned()
                .unwrap_or_else(|| OnhandBalance::empty(key.clone()))
        }

        fn serial_location(&self, serial_no: &str) -> Option<OnhandKey> {
            self.balances
                .iter()
                .find(|(_, b)| b.serial_state(serial_no).is_some())
                .map(|(k, _)| k.clone())
        }
    }

    #[test]
    fn untracked_line_rejects_details() {
        let err = validate_shape(1, TrackingType::None, 2, &TrackingDetail::serials(&["A", "B"]))
            .unwrap_err();
        assert!(matches!(err, DetailError::DetailKindMismatch { line_no: 1, .. }));
        assert!(validate_shape(1, TrackingType::None, 5, &TrackingDetail::None).is_ok());
    }

    #[test]
    fn serial_count_must_match_declared_quantity() {
        let err = validate_shape(2, TrackingType::Serial, 3, &TrackingDetail::serials(&["A", "B"]))
            .unwrap_err();
        assert_eq!(
            err,
            DetailError::SerialCountMismatch {
                line_no: 2,
                declared: 3,
                actual: 2
            }
        );
    }

    #[test]
    fn duplicate_serial_within_line_is_rejected() {
        let err = validate_shape(1, TrackingType::Serial, 2, &TrackingDetail::serials(&["A", "A"]))
            .unwrap_err();
        assert!(matches!(err, DetailError::DuplicateSerial { serial_no, .. } if serial_no == "A"));
    }

    #[test]
    fn lot_sum_must_match_declared_quantity() {
        let detail = TrackingDetail::lots(vec![LotEntry::new("L-1", 4), LotEntry::new("L-2", 5)]);
        let err = validate_shape(1, TrackingType::Lot, 10, &detail).unwrap_err();
        assert!(matches!(err, DetailError::LotQtyMismatch { declared: 10, actual: 9, .. }));
    }

    #[test]
    fn outbound_serial_must_be_available_at_source() {
        let mut stock = FakeStock::default();
        let k = key("M1");
        stock.receive(&k, TrackingType::Serial, 1, &TrackingDetail::serials(&["S1"]));

        let ok = validate_details(
            1,
            TrackingType::Serial,
            1,
            &TrackingDetail::serials(&["S1"]),
            Direction::Outbound,
            &k,
            &stock,
        );
        assert!(ok.is_ok());

        let err = validate_details(
            1,
            TrackingType::Serial,
            1,
            &TrackingDetail::serials(&["S9"]),
            Direction::Outbound,
            &k,
            &stock,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DetailError::SerialNotAvailable { serial_no, .. } if serial_no == "S9"
        ));
    }

    #[test]
    fn inbound_serial_must_not_be_live_anywhere() {
        let mut stock = FakeStock::default();
        stock.receive(&key("M1"), TrackingType::Serial, 1, &TrackingDetail::serials(&["S1"]));

        let err = validate_details(
            1,
            TrackingType::Serial,
            1,
            &TrackingDetail::serials(&["S1"]),
            Direction::Inbound,
            &key("M2"),
            &stock,
        )
        .unwrap_err();
        assert!(matches!(err, DetailError::DuplicateSerial { .. }));
    }

    #[test]
    fn outbound_lot_needs_enough_available_quantity() {
        let mut stock = FakeStock::default();
        let k = key("M1");
        stock.receive(
            &k,
            TrackingType::Lot,
            5,
            &TrackingDetail::lots(vec![LotEntry::new("LOT-A", 5)]),
        );

        let err = validate_details(
            3,
            TrackingType::Lot,
            6,
            &TrackingDetail::lots(vec![LotEntry::new("LOT-A", 6)]),
            Direction::Outbound,
            &k,
            &stock,
        )
        .unwrap_err();
        assert_eq!(
            err,
            DetailError::InsufficientLotQty {
                line_no: 3,
                lot_code: "LOT-A".to_string(),
                requested: 6,
                available: 5
            }
        );
    }

    #[test]
    fn serials_are_unique_across_document_lines() {
        let a = TrackingDetail::serials(&["S1", "S2"]);
        let b = TrackingDetail::serials(&["S3", "S2"]);
        let err = ensure_unique_serials([(1, &a), (2, &b)]).unwrap_err();
        assert!(matches!(err, DetailError::DuplicateSerial { line_no: 2, .. }));
    }

    proptest! {
        /// Accepted lot lines always satisfy sum(detail.qty) == declared.
        #[test]
        fn accepted_lot_lines_sum_to_declared(
            qtys in prop::collection::vec(1i64..500, 1..8),
            skew in -3i64..3,
        ) {
            let entries = qtys
                .iter()
                .enumerate()
                .map(|(i, q)| LotEntry::new(format!("LOT-{i}"), *q))
                .collect::<Vec<_>>();
            let detail = TrackingDetail::lots(entries);
            let declared = qtys.iter().sum::<i64>() + skew;

            let result = validate_shape(1, TrackingType::Lot, declared, &detail);
            prop_assert_eq!(result.is_ok(), detail.total_qty() == declared);
        }
    }
}
