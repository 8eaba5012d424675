//! Inventory count: system snapshot, counted quantities, variance and the
//! adjustment each discrepancy line posts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::ModelCode;

use crate::document::{DocStatus, DocType, Document, DocumentLine, LineQty, ValidationError};
use crate::onhand::{
    LedgerDelta, LedgerError, LotDelta, OnhandBalance, SerialAction, SerialOp, SerialState,
    TrackingDelta,
};
use crate::status::TransitionError;
use crate::tracking::{self, TrackingDetail, TrackingType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceClass {
    Exact,
    Discrepancy,
    NotCounted,
}

/// `counted - system`, or `None` while the line is uncounted.
pub fn variance(system_qty: i64, counted_qty: Option<i64>) -> Option<i64> {
    counted_qty.map(|counted| counted - system_qty)
}

pub fn classify(variance: Option<i64>) -> VarianceClass {
    match variance {
        None => VarianceClass::NotCounted,
        Some(0) => VarianceClass::Exact,
        Some(_) => VarianceClass::Discrepancy,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineVariance {
    pub line_no: u32,
    pub model_code: ModelCode,
    pub tracking_type: TrackingType,
    pub system_qty: i64,
    pub counted_qty: Option<i64>,
    pub variance: Option<i64>,
    pub class: VarianceClass,
    pub is_recounted: bool,
    pub adjustment_posted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarianceSummary {
    pub doc_no: String,
    pub status: DocStatus,
    pub exact: usize,
    pub discrepancy: usize,
    pub not_counted: usize,
    pub lines: Vec<LineVariance>,
}

/// A counted quantity for one line. Tracked lines also list what was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountEntry {
    pub line_no: u32,
    pub counted_qty: i64,
    #[serde(default)]
    pub detail: TrackingDetail,
}

impl CountEntry {
    pub fn new(line_no: u32, counted_qty: i64) -> Self {
        Self {
            line_no,
            counted_qty,
            detail: TrackingDetail::None,
        }
    }

    pub fn with_detail(mut self, detail: TrackingDetail) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CountError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("invalid count entries: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedAdjustment {
    pub line_no: u32,
    pub model_code: ModelCode,
    pub variance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAdjustment {
    pub line_no: u32,
    pub model_code: ModelCode,
    pub variance: i64,
    pub error: LedgerError,
}

/// Outcome of completing a count. Each discrepancy line is its own commit
/// unit, so one may post while another fails.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdjustmentReport {
    pub doc_no: String,
    pub posted: Vec<PostedAdjustment>,
    pub failed: Vec<FailedAdjustment>,
}

impl AdjustmentReport {
    pub fn new(doc_no: impl Into<String>) -> Self {
        Self {
            doc_no: doc_no.into(),
            ..Self::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl DocumentLine {
    pub fn system_qty(&self) -> Option<i64> {
        match self.qty {
            LineQty::Count { system_qty, .. } => system_qty,
            _ => None,
        }
    }

    pub fn counted_qty(&self) -> Option<i64> {
        match self.qty {
            LineQty::Count { counted_qty, .. } => counted_qty,
            _ => None,
        }
    }

    pub fn variance(&self) -> Option<i64> {
        variance(self.system_qty().unwrap_or(0), self.counted_qty())
    }

    pub fn variance_class(&self) -> VarianceClass {
        classify(self.variance())
    }
}

impl Document {
    /// Variance view of a count, `None` for other document types.
    pub fn variance_summary(&self) -> Option<VarianceSummary> {
        if self.doc_type != DocType::InventoryCount {
            return None;
        }

        let lines: Vec<LineVariance> = self
            .lines
            .iter()
            .map(|line| {
                let variance = line.variance();
                LineVariance {
                    line_no: line.line_no,
                    model_code: line.model_code.clone(),
                    tracking_type: line.tracking_type,
                    system_qty: line.system_qty().unwrap_or(0),
                    counted_qty: line.counted_qty(),
                    variance,
                    class: classify(variance),
                    is_recounted: line.is_recounted,
                    adjustment_posted: line.adjustment_posted,
                }
            })
            .collect();

        let tally = |class| lines.iter().filter(|l| l.class == class).count();
        Some(VarianceSummary {
            doc_no: self.doc_no.clone(),
            status: self.status,
            exact: tally(VarianceClass::Exact),
            discrepancy: tally(VarianceClass::Discrepancy),
            not_counted: tally(VarianceClass::NotCounted),
            lines,
        })
    }

    /// Capture the ledger quantity for a line when counting starts.
    pub fn snapshot_system_qty(&mut self, line_no: u32, qty: i64) {
        if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == line_no) {
            if let LineQty::Count { system_qty, .. } = &mut line.qty {
                *system_qty = Some(qty);
            }
        }
    }

    /// Record counted quantities while in `Counting`. During a recount only
    /// flagged lines accept entries.
    pub fn record_counts(
        &mut self,
        entries: &[CountEntry],
        at: DateTime<Utc>,
    ) -> Result<(), CountError> {
        if self.doc_type != DocType::InventoryCount || self.status != DocStatus::Counting {
            return Err(TransitionError::DocumentLocked {
                doc_no: self.doc_no.clone(),
                status: self.status,
            }
            .into());
        }

        let recounting = self.lines.iter().any(|l| l.is_recounted);
        let mut errors = Vec::new();
        for entry in entries {
            let Some(line) = self.line(entry.line_no) else {
                errors.push(ValidationError::line(entry.line_no, "line_no", "no such line"));
                continue;
            };
            if entry.counted_qty < 0 {
                errors.push(ValidationError::line(
                    entry.line_no,
                    "counted_qty",
                    "cannot be negative",
                ));
                continue;
            }
            if recounting && !line.is_recounted {
                errors.push(ValidationError::line(
                    entry.line_no,
                    "line_no",
                    "line is not flagged for recount",
                ));
                continue;
            }
            if let Err(e) = tracking::validate_shape(
                entry.line_no,
                line.tracking_type,
                entry.counted_qty,
                &entry.detail,
            ) {
                errors.push(ValidationError::line(entry.line_no, "detail", e.to_string()));
            }
        }
        let details = entries.iter().map(|e| (e.line_no, &e.detail));
        if let Err(e) = tracking::ensure_unique_serials(details) {
            errors.push(ValidationError::header("detail", e.to_string()));
        }
        if !errors.is_empty() {
            return Err(CountError::Invalid(errors));
        }

        for entry in entries {
            if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == entry.line_no) {
                if let LineQty::Count { counted_qty, .. } = &mut line.qty {
                    *counted_qty = Some(entry.counted_qty);
                }
                line.detail = entry.detail.clone();
            }
        }
        self.touch(at);
        Ok(())
    }

    /// Flag lines for a second pass and clear their counts. Flags from a
    /// previous round are dropped.
    pub fn flag_recount(&mut self, line_nos: &[u32]) -> Result<(), Vec<ValidationError>> {
        if line_nos.is_empty() {
            return Err(vec![ValidationError::header("lines", "at least one line must be flagged")]);
        }
        let unknown: Vec<ValidationError> = line_nos
            .iter()
            .filter(|n| self.line(**n).is_none())
            .map(|n| ValidationError::line(*n, "line_no", "no such line"))
            .collect();
        if !unknown.is_empty() {
            return Err(unknown);
        }

        for line in &mut self.lines {
            line.is_recounted = line_nos.contains(&line.line_no);
            if line.is_recounted {
                if let LineQty::Count { counted_qty, .. } = &mut line.qty {
                    *counted_qty = None;
                }
                line.detail = TrackingDetail::None;
            }
        }
        Ok(())
    }

    /// Completion requires every line counted.
    pub fn ensure_fully_counted(&self) -> Result<(), TransitionError> {
        let missing: Vec<String> = self
            .lines
            .iter()
            .filter(|l| l.counted_qty().is_none())
            .map(|l| l.line_no.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(TransitionError::NotReady {
                doc_no: self.doc_no.clone(),
                reason: format!("lines not counted: {}", missing.join(", ")),
            })
        }
    }

    /// Discrepancy lines whose adjustment has not been committed yet.
    pub fn pending_adjustments(&self) -> impl Iterator<Item = &DocumentLine> {
        self.lines
            .iter()
            .filter(|l| l.variance_class() == VarianceClass::Discrepancy && !l.adjustment_posted)
    }

    pub fn mark_adjustment_posted(&mut self, line_no: u32, at: DateTime<Utc>) {
        if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == line_no) {
            line.adjustment_posted = true;
            self.touch(at);
        }
    }
}

/// Build the delta that brings `live` in line with a counted line.
///
/// Serial lines receive counted serials that are not on hand and write off
/// available serials that were not found. Lot lines post the per-lot
/// difference. The detail changes must net to the line's variance.
pub fn plan_adjustment(
    line: &DocumentLine,
    live: &OnhandBalance,
) -> Result<LedgerDelta, LedgerError> {
    let variance = line.variance().unwrap_or(0);
    let key = live.key().clone();
    let inconsistent = |reason: String| LedgerError::TrackingInconsistent {
        key: key.clone(),
        reason,
    };

    match line.tracking_type {
        TrackingType::None => Ok(LedgerDelta::quantity(variance, 0)),
        TrackingType::Serial => {
            let counted: BTreeSet<&str> =
                line.detail.serial_numbers().iter().map(String::as_str).collect();
            let mut ops = Vec::new();
            for serial in &counted {
                if live.serial_state(serial).is_none() {
                    ops.push(SerialOp {
                        serial_no: serial.to_string(),
                        action: SerialAction::Receive,
                    });
                }
            }
            for (serial, state) in live.serials() {
                if state == SerialState::Available && !counted.contains(serial) {
                    ops.push(SerialOp {
                        serial_no: serial.to_string(),
                        action: SerialAction::WriteOff,
                    });
                }
            }
            let net: i64 = ops
                .iter()
                .map(|op| if op.action == SerialAction::Receive { 1 } else { -1 })
                .sum();
            if net != variance {
                return Err(inconsistent(format!(
                    "counted serials change onhand by {net}, variance is {variance}"
                )));
            }
            Ok(LedgerDelta {
                tracking_type: TrackingType::Serial,
                qty_delta: variance,
                allocated_delta: 0,
                tracking: TrackingDelta::Serials(ops),
            })
        }
        TrackingType::Lot => {
            let mut diffs: BTreeMap<&str, LotDelta> = BTreeMap::new();
            for lot in live.lots() {
                diffs.insert(
                    lot.lot_code.as_str(),
                    LotDelta {
                        lot_code: lot.lot_code.clone(),
                        qty_delta: -lot.qty,
                        allocated_delta: 0,
                        expiry_date: lot.expiry_date,
                    },
                );
            }
            for lot in line.detail.lot_entries() {
                let entry = diffs.entry(lot.lot_code.as_str()).or_insert_with(|| LotDelta {
                    lot_code: lot.lot_code.clone(),
                    qty_delta: 0,
                    allocated_delta: 0,
                    expiry_date: lot.expiry_date,
                });
                entry.qty_delta += lot.qty;
            }
            let lots: Vec<LotDelta> = diffs.into_values().filter(|d| d.qty_delta != 0).collect();
            let net: i64 = lots.iter().map(|d| d.qty_delta).sum();
            if net != variance {
                return Err(inconsistent(format!(
                    "counted lots change onhand by {net}, variance is {variance}"
                )));
            }
            Ok(LedgerDelta {
                tracking_type: TrackingType::Lot,
                qty_delta: variance,
                allocated_delta: 0,
                tracking: TrackingDelta::Lots(lots),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentHeader, LineInput};
    use crate::onhand::OnhandKey;
    use crate::tracking::LotEntry;
    use stockflow_core::{DocumentId, LocationCode, UserId, WarehouseCode};

    fn model(code: &str) -> ModelCode {
        ModelCode::parse(code).unwrap()
    }

    fn counting_doc(lines: Vec<LineInput>) -> Document {
        let header = DocumentHeader::new(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse("L1").unwrap(),
        );
        let mut doc = Document::create(
            DocumentId::new(),
            "IC-000001",
            DocType::InventoryCount,
            header,
            lines,
            UserId::new(),
            Utc::now(),
        )
        .unwrap();
        doc.transition_to(DocStatus::Counting, UserId::new(), Utc::now(), None);
        doc
    }

    fn live(
        model_code: &str,
        tracking: TrackingType,
        qty: i64,
        detail: &TrackingDetail,
    ) -> OnhandBalance {
        let key = OnhandKey::new(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse("L1").unwrap(),
            model(model_code),
        );
        OnhandBalance::empty(key)
            .apply(&LedgerDelta::receipt(tracking, qty, detail))
            .unwrap()
            .balance
    }

    #[test]
    fn summary_classifies_each_line() {
        let mut doc = counting_doc(vec![
            LineInput::new(model("A"), "EA", TrackingType::None, 0),
            LineInput::new(model("B"), "EA", TrackingType::None, 0),
            LineInput::new(model("C"), "EA", TrackingType::None, 0),
        ]);
        doc.snapshot_system_qty(1, 10);
        doc.snapshot_system_qty(2, 20);
        doc.snapshot_system_qty(3, 5);
        doc.record_counts(&[CountEntry::new(1, 10), CountEntry::new(2, 17)], Utc::now())
            .unwrap();

        let summary = doc.variance_summary().unwrap();
        assert_eq!((summary.exact, summary.discrepancy, summary.not_counted), (1, 1, 1));
        assert_eq!(summary.lines[1].variance, Some(-3));
        assert!(doc.ensure_fully_counted().is_err());
    }

    #[test]
    fn counts_are_rejected_outside_counting() {
        let mut doc = counting_doc(vec![LineInput::new(model("A"), "EA", TrackingType::None, 0)]);
        doc.transition_to(DocStatus::Review, UserId::new(), Utc::now(), None);
        let err = doc.record_counts(&[CountEntry::new(1, 1)], Utc::now()).unwrap_err();
        assert!(matches!(err, CountError::Transition(TransitionError::DocumentLocked { .. })));
    }

    #[test]
    fn recount_only_accepts_flagged_lines() {
        let mut doc = counting_doc(vec![
            LineInput::new(model("A"), "EA", TrackingType::None, 0),
            LineInput::new(model("B"), "EA", TrackingType::None, 0),
        ]);
        doc.record_counts(&[CountEntry::new(1, 4), CountEntry::new(2, 5)], Utc::now())
            .unwrap();
        doc.flag_recount(&[2]).unwrap();
        assert_eq!(doc.line(2).unwrap().counted_qty(), None);

        let err = doc.record_counts(&[CountEntry::new(1, 9)], Utc::now()).unwrap_err();
        assert!(matches!(err, CountError::Invalid(_)));
        doc.record_counts(&[CountEntry::new(2, 6)], Utc::now()).unwrap();
        assert_eq!(doc.line(1).unwrap().counted_qty(), Some(4));
    }

    #[test]
    fn serial_adjustment_receives_found_and_writes_off_missing() {
        let mut doc = counting_doc(vec![LineInput::new(model("S"), "EA", TrackingType::Serial, 0)]);
        let balance = live("S", TrackingType::Serial, 2, &TrackingDetail::serials(&["S1", "S2"]));
        doc.snapshot_system_qty(1, 2);
        doc.record_counts(
            &[CountEntry::new(1, 2).with_detail(TrackingDetail::serials(&["S1", "S3"]))],
            Utc::now(),
        )
        .unwrap();

        // Same quantity, different units: variance 0, nothing pending.
        assert_eq!(doc.pending_adjustments().count(), 0);

        doc.flag_recount(&[1]).unwrap();
        doc.record_counts(
            &[CountEntry::new(1, 3).with_detail(TrackingDetail::serials(&["S1", "S2", "S3"]))],
            Utc::now(),
        )
        .unwrap();
        let line = doc.pending_adjustments().next().unwrap().clone();
        let delta = plan_adjustment(&line, &balance).unwrap();
        assert_eq!(delta.qty_delta, 1);
        let next = balance.apply(&delta).unwrap().balance;
        assert_eq!(next.record().onhand_qty, 3);
        assert!(next.serial_state("S3").is_some());
    }

    #[test]
    fn serial_adjustment_that_cannot_net_out_is_inconsistent() {
        let mut doc = counting_doc(vec![LineInput::new(model("S"), "EA", TrackingType::Serial, 0)]);
        let balance = live("S", TrackingType::Serial, 2, &TrackingDetail::serials(&["S1", "S2"]));
        doc.snapshot_system_qty(1, 3);
        doc.record_counts(
            &[CountEntry::new(1, 2).with_detail(TrackingDetail::serials(&["S1", "S2"]))],
            Utc::now(),
        )
        .unwrap();
        let line = doc.line(1).unwrap().clone();
        let err = plan_adjustment(&line, &balance).unwrap_err();
        assert!(matches!(err, LedgerError::TrackingInconsistent { .. }));
    }

    #[test]
    fn lot_adjustment_posts_per_lot_difference() {
        let mut doc = counting_doc(vec![LineInput::new(model("L"), "EA", TrackingType::Lot, 0)]);
        let balance = live(
            "L",
            TrackingType::Lot,
            10,
            &TrackingDetail::lots(vec![LotEntry::new("A", 6), LotEntry::new("B", 4)]),
        );
        doc.snapshot_system_qty(1, 10);
        doc.record_counts(
            &[CountEntry::new(1, 8).with_detail(TrackingDetail::lots(vec![
                LotEntry::new("A", 6),
                LotEntry::new("B", 1),
                LotEntry::new("C", 1),
            ]))],
            Utc::now(),
        )
        .unwrap();

        let line = doc.line(1).unwrap().clone();
        let delta = plan_adjustment(&line, &balance).unwrap();
        let next = balance.apply(&delta).unwrap().balance;
        assert_eq!(next.record().onhand_qty, 8);
        assert_eq!(next.lot_available("B"), 1);
        assert_eq!(next.lot_available("C"), 1);
    }

    proptest::proptest! {
        #[test]
        fn untracked_adjustment_lands_on_the_counted_quantity(
            system in 0i64..1_000,
            counted in 0i64..1_000,
        ) {
            let key = OnhandKey::new(
                WarehouseCode::parse("W1").unwrap(),
                LocationCode::parse("L1").unwrap(),
                model("M1"),
            );
            let balance = OnhandBalance::empty(key)
                .apply(&LedgerDelta::quantity(system, 0))
                .unwrap()
                .balance;

            let mut doc =
                counting_doc(vec![LineInput::new(model("M1"), "EA", TrackingType::None, 0)]);
            doc.snapshot_system_qty(1, system);
            doc.record_counts(&[CountEntry::new(1, counted)], Utc::now()).unwrap();
            let line = doc.line(1).unwrap().clone();

            proptest::prop_assert_eq!(line.variance(), Some(counted - system));
            let expected = if counted == system {
                VarianceClass::Exact
            } else {
                VarianceClass::Discrepancy
            };
            proptest::prop_assert_eq!(line.variance_class(), expected);

            let next = balance.apply(&plan_adjustment(&line, &balance).unwrap()).unwrap().balance;
            proptest::prop_assert_eq!(next.record().onhand_qty, counted);
        }
    }
}
