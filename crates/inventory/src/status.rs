//! Per-document-type transition tables.
//!
//! [`plan`] is pure: it decides whether an event is legal and which ledger
//! effect the transition carries. Applying the effect and the status change is
//! the engine's job, in that order, so a failed effect leaves the status alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{DocStatus, DocType};

/// Caller-triggered events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DocEvent {
    Release,
    StartReceiving,
    StartPicking,
    Submit,
    Confirm,
    Reject,
    Cancel,
    StartCounting,
    SubmitForReview,
    RequestRecount { lines: Vec<u32> },
    RequestAdjustment,
    Complete,
    Export,
}

impl DocEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DocEvent::Release => "release",
            DocEvent::StartReceiving => "start_receiving",
            DocEvent::StartPicking => "start_picking",
            DocEvent::Submit => "submit",
            DocEvent::Confirm => "confirm",
            DocEvent::Reject => "reject",
            DocEvent::Cancel => "cancel",
            DocEvent::StartCounting => "start_counting",
            DocEvent::SubmitForReview => "submit_for_review",
            DocEvent::RequestRecount { .. } => "request_recount",
            DocEvent::RequestAdjustment => "request_adjustment",
            DocEvent::Complete => "complete",
            DocEvent::Export => "export",
        }
    }
}

impl core::fmt::Display for DocEvent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    None,
    /// GR confirm: onhand += received.
    PostReceipt,
    /// GI start picking: allocated += picked.
    ReserveIssue,
    /// GI confirm: onhand -= picked, allocated -= picked.
    ConsumeIssue,
    /// GI reject / cancel while picking: allocated -= picked.
    ReleaseIssue,
    /// IC start counting: capture system quantities.
    SnapshotCount,
    /// IC review back to counting: flag lines for a second pass.
    FlagRecount,
    /// IC complete: post per-line variance adjustments.
    PostCountAdjustment,
    /// GT export: spawn the linked goods issue.
    SpawnTransferIssue,
    /// GT cancel: cancel linked children that have not posted.
    CascadeTransferCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: DocStatus,
    pub to: DocStatus,
    pub effect: LedgerEffect,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("{doc_type} cannot apply '{event}' in status {from}")]
    InvalidTransition {
        doc_type: DocType,
        from: DocStatus,
        event: String,
    },

    #[error("document {doc_no} is locked in status {status}")]
    DocumentLocked { doc_no: String, status: DocStatus },

    #[error("document {doc_no} is not ready: {reason}")]
    NotReady { doc_no: String, reason: String },
}

/// Decide the outcome of `event` on a document of `doc_type` in `from`.
pub fn plan(
    doc_type: DocType,
    from: DocStatus,
    event: &DocEvent,
) -> Result<TransitionPlan, TransitionError> {
    let invalid = || TransitionError::InvalidTransition {
        doc_type,
        from,
        event: event.name().to_string(),
    };

    if from.is_terminal() {
        return Err(invalid());
    }

    let next = match doc_type {
        DocType::GoodsReceipt => receipt(from, event),
        DocType::GoodsIssue => issue(from, event),
        DocType::GoodsTransfer => transfer(from, event),
        DocType::InventoryCount => count(from, event),
    };

    next.map(|(to, effect)| TransitionPlan { from, to, effect })
        .ok_or_else(invalid)
}

fn receipt(from: DocStatus, event: &DocEvent) -> Option<(DocStatus, LedgerEffect)> {
    use DocStatus as S;
    match (from, event) {
        (S::Draft, DocEvent::Release) => Some((S::New, LedgerEffect::None)),
        (S::Draft | S::New, DocEvent::StartReceiving) => Some((S::Receiving, LedgerEffect::None)),
        (S::Receiving, DocEvent::Submit) => Some((S::Submitted, LedgerEffect::None)),
        (S::Submitted, DocEvent::Confirm) => Some((S::Completed, LedgerEffect::PostReceipt)),
        (S::Draft | S::New | S::Receiving | S::Submitted, DocEvent::Cancel) => {
            Some((S::Cancelled, LedgerEffect::None))
        }
        _ => None,
    }
}

fn issue(from: DocStatus, event: &DocEvent) -> Option<(DocStatus, LedgerEffect)> {
    use DocStatus as S;
    match (from, event) {
        (S::New, DocEvent::StartPicking) => Some((S::Picking, LedgerEffect::ReserveIssue)),
        (S::Picking, DocEvent::Submit) => Some((S::Submitted, LedgerEffect::None)),
        (S::Submitted, DocEvent::Confirm) => Some((S::Completed, LedgerEffect::ConsumeIssue)),
        (S::Submitted, DocEvent::Reject) => Some((S::Rejected, LedgerEffect::ReleaseIssue)),
        (S::New, DocEvent::Cancel) => Some((S::Cancelled, LedgerEffect::None)),
        (S::Picking, DocEvent::Cancel) => Some((S::Cancelled, LedgerEffect::ReleaseIssue)),
        _ => None,
    }
}

/// A transfer's progress statuses are derived from its children; callers may
/// only export or cancel it. Exporting again is only meaningful after the
/// previous issue was voided, which the engine checks.
fn transfer(from: DocStatus, event: &DocEvent) -> Option<(DocStatus, LedgerEffect)> {
    use DocStatus as S;
    match (from, event) {
        (S::Created | S::Exporting, DocEvent::Export) => {
            Some((S::Exporting, LedgerEffect::SpawnTransferIssue))
        }
        (S::Created | S::Exporting | S::Receiving, DocEvent::Cancel) => {
            Some((S::Cancelled, LedgerEffect::CascadeTransferCancel))
        }
        _ => None,
    }
}

fn count(from: DocStatus, event: &DocEvent) -> Option<(DocStatus, LedgerEffect)> {
    use DocStatus as S;
    match (from, event) {
        (S::Created, DocEvent::StartCounting) => Some((S::Counting, LedgerEffect::SnapshotCount)),
        (S::Counting, DocEvent::SubmitForReview) => Some((S::Review, LedgerEffect::None)),
        (S::Review, DocEvent::RequestRecount { .. }) => {
            Some((S::Counting, LedgerEffect::FlagRecount))
        }
        (S::Review, DocEvent::RequestAdjustment) => {
            Some((S::AdjustmentRequested, LedgerEffect::None))
        }
        (S::Review | S::AdjustmentRequested, DocEvent::Complete) => {
            Some((S::Completed, LedgerEffect::PostCountAdjustment))
        }
        (S::Created | S::Counting | S::Review, DocEvent::Cancel) => {
            Some((S::Cancelled, LedgerEffect::None))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_EVENTS: [DocEvent; 13] = [
        DocEvent::Release,
        DocEvent::StartReceiving,
        DocEvent::StartPicking,
        DocEvent::Submit,
        DocEvent::Confirm,
        DocEvent::Reject,
        DocEvent::Cancel,
        DocEvent::StartCounting,
        DocEvent::SubmitForReview,
        DocEvent::RequestRecount { lines: Vec::new() },
        DocEvent::RequestAdjustment,
        DocEvent::Complete,
        DocEvent::Export,
    ];

    const ALL_TYPES: [DocType; 4] = [
        DocType::GoodsReceipt,
        DocType::GoodsIssue,
        DocType::GoodsTransfer,
        DocType::InventoryCount,
    ];

    #[test]
    fn receipt_happy_path_posts_on_confirm() {
        let steps = [
            (DocStatus::Draft, DocEvent::Release, DocStatus::New),
            (DocStatus::New, DocEvent::StartReceiving, DocStatus::Receiving),
            (DocStatus::Receiving, DocEvent::Submit, DocStatus::Submitted),
        ];
        for (from, event, to) in steps {
            let p = plan(DocType::GoodsReceipt, from, &event).unwrap();
            assert_eq!((p.to, p.effect), (to, LedgerEffect::None));
        }
        let p = plan(DocType::GoodsReceipt, DocStatus::Submitted, &DocEvent::Confirm).unwrap();
        assert_eq!((p.to, p.effect), (DocStatus::Completed, LedgerEffect::PostReceipt));
    }

    #[test]
    fn issue_reserves_on_pick_and_releases_on_reject() {
        let p = plan(DocType::GoodsIssue, DocStatus::New, &DocEvent::StartPicking).unwrap();
        assert_eq!(p.effect, LedgerEffect::ReserveIssue);
        let p = plan(DocType::GoodsIssue, DocStatus::Submitted, &DocEvent::Reject).unwrap();
        assert_eq!((p.to, p.effect), (DocStatus::Rejected, LedgerEffect::ReleaseIssue));
        let p = plan(DocType::GoodsIssue, DocStatus::New, &DocEvent::Cancel).unwrap();
        assert_eq!(p.effect, LedgerEffect::None);
    }

    #[test]
    fn count_can_loop_through_recount() {
        let p = plan(
            DocType::InventoryCount,
            DocStatus::Review,
            &DocEvent::RequestRecount { lines: vec![2] },
        )
        .unwrap();
        assert_eq!((p.to, p.effect), (DocStatus::Counting, LedgerEffect::FlagRecount));

        let p = plan(
            DocType::InventoryCount,
            DocStatus::AdjustmentRequested,
            &DocEvent::Complete,
        )
        .unwrap();
        assert_eq!(p.effect, LedgerEffect::PostCountAdjustment);
    }

    #[test]
    fn transfer_progress_cannot_be_driven_by_callers() {
        for event in [DocEvent::Confirm, DocEvent::Complete, DocEvent::StartReceiving] {
            assert!(plan(DocType::GoodsTransfer, DocStatus::Exporting, &event).is_err());
        }
    }

    #[test]
    fn unknown_pairs_name_the_event() {
        let err = plan(DocType::GoodsReceipt, DocStatus::Draft, &DocEvent::Confirm).unwrap_err();
        assert_eq!(
            err,
            TransitionError::InvalidTransition {
                doc_type: DocType::GoodsReceipt,
                from: DocStatus::Draft,
                event: "confirm".to_string(),
            }
        );
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        for doc_type in ALL_TYPES {
            for status in [DocStatus::Completed, DocStatus::Rejected, DocStatus::Cancelled] {
                for event in ALL_EVENTS.iter() {
                    assert!(plan(doc_type, status, event).is_err(), "{doc_type} {status} {event}");
                }
            }
        }
    }
}
