//! Inventory movement domain.
//!
//! Pure, deterministic rules for warehouse documents and the onhand ledger
//! (no IO, no locking, no storage). The engine in `stockflow-infra` owns
//! concurrency and persistence and calls into this crate.

pub mod document;
pub mod onhand;
pub mod status;
pub mod tracking;
pub mod transfer;
pub mod variance;

pub use document::{
    DocStatus, DocType, Document, DocumentHeader, DocumentLine, LineInput, LineQty,
    StatusHistoryEvent, TransferShortfall, ValidationError, validate_header, validate_lines,
};
pub use onhand::{
    AppliedDelta, LedgerDelta, LedgerError, LedgerPosting, LotBalance, LotDelta, OnhandBalance,
    OnhandKey, OnhandRecord, SerialAction, SerialOp, SerialState, TrackingDelta,
};
pub use status::{DocEvent, LedgerEffect, TransitionError, TransitionPlan, plan};
pub use tracking::{
    DetailError, Direction, LotEntry, StockAvailability, TrackingDetail, TrackingType,
    ensure_unique_serials, validate_details, validate_shape,
};
pub use transfer::{
    LinkageError, cancel_children, check_leg, compute_shortfalls, derive_transfer_status, is_void,
    issue_header, issue_lines, receipt_header, receipt_lines,
};
pub use variance::{
    AdjustmentReport, CountEntry, CountError, FailedAdjustment, LineVariance, PostedAdjustment,
    VarianceClass, VarianceSummary, classify, plan_adjustment, variance,
};
