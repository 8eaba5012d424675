use chrono::{DateTime, Utc};

/// A fact emitted by the engine (status change, ledger change, rejected attempt).
///
/// Events are immutable and append-only; consumers must never expect them
/// to be edited after publication.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "document.status_changed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
