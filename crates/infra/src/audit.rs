//! Audit events published to the configured event bus.
//!
//! Publication happens after the change is committed. A failed publish is
//! logged and never undoes the change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockflow_core::{DocumentId, UserId};
use stockflow_events::{Event, EventBus, EventEnvelope};
use stockflow_inventory::{
    DocStatus, Document, LedgerPosting, OnhandKey, OnhandRecord, StatusHistoryEvent, TrackingType,
};

pub const ONHAND_STREAM: &str = "onhand";

/// Net change committed to one ledger key by one document operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnhandChanged {
    pub doc_no: String,
    pub key: OnhandKey,
    pub tracking_type: TrackingType,
    pub qty_delta: i64,
    pub allocated_delta: i64,
    pub onhand_qty: i64,
    pub allocated_qty: i64,
    pub available_qty: i64,
    pub version: u64,
    pub occurred_at: DateTime<Utc>,
}

impl Event for OnhandChanged {
    fn event_type(&self) -> &'static str {
        "onhand.changed"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

/// A transition attempt that was refused. Status and history are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRejected {
    pub doc_id: DocumentId,
    pub doc_no: String,
    pub status: DocStatus,
    pub event: String,
    pub reason: String,
    pub user: UserId,
    pub occurred_at: DateTime<Utc>,
}

impl Event for TransitionRejected {
    fn event_type(&self) -> &'static str {
        "document.transition_rejected"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }
}

pub(crate) struct Audit<B> {
    bus: B,
}

impl<B> Audit<B>
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub(crate) fn new(bus: B) -> Self {
        Self { bus }
    }

    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }

    fn publish<E>(&self, stream_id: &str, stream_type: &str, sequence_number: u64, event: &E)
    where
        E: Event + Serialize,
    {
        let typed = EventEnvelope::from_typed(stream_id, stream_type, sequence_number, event);
        let envelope = match typed {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(
                    stream_id,
                    event_type = event.event_type(),
                    error = %err,
                    "audit event not serializable"
                );
                return;
            }
        };
        if let Err(err) = self.bus.publish(envelope) {
            tracing::warn!(
                stream_id,
                event_type = event.event_type(),
                error = ?err,
                "audit publish failed"
            );
        }
    }

    pub(crate) fn status_changed(&self, doc: &Document, entry: &StatusHistoryEvent) {
        self.publish(
            doc.doc_no(),
            doc.doc_type().stream_type(),
            doc.history().len() as u64,
            entry,
        );
    }

    pub(crate) fn transition_rejected(&self, event: &TransitionRejected) {
        self.publish(&event.doc_no, "document", 0, event);
    }

    /// One `OnhandChanged` per touched key, netting the postings for that key.
    pub(crate) fn onhand_changed(
        &self,
        doc_no: &str,
        postings: &[LedgerPosting],
        records: &[OnhandRecord],
        at: DateTime<Utc>,
    ) {
        let mut net: BTreeMap<&OnhandKey, (i64, i64)> = BTreeMap::new();
        for posting in postings {
            let entry = net.entry(&posting.key).or_default();
            entry.0 += posting.delta.qty_delta;
            entry.1 += posting.delta.allocated_delta;
        }

        for record in records {
            let (qty_delta, allocated_delta) = net.get(&record.key).copied().unwrap_or_default();
            let event = OnhandChanged {
                doc_no: doc_no.to_string(),
                key: record.key.clone(),
                tracking_type: record.tracking_type,
                qty_delta,
                allocated_delta,
                onhand_qty: record.onhand_qty,
                allocated_qty: record.allocated_qty,
                available_qty: record.available_qty(),
                version: record.version,
                occurred_at: at,
            };
            self.publish(&record.key.to_string(), ONHAND_STREAM, record.version, &event);
        }
    }
}
