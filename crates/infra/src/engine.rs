//! Inventory engine: the exposed operations.
//!
//! ```text
//! transition(doc, event)
//!   ↓
//! 1. Lock the document (one transition per document at a time)
//!   ↓
//! 2. Plan: per-type table decides next status + ledger effect (pure)
//!   ↓
//! 3. Validate tracking details, post the ledger batch (per-key critical sections)
//!   ↓
//! 4. Append history, save with optimistic version check
//!   ↓
//! 5. Publish audit events; re-derive the parent transfer if any
//! ```
//!
//! A failure before step 4 leaves status and history untouched. If the save in
//! step 4 fails, the ledger batch from step 3 is reversed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use stockflow_core::{
    AggregateRoot, Clock, DocumentId, ExpectedVersion, LocationCode, ModelCode, UserId,
    WarehouseCode,
};
use stockflow_events::{EventBus, EventEnvelope};
use stockflow_inventory::{
    AdjustmentReport, CountEntry, Direction, DocEvent, DocStatus, DocType, Document, DocumentHeader,
    FailedAdjustment, LedgerDelta, LedgerEffect, LedgerPosting, LineInput, LotBalance, OnhandKey,
    OnhandRecord, PostedAdjustment, SerialState, StatusHistoryEvent, StockAvailability,
    TrackingDetail, TrackingType, TransitionPlan, ValidationError, VarianceSummary, plan_adjustment,
    status, validate_details,
};

use crate::audit::{Audit, TransitionRejected};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::ledger::OnhandLedger;
use crate::repository::DocumentRepository;

/// Document operations over a repository, an onhand ledger and an audit bus.
pub struct InventoryEngine<R, L, B> {
    pub(crate) repo: R,
    pub(crate) ledger: L,
    pub(crate) audit: Audit<B>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
    doc_locks: Mutex<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl<R, L, B> InventoryEngine<R, L, B>
where
    R: DocumentRepository,
    L: OnhandLedger,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(repo: R, ledger: L, bus: B, clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            repo,
            ledger,
            audit: Audit::new(bus),
            clock,
            config,
            doc_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn bus(&self) -> &B {
        self.audit.bus()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- documents ---------------------------------------------------------

    /// Create a document in its type's initial status. With auto-issue on, a
    /// transfer immediately spawns its export issue.
    pub fn create_document(
        &self,
        doc_type: DocType,
        header: DocumentHeader,
        lines: Vec<LineInput>,
        actor: UserId,
    ) -> Result<Document, EngineError> {
        let doc_no = self.repo.next_number(doc_type)?;
        let doc = Document::create(
            DocumentId::new(),
            doc_no,
            doc_type,
            header,
            lines,
            actor,
            self.clock.now(),
        )?;
        self.repo.save(&doc, ExpectedVersion::New)?;
        self.publish_created(&doc);
        tracing::info!(
            doc_no = doc.doc_no(),
            %doc_type,
            lines = doc.lines().len(),
            "document created"
        );

        if doc_type == DocType::GoodsTransfer && self.config.transfer_auto_issue {
            let note = Some("auto export".to_string());
            return self.transition(doc.doc_id(), DocEvent::Export, actor, note);
        }
        Ok(doc)
    }

    /// Replace a document's lines. Only allowed before anything has posted.
    pub fn update_lines(
        &self,
        id: DocumentId,
        lines: Vec<LineInput>,
        actor: UserId,
    ) -> Result<Document, EngineError> {
        self.with_document_lock(id, || {
            let mut doc = self.load(id)?;
            let loaded = doc.version();
            doc.ensure_editable()?;
            doc.replace_lines(lines, self.clock.now())?;
            self.repo.save(&doc, ExpectedVersion::Exact(loaded))?;
            tracing::info!(
                doc_no = doc.doc_no(),
                user = %actor,
                lines = doc.lines().len(),
                "lines updated"
            );
            Ok(doc)
        })
    }

    /// Record counted quantities on an inventory count in `Counting`.
    pub fn record_counts(
        &self,
        id: DocumentId,
        entries: &[CountEntry],
        actor: UserId,
    ) -> Result<Document, EngineError> {
        self.with_document_lock(id, || {
            let mut doc = self.load(id)?;
            let loaded = doc.version();
            doc.record_counts(entries, self.clock.now())?;
            self.repo.save(&doc, ExpectedVersion::Exact(loaded))?;
            tracing::info!(
                doc_no = doc.doc_no(),
                user = %actor,
                entries = entries.len(),
                "counts recorded"
            );
            Ok(doc)
        })
    }

    /// Apply a caller event. On success the returned document carries the new
    /// status and history entry.
    pub fn transition(
        &self,
        id: DocumentId,
        event: DocEvent,
        actor: UserId,
        note: Option<String>,
    ) -> Result<Document, EngineError> {
        let doc = self.with_document_lock(id, || self.transition_locked(id, &event, actor, note))?;

        // The child's lock is released before the parent transfer is locked.
        if let Some(gt_no) = doc.gt_no() {
            if let Err(err) = self.sync_from_child(gt_no, &doc, actor) {
                tracing::error!(
                    doc_no = doc.doc_no(),
                    gt_no,
                    error = %err,
                    "transfer re-derivation failed; resync_transfer will recover it"
                );
            }
        }
        Ok(doc)
    }

    pub(crate) fn transition_locked(
        &self,
        id: DocumentId,
        event: &DocEvent,
        actor: UserId,
        note: Option<String>,
    ) -> Result<Document, EngineError> {
        let mut doc = self.load(id)?;
        self.transition_locked_on(&mut doc, event, actor, note)?;
        Ok(doc)
    }

    /// Apply `event` to an already loaded document whose lock the caller holds.
    pub(crate) fn transition_locked_on(
        &self,
        doc: &mut Document,
        event: &DocEvent,
        actor: UserId,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        self.apply_event(doc, event, actor, note)
            .inspect_err(|err| self.reject(doc, event, actor, err))
    }

    fn apply_event(
        &self,
        doc: &mut Document,
        event: &DocEvent,
        actor: UserId,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        let plan = status::plan(doc.doc_type(), doc.status(), event)?;
        let loaded = doc.version();

        let postings = match plan.effect {
            LedgerEffect::None => Vec::new(),
            LedgerEffect::PostReceipt => {
                self.line_postings(doc, Direction::Inbound, LedgerDelta::receipt)?
            }
            LedgerEffect::ReserveIssue => {
                self.line_postings(doc, Direction::Outbound, LedgerDelta::reserve)?
            }
            LedgerEffect::ConsumeIssue => {
                self.line_postings(doc, Direction::Count, LedgerDelta::consume)?
            }
            LedgerEffect::ReleaseIssue => {
                self.line_postings(doc, Direction::Count, LedgerDelta::release)?
            }
            LedgerEffect::SnapshotCount => {
                self.snapshot_count(doc);
                Vec::new()
            }
            LedgerEffect::FlagRecount => {
                if let DocEvent::RequestRecount { lines } = event {
                    doc.flag_recount(lines)?;
                }
                Vec::new()
            }
            LedgerEffect::PostCountAdjustment => {
                return self.complete_count(doc, plan, loaded, actor, note);
            }
            LedgerEffect::SpawnTransferIssue => {
                self.export_transfer(doc, actor)?;
                Vec::new()
            }
            LedgerEffect::CascadeTransferCancel => {
                self.cancel_transfer_children(doc, actor)?;
                Vec::new()
            }
        };

        let records = self.post(doc.doc_no(), &postings)?;
        if let Err(err) = self.commit(doc, plan.to, loaded, actor, note, &postings) {
            if plan.effect == LedgerEffect::CascadeTransferCancel {
                // Children stay cancelled; cancelling the transfer again skips them.
                tracing::warn!(
                    doc_no = doc.doc_no(),
                    error = %err,
                    "transfer children cancelled but transfer not saved"
                );
            }
            return Err(err);
        }
        self.audit
            .onhand_changed(doc.doc_no(), &postings, &records, self.clock.now());
        Ok(())
    }

    /// Append the status change and save. Reverses `postings` if the save fails,
    /// leaving `doc` at its old status.
    fn commit(
        &self,
        doc: &mut Document,
        to: DocStatus,
        loaded: u64,
        actor: UserId,
        note: Option<String>,
        postings: &[LedgerPosting],
    ) -> Result<StatusHistoryEvent, EngineError> {
        let from = doc.status();
        let mut next = doc.clone();
        let entry = next.transition_to(to, actor, self.clock.now(), note);
        if let Err(err) = self.repo.save(&next, ExpectedVersion::Exact(loaded)) {
            self.compensate(doc.doc_no(), postings);
            return Err(err.into());
        }
        *doc = next;
        self.audit.status_changed(doc, &entry);
        tracing::info!(doc_no = doc.doc_no(), %from, %to, user = %actor, "transition accepted");
        Ok(entry)
    }

    fn reject(&self, doc: &Document, event: &DocEvent, actor: UserId, err: &EngineError) {
        tracing::warn!(
            doc_no = doc.doc_no(),
            status = %doc.status(),
            event = event.name(),
            user = %actor,
            error = %err,
            "transition rejected"
        );
        self.audit.transition_rejected(&TransitionRejected {
            doc_id: doc.doc_id(),
            doc_no: doc.doc_no().to_string(),
            status: doc.status(),
            event: event.name().to_string(),
            reason: err.to_string(),
            user: actor,
            occurred_at: self.clock.now(),
        });
    }

    // -- ledger effects ----------------------------------------------------

    /// One posting per non-empty line at the document's source location, with
    /// tracking details validated against live stock first.
    fn line_postings(
        &self,
        doc: &Document,
        direction: Direction,
        delta: fn(TrackingType, i64, &TrackingDetail) -> LedgerDelta,
    ) -> Result<Vec<LedgerPosting>, EngineError> {
        let mut postings = Vec::with_capacity(doc.lines().len());
        for line in doc.lines() {
            let qty = line.declared_qty();
            if qty == 0 {
                continue;
            }
            let key = doc.line_key(line);
            validate_details(
                line.line_no,
                line.tracking_type,
                qty,
                &line.detail,
                direction,
                &key,
                &self.ledger,
            )
            .map_err(|e| EngineError::detail(doc.doc_no(), e))?;
            postings.push(LedgerPosting {
                key,
                delta: delta(line.tracking_type, qty, &line.detail),
            });
        }
        Ok(postings)
    }

    fn post(
        &self,
        doc_no: &str,
        postings: &[LedgerPosting],
    ) -> Result<Vec<OnhandRecord>, EngineError> {
        if postings.is_empty() {
            return Ok(Vec::new());
        }
        let records = self
            .config
            .ledger_retry
            .run(|| self.ledger.post_batch(postings))
            .map_err(|e| EngineError::ledger(doc_no, e))?;
        tracing::info!(
            doc_no,
            keys = records.len(),
            postings = postings.len(),
            "ledger batch posted"
        );
        Ok(records)
    }

    fn compensate(&self, doc_no: &str, postings: &[LedgerPosting]) {
        if postings.is_empty() {
            return;
        }
        let inverse: Vec<LedgerPosting> = postings
            .iter()
            .rev()
            .map(|p| LedgerPosting {
                key: p.key.clone(),
                delta: p.delta.inverse(),
            })
            .collect();
        match self.config.ledger_retry.run(|| self.ledger.post_batch(&inverse)) {
            Ok(_) => tracing::warn!(
                doc_no,
                postings = inverse.len(),
                "ledger batch reversed after failed save"
            ),
            Err(err) => tracing::error!(doc_no, error = %err, "failed to reverse ledger batch"),
        }
    }

    fn snapshot_count(&self, doc: &mut Document) {
        let snapshot: Vec<(u32, i64)> = doc
            .lines()
            .iter()
            .map(|line| (line.line_no, self.ledger.get(&doc.line_key(line)).onhand_qty))
            .collect();
        for (line_no, qty) in snapshot {
            doc.snapshot_system_qty(line_no, qty);
        }
    }

    /// Post each pending discrepancy line as its own commit. Lines that fail
    /// are reported; the count then waits in `AdjustmentRequested`.
    fn complete_count(
        &self,
        doc: &mut Document,
        plan: TransitionPlan,
        loaded: u64,
        actor: UserId,
        note: Option<String>,
    ) -> Result<(), EngineError> {
        doc.ensure_fully_counted()?;

        let mut report = AdjustmentReport::new(doc.doc_no());
        let mut posted = Vec::new();
        let mut records = Vec::new();
        let pending: Vec<_> = doc.pending_adjustments().cloned().collect();
        for line in pending {
            let key = doc.line_key(&line);
            let variance = line.variance().unwrap_or(0);
            let outcome = self.config.ledger_retry.run(|| {
                let delta = plan_adjustment(&line, &self.ledger.balance(&key))?;
                let record = self.ledger.apply_delta(&key, &delta)?;
                Ok((delta, record))
            });
            match outcome {
                Ok((delta, record)) => {
                    tracing::info!(
                        doc_no = doc.doc_no(),
                        line_no = line.line_no,
                        %key,
                        variance,
                        "count adjustment posted"
                    );
                    doc.mark_adjustment_posted(line.line_no, self.clock.now());
                    posted.push(LedgerPosting { key, delta });
                    records.push(record);
                    report.posted.push(PostedAdjustment {
                        line_no: line.line_no,
                        model_code: line.model_code.clone(),
                        variance,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        doc_no = doc.doc_no(),
                        line_no = line.line_no,
                        %key,
                        variance,
                        %error,
                        "count adjustment failed"
                    );
                    report.failed.push(FailedAdjustment {
                        line_no: line.line_no,
                        model_code: line.model_code.clone(),
                        variance,
                        error,
                    });
                }
            }
        }

        let now = self.clock.now();
        if report.is_complete() {
            self.commit(doc, plan.to, loaded, actor, note, &posted)?;
            self.audit.onhand_changed(doc.doc_no(), &posted, &records, now);
            return Ok(());
        }

        let reason = Some(format!("{} adjustment line(s) failed", report.failed.len()));
        if doc.status() != DocStatus::AdjustmentRequested {
            self.commit(doc, DocStatus::AdjustmentRequested, loaded, actor, reason, &posted)?;
        } else if let Err(err) = self.repo.save(doc, ExpectedVersion::Exact(loaded)) {
            self.compensate(doc.doc_no(), &posted);
            return Err(err.into());
        }
        self.audit.onhand_changed(doc.doc_no(), &posted, &records, now);
        Err(EngineError::AdjustmentIncomplete(report))
    }

    // -- queries -----------------------------------------------------------

    pub fn get_onhand(
        &self,
        wh_code: &WarehouseCode,
        loc_code: &LocationCode,
        model_code: &ModelCode,
    ) -> OnhandRecord {
        self.ledger
            .get(&OnhandKey::new(wh_code.clone(), loc_code.clone(), model_code.clone()))
    }

    pub fn list_onhand(&self, wh_code: &WarehouseCode) -> Vec<OnhandRecord> {
        self.ledger.list(wh_code)
    }

    pub fn serials_at(&self, key: &OnhandKey) -> Vec<(String, SerialState)> {
        self.ledger.serials_at(key)
    }

    pub fn lots_at(&self, key: &OnhandKey) -> Vec<LotBalance> {
        self.ledger.lots_at(key)
    }

    /// Exact / discrepancy / not-counted partition of an inventory count.
    pub fn query_variance(&self, id: DocumentId) -> Result<VarianceSummary, EngineError> {
        let doc = self.load(id)?;
        doc.variance_summary().ok_or_else(|| {
            EngineError::validation(ValidationError::header(
                "doc_type",
                format!("{} is not an inventory count", doc.doc_no()),
            ))
        })
    }

    pub fn get_document(&self, id: DocumentId) -> Result<Document, EngineError> {
        self.load(id)
    }

    pub fn find_document(&self, doc_no: &str) -> Result<Document, EngineError> {
        self.load_by_no(doc_no)
    }

    pub fn history(&self, id: DocumentId) -> Result<Vec<StatusHistoryEvent>, EngineError> {
        Ok(self.load(id)?.history().to_vec())
    }

    pub fn list_documents_by_status(
        &self,
        status: DocStatus,
    ) -> Result<Vec<Document>, EngineError> {
        Ok(self.repo.list_by_status(status)?)
    }

    pub fn list_documents_by_warehouse(
        &self,
        wh_code: &WarehouseCode,
    ) -> Result<Vec<Document>, EngineError> {
        Ok(self.repo.list_by_warehouse(wh_code)?)
    }

    // -- plumbing ----------------------------------------------------------

    pub(crate) fn load(&self, id: DocumentId) -> Result<Document, EngineError> {
        self.repo
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(format!("document {id}")))
    }

    pub(crate) fn load_by_no(&self, doc_no: &str) -> Result<Document, EngineError> {
        self.repo
            .find_by_no(doc_no)?
            .ok_or_else(|| EngineError::NotFound(format!("document {doc_no}")))
    }

    pub(crate) fn publish_created(&self, doc: &Document) {
        if let Some(entry) = doc.history().first() {
            self.audit.status_changed(doc, entry);
        }
    }

    /// Run `f` while holding the document's lock. The lock entry is dropped
    /// again once no other caller holds or waits on it.
    pub(crate) fn with_document_lock<T>(
        &self,
        id: DocumentId,
        f: impl FnOnce() -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let lock = self.doc_locks.lock().entry(id).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };

        // Clones are only taken under the map lock, so the count is exact here.
        let mut locks = self.doc_locks.lock();
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use stockflow_core::ManualClock;
    use stockflow_events::InMemoryEventBus;
    use stockflow_inventory::LedgerError;

    use crate::ledger::InMemoryOnhandLedger;
    use crate::repository::InMemoryDocumentRepository;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;

    fn engine() -> InventoryEngine<InMemoryDocumentRepository, InMemoryOnhandLedger, Bus> {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()));
        InventoryEngine::new(
            InMemoryDocumentRepository::new(),
            InMemoryOnhandLedger::default(),
            Arc::new(InMemoryEventBus::new()),
            clock,
            EngineConfig::default(),
        )
    }

    fn header() -> DocumentHeader {
        DocumentHeader::new(WarehouseCode::parse("W1").unwrap(), LocationCode::parse("L1").unwrap())
    }

    fn m(code: &str) -> ModelCode {
        ModelCode::parse(code).unwrap()
    }

    fn run(
        engine: &InventoryEngine<InMemoryDocumentRepository, InMemoryOnhandLedger, Bus>,
        id: DocumentId,
        events: &[DocEvent],
    ) -> Result<Document, EngineError> {
        let mut last = None;
        for event in events {
            last = Some(engine.transition(id, event.clone(), UserId::new(), None)?);
        }
        last.ok_or_else(|| EngineError::NotFound("no events".into()))
    }

    #[test]
    fn receipt_confirm_posts_to_the_ledger() {
        let engine = engine();
        let gr = engine
            .create_document(
                DocType::GoodsReceipt,
                header(),
                vec![LineInput::new(m("M1"), "EA", TrackingType::None, 100)],
                UserId::new(),
            )
            .unwrap();
        let events = [DocEvent::StartReceiving, DocEvent::Submit, DocEvent::Confirm];
        let gr = run(&engine, gr.doc_id(), &events).unwrap();

        assert_eq!(gr.status(), DocStatus::Completed);
        assert_eq!(gr.history().len(), 4);
        let record = engine.get_onhand(&header().wh_code, &header().loc_code, &m("M1"));
        assert_eq!((record.onhand_qty, record.allocated_qty), (100, 0));
    }

    #[test]
    fn failed_posting_leaves_status_and_history_alone() {
        let engine = engine();
        let gi = engine
            .create_document(
                DocType::GoodsIssue,
                header(),
                vec![LineInput::new(m("M1"), "EA", TrackingType::None, 5)],
                UserId::new(),
            )
            .unwrap();

        let err = engine
            .transition(gi.doc_id(), DocEvent::StartPicking, UserId::new(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger { source: LedgerError::InsufficientStock { .. }, .. }
        ));

        let after = engine.get_document(gi.doc_id()).unwrap();
        assert_eq!(after.status(), DocStatus::New);
        assert_eq!(after.history().len(), 1);

        let rejected = engine
            .bus()
            .journal()
            .iter()
            .filter(|e| e.event_type() == "document.transition_rejected")
            .count();
        assert_eq!(rejected, 1);
    }

    #[test]
    fn serial_receipt_rejects_live_serials() {
        let engine = engine();
        let line = || {
            LineInput::new(m("S"), "EA", TrackingType::Serial, 1)
                .with_detail(TrackingDetail::serials(&["SN-1"]))
        };
        for expect_ok in [true, false] {
            let gr = engine
                .create_document(DocType::GoodsReceipt, header(), vec![line()], UserId::new())
                .unwrap();
            let events = [DocEvent::StartReceiving, DocEvent::Submit, DocEvent::Confirm];
            let result = run(&engine, gr.doc_id(), &events);
            assert_eq!(result.is_ok(), expect_ok);
        }
        assert_eq!(engine.ledger().serial_location("SN-1"), Some(header().source_key(&m("S"))));
    }

    #[test]
    fn documents_are_listed_by_status() {
        let engine = engine();
        engine
            .create_document(DocType::GoodsReceipt, header(), vec![], UserId::new())
            .unwrap();
        engine
            .create_document(DocType::InventoryCount, header(), vec![], UserId::new())
            .unwrap();

        assert_eq!(engine.list_documents_by_status(DocStatus::Draft).unwrap().len(), 1);
        assert_eq!(engine.list_documents_by_warehouse(&header().wh_code).unwrap().len(), 2);
        assert!(matches!(engine.find_document("GR-000009"), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn document_locks_are_released_after_use() {
        let engine = engine();
        let gr = engine
            .create_document(
                DocType::GoodsReceipt,
                header(),
                vec![LineInput::new(m("M1"), "EA", TrackingType::None, 3)],
                UserId::new(),
            )
            .unwrap();
        run(&engine, gr.doc_id(), &[DocEvent::StartReceiving, DocEvent::Submit]).unwrap();
        engine
            .update_lines(
                gr.doc_id(),
                vec![LineInput::new(m("M1"), "EA", TrackingType::None, 4)],
                UserId::new(),
            )
            .unwrap_err();
        run(&engine, gr.doc_id(), &[DocEvent::Confirm]).unwrap();

        assert!(engine.doc_locks.lock().is_empty());
    }
}
