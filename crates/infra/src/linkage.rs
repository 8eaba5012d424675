//! Transfer orchestration on top of the engine.
//!
//! A transfer (GT) never posts to the ledger itself. It spawns an export issue
//! (GI) at the source and, once that completes, an import receipt (GR) at the
//! destination. The GT's status is then re-derived whenever a child moves.
//!
//! Lock order is always transfer, then child. A child transition releases its
//! own lock before the transfer is re-derived.

use serde_json::Value as JsonValue;

use stockflow_core::{AggregateRoot, DocumentId, ExpectedVersion, UserId};
use stockflow_events::{EventBus, EventEnvelope};
use stockflow_inventory::{
    DocEvent, DocStatus, DocType, Document, LinkageError, TransitionError, cancel_children,
    derive_transfer_status, is_void, issue_header, issue_lines, receipt_header, receipt_lines,
};

use crate::engine::InventoryEngine;
use crate::errors::EngineError;
use crate::ledger::OnhandLedger;
use crate::repository::DocumentRepository;

impl<R, L, B> InventoryEngine<R, L, B>
where
    R: DocumentRepository,
    L: OnhandLedger,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    /// Re-derive a transfer from its children. Recovers a transfer whose
    /// automatic re-derivation failed after a child transition.
    pub fn resync_transfer(
        &self,
        gt_id: DocumentId,
        actor: UserId,
    ) -> Result<Document, EngineError> {
        self.with_document_lock(gt_id, || self.sync_transfer_locked(gt_id, actor))
    }

    /// Spawn the export issue for `gt`. Refused while a live issue exists.
    pub(crate) fn export_transfer(
        &self,
        gt: &mut Document,
        actor: UserId,
    ) -> Result<(), EngineError> {
        if let Some(gi) = self.linked_child(gt, gt.linked_gi_no())? {
            if !is_void(gi.status()) {
                return Err(TransitionError::NotReady {
                    doc_no: gt.doc_no().to_string(),
                    reason: format!("issue {} is still {}", gi.doc_no(), gi.status()),
                }
                .into());
            }
        }

        let mut gi = Document::create(
            DocumentId::new(),
            self.repo.next_number(DocType::GoodsIssue)?,
            DocType::GoodsIssue,
            issue_header(gt),
            issue_lines(gt),
            actor,
            self.clock.now(),
        )?;
        gi.set_gt_no(gt.doc_no());
        self.repo.save(&gi, ExpectedVersion::New)?;
        self.publish_created(&gi);
        gt.link_issue(gi.doc_no(), self.clock.now());
        tracing::info!(gt_no = gt.doc_no(), gi_no = gi.doc_no(), "transfer issue spawned");
        Ok(())
    }

    fn spawn_receipt(
        &self,
        gt: &mut Document,
        gi: &Document,
        actor: UserId,
    ) -> Result<Document, EngineError> {
        let mut gr = Document::create(
            DocumentId::new(),
            self.repo.next_number(DocType::GoodsReceipt)?,
            DocType::GoodsReceipt,
            receipt_header(gt)?,
            receipt_lines(gt, gi)?,
            actor,
            self.clock.now(),
        )?;
        gr.set_gt_no(gt.doc_no());
        self.repo.save(&gr, ExpectedVersion::New)?;
        self.publish_created(&gr);
        gt.link_receipt(gr.doc_no(), self.clock.now());
        tracing::info!(
            gt_no = gt.doc_no(),
            gr_no = gr.doc_no(),
            gi_no = gi.doc_no(),
            "transfer receipt spawned"
        );
        Ok(gr)
    }

    /// Cancel every live child ahead of the transfer. Nothing is cancelled if
    /// any live child has already left its pre-posting statuses.
    pub(crate) fn cancel_transfer_children(
        &self,
        gt: &Document,
        actor: UserId,
    ) -> Result<(), EngineError> {
        let gi = self.linked_child(gt, gt.linked_gi_no())?;
        let gr = self.linked_child(gt, gt.linked_gr_no())?;
        let children: Vec<&Document> = gi.iter().chain(gr.iter()).collect();
        let ids = cancel_children(gt, &children)?;

        for id in ids {
            self.with_document_lock(id, || {
                let mut child = self.load(id)?;
                // Re-checked under the child's lock: it may have moved since.
                if !child.status().is_pre_posting() {
                    return Err(LinkageError::CannotCancelPostedTransfer {
                        gt_no: gt.doc_no().to_string(),
                        child_no: child.doc_no().to_string(),
                        child_status: child.status(),
                    }
                    .into());
                }
                let note = Some(format!("cancelled with transfer {}", gt.doc_no()));
                self.transition_locked_on(&mut child, &DocEvent::Cancel, actor, note)?;
                tracing::info!(
                    gt_no = gt.doc_no(),
                    child_no = child.doc_no(),
                    "transfer child cancelled"
                );
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Called after `child` moved. Skips silently if the transfer no longer
    /// links it (e.g. a voided issue that has since been replaced).
    pub(crate) fn sync_from_child(
        &self,
        gt_no: &str,
        child: &Document,
        actor: UserId,
    ) -> Result<(), EngineError> {
        let gt = self.load_by_no(gt_no)?;
        if !gt.links(child) {
            let err = LinkageError::NotATransferChild {
                doc_no: child.doc_no().to_string(),
                gt_no: gt_no.to_string(),
            };
            tracing::debug!(error = %err, "skipping transfer re-derivation");
            return Ok(());
        }
        let gt_id = gt.doc_id();
        self.with_document_lock(gt_id, || self.sync_transfer_locked(gt_id, actor))?;
        Ok(())
    }

    fn sync_transfer_locked(
        &self,
        gt_id: DocumentId,
        actor: UserId,
    ) -> Result<Document, EngineError> {
        let mut gt = self.load(gt_id)?;
        if gt.doc_type() != DocType::GoodsTransfer {
            return Err(LinkageError::NotATransfer {
                doc_no: gt.doc_no().to_string(),
            }
            .into());
        }
        if gt.status().is_terminal() {
            return Ok(gt);
        }

        let loaded = gt.version();
        let gi = self.linked_child(&gt, gt.linked_gi_no())?;
        let mut gr = self.linked_child(&gt, gt.linked_gr_no())?;

        if let Some(gi) = gi.as_ref().filter(|d| d.status() == DocStatus::Completed) {
            if gr.as_ref().is_none_or(|d| is_void(d.status())) {
                gr = Some(self.spawn_receipt(&mut gt, gi, actor)?);
            }
        }

        let now = self.clock.now();
        gt.mirror_transfer_progress(gi.as_ref(), gr.as_ref(), now)?;

        let derived = derive_transfer_status(
            gi.as_ref().map(Document::status),
            gr.as_ref().map(Document::status),
        );
        let entry = match derived {
            Some(to) if to != gt.status() => {
                let from = gt.status();
                let summary = child_summary(gi.as_ref(), gr.as_ref());
                let note = Some(format!("derived from {summary}"));
                let entry = gt.transition_to(to, actor, now, note);
                tracing::info!(gt_no = gt.doc_no(), %from, %to, "transfer status derived");
                if to == DocStatus::Completed {
                    for s in gt.shortfalls() {
                        tracing::warn!(
                            gt_no = gt.doc_no(),
                            line_no = s.line_no,
                            model = %s.model_code,
                            exported = s.exported,
                            received = s.received,
                            shortfall = s.shortfall,
                            "transfer completed with shortfall"
                        );
                    }
                }
                Some(entry)
            }
            _ => None,
        };

        if gt.version() != loaded {
            self.repo.save(&gt, ExpectedVersion::Exact(loaded))?;
            if let Some(entry) = entry {
                self.audit.status_changed(&gt, &entry);
            }
        }
        Ok(gt)
    }

    fn linked_child(
        &self,
        gt: &Document,
        doc_no: Option<&str>,
    ) -> Result<Option<Document>, EngineError> {
        let Some(doc_no) = doc_no else {
            return Ok(None);
        };
        match self.repo.find_by_no(doc_no)? {
            Some(doc) => Ok(Some(doc)),
            None => Err(LinkageError::MissingLink {
                gt_no: gt.doc_no().to_string(),
                doc_no: doc_no.to_string(),
            }
            .into()),
        }
    }
}

fn child_summary(gi: Option<&Document>, gr: Option<&Document>) -> String {
    [gi, gr]
        .into_iter()
        .flatten()
        .map(|d| format!("{} {}", d.doc_no(), d.status()))
        .collect::<Vec<_>>()
        .join(", ")
}
