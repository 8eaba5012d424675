//! Transfer linkage: a GT owns an export GI at the source and an import GR at
//! the destination. The GT's progress is derived from those two children.

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockflow_core::DocumentId;

use crate::document::{
    DocStatus, DocType, Document, DocumentHeader, DocumentLine, LineInput, LineQty,
    TransferShortfall, ValidationError,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkageError {
    #[error("transfer {gt_no} cannot be cancelled: {child_no} has posted (status {child_status})")]
    CannotCancelPostedTransfer {
        gt_no: String,
        child_no: String,
        child_status: DocStatus,
    },

    #[error("transfer {gt_no} references missing document {doc_no}")]
    MissingLink { gt_no: String, doc_no: String },

    #[error("document {doc_no} is not a transfer")]
    NotATransfer { doc_no: String },

    #[error("document {doc_no} claims transfer {gt_no}, which does not link it")]
    NotATransferChild { doc_no: String, gt_no: String },

    #[error("{doc_no} line {line_no} does not match transfer {gt_no}: {reason}")]
    LegMismatch {
        gt_no: String,
        doc_no: String,
        line_no: u32,
        reason: String,
    },
}

/// Rejected or cancelled children no longer count towards the transfer.
pub fn is_void(status: DocStatus) -> bool {
    matches!(status, DocStatus::Rejected | DocStatus::Cancelled)
}

/// GT status implied by its children, or `None` when the children say
/// nothing (no GI yet, or the GI was voided).
pub fn derive_transfer_status(gi: Option<DocStatus>, gr: Option<DocStatus>) -> Option<DocStatus> {
    match gi {
        None => None,
        Some(gi) if is_void(gi) => None,
        Some(DocStatus::Completed) => match gr {
            Some(DocStatus::Completed) => Some(DocStatus::Completed),
            _ => Some(DocStatus::Receiving),
        },
        Some(_) => Some(DocStatus::Exporting),
    }
}

/// Export leg: an issue at the transfer's source.
pub fn issue_header(gt: &Document) -> DocumentHeader {
    DocumentHeader {
        wh_code: gt.header.wh_code.clone(),
        loc_code: gt.header.loc_code.clone(),
        dest_wh_code: None,
        dest_loc_code: None,
        reference: Some(gt.doc_no.clone()),
        note: gt.header.note.clone(),
    }
}

pub fn issue_lines(gt: &Document) -> Vec<LineInput> {
    gt.lines
        .iter()
        .map(|line| LineInput {
            model_code: line.model_code.clone(),
            uom: line.uom.clone(),
            tracking_type: line.tracking_type,
            qty_planned: line.planned_qty(),
            qty_actual: None,
            detail: line.detail.clone(),
        })
        .collect()
}

/// Import leg: a receipt at the transfer's destination.
pub fn receipt_header(gt: &Document) -> Result<DocumentHeader, LinkageError> {
    match (&gt.header.dest_wh_code, &gt.header.dest_loc_code) {
        (Some(wh), Some(loc)) => Ok(DocumentHeader {
            wh_code: wh.clone(),
            loc_code: loc.clone(),
            dest_wh_code: None,
            dest_loc_code: None,
            reference: Some(gt.doc_no.clone()),
            note: gt.header.note.clone(),
        }),
        _ => Err(LinkageError::MissingLink {
            gt_no: gt.doc_no.clone(),
            doc_no: "destination".to_string(),
        }),
    }
}

/// A leg must carry the transfer's lines one for one: same line numbers,
/// models and tracking types.
pub fn check_leg(gt: &Document, child: &Document) -> Result<(), LinkageError> {
    let mismatch = |line_no: u32, reason: String| LinkageError::LegMismatch {
        gt_no: gt.doc_no.clone(),
        doc_no: child.doc_no.clone(),
        line_no,
        reason,
    };

    for line in &gt.lines {
        match child.line(line.line_no) {
            None => return Err(mismatch(line.line_no, "line missing".to_string())),
            Some(leg) if leg.model_code != line.model_code => {
                return Err(mismatch(
                    line.line_no,
                    format!("model {} instead of {}", leg.model_code, line.model_code),
                ));
            }
            Some(leg) if leg.tracking_type != line.tracking_type => {
                return Err(mismatch(
                    line.line_no,
                    format!(
                        "tracked as {:?} instead of {:?}",
                        leg.tracking_type, line.tracking_type
                    ),
                ));
            }
            Some(_) => {}
        }
    }
    if let Some(extra) = child.lines.iter().find(|l| gt.line(l.line_no).is_none()) {
        return Err(mismatch(
            extra.line_no,
            format!("model {} is not on the transfer", extra.model_code),
        ));
    }
    Ok(())
}

/// Receipt lines planned at the transfer quantity, received defaulting to what
/// the issue actually picked, with the picked details.
pub fn receipt_lines(gt: &Document, gi: &Document) -> Result<Vec<LineInput>, LinkageError> {
    check_leg(gt, gi)?;
    Ok(gt
        .lines
        .iter()
        .map(|line| {
            let picked = gi.line(line.line_no);
            LineInput {
                model_code: line.model_code.clone(),
                uom: line.uom.clone(),
                tracking_type: line.tracking_type,
                qty_planned: line.planned_qty(),
                qty_actual: Some(picked.map_or(0, DocumentLine::declared_qty)),
                detail: picked.map(|l| l.detail.clone()).unwrap_or_default(),
            }
        })
        .collect())
}

/// Children to cancel along with the transfer. Fails if any live child has
/// already posted.
pub fn cancel_children(
    gt: &Document,
    children: &[&Document],
) -> Result<Vec<DocumentId>, LinkageError> {
    let mut to_cancel = Vec::new();
    for child in children {
        if is_void(child.status) {
            continue;
        }
        if !child.status.is_pre_posting() {
            return Err(LinkageError::CannotCancelPostedTransfer {
                gt_no: gt.doc_no.clone(),
                child_no: child.doc_no.clone(),
                child_status: child.status,
            });
        }
        to_cancel.push(child.id);
    }
    Ok(to_cancel)
}

/// Lines whose received quantity differs from the exported quantity.
pub fn compute_shortfalls(gt: &Document) -> Vec<TransferShortfall> {
    gt.lines
        .iter()
        .filter_map(|line| match line.qty {
            LineQty::Transfer {
                qty_exported: Some(exported),
                qty_received: Some(received),
                ..
            } if exported != received => Some(TransferShortfall {
                line_no: line.line_no,
                model_code: line.model_code.clone(),
                exported,
                received,
                shortfall: exported - received,
            }),
            _ => None,
        })
        .collect()
}

impl Document {
    pub fn link_issue(&mut self, gi_no: impl Into<String>, at: DateTime<Utc>) {
        self.linked_gi_no = Some(gi_no.into());
        self.touch(at);
    }

    /// Relinking bumps the version so a re-spawned receipt is always saved.
    pub fn link_receipt(&mut self, gr_no: impl Into<String>, at: DateTime<Utc>) {
        self.linked_gr_no = Some(gr_no.into());
        self.touch(at);
    }

    pub fn set_gt_no(&mut self, gt_no: impl Into<String>) {
        self.gt_no = Some(gt_no.into());
    }

    /// Whether `child` is one of this transfer's current legs.
    pub fn links(&self, child: &Document) -> bool {
        let no = Some(child.doc_no.as_str());
        match child.doc_type {
            DocType::GoodsIssue => self.linked_gi_no.as_deref() == no,
            DocType::GoodsReceipt => self.linked_gr_no.as_deref() == no,
            _ => false,
        }
    }

    /// Copy posted quantities from completed children onto the transfer lines
    /// and refresh the shortfall list. Returns whether anything changed.
    pub fn mirror_transfer_progress(
        &mut self,
        gi: Option<&Document>,
        gr: Option<&Document>,
        at: DateTime<Utc>,
    ) -> Result<bool, LinkageError> {
        let gi = gi.filter(|d| d.status == DocStatus::Completed);
        let gr = gr.filter(|d| d.status == DocStatus::Completed);
        for leg in gi.iter().chain(gr.iter()) {
            check_leg(self, leg)?;
        }
        let mut changed = false;

        for line in &mut self.lines {
            let exported_now = gi.and_then(|d| d.line(line.line_no)).map(|l| l.declared_qty());
            let received_now = gr.and_then(|d| d.line(line.line_no)).map(|l| l.declared_qty());
            if let LineQty::Transfer {
                qty_exported,
                qty_received,
                ..
            } = &mut line.qty
            {
                if exported_now.is_some() && *qty_exported != exported_now {
                    *qty_exported = exported_now;
                    changed = true;
                }
                if received_now.is_some() && *qty_received != received_now {
                    *qty_received = received_now;
                    changed = true;
                }
            }
        }

        let shortfalls = compute_shortfalls(self);
        if shortfalls != self.shortfalls {
            self.shortfalls = shortfalls;
            changed = true;
        }
        if changed {
            self.touch(at);
        }
        Ok(changed)
    }

    /// Edits to a transfer leg may change quantities and details only.
    pub(crate) fn leg_edit_errors(&self, lines: &[LineInput]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if lines.len() != self.lines.len() {
            errors.push(ValidationError::header(
                "lines",
                format!("transfer leg has {} lines, got {}", self.lines.len(), lines.len()),
            ));
        }
        for (existing, input) in self.lines.iter().zip(lines) {
            let line_no = existing.line_no;
            if input.model_code != existing.model_code {
                errors.push(ValidationError::line(
                    line_no,
                    "model_code",
                    format!("transfer leg line is {}", existing.model_code),
                ));
            }
            if input.tracking_type != existing.tracking_type {
                errors.push(ValidationError::line(
                    line_no,
                    "tracking_type",
                    format!("transfer leg line is tracked as {:?}", existing.tracking_type),
                ));
            }
            if input.qty_planned != existing.planned_qty() {
                errors.push(ValidationError::line(
                    line_no,
                    "qty_planned",
                    format!("transfer leg line is planned at {}", existing.planned_qty()),
                ));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{LocationCode, ModelCode, UserId, WarehouseCode};

    use crate::tracking::TrackingType;

    fn wh(code: &str) -> WarehouseCode {
        WarehouseCode::parse(code).unwrap()
    }

    fn loc(code: &str) -> LocationCode {
        LocationCode::parse(code).unwrap()
    }

    fn doc(no: &str, doc_type: DocType, header: DocumentHeader, lines: Vec<LineInput>) -> Document {
        Document::create(
            DocumentId::new(),
            no,
            doc_type,
            header,
            lines,
            UserId::new(),
            Utc::now(),
        )
        .unwrap()
    }

    fn transfer(qty: i64) -> Document {
        let header = DocumentHeader::new(wh("W1"), loc("L1")).with_destination(wh("W2"), loc("L9"));
        doc(
            "GT-000001",
            DocType::GoodsTransfer,
            header,
            vec![LineInput::new(ModelCode::parse("M1").unwrap(), "EA", TrackingType::None, qty)],
        )
    }

    fn complete(doc: &mut Document) {
        doc.transition_to(DocStatus::Completed, UserId::new(), Utc::now(), None);
    }

    #[test]
    fn status_follows_the_children() {
        use DocStatus as S;
        assert_eq!(derive_transfer_status(None, None), None);
        assert_eq!(derive_transfer_status(Some(S::New), None), Some(S::Exporting));
        assert_eq!(derive_transfer_status(Some(S::Picking), None), Some(S::Exporting));
        assert_eq!(derive_transfer_status(Some(S::Rejected), None), None);
        assert_eq!(derive_transfer_status(Some(S::Completed), None), Some(S::Receiving));
        assert_eq!(
            derive_transfer_status(Some(S::Completed), Some(S::Submitted)),
            Some(S::Receiving)
        );
        assert_eq!(
            derive_transfer_status(Some(S::Completed), Some(S::Completed)),
            Some(S::Completed)
        );
    }

    #[test]
    fn legs_are_built_from_the_transfer_lines() {
        let gt = transfer(20);
        let gi_header = issue_header(&gt);
        assert_eq!(gi_header.wh_code, wh("W1"));
        assert_eq!(gi_header.reference.as_deref(), Some("GT-000001"));
        let lines = issue_lines(&gt);
        assert_eq!(lines[0].qty_planned, 20);

        let picked = vec![lines[0].clone().with_actual(19)];
        let gi = doc("GI-000001", DocType::GoodsIssue, gi_header, picked);
        let gr_lines = receipt_lines(&gt, &gi).unwrap();
        assert_eq!((gr_lines[0].qty_planned, gr_lines[0].qty_actual), (20, Some(19)));
        assert_eq!(receipt_header(&gt).unwrap().loc_code, loc("L9"));
    }

    #[test]
    fn shortfall_is_surfaced_once_both_legs_complete() {
        let mut gt = transfer(20);
        let mut gi = doc("GI-000001", DocType::GoodsIssue, issue_header(&gt), issue_lines(&gt));
        complete(&mut gi);
        assert!(gt.mirror_transfer_progress(Some(&gi), None, Utc::now()).unwrap());
        assert!(gt.shortfalls().is_empty());

        let lines = vec![receipt_lines(&gt, &gi).unwrap()[0].clone().with_actual(18)];
        let mut gr = doc("GR-000001", DocType::GoodsReceipt, receipt_header(&gt).unwrap(), lines);
        complete(&mut gr);
        assert!(gt.mirror_transfer_progress(Some(&gi), Some(&gr), Utc::now()).unwrap());
        assert_eq!(gt.shortfalls()[0].shortfall, 2);

        assert!(!gt.mirror_transfer_progress(Some(&gi), Some(&gr), Utc::now()).unwrap());
    }

    #[test]
    fn cancel_is_refused_once_a_child_posted() {
        let gt = transfer(5);
        let mut gi = doc("GI-000001", DocType::GoodsIssue, issue_header(&gt), issue_lines(&gt));
        assert_eq!(cancel_children(&gt, &[&gi]).unwrap(), vec![gi.doc_id()]);

        gi.transition_to(DocStatus::Picking, UserId::new(), Utc::now(), None);
        let err = cancel_children(&gt, &[&gi]).unwrap_err();
        assert!(matches!(
            err,
            LinkageError::CannotCancelPostedTransfer { child_status: DocStatus::Picking, .. }
        ));

        gi.transition_to(DocStatus::Cancelled, UserId::new(), Utc::now(), None);
        assert!(cancel_children(&gt, &[&gi]).unwrap().is_empty());
    }

    #[test]
    fn a_leg_with_a_different_model_is_not_mirrored() {
        let mut gt = transfer(20);
        let m2 = ModelCode::parse("M2").unwrap();
        let mut gi = doc(
            "GI-000001",
            DocType::GoodsIssue,
            issue_header(&gt),
            vec![LineInput::new(m2, "EA", TrackingType::None, 20)],
        );
        complete(&mut gi);
        let before = gt.version;

        let err = receipt_lines(&gt, &gi).unwrap_err();
        assert!(matches!(err, LinkageError::LegMismatch { line_no: 1, .. }));
        let err = gt.mirror_transfer_progress(Some(&gi), None, Utc::now()).unwrap_err();
        assert!(matches!(err, LinkageError::LegMismatch { .. }));
        assert_eq!(gt.version, before);
    }

    #[test]
    fn leg_edits_keep_the_transfer_shape() {
        let gt = transfer(20);
        let mut gi = doc("GI-000001", DocType::GoodsIssue, issue_header(&gt), issue_lines(&gt));
        gi.set_gt_no(gt.doc_no());

        let m2 = ModelCode::parse("M2").unwrap();
        let swapped = vec![LineInput::new(m2, "EA", TrackingType::None, 20)];
        let errors = gi.replace_lines(swapped, Utc::now()).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "model_code"));

        let extra = vec![issue_lines(&gt)[0].clone(), issue_lines(&gt)[0].clone()];
        let errors = gi.replace_lines(extra, Utc::now()).unwrap_err();
        assert!(errors.iter().any(|e| e.field == "lines"));

        let picked = vec![issue_lines(&gt)[0].clone().with_actual(19)];
        gi.replace_lines(picked, Utc::now()).unwrap();
        assert_eq!(gi.line(1).unwrap().declared_qty(), 19);
    }
}
