//! Warehouse documents: header, ordered lines, status and append-only history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::{AggregateRoot, DocumentId, LocationCode, ModelCode, UserId, WarehouseCode};
use stockflow_events::Event;

use crate::onhand::OnhandKey;
use crate::tracking::{self, TrackingDetail, TrackingType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    GoodsReceipt,
    GoodsIssue,
    GoodsTransfer,
    InventoryCount,
}

impl DocType {
    /// Document number prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            DocType::GoodsReceipt => "GR",
            DocType::GoodsIssue => "GI",
            DocType::GoodsTransfer => "GT",
            DocType::InventoryCount => "IC",
        }
    }

    pub fn initial_status(self) -> DocStatus {
        match self {
            DocType::GoodsReceipt => DocStatus::Draft,
            DocType::GoodsIssue => DocStatus::New,
            DocType::GoodsTransfer => DocStatus::Created,
            DocType::InventoryCount => DocStatus::Created,
        }
    }

    /// Stream type used when publishing this document's events.
    pub fn stream_type(self) -> &'static str {
        match self {
            DocType::GoodsReceipt => "document.goods_receipt",
            DocType::GoodsIssue => "document.goods_issue",
            DocType::GoodsTransfer => "document.goods_transfer",
            DocType::InventoryCount => "document.inventory_count",
        }
    }
}

impl core::fmt::Display for DocType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocStatus {
    Draft,
    New,
    Receiving,
    Picking,
    Submitted,
    Counting,
    Review,
    Completed,
    Rejected,
    Cancelled,
    AdjustmentRequested,
    Created,
    Exporting,
}

impl DocStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DocStatus::Completed | DocStatus::Rejected | DocStatus::Cancelled)
    }

    /// Statuses in which nothing has touched the ledger and lines may be edited.
    pub fn is_pre_posting(self) -> bool {
        matches!(self, DocStatus::Draft | DocStatus::New | DocStatus::Created)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocStatus::Draft => "draft",
            DocStatus::New => "new",
            DocStatus::Receiving => "receiving",
            DocStatus::Picking => "picking",
            DocStatus::Submitted => "submitted",
            DocStatus::Counting => "counting",
            DocStatus::Review => "review",
            DocStatus::Completed => "completed",
            DocStatus::Rejected => "rejected",
            DocStatus::Cancelled => "cancelled",
            DocStatus::AdjustmentRequested => "adjustment_requested",
            DocStatus::Created => "created",
            DocStatus::Exporting => "exporting",
        }
    }
}

impl core::fmt::Display for DocStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Document header. Transfers also carry a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHeader {
    pub wh_code: WarehouseCode,
    pub loc_code: LocationCode,
    pub dest_wh_code: Option<WarehouseCode>,
    pub dest_loc_code: Option<LocationCode>,
    pub reference: Option<String>,
    pub note: Option<String>,
}

impl DocumentHeader {
    pub fn new(wh_code: WarehouseCode, loc_code: LocationCode) -> Self {
        Self {
            wh_code,
            loc_code,
            dest_wh_code: None,
            dest_loc_code: None,
            reference: None,
            note: None,
        }
    }

    pub fn with_destination(mut self, wh_code: WarehouseCode, loc_code: LocationCode) -> Self {
        self.dest_wh_code = Some(wh_code);
        self.dest_loc_code = Some(loc_code);
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn source_key(&self, model_code: &ModelCode) -> OnhandKey {
        OnhandKey::new(self.wh_code.clone(), self.loc_code.clone(), model_code.clone())
    }
}

/// Caller-supplied line content for create/update.
///
/// `qty_planned` is the planned quantity (`qty_transfer` for transfers, unused
/// for counts). `qty_actual` is the received/picked quantity and defaults to
/// the planned quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInput {
    pub model_code: ModelCode,
    pub uom: String,
    pub tracking_type: TrackingType,
    pub qty_planned: i64,
    pub qty_actual: Option<i64>,
    #[serde(default)]
    pub detail: TrackingDetail,
}

impl LineInput {
    pub fn new(
        model_code: ModelCode,
        uom: impl Into<String>,
        tracking_type: TrackingType,
        qty_planned: i64,
    ) -> Self {
        Self {
            model_code,
            uom: uom.into(),
            tracking_type,
            qty_planned,
            qty_actual: None,
            detail: TrackingDetail::None,
        }
    }

    pub fn with_actual(mut self, qty: i64) -> Self {
        self.qty_actual = Some(qty);
        self
    }

    pub fn with_detail(mut self, detail: TrackingDetail) -> Self {
        self.detail = detail;
        self
    }

    fn actual_or_planned(&self) -> i64 {
        self.qty_actual.unwrap_or(self.qty_planned)
    }
}

/// Per-document-type quantities of a line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LineQty {
    Receipt {
        qty_planned: i64,
        qty_received: i64,
    },
    Issue {
        qty_planned: i64,
        qty_picked: i64,
    },
    Transfer {
        qty_transfer: i64,
        qty_exported: Option<i64>,
        qty_received: Option<i64>,
    },
    Count {
        system_qty: Option<i64>,
        counted_qty: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub line_no: u32,
    pub model_code: ModelCode,
    pub uom: String,
    pub tracking_type: TrackingType,
    pub qty: LineQty,
    pub detail: TrackingDetail,
    /// Count lines flagged for a second pass.
    pub is_recounted: bool,
    /// Count lines whose adjustment has been committed to the ledger.
    pub adjustment_posted: bool,
}

impl DocumentLine {
    fn from_input(doc_type: DocType, line_no: u32, input: LineInput) -> Self {
        let qty = match doc_type {
            DocType::GoodsReceipt => LineQty::Receipt {
                qty_planned: input.qty_planned,
                qty_received: input.actual_or_planned(),
            },
            DocType::GoodsIssue => LineQty::Issue {
                qty_planned: input.qty_planned,
                qty_picked: input.actual_or_planned(),
            },
            DocType::GoodsTransfer => LineQty::Transfer {
                qty_transfer: input.qty_planned,
                qty_exported: None,
                qty_received: None,
            },
            DocType::InventoryCount => LineQty::Count {
                system_qty: None,
                counted_qty: None,
            },
        };
        Self {
            line_no,
            model_code: input.model_code,
            uom: input.uom,
            tracking_type: input.tracking_type,
            qty,
            detail: input.detail,
            is_recounted: false,
            adjustment_posted: false,
        }
    }

    pub fn planned_qty(&self) -> i64 {
        match &self.qty {
            LineQty::Receipt { qty_planned, .. } | LineQty::Issue { qty_planned, .. } => {
                *qty_planned
            }
            LineQty::Transfer { qty_transfer, .. } => *qty_transfer,
            LineQty::Count { system_qty, .. } => system_qty.unwrap_or(0),
        }
    }

    /// The quantity the line's detail list must account for and that a
    /// posting moves: received, picked, transferred or counted.
    pub fn declared_qty(&self) -> i64 {
        match &self.qty {
            LineQty::Receipt { qty_received, .. } => *qty_received,
            LineQty::Issue { qty_picked, .. } => *qty_picked,
            LineQty::Transfer { qty_transfer, .. } => *qty_transfer,
            LineQty::Count { counted_qty, .. } => counted_qty.unwrap_or(0),
        }
    }
}

/// A malformed or missing field. Recoverable: the caller corrects the input.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}{field}: {message}", line_prefix(.line_no))]
pub struct ValidationError {
    pub line_no: Option<u32>,
    pub field: String,
    pub message: String,
}

fn line_prefix(line_no: &Option<u32>) -> String {
    match line_no {
        Some(n) => format!("line {n}: "),
        None => String::new(),
    }
}

impl ValidationError {
    pub fn header(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line_no: None,
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn line(line_no: u32, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            line_no: Some(line_no),
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_header(doc_type: DocType, header: &DocumentHeader) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    if doc_type == DocType::GoodsTransfer {
        match (&header.dest_wh_code, &header.dest_loc_code) {
            (Some(wh), Some(loc)) => {
                if *wh == header.wh_code && *loc == header.loc_code {
                    errors.push(ValidationError::header(
                        "dest_loc_code",
                        "destination must differ from source",
                    ));
                }
            }
            _ => errors.push(ValidationError::header(
                "dest_loc_code",
                "transfer requires a destination warehouse and location",
            )),
        }
    }
    errors
}

/// Validate caller-supplied lines for a document type. Returns every problem
/// found, not just the first.
pub fn validate_lines(doc_type: DocType, lines: &[LineInput]) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let line_no = idx as u32 + 1;

        if line.uom.trim().is_empty() {
            errors.push(ValidationError::line(line_no, "uom", "cannot be empty"));
        }
        if line.qty_planned < 0 {
            errors.push(ValidationError::line(line_no, "qty_planned", "cannot be negative"));
        }
        if doc_type == DocType::GoodsTransfer && line.qty_planned == 0 {
            errors.push(ValidationError::line(line_no, "qty_transfer", "must be positive"));
        }
        if let Some(actual) = line.qty_actual {
            if actual < 0 {
                errors.push(ValidationError::line(line_no, "qty_actual", "cannot be negative"));
            }
            if doc_type == DocType::GoodsIssue && actual > line.qty_planned {
                errors.push(ValidationError::line(
                    line_no,
                    "qty_picked",
                    format!("cannot exceed planned quantity {}", line.qty_planned),
                ));
            }
        }

        if doc_type == DocType::InventoryCount {
            if line.detail != TrackingDetail::None {
                errors.push(ValidationError::line(
                    line_no,
                    "detail",
                    "count details are recorded while counting",
                ));
            }
            continue;
        }

        let declared = match doc_type {
            DocType::GoodsTransfer => line.qty_planned,
            _ => line.actual_or_planned(),
        };
        if let Err(e) =
            tracking::validate_shape(line_no, line.tracking_type, declared, &line.detail)
        {
            errors.push(ValidationError::line(line_no, "detail", e.to_string()));
        }
    }

    let details = lines
        .iter()
        .enumerate()
        .map(|(idx, l)| (idx as u32 + 1, &l.detail));
    if let Err(e) = tracking::ensure_unique_serials(details) {
        errors.push(ValidationError::header("detail", e.to_string()));
    }

    errors
}

/// Immutable audit entry appended on every status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEvent {
    pub doc_id: DocumentId,
    pub doc_no: String,
    pub doc_type: DocType,
    pub from: Option<DocStatus>,
    pub status: DocStatus,
    pub user: UserId,
    pub timestamp: DateTime<Utc>,
    pub note: Option<String>,
}

impl Event for StatusHistoryEvent {
    fn event_type(&self) -> &'static str {
        "document.status_changed"
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Received quantity differing from exported quantity on a completed transfer.
/// Surfaced for review, never auto-corrected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferShortfall {
    pub line_no: u32,
    pub model_code: ModelCode,
    pub exported: i64,
    pub received: i64,
    /// `exported - received`; negative for an overage.
    pub shortfall: i64,
}

/// Aggregate root: a GR, GI, GT or IC document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub(crate) id: DocumentId,
    pub(crate) doc_no: String,
    pub(crate) doc_type: DocType,
    pub(crate) status: DocStatus,
    pub(crate) header: DocumentHeader,
    pub(crate) lines: Vec<DocumentLine>,
    pub(crate) history: Vec<StatusHistoryEvent>,
    pub(crate) gt_no: Option<String>,
    pub(crate) linked_gi_no: Option<String>,
    pub(crate) linked_gr_no: Option<String>,
    pub(crate) shortfalls: Vec<TransferShortfall>,
    pub(crate) created_by: UserId,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
    pub(crate) version: u64,
}

impl Document {
    /// Create a document in its type's initial status. The creation is the
    /// first history entry.
    pub fn create(
        id: DocumentId,
        doc_no: impl Into<String>,
        doc_type: DocType,
        header: DocumentHeader,
        lines: Vec<LineInput>,
        actor: UserId,
        at: DateTime<Utc>,
    ) -> Result<Self, Vec<ValidationError>> {
        let mut errors = validate_header(doc_type, &header);
        errors.extend(validate_lines(doc_type, &lines));
        if !errors.is_empty() {
            return Err(errors);
        }

        let doc_no = doc_no.into();
        let status = doc_type.initial_status();
        let lines = number_lines(doc_type, lines);
        let created = StatusHistoryEvent {
            doc_id: id,
            doc_no: doc_no.clone(),
            doc_type,
            from: None,
            status,
            user: actor,
            timestamp: at,
            note: None,
        };

        Ok(Self {
            id,
            doc_no,
            doc_type,
            status,
            header,
            lines,
            history: vec![created],
            gt_no: None,
            linked_gi_no: None,
            linked_gr_no: None,
            shortfalls: Vec::new(),
            created_by: actor,
            created_at: at,
            updated_at: at,
            version: 1,
        })
    }

    pub fn doc_id(&self) -> DocumentId {
        self.id
    }

    pub fn doc_no(&self) -> &str {
        &self.doc_no
    }

    pub fn doc_type(&self) -> DocType {
        self.doc_type
    }

    pub fn status(&self) -> DocStatus {
        self.status
    }

    pub fn header(&self) -> &DocumentHeader {
        &self.header
    }

    pub fn lines(&self) -> &[DocumentLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&DocumentLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn history(&self) -> &[StatusHistoryEvent] {
        &self.history
    }

    pub fn gt_no(&self) -> Option<&str> {
        self.gt_no.as_deref()
    }

    pub fn linked_gi_no(&self) -> Option<&str> {
        self.linked_gi_no.as_deref()
    }

    pub fn linked_gr_no(&self) -> Option<&str> {
        self.linked_gr_no.as_deref()
    }

    pub fn shortfalls(&self) -> &[TransferShortfall] {
        &self.shortfalls
    }

    pub fn created_by(&self) -> UserId {
        self.created_by
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Ledger key a line posts to (the header's source location).
    pub fn line_key(&self, line: &DocumentLine) -> OnhandKey {
        self.header.source_key(&line.model_code)
    }

    /// Line edits are only allowed before anything has been posted.
    pub fn ensure_editable(&self) -> Result<(), crate::status::TransitionError> {
        if self.status.is_pre_posting() {
            Ok(())
        } else {
            Err(crate::status::TransitionError::DocumentLocked {
                doc_no: self.doc_no.clone(),
                status: self.status,
            })
        }
    }

    /// Replace all lines. The caller must have checked [`Self::ensure_editable`].
    ///
    /// A model's tracking type is frozen once it appears on the document. Lines
    /// of a transfer leg keep their model, tracking type and planned quantity.
    pub fn replace_lines(
        &mut self,
        lines: Vec<LineInput>,
        at: DateTime<Utc>,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = validate_lines(self.doc_type, &lines);
        if self.gt_no.is_some() {
            errors.extend(self.leg_edit_errors(&lines));
        }
        for (idx, input) in lines.iter().enumerate() {
            let frozen = self
                .lines
                .iter()
                .find(|l| l.model_code == input.model_code)
                .map(|l| l.tracking_type);
            if let Some(existing) = frozen {
                if existing != input.tracking_type {
                    errors.push(ValidationError::line(
                        idx as u32 + 1,
                        "tracking_type",
                        format!("{} is tracked as {existing:?}", input.model_code),
                    ));
                }
            }
        }
        if !errors.is_empty() {
            return Err(errors);
        }

        self.lines = number_lines(self.doc_type, lines);
        self.touch(at);
        Ok(())
    }

    /// Move to `to`, appending the history entry. Returns the entry.
    pub fn transition_to(
        &mut self,
        to: DocStatus,
        actor: UserId,
        at: DateTime<Utc>,
        note: Option<String>,
    ) -> StatusHistoryEvent {
        let entry = StatusHistoryEvent {
            doc_id: self.id,
            doc_no: self.doc_no.clone(),
            doc_type: self.doc_type,
            from: Some(self.status),
            status: to,
            user: actor,
            timestamp: at,
            note,
        };
        self.status = to;
        self.history.push(entry.clone());
        self.touch(at);
        entry
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.version += 1;
    }
}

impl AggregateRoot for Document {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

fn number_lines(doc_type: DocType, lines: Vec<LineInput>) -> Vec<DocumentLine> {
    lines
        .into_iter()
        .enumerate()
        .map(|(idx, input)| DocumentLine::from_input(doc_type, idx as u32 + 1, input))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::LotEntry;

    fn header() -> DocumentHeader {
        DocumentHeader::new(WarehouseCode::parse("W1").unwrap(), LocationCode::parse("L1").unwrap())
    }

    fn model(code: &str) -> ModelCode {
        ModelCode::parse(code).unwrap()
    }

    fn create(
        doc_type: DocType,
        header: DocumentHeader,
        lines: Vec<LineInput>,
    ) -> Result<Document, Vec<ValidationError>> {
        Document::create(
            DocumentId::new(),
            "DOC-1",
            doc_type,
            header,
            lines,
            UserId::new(),
            Utc::now(),
        )
    }

    #[test]
    fn documents_start_in_their_type_initial_status() {
        let gr = create(DocType::GoodsReceipt, header(), vec![]).unwrap();
        assert_eq!(gr.status(), DocStatus::Draft);
        assert_eq!(gr.history().len(), 1);
        assert_eq!(gr.history()[0].from, None);

        let gi = create(DocType::GoodsIssue, header(), vec![]).unwrap();
        assert_eq!(gi.status(), DocStatus::New);
    }

    #[test]
    fn actual_quantity_defaults_to_planned() {
        let gr = create(
            DocType::GoodsReceipt,
            header(),
            vec![LineInput::new(model("M1"), "EA", TrackingType::None, 12)],
        )
        .unwrap();
        assert_eq!(gr.lines()[0].declared_qty(), 12);
        assert_eq!(gr.lines()[0].line_no, 1);
    }

    #[test]
    fn invalid_lines_report_every_problem() {
        let errors = create(
            DocType::GoodsIssue,
            header(),
            vec![
                LineInput::new(model("M1"), "", TrackingType::None, 5),
                LineInput::new(model("M2"), "EA", TrackingType::None, 5).with_actual(6),
                LineInput::new(model("M3"), "EA", TrackingType::Lot, 4)
                    .with_detail(TrackingDetail::lots(vec![LotEntry::new("A", 3)])),
            ],
        )
        .unwrap_err();

        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].line_no, Some(1));
        assert_eq!(errors[1].field, "qty_picked");
        assert_eq!(errors[2].field, "detail");
    }

    #[test]
    fn transfer_requires_a_distinct_destination() {
        let errors = create(DocType::GoodsTransfer, header(), vec![]).unwrap_err();
        assert_eq!(errors[0].field, "dest_loc_code");

        let same = header().with_destination(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse("L1").unwrap(),
        );
        assert!(create(DocType::GoodsTransfer, same, vec![]).is_err());
    }

    #[test]
    fn tracking_type_is_frozen_per_model() {
        let mut gr = create(
            DocType::GoodsReceipt,
            header(),
            vec![LineInput::new(model("M1"), "EA", TrackingType::None, 1)],
        )
        .unwrap();

        let errors = gr
            .replace_lines(
                vec![LineInput::new(model("M1"), "EA", TrackingType::Serial, 1)
                    .with_detail(TrackingDetail::serials(&["S1"]))],
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(errors[0].field, "tracking_type");
    }

    #[test]
    fn transitions_append_history_and_bump_version() {
        let mut gr = create(DocType::GoodsReceipt, header(), vec![]).unwrap();
        let before = gr.version();
        let entry =
            gr.transition_to(DocStatus::New, UserId::new(), Utc::now(), Some("released".into()));

        assert_eq!(entry.from, Some(DocStatus::Draft));
        assert_eq!(gr.status(), DocStatus::New);
        assert_eq!(gr.history().len(), 2);
        assert_eq!(gr.version(), before + 1);
    }

    #[test]
    fn validation_error_display_names_the_line() {
        let e = ValidationError::line(3, "uom", "cannot be empty");
        assert_eq!(e.to_string(), "line 3: uom: cannot be empty");
        assert_eq!(ValidationError::header("x", "y").to_string(), "x: y");
    }
}
