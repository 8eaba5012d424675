//! Document repository boundary.
//!
//! Documents are stored whole (header, lines, history). `save` is an
//! optimistic compare-and-swap on the document version and refuses to rewrite
//! history: the stored history must be a prefix of the new one.

pub mod in_memory;

pub use in_memory::InMemoryDocumentRepository;

use thiserror::Error;

use stockflow_core::{DocumentId, ExpectedVersion, WarehouseCode};
use stockflow_inventory::{DocStatus, DocType, Document};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DocumentStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("duplicate document: {0}")]
    Duplicate(String),

    #[error("status history is append-only: {0}")]
    HistoryRewrite(String),

    #[error("document store unavailable: {0}")]
    Unavailable(String),
}

pub trait DocumentRepository: Send + Sync {
    /// Allocate the next document number for a type (`GR-000001`, ...).
    fn next_number(&self, doc_type: DocType) -> Result<String, DocumentStoreError>;

    /// Insert (`ExpectedVersion::New`) or update (`Exact(loaded version)`).
    fn save(&self, doc: &Document, expected: ExpectedVersion) -> Result<(), DocumentStoreError>;

    fn get(&self, id: DocumentId) -> Result<Option<Document>, DocumentStoreError>;

    fn find_by_no(&self, doc_no: &str) -> Result<Option<Document>, DocumentStoreError>;

    /// Ordered by document number.
    fn list_by_status(&self, status: DocStatus) -> Result<Vec<Document>, DocumentStoreError>;

    /// Documents whose source warehouse is `wh_code`, ordered by document number.
    fn list_by_warehouse(
        &self,
        wh_code: &WarehouseCode,
    ) -> Result<Vec<Document>, DocumentStoreError>;
}

impl<R> DocumentRepository for std::sync::Arc<R>
where
    R: DocumentRepository + ?Sized,
{
    fn next_number(&self, doc_type: DocType) -> Result<String, DocumentStoreError> {
        (**self).next_number(doc_type)
    }

    fn save(&self, doc: &Document, expected: ExpectedVersion) -> Result<(), DocumentStoreError> {
        (**self).save(doc, expected)
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>, DocumentStoreError> {
        (**self).get(id)
    }

    fn find_by_no(&self, doc_no: &str) -> Result<Option<Document>, DocumentStoreError> {
        (**self).find_by_no(doc_no)
    }

    fn list_by_status(&self, status: DocStatus) -> Result<Vec<Document>, DocumentStoreError> {
        (**self).list_by_status(status)
    }

    fn list_by_warehouse(
        &self,
        wh_code: &WarehouseCode,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        (**self).list_by_warehouse(wh_code)
    }
}
