use std::collections::HashMap;
use std::sync::RwLock;

use stockflow_core::{AggregateRoot, DocumentId, ExpectedVersion, WarehouseCode};
use stockflow_inventory::{DocStatus, DocType, Document};

use super::{DocumentRepository, DocumentStoreError};

#[derive(Debug, Default)]
struct Tables {
    docs: HashMap<DocumentId, Document>,
    by_no: HashMap<String, DocumentId>,
    counters: HashMap<DocType, u64>,
}

/// In-memory document repository.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryDocumentRepository {
    tables: RwLock<Tables>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> DocumentStoreError {
        DocumentStoreError::Unavailable("lock poisoned".to_string())
    }

    fn select(
        &self,
        filter: impl Fn(&Document) -> bool,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let mut docs: Vec<Document> = tables.docs.values().filter(|d| filter(d)).cloned().collect();
        docs.sort_by(|a, b| a.doc_no().cmp(b.doc_no()));
        Ok(docs)
    }
}

impl DocumentRepository for InMemoryDocumentRepository {
    fn next_number(&self, doc_type: DocType) -> Result<String, DocumentStoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let counter = tables.counters.entry(doc_type).or_insert(0);
        *counter += 1;
        Ok(format!("{}-{:06}", doc_type.prefix(), counter))
    }

    fn save(&self, doc: &Document, expected: ExpectedVersion) -> Result<(), DocumentStoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;

        let stored = tables.docs.get(&doc.doc_id());
        let current = stored.map(|d| d.version());
        if !expected.matches(current) {
            return Err(DocumentStoreError::Concurrency(format!(
                "{}: expected {expected:?}, found {current:?}",
                doc.doc_no()
            )));
        }

        match stored {
            Some(existing) => {
                if !doc.history().starts_with(existing.history()) {
                    return Err(DocumentStoreError::HistoryRewrite(doc.doc_no().to_string()));
                }
            }
            None => {
                if tables.by_no.contains_key(doc.doc_no()) {
                    return Err(DocumentStoreError::Duplicate(doc.doc_no().to_string()));
                }
            }
        }

        tables.by_no.insert(doc.doc_no().to_string(), doc.doc_id());
        tables.docs.insert(doc.doc_id(), doc.clone());
        Ok(())
    }

    fn get(&self, id: DocumentId) -> Result<Option<Document>, DocumentStoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.docs.get(&id).cloned())
    }

    fn find_by_no(&self, doc_no: &str) -> Result<Option<Document>, DocumentStoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables
            .by_no
            .get(doc_no)
            .and_then(|id| tables.docs.get(id))
            .cloned())
    }

    fn list_by_status(&self, status: DocStatus) -> Result<Vec<Document>, DocumentStoreError> {
        self.select(|d| d.status() == status)
    }

    fn list_by_warehouse(
        &self,
        wh_code: &WarehouseCode,
    ) -> Result<Vec<Document>, DocumentStoreError> {
        self.select(|d| &d.header().wh_code == wh_code)
    }
}
