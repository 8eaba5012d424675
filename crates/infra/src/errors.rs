//! Engine-level error, aggregating the domain error taxonomy with context.

use thiserror::Error;

use stockflow_inventory::{
    AdjustmentReport, CountError, DetailError, LedgerError, LinkageError, TransitionError,
    ValidationError,
};

use crate::repository::DocumentStoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input; the caller corrects it and retries.
    #[error("validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("{doc_no}: {source}")]
    Detail { doc_no: String, source: DetailError },

    #[error("{doc_no}: {source}")]
    Ledger { doc_no: String, source: LedgerError },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Linkage(#[from] LinkageError),

    /// Some count adjustment lines posted and some failed.
    #[error(
        "count {} adjustment incomplete: {} posted, {} failed",
        .0.doc_no,
        .0.posted.len(),
        .0.failed.len()
    )]
    AdjustmentIncomplete(AdjustmentReport),

    #[error("not found: {0}")]
    NotFound(String),

    /// The stored document changed underneath the operation.
    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Store(DocumentStoreError),
}

fn join(errors: &[ValidationError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl EngineError {
    pub fn validation(error: ValidationError) -> Self {
        Self::Validation(vec![error])
    }

    pub fn ledger(doc_no: impl Into<String>, source: LedgerError) -> Self {
        Self::Ledger {
            doc_no: doc_no.into(),
            source,
        }
    }

    pub fn detail(doc_no: impl Into<String>, source: DetailError) -> Self {
        Self::Detail {
            doc_no: doc_no.into(),
            source,
        }
    }

    /// Contention only: a busy ledger key or a stale document version.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Ledger { source, .. } => source.is_retryable(),
            EngineError::Concurrency(_) => true,
            _ => false,
        }
    }
}

impl From<Vec<ValidationError>> for EngineError {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

impl From<DocumentStoreError> for EngineError {
    fn from(value: DocumentStoreError) -> Self {
        match value {
            DocumentStoreError::Concurrency(msg) => EngineError::Concurrency(msg),
            other => EngineError::Store(other),
        }
    }
}

impl From<CountError> for EngineError {
    fn from(value: CountError) -> Self {
        match value {
            CountError::Transition(e) => EngineError::Transition(e),
            CountError::Invalid(errors) => EngineError::Validation(errors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::{LocationCode, ModelCode, WarehouseCode};
    use stockflow_inventory::OnhandKey;

    fn key() -> OnhandKey {
        OnhandKey::new(
            WarehouseCode::parse("W1").unwrap(),
            LocationCode::parse("L1").unwrap(),
            ModelCode::parse("M1").unwrap(),
        )
    }

    #[test]
    fn only_contention_is_retryable() {
        let busy = LedgerError::LedgerBusy { key: key() };
        assert!(EngineError::ledger("GI-000001", busy).is_retryable());
        assert!(EngineError::from(DocumentStoreError::Concurrency("stale".into())).is_retryable());

        let insufficient = LedgerError::InsufficientStock {
            key: key(),
            onhand_qty: 1,
            allocated_qty: 0,
            qty_delta: 0,
            allocated_delta: 2,
        };
        assert!(!EngineError::ledger("GI-000001", insufficient).is_retryable());
        assert!(!EngineError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn ledger_errors_name_the_document() {
        let err = EngineError::ledger("GI-000007", LedgerError::LedgerBusy { key: key() });
        assert_eq!(err.to_string(), "GI-000007: ledger key W1/L1/M1 is busy; retry later");
    }
}
