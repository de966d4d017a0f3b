//! Error types for the memory manager.

use memsync_config::ConfigError;
use memsync_store::{RecordKind, StoreError};
use thiserror::Error;

/// Errors returned by memory manager operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Store name is not registered.
    #[error("unknown store: {0}")]
    UnknownStore(String),
    /// A participant failed to commit; every participant was rolled back.
    #[error("transaction commit failed on store {store}: {source}")]
    TransactionCommit {
        store: String,
        #[source]
        source: StoreError,
    },
    /// The store already has an open transaction. Retryable.
    #[error("transaction busy on store {0}")]
    TransactionBusy(String),
    #[error("unsupported query on store {store}: {reason}")]
    UnsupportedQuery { store: String, reason: String },
    #[error("record {id} has kind {existing}; refusing to change it to {attempted}")]
    ImmutableKind {
        id: String,
        existing: RecordKind,
        attempted: RecordKind,
    },
    #[error("embedding dimension mismatch on store {store}: expected {expected}, got {actual}")]
    DimensionMismatch {
        store: String,
        expected: usize,
        actual: usize,
    },
    /// Store cannot undo a committed write, so it cannot join a transaction.
    #[error("store {0} does not support compensating rollback")]
    NonTransactional(String),
    /// Transaction handle is unknown or no longer usable.
    #[error("unknown transaction {handle} on store {store}")]
    UnknownTransaction { store: String, handle: String },
    /// Store was written through a scope it is not part of.
    #[error("store {0} is not part of this transaction")]
    NotInTransaction(String),
    /// Every attempt of a retried operation failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        last: Box<SyncError>,
    },
    /// Propagation worker is gone.
    #[error("propagation worker stopped")]
    WorkerStopped,
    /// Any other adapter failure.
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransactionBusy(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TransactionBusy { store } => SyncError::TransactionBusy(store),
            StoreError::UnsupportedQuery { store, reason } => {
                SyncError::UnsupportedQuery { store, reason }
            }
            StoreError::ImmutableKind {
                id,
                existing,
                attempted,
            } => SyncError::ImmutableKind {
                id,
                existing,
                attempted,
            },
            StoreError::DimensionMismatch {
                store,
                expected,
                actual,
            } => SyncError::DimensionMismatch {
                store,
                expected,
                actual,
            },
            StoreError::UnknownTransaction { store, handle } => SyncError::UnknownTransaction {
                store,
                handle: handle.to_string(),
            },
            other => SyncError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsync_store::TxnHandle;
    use pretty_assertions::assert_eq;

    #[test]
    fn busy_store_error_lifts_to_retryable() {
        let err = SyncError::from(StoreError::TransactionBusy {
            store: "lmdb".to_string(),
        });
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "transaction busy on store lmdb");
    }

    #[test]
    fn unknown_handle_keeps_store_name() {
        let handle = TxnHandle::new();
        let err = SyncError::from(StoreError::UnknownTransaction {
            store: "kuzu".to_string(),
            handle,
        });
        assert!(matches!(
            err,
            SyncError::UnknownTransaction { ref store, handle: ref shown }
                if store == "kuzu" && *shown == handle.to_string()
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn backend_errors_are_wrapped() {
        let err = SyncError::from(StoreError::Backend("disk full".to_string()));
        assert!(matches!(err, SyncError::Store(StoreError::Backend(_))));
    }
}
