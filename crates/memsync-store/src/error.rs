//! Error types for store adapters.

use crate::adapter::TxnHandle;
use crate::model::RecordKind;
use crate::txn::TxnState;

/// Errors returned by store adapters.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another transaction already holds the adapter's write slot.
    #[error("transaction busy on store {store}")]
    TransactionBusy { store: String },
    /// Handle was never issued by this adapter or has been released.
    #[error("unknown transaction {handle} on store {store}")]
    UnknownTransaction { store: String, handle: TxnHandle },
    /// Handle exists but is no longer open for writes.
    #[error("transaction {handle} on store {store} is {state}")]
    TransactionClosed {
        store: String,
        handle: TxnHandle,
        state: TxnState,
    },
    /// Query uses a filter this adapter cannot evaluate.
    #[error("unsupported query on store {store}: {reason}")]
    UnsupportedQuery { store: String, reason: String },
    /// A write tried to change the kind of an existing record.
    #[error("record {id} has kind {existing}; refusing to change it to {attempted}")]
    ImmutableKind {
        id: String,
        existing: RecordKind,
        attempted: RecordKind,
    },
    /// Embedding length differs from the adapter's dimension.
    #[error("embedding dimension mismatch on store {store}: expected {expected}, got {actual}")]
    DimensionMismatch {
        store: String,
        expected: usize,
        actual: usize,
    },
    /// Commit could not be applied.
    #[error("commit failed on store {store}: {reason}")]
    CommitFailed { store: String, reason: String },
    /// Backend-specific failure.
    #[error("backend error: {0}")]
    Backend(String),
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransactionBusy { .. })
    }
}
