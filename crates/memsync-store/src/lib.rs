//! Record model, adapter contract and bundled backends for memsync.
//!
//! Every backend plugged into the memory manager implements [`StoreAdapter`].
//! Backends without native transactions share the write-ahead buffer in
//! [`txn`] so that commit and compensating rollback behave the same way
//! everywhere.

pub mod adapter;
pub mod backends;
pub mod error;
pub mod model;
pub mod query;
pub mod txn;

/// Adapter contract and descriptors.
pub use adapter::{Capabilities, StoreAdapter, StoreRole, TxnHandle};
/// Bundled in-process backends.
pub use backends::{
    CharSumEmbedder, DocumentStore, Embedder, GraphStore, KeyValueStore, Relation, VectorStore,
};
/// Store error type.
pub use error::StoreError;
/// Record model.
pub use model::{Metadata, Record, RecordKind, SearchResult, WorkflowPhase};
/// Structured search query.
pub use query::Query;
/// Transaction state machine.
pub use txn::TxnState;
