//! The contract every storage backend satisfies.

use crate::error::StoreError;
use crate::model::{Record, SearchResult};
use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque per-adapter transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnHandle(Uuid);

impl TxnHandle {
    /// Issue a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TxnHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of physical backend an adapter wraps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    Document,
    KeyValue,
    Columnar,
    Vector,
    Graph,
}

impl StoreRole {
    /// Position in the cascading traversal order. Key-value and columnar
    /// backends share a hop.
    pub fn hop(&self) -> u8 {
        match self {
            StoreRole::Document => 0,
            StoreRole::KeyValue | StoreRole::Columnar => 1,
            StoreRole::Vector => 2,
            StoreRole::Graph => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Document => "document",
            StoreRole::KeyValue => "key_value",
            StoreRole::Columnar => "columnar",
            StoreRole::Vector => "vector",
            StoreRole::Graph => "graph",
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "document" => Ok(StoreRole::Document),
            "key_value" => Ok(StoreRole::KeyValue),
            "columnar" => Ok(StoreRole::Columnar),
            "vector" => Ok(StoreRole::Vector),
            "graph" => Ok(StoreRole::Graph),
            other => Err(format!("unknown store role: {other}")),
        }
    }
}

/// What an adapter can do beyond plain CRUD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Accepts a query embedding.
    pub embedding_search: bool,
    /// Can undo a committed transaction.
    pub compensating_rollback: bool,
    /// Evaluates content substring filters.
    pub content_filter: bool,
    /// Evaluates metadata equality filters.
    pub metadata_filter: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            embedding_search: false,
            compensating_rollback: true,
            content_filter: true,
            metadata_filter: true,
        }
    }
}

/// Uniform CRUD and transaction contract over one backend.
///
/// Implementations guard their own state; every method may be called
/// concurrently from several tasks.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Registry name of this adapter.
    fn name(&self) -> &str;

    fn role(&self) -> StoreRole;

    fn capabilities(&self) -> Capabilities;

    /// Write a record outside any transaction and return its id.
    async fn store(&self, record: Record) -> Result<String, StoreError>;

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, StoreError>;

    async fn search(&self, query: &Query) -> Result<Vec<SearchResult>, StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Full scan used by synchronization.
    async fn list(&self) -> Result<Vec<Record>, StoreError>;

    async fn begin_transaction(&self) -> Result<TxnHandle, StoreError>;

    async fn store_in_transaction(
        &self,
        handle: TxnHandle,
        record: Record,
    ) -> Result<String, StoreError>;

    /// Read through the transaction, seeing its own uncommitted writes.
    async fn retrieve_in_transaction(
        &self,
        handle: TxnHandle,
        id: &str,
    ) -> Result<Option<Record>, StoreError>;

    async fn commit_transaction(&self, handle: TxnHandle) -> Result<(), StoreError>;

    /// Discard an open transaction, or compensate a committed one.
    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError>;

    async fn is_transaction_active(&self, handle: TxnHandle) -> bool;

    /// Forget a finished handle and its compensation log.
    async fn release_transaction(&self, _handle: TxnHandle) -> Result<(), StoreError> {
        Ok(())
    }

    /// Records linked to `id`. Only graph backends track links.
    async fn related(&self, _id: &str) -> Result<Vec<Record>, StoreError> {
        Ok(Vec::new())
    }
}
