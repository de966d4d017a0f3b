//! Fixed-dimension vector backend with cosine similarity search.

use crate::adapter::{Capabilities, StoreAdapter, StoreRole, TxnHandle};
use crate::error::StoreError;
use crate::model::{Record, SearchResult};
use crate::query::{Query, rank};
use crate::txn::{RecordMap, TxnTable, apply_undo, apply_writes, check_kind};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// Default number of neighbours returned by an embedding search.
pub const DEFAULT_TOP_K: usize = 5;

/// Produces embeddings for records stored without one.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str, dimension: usize) -> Vec<f32>;
}

/// Deterministic fallback: character code points summed into buckets and
/// normalised by text length.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharSumEmbedder;

impl Embedder for CharSumEmbedder {
    fn embed(&self, text: &str, dimension: usize) -> Vec<f32> {
        let mut vector = vec![0.0_f32; dimension];
        if dimension == 0 {
            return vector;
        }
        let mut length = 0usize;
        for (idx, ch) in text.chars().enumerate() {
            vector[idx % dimension] += ch as u32 as f32;
            length += 1;
        }
        if length == 0 {
            return vector;
        }
        for value in &mut vector {
            *value /= length as f32;
        }
        vector
    }
}

/// Cosine similarity; zero when either vector has no magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

struct VectorState {
    records: RecordMap,
    txns: TxnTable,
}

/// Vector adapter. Every stored record carries an embedding of exactly
/// `dimension` values.
pub struct VectorStore {
    name: String,
    dimension: usize,
    embedder: Arc<dyn Embedder>,
    state: Mutex<VectorState>,
}

impl VectorStore {
    /// Create a store that embeds missing vectors with [`CharSumEmbedder`].
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self::with_embedder(name, dimension, Arc::new(CharSumEmbedder))
    }

    pub fn with_embedder(
        name: impl Into<String>,
        dimension: usize,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let name = name.into();
        Self {
            state: Mutex::new(VectorState {
                records: RecordMap::new(),
                txns: TxnTable::new(name.clone()),
            }),
            name,
            dimension,
            embedder,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Fill in a missing embedding and validate its length.
    fn prepare(&self, mut record: Record) -> Result<Record, StoreError> {
        let embedding = match record.embedding.take() {
            Some(embedding) => embedding,
            None => self
                .embedder
                .embed(&record.content_text(), self.dimension),
        };
        self.check_dimension(&embedding)?;
        record.embedding = Some(embedding);
        Ok(record)
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<(), StoreError> {
        if embedding.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                store: self.name.clone(),
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for VectorStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StoreRole {
        StoreRole::Vector
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            embedding_search: true,
            ..Capabilities::default()
        }
    }

    async fn store(&self, record: Record) -> Result<String, StoreError> {
        let record = self.prepare(record)?;
        let mut state = self.state.lock();
        check_kind(state.records.get(&record.id), &record)?;
        let id = record.id.clone();
        state.records.insert(id.clone(), record);
        debug!(
            "stored vector (store={}, id={}, dimension={})",
            self.name, id, self.dimension
        );
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.state.lock().records.get(id).cloned())
    }

    async fn search(&self, query: &Query) -> Result<Vec<SearchResult>, StoreError> {
        query.check_supported(&self.name, self.capabilities())?;
        let Some(target) = &query.embedding else {
            let state = self.state.lock();
            return Ok(query.scan(state.records.values(), &self.name));
        };
        self.check_dimension(target)?;

        let state = self.state.lock();
        let mut results: Vec<SearchResult> = state
            .records
            .values()
            .filter(|record| query.matches(record))
            .filter_map(|record| {
                let embedding = record.embedding.as_deref()?;
                let similarity = cosine_similarity(target, embedding);
                Some(SearchResult::similar(record.clone(), similarity, &self.name))
            })
            .collect();
        rank(&mut results);
        results.truncate(query.limit.unwrap_or(DEFAULT_TOP_K));
        Ok(results)
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().records.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    async fn begin_transaction(&self) -> Result<TxnHandle, StoreError> {
        self.state.lock().txns.begin()
    }

    async fn store_in_transaction(
        &self,
        handle: TxnHandle,
        record: Record,
    ) -> Result<String, StoreError> {
        let record = self.prepare(record)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.txns.stage(handle, record, &state.records)
    }

    async fn retrieve_in_transaction(
        &self,
        handle: TxnHandle,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.txns.staged(handle, id)? {
            Some(record) => Ok(Some(record)),
            None => Ok(state.records.get(id).cloned()),
        }
    }

    async fn commit_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let records = &mut state.records;
        state
            .txns
            .commit(handle, |writes| apply_writes(records, writes))
    }

    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(undo) = state.txns.rollback(handle)? {
            apply_undo(&mut state.records, undo);
        }
        Ok(())
    }

    async fn is_transaction_active(&self, handle: TxnHandle) -> bool {
        self.state.lock().txns.is_active(handle)
    }

    async fn release_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        self.state.lock().txns.release(handle)
    }
}
