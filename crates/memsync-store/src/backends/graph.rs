//! Graph backend: records, relationship edges and per-id version history.

use crate::adapter::{Capabilities, StoreAdapter, StoreRole, TxnHandle};
use crate::error::StoreError;
use crate::model::{Record, SearchResult};
use crate::query::Query;
use crate::txn::{RecordMap, TxnTable, check_batch, check_kind};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Directed, labelled edge between two record ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub to: String,
    pub label: String,
}

impl Relation {
    pub fn new(from: impl Into<String>, to: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: label.into(),
        }
    }
}

/// Compensation entry: prior value plus how many superseded versions the id
/// had before the commit.
#[derive(Debug, Clone)]
struct GraphUndo {
    id: String,
    prior: Option<Record>,
    superseded: usize,
}

#[derive(Debug, Default)]
struct Nodes {
    records: RecordMap,
    superseded: HashMap<String, Vec<Record>>,
    edges: BTreeSet<Relation>,
}

#[derive(Debug)]
struct GraphState {
    nodes: Nodes,
    txns: TxnTable<GraphUndo>,
}

impl Nodes {
    fn put(&mut self, record: Record) -> Option<Record> {
        let prior = self.records.insert(record.id.clone(), record);
        if let Some(previous) = &prior {
            self.superseded
                .entry(previous.id.clone())
                .or_default()
                .push(previous.clone());
        }
        prior
    }

    fn apply(&mut self, writes: Vec<Record>) -> Result<Vec<GraphUndo>, StoreError> {
        check_batch(&writes, &self.records)?;

        let mut undo: Vec<GraphUndo> = Vec::new();
        for write in writes {
            let id = write.id.clone();
            let superseded = self.superseded.get(&id).map_or(0, Vec::len);
            let prior = self.put(write);
            if !undo.iter().any(|entry| entry.id == id) {
                undo.push(GraphUndo {
                    id,
                    prior,
                    superseded,
                });
            }
        }
        Ok(undo)
    }

    fn compensate(&mut self, undo: Vec<GraphUndo>) {
        for entry in undo.into_iter().rev() {
            match entry.prior {
                Some(prior) => {
                    self.records.insert(entry.id.clone(), prior);
                }
                None => {
                    self.records.remove(&entry.id);
                }
            }
            if entry.superseded == 0 {
                self.superseded.remove(&entry.id);
            } else if let Some(versions) = self.superseded.get_mut(&entry.id) {
                versions.truncate(entry.superseded);
            }
        }
    }
}

/// Graph adapter. Relationships come from explicit [`GraphStore::relate`]
/// calls and from the reserved `references` metadata key.
#[derive(Debug)]
pub struct GraphStore {
    name: String,
    state: Mutex<GraphState>,
}

impl GraphStore {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            state: Mutex::new(GraphState {
                nodes: Nodes::default(),
                txns: TxnTable::new(name.clone()),
            }),
            name,
        }
    }

    /// Add an explicit edge. Returns false if it already existed.
    pub fn relate(&self, relation: Relation) -> bool {
        debug!(
            "adding relation (store={}, from={}, to={}, label={})",
            self.name, relation.from, relation.to, relation.label
        );
        self.state.lock().nodes.edges.insert(relation)
    }

    /// Explicit edges touching `id`.
    pub fn relations(&self, id: &str) -> Vec<Relation> {
        self.state
            .lock()
            .nodes
            .edges
            .iter()
            .filter(|edge| edge.from == id || edge.to == id)
            .cloned()
            .collect()
    }

    /// Records connected to `id` in either direction, excluding `id` itself.
    pub fn linked(&self, id: &str) -> Vec<Record> {
        let state = self.state.lock();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for edge in &state.nodes.edges {
            if edge.from == id {
                ids.insert(edge.to.clone());
            } else if edge.to == id {
                ids.insert(edge.from.clone());
            }
        }
        if let Some(record) = state.nodes.records.get(id) {
            ids.extend(record.references());
        }
        for record in state.nodes.records.values() {
            if record.references().iter().any(|reference| reference == id) {
                ids.insert(record.id.clone());
            }
        }
        ids.remove(id);
        ids.iter()
            .filter_map(|related| state.nodes.records.get(related).cloned())
            .collect()
    }

    /// Every version of `id`, oldest first, ending with the current one.
    pub fn history(&self, id: &str) -> Vec<Record> {
        let state = self.state.lock();
        let mut versions = state.nodes.superseded.get(id).cloned().unwrap_or_default();
        if let Some(current) = state.nodes.records.get(id) {
            versions.push(current.clone());
        }
        versions
    }

    /// One version of `id`, counting from 1.
    pub fn retrieve_version(&self, id: &str, version: usize) -> Option<Record> {
        if version == 0 {
            return None;
        }
        self.history(id).into_iter().nth(version - 1)
    }
}

#[async_trait]
impl StoreAdapter for GraphStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StoreRole {
        StoreRole::Graph
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn store(&self, record: Record) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        check_kind(state.nodes.records.get(&record.id), &record)?;
        let id = record.id.clone();
        let replaced = state.nodes.put(record).is_some();
        debug!(
            "stored graph node (store={}, id={}, replaced={})",
            self.name, id, replaced
        );
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.state.lock().nodes.records.get(id).cloned())
    }

    async fn search(&self, query: &Query) -> Result<Vec<SearchResult>, StoreError> {
        query.check_supported(&self.name, self.capabilities())?;
        let state = self.state.lock();
        Ok(query.scan(state.nodes.records.values(), &self.name))
    }

    /// Removes the node, its history and every explicit edge touching it.
    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        let removed = state.nodes.records.remove(id).is_some();
        state.nodes.superseded.remove(id);
        state.nodes.edges.retain(|edge| edge.from != id && edge.to != id);
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.state.lock().nodes.records.values().cloned().collect())
    }

    async fn begin_transaction(&self) -> Result<TxnHandle, StoreError> {
        self.state.lock().txns.begin()
    }

    async fn store_in_transaction(
        &self,
        handle: TxnHandle,
        record: Record,
    ) -> Result<String, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.txns.stage(handle, record, &state.nodes.records)
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
            None => Ok(state.nodes.records.get(id).cloned()),
        }
    }

    async fn commit_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let nodes = &mut state.nodes;
        state.txns.commit(handle, |writes| nodes.apply(writes))
    }

    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(undo) = state.txns.rollback(handle)? {
            state.nodes.compensate(undo);
        }
        Ok(())
    }

    async fn is_transaction_active(&self, handle: TxnHandle) -> bool {
        self.state.lock().txns.is_active(handle)
    }

    async fn release_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        self.state.lock().txns.release(handle)
    }

    async fn related(&self, id: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self.linked(id))
    }
}
