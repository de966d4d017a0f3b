//! Ordered in-memory key-value backend.

use crate::adapter::{Capabilities, StoreAdapter, StoreRole, TxnHandle};
use crate::error::StoreError;
use crate::model::{Record, SearchResult};
use crate::query::Query;
use crate::txn::{RecordMap, TxnTable, apply_undo, apply_writes, check_kind};
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;

#[derive(Debug)]
struct KeyValueState {
    records: RecordMap,
    txns: TxnTable,
}

/// Key-value adapter over an ordered map with single-writer transactions.
///
/// Also serves the columnar role, which shares the same access pattern.
#[derive(Debug)]
pub struct KeyValueStore {
    name: String,
    role: StoreRole,
    state: Mutex<KeyValueState>,
}

impl KeyValueStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_role(name, StoreRole::KeyValue)
    }

    /// Same backend registered under the columnar role.
    pub fn columnar(name: impl Into<String>) -> Self {
        Self::with_role(name, StoreRole::Columnar)
    }

    fn with_role(name: impl Into<String>, role: StoreRole) -> Self {
        let name = name.into();
        Self {
            state: Mutex::new(KeyValueState {
                records: RecordMap::new(),
                txns: TxnTable::new(name.clone()),
            }),
            name,
            role,
        }
    }

    /// Number of committed records.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoreAdapter for KeyValueStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StoreRole {
        self.role
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn store(&self, record: Record) -> Result<String, StoreError> {
        let mut state = self.state.lock();
        check_kind(state.records.get(&record.id), &record)?;
        let id = record.id.clone();
        state.records.insert(id.clone(), record);
        debug!("stored record (store={}, id={})", self.name, id);
        Ok(id)
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.state.lock().records.get(id).cloned())
    }

    async fn search(&self, query: &Query) -> Result<Vec<SearchResult>, StoreError> {
        query.check_supported(&self.name, self.capabilities())?;
        let state = self.state.lock();
        Ok(query.scan(state.records.values(), &self.name))
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let removed = self.state.lock().records.remove(id).is_some();
        debug!(
            "deleted record (store={}, id={}, existed={})",
            self.name, id, removed
        );
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self.state.lock().records.values().cloned().collect())
    }

    async fn begin_transaction(&self) -> Result<TxnHandle, StoreError> {
        let handle = self.state.lock().txns.begin()?;
        debug!("began transaction (store={}, handle={})", self.name, handle);
        Ok(handle)
    }

    async fn store_in_transaction(
        &self,
        handle: TxnHandle,
        record: Record,
    ) -> Result<String, StoreError> {
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
            .commit(handle, |writes| apply_writes(records, writes))?;
        debug!("committed transaction (store={}, handle={})", self.name, handle);
        Ok(())
    }

    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(undo) = state.txns.rollback(handle)? {
            debug!(
                "compensating committed transaction (store={}, handle={}, entries={})",
                self.name,
                handle,
                undo.len()
            );
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
