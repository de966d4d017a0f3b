//! JSONL file-backed document backend.

use crate::adapter::{Capabilities, StoreAdapter, StoreRole, TxnHandle};
use crate::error::StoreError;
use crate::model::{Record, SearchResult};
use crate::query::Query;
use crate::txn::{RecordMap, TxnTable, UndoEntry, apply_undo, apply_writes};
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct DocumentState {
    records: RecordMap,
    txns: TxnTable,
}

/// Document adapter persisting one JSON record per line.
///
/// The whole file is rewritten through a temp file after every committed
/// change. A failed rewrite reverts the in-memory change.
#[derive(Debug)]
pub struct DocumentStore {
    name: String,
    path: PathBuf,
    state: Mutex<DocumentState>,
}

impl DocumentStore {
    /// Open the store at `path`, loading any existing records.
    pub fn open(name: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let name = name.into();
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let records = load_records(&path)?;
        info!(
            "document store initialized (store={}, path={}, records={})",
            name,
            path.display(),
            records.len()
        );
        Ok(Self {
            state: Mutex::new(DocumentState {
                records,
                txns: TxnTable::new(name.clone()),
            }),
            name,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_or_revert(
        &self,
        records: &mut RecordMap,
        undo: Vec<UndoEntry>,
    ) -> Result<Vec<UndoEntry>, StoreError> {
        if let Err(err) = write_records(&self.path, records) {
            warn!(
                "document store rewrite failed, reverting (store={}, path={}, error={})",
                self.name,
                self.path.display(),
                err
            );
            apply_undo(records, undo);
            return Err(StoreError::CommitFailed {
                store: self.name.clone(),
                reason: err.to_string(),
            });
        }
        Ok(undo)
    }
}

fn load_records(path: &Path) -> Result<RecordMap, StoreError> {
    let mut records = RecordMap::new();
    if !path.exists() {
        return Ok(records);
    }
    let file = OpenOptions::new().read(true).open(path)?;
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)?;
        records.insert(record.id.clone(), record);
    }
    Ok(records)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    PathBuf::from(temp)
}

/// Rewrite the file atomically.
fn write_records(path: &Path, records: &RecordMap) -> Result<(), StoreError> {
    let temp = temp_path(path);
    {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp)?;
        for record in records.values() {
            let line = serde_json::to_string(record)?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
    }
    std::fs::rename(temp, path)?;
    Ok(())
}

#[async_trait]
impl StoreAdapter for DocumentStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> StoreRole {
        StoreRole::Document
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn store(&self, record: Record) -> Result<String, StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let id = record.id.clone();
        let undo = apply_writes(&mut state.records, vec![record])?;
        self.persist_or_revert(&mut state.records, undo)?;
        debug!("stored document (store={}, id={})", self.name, id);
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
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(prior) = state.records.remove(id) else {
            return Ok(false);
        };
        let undo = vec![UndoEntry {
            id: id.to_string(),
            prior: Some(prior),
        }];
        self.persist_or_revert(&mut state.records, undo)?;
        Ok(true)
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
        state.txns.commit(handle, |writes| {
            let undo = apply_writes(records, writes)?;
            self.persist_or_revert(records, undo)
        })
    }

    /// The file is rewritten before the handle counts as rolled back, so a
    /// failed rewrite can be retried.
    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let records = &mut state.records;
        state.txns.rollback_with(handle, |undo| {
            let mut restored = records.clone();
            apply_undo(&mut restored, undo.to_vec());
            write_records(&self.path, &restored)?;
            *records = restored;
            Ok(())
        })
    }

    async fn is_transaction_active(&self, handle: TxnHandle) -> bool {
        self.state.lock().txns.is_active(handle)
    }

    async fn release_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        self.state.lock().txns.release(handle)
    }
}
