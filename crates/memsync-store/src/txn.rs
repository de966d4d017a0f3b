//! Write-ahead transaction buffer for backends without native transactions.
//!
//! Each handle moves through `Open -> Committed | RolledBack`. Writes are
//! staged while open and applied in one step on commit. A committed handle
//! keeps the prior value of every id it touched so that a later rollback can
//! compensate the commit; [`TxnTable::release`] drops that log. Closed
//! handles that are never released are evicted oldest first once more than
//! [`RETAINED_CLOSED_HANDLES`] accumulate.

use crate::adapter::TxnHandle;
use crate::error::StoreError;
use crate::model::{Record, RecordKind};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

/// Closed handles kept for compensation or release before eviction.
pub const RETAINED_CLOSED_HANDLES: usize = 64;

/// Committed records keyed by id.
pub type RecordMap = BTreeMap<String, Record>;

/// State of one transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    RolledBack,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TxnState::Open => "open",
            TxnState::Committed => "committed",
            TxnState::RolledBack => "rolled back",
        };
        f.write_str(label)
    }
}

/// Value an id held before a commit touched it.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    pub id: String,
    pub prior: Option<Record>,
}

#[derive(Debug)]
struct TxnEntry<U> {
    state: TxnState,
    writes: Vec<Record>,
    undo: Vec<U>,
}

/// Handle table with a single active writer.
///
/// `U` is the compensation entry recorded on commit; backends that keep more
/// than a record map (such as version history) supply their own.
#[derive(Debug)]
pub struct TxnTable<U = UndoEntry> {
    store: String,
    entries: HashMap<TxnHandle, TxnEntry<U>>,
    active: Option<TxnHandle>,
    /// Committed or rolled-back handles, oldest first.
    closed: VecDeque<TxnHandle>,
}

impl<U> TxnTable<U> {
    pub fn new(store: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            entries: HashMap::new(),
            active: None,
            closed: VecDeque::new(),
        }
    }

    /// Open a new handle. Fails with `TransactionBusy` while another handle is open.
    pub fn begin(&mut self) -> Result<TxnHandle, StoreError> {
        if self.active.is_some() {
            return Err(StoreError::TransactionBusy {
                store: self.store.clone(),
            });
        }
        let handle = TxnHandle::new();
        self.entries.insert(
            handle,
            TxnEntry {
                state: TxnState::Open,
                writes: Vec::new(),
                undo: Vec::new(),
            },
        );
        self.active = Some(handle);
        Ok(handle)
    }

    /// Buffer a write. The kind rule is checked against earlier staged writes
    /// and the committed view.
    pub fn stage(
        &mut self,
        handle: TxnHandle,
        record: Record,
        committed: &RecordMap,
    ) -> Result<String, StoreError> {
        let entry = self.open_entry(handle)?;
        let existing = entry
            .writes
            .iter()
            .rev()
            .find(|staged| staged.id == record.id)
            .or_else(|| committed.get(&record.id));
        check_kind(existing, &record)?;
        let id = record.id.clone();
        entry.writes.push(record);
        Ok(id)
    }

    /// Latest staged write for `id`, if this handle wrote one.
    pub fn staged(&mut self, handle: TxnHandle, id: &str) -> Result<Option<Record>, StoreError> {
        let entry = self.open_entry(handle)?;
        Ok(entry
            .writes
            .iter()
            .rev()
            .find(|staged| staged.id == id)
            .cloned())
    }

    /// Apply the staged writes through `apply` and mark the handle committed.
    ///
    /// When `apply` fails nothing has been applied, so the handle is marked
    /// rolled back and the error returned.
    pub fn commit<F>(&mut self, handle: TxnHandle, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(Vec<Record>) -> Result<Vec<U>, StoreError>,
    {
        let entry = self.open_entry(handle)?;
        let writes = std::mem::take(&mut entry.writes);
        let outcome = match apply(writes) {
            Ok(undo) => {
                entry.state = TxnState::Committed;
                entry.undo = undo;
                Ok(())
            }
            Err(err) => {
                entry.state = TxnState::RolledBack;
                Err(err)
            }
        };
        self.active = None;
        self.close(handle);
        outcome
    }

    /// Roll a handle back. Returns the undo log when a committed handle must be
    /// compensated; rolling back twice is a no-op.
    pub fn rollback(&mut self, handle: TxnHandle) -> Result<Option<Vec<U>>, StoreError> {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or_else(|| StoreError::UnknownTransaction {
                store: self.store.clone(),
                handle,
            })?;
        let undo = match entry.state {
            TxnState::Open => {
                entry.writes.clear();
                None
            }
            TxnState::Committed => Some(std::mem::take(&mut entry.undo)),
            TxnState::RolledBack => return Ok(None),
        };
        entry.state = TxnState::RolledBack;
        self.finish_rollback(handle);
        Ok(undo)
    }

    /// Roll a handle back, marking it rolled back only once `compensate`
    /// has undone a commit. A failed compensation leaves the handle committed
    /// so the rollback can be retried.
    pub fn rollback_with<F>(&mut self, handle: TxnHandle, compensate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&[U]) -> Result<(), StoreError>,
    {
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or_else(|| StoreError::UnknownTransaction {
                store: self.store.clone(),
                handle,
            })?;
        match entry.state {
            TxnState::Open => entry.writes.clear(),
            TxnState::Committed => {
                compensate(&entry.undo)?;
                entry.undo.clear();
            }
            TxnState::RolledBack => return Ok(()),
        }
        entry.state = TxnState::RolledBack;
        self.finish_rollback(handle);
        Ok(())
    }

    /// Forget a handle. An open handle is discarded.
    pub fn release(&mut self, handle: TxnHandle) -> Result<(), StoreError> {
        if self.entries.remove(&handle).is_none() {
            return Err(StoreError::UnknownTransaction {
                store: self.store.clone(),
                handle,
            });
        }
        if self.active == Some(handle) {
            self.active = None;
        }
        self.closed.retain(|closed| *closed != handle);
        Ok(())
    }

    /// Handles still tracked, open or closed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, handle: TxnHandle) -> Option<TxnState> {
        self.entries.get(&handle).map(|entry| entry.state)
    }

    pub fn is_active(&self, handle: TxnHandle) -> bool {
        self.state(handle) == Some(TxnState::Open)
    }

    fn finish_rollback(&mut self, handle: TxnHandle) {
        if self.active == Some(handle) {
            self.active = None;
            self.close(handle);
        }
    }

    /// Track a newly closed handle, evicting the oldest beyond the limit.
    fn close(&mut self, handle: TxnHandle) {
        self.closed.push_back(handle);
        while self.closed.len() > RETAINED_CLOSED_HANDLES {
            if let Some(evicted) = self.closed.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn open_entry(&mut self, handle: TxnHandle) -> Result<&mut TxnEntry<U>, StoreError> {
        let store = &self.store;
        let entry = self
            .entries
            .get_mut(&handle)
            .ok_or_else(|| StoreError::UnknownTransaction {
                store: store.clone(),
                handle,
            })?;
        if entry.state != TxnState::Open {
            return Err(StoreError::TransactionClosed {
                store: store.clone(),
                handle,
                state: entry.state,
            });
        }
        Ok(entry)
    }
}

/// Reject a write that would change the kind of an existing record.
pub fn check_kind(existing: Option<&Record>, incoming: &Record) -> Result<(), StoreError> {
    match existing {
        Some(existing) if existing.kind != incoming.kind => Err(StoreError::ImmutableKind {
            id: incoming.id.clone(),
            existing: existing.kind,
            attempted: incoming.kind,
        }),
        _ => Ok(()),
    }
}

/// Check a batch of writes against the committed view and each other.
pub fn check_batch(writes: &[Record], committed: &RecordMap) -> Result<(), StoreError> {
    let mut kinds: HashMap<&str, RecordKind> = HashMap::new();
    for write in writes {
        let known = kinds
            .get(write.id.as_str())
            .copied()
            .or_else(|| committed.get(&write.id).map(|record| record.kind));
        if let Some(kind) = known {
            if kind != write.kind {
                return Err(StoreError::ImmutableKind {
                    id: write.id.clone(),
                    existing: kind,
                    attempted: write.kind,
                });
            }
        }
        kinds.insert(write.id.as_str(), write.kind);
    }
    Ok(())
}

/// Validate every write, then apply them in order.
///
/// Returns the first prior value of each touched id.
pub fn apply_writes(
    records: &mut RecordMap,
    writes: Vec<Record>,
) -> Result<Vec<UndoEntry>, StoreError> {
    check_batch(&writes, records)?;

    let mut undo: Vec<UndoEntry> = Vec::new();
    for write in writes {
        let prior = records.insert(write.id.clone(), write.clone());
        if !undo.iter().any(|entry| entry.id == write.id) {
            undo.push(UndoEntry {
                id: write.id,
                prior,
            });
        }
    }
    Ok(undo)
}

/// Restore prior values, newest first.
pub fn apply_undo(records: &mut RecordMap, undo: Vec<UndoEntry>) {
    for entry in undo.into_iter().rev() {
        match entry.prior {
            Some(prior) => {
                records.insert(entry.id, prior);
            }
            None => {
                records.remove(&entry.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        RETAINED_CLOSED_HANDLES, RecordMap, TxnState, TxnTable, UndoEntry, apply_undo,
        apply_writes,
    };
    use crate::error::StoreError;
    use crate::model::{Record, RecordKind};
    use pretty_assertions::assert_eq;

    fn record(id: &str, content: &str) -> Record {
        Record::new(id, RecordKind::LongTerm, content)
    }

    #[test]
    fn second_writer_is_busy_until_first_finishes() {
        let mut table: TxnTable = TxnTable::new("kv");
        let first = table.begin().expect("begin");
        let err = table.begin().expect_err("busy");
        assert!(err.is_retryable());

        let mut records = RecordMap::new();
        table
            .commit(first, |writes| apply_writes(&mut records, writes))
            .expect("commit");
        assert_eq!(table.state(first), Some(TxnState::Committed));
        table.begin().expect("begin after commit");
    }

    #[test]
    fn staged_writes_are_visible_only_through_handle() {
        let mut table: TxnTable = TxnTable::new("kv");
        let records = RecordMap::new();
        let handle = table.begin().expect("begin");
        table
            .stage(handle, record("a", "alpha"), &records)
            .expect("stage");
        assert_eq!(
            table.staged(handle, "a").expect("staged").map(|r| r.content),
            Some("alpha".into())
        );
        assert!(records.is_empty());
    }

    #[test]
    fn committed_handle_rolls_back_by_compensation() {
        let mut table: TxnTable = TxnTable::new("kv");
        let mut records = RecordMap::new();
        records.insert("a".to_string(), record("a", "before"));

        let handle = table.begin().expect("begin");
        table
            .stage(handle, record("a", "after"), &records)
            .expect("stage");
        table
            .stage(handle, record("b", "new"), &records)
            .expect("stage");
        table
            .commit(handle, |writes| apply_writes(&mut records, writes))
            .expect("commit");
        assert_eq!(records.len(), 2);

        let undo = table.rollback(handle).expect("rollback").expect("undo log");
        apply_undo(&mut records, undo);
        assert_eq!(records.len(), 1);
        assert_eq!(records["a"].content, "before");
        assert_eq!(table.rollback(handle).expect("idempotent"), None);
    }

    #[test]
    fn closed_handle_rejects_writes() {
        let mut table: TxnTable = TxnTable::new("kv");
        let records = RecordMap::new();
        let handle = table.begin().expect("begin");
        table.rollback(handle).expect("rollback");
        let err = table
            .stage(handle, record("a", "alpha"), &records)
            .expect_err("closed");
        assert!(matches!(
            err,
            StoreError::TransactionClosed {
                state: TxnState::RolledBack,
                ..
            }
        ));
        table.release(handle).expect("release");
        assert!(matches!(
            table.release(handle),
            Err(StoreError::UnknownTransaction { .. })
        ));
    }

    #[test]
    fn kind_change_is_rejected_before_anything_applies() {
        let mut records = RecordMap::new();
        let writes = vec![
            record("a", "alpha"),
            Record::new("a", RecordKind::Code, "alpha"),
        ];
        let err = apply_writes(&mut records, writes).expect_err("kind change");
        assert!(matches!(err, StoreError::ImmutableKind { .. }));
        assert!(records.is_empty());
    }

    #[test]
    fn unreleased_handles_are_evicted_oldest_first() {
        let mut table: TxnTable = TxnTable::new("kv");
        let mut records = RecordMap::new();
        let mut handles = Vec::new();
        for step in 0..1000 {
            let handle = table.begin().expect("begin");
            table
                .stage(handle, record("a", &format!("v{step}")), &records)
                .expect("stage");
            table
                .commit(handle, |writes| apply_writes(&mut records, writes))
                .expect("commit");
            handles.push(handle);
        }
        assert_eq!(table.len(), RETAINED_CLOSED_HANDLES);
        assert_eq!(table.state(handles[0]), None);
        assert_eq!(table.state(handles[999]), Some(TxnState::Committed));

        table.release(handles[999]).expect("release");
        assert_eq!(table.len(), RETAINED_CLOSED_HANDLES - 1);
    }

    #[test]
    fn failed_compensation_keeps_handle_committed() {
        let mut table: TxnTable = TxnTable::new("kv");
        let mut records = RecordMap::new();
        let handle = table.begin().expect("begin");
        table
            .stage(handle, record("a", "alpha"), &records)
            .expect("stage");
        table
            .commit(handle, |writes| apply_writes(&mut records, writes))
            .expect("commit");

        let err = table
            .rollback_with(handle, |_undo: &[UndoEntry]| {
                Err(StoreError::Backend("disk full".to_string()))
            })
            .expect_err("compensation fails");
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(table.state(handle), Some(TxnState::Committed));

        let mut undone = 0;
        table
            .rollback_with(handle, |undo| {
                undone = undo.len();
                Ok(())
            })
            .expect("retry");
        assert_eq!(undone, 1);
        assert_eq!(table.state(handle), Some(TxnState::RolledBack));
    }
}
