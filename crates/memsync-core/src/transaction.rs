//! Coordinated transactions across several stores.
//!
//! A coordinator transaction begins one handle per participating store,
//! runs the caller's body against a [`TransactionScope`], then commits every
//! handle in the listed order. If any commit fails, the participants that
//! already committed are undone through their compensating rollback. This is
//! a best-effort coordinated commit for local stores, not two-phase commit.
//!
//! A transaction whose future is dropped before it finishes is rolled back
//! and its handles released, so cancellation never leaves a store busy.

use crate::error::SyncError;
use crate::registry::StoreRegistry;
use crate::sync::{SyncEngine, SyncReport};
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use memsync_store::{Record, StoreAdapter, TxnHandle};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use uuid::Uuid;

/// One store taking part in a coordinator transaction.
#[derive(Clone)]
struct Participant {
    name: String,
    adapter: Arc<dyn StoreAdapter>,
    handle: TxnHandle,
}

/// Begun handles that are rolled back and released on drop unless disarmed.
struct AbandonGuard {
    id: Uuid,
    participants: Vec<Participant>,
    armed: bool,
}

impl AbandonGuard {
    fn new(id: Uuid) -> Self {
        Self {
            id,
            participants: Vec::new(),
            armed: true,
        }
    }

    /// Roll back and release every participant, then disarm.
    async fn abort(&mut self) {
        rollback_all(&self.participants).await;
        release_all(&self.participants).await;
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed || self.participants.is_empty() {
            return;
        }
        let participants = std::mem::take(&mut self.participants);
        warn!(
            "transaction abandoned; rolling back (txn={}, stores={})",
            self.id,
            participants.len()
        );
        let cleanup = async move {
            rollback_all(&participants).await;
            release_all(&participants).await;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(cleanup);
            }
            Err(_) => {
                if cleanup.now_or_never().is_none() {
                    error!("abandoned transaction left handles open (txn={})", self.id);
                }
            }
        }
    }
}

struct ScopeInner {
    id: Uuid,
    participants: Vec<Participant>,
    /// Records written through the scope, per store, for overlaying scans.
    written: Mutex<BTreeMap<String, BTreeMap<String, Record>>>,
    sync: Arc<SyncEngine>,
}

/// Handle passed to a transaction body. Clones share the same transaction.
#[derive(Clone)]
pub struct TransactionScope {
    inner: Arc<ScopeInner>,
}

impl TransactionScope {
    /// Coordinator transaction id.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Participating store names in commit order.
    pub fn stores(&self) -> Vec<&str> {
        self.inner
            .participants
            .iter()
            .map(|participant| participant.name.as_str())
            .collect()
    }

    /// Adapter handle for `store`, if it participates.
    pub fn handle(&self, store: &str) -> Option<TxnHandle> {
        self.participant(store)
            .ok()
            .map(|participant| participant.handle)
    }

    pub fn includes(&self, store: &str) -> bool {
        self.participant(store).is_ok()
    }

    /// Stage a write on `store`. It becomes visible when the scope commits.
    pub async fn store(&self, store: &str, record: Record) -> Result<String, SyncError> {
        let participant = self.participant(store)?;
        let staged = record.clone();
        let id = participant
            .adapter
            .store_in_transaction(participant.handle, record)
            .await?;
        self.inner
            .written
            .lock()
            .entry(store.to_string())
            .or_default()
            .insert(id.clone(), staged);
        Ok(id)
    }

    /// Read through the transaction, seeing writes staged in it.
    pub async fn retrieve(&self, store: &str, id: &str) -> Result<Option<Record>, SyncError> {
        let participant = self.participant(store)?;
        Ok(participant
            .adapter
            .retrieve_in_transaction(participant.handle, id)
            .await?)
    }

    /// Committed records of `store` overlaid with the writes staged here.
    pub async fn list(&self, store: &str) -> Result<Vec<Record>, SyncError> {
        let participant = self.participant(store)?;
        let mut records: BTreeMap<String, Record> = participant
            .adapter
            .list()
            .await?
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        if let Some(staged) = self.inner.written.lock().get(store) {
            for (id, record) in staged {
                records.insert(id.clone(), record.clone());
            }
        }
        Ok(records.into_values().collect())
    }

    /// Synchronize inside the transaction; the writes commit or roll back
    /// with the scope.
    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> Result<SyncReport, SyncError> {
        let sync = self.inner.sync.clone();
        sync.synchronize_in(self, source, target, bidirectional)
            .await
    }

    fn participant(&self, store: &str) -> Result<&Participant, SyncError> {
        self.inner
            .participants
            .iter()
            .find(|participant| participant.name == store)
            .ok_or_else(|| SyncError::NotInTransaction(store.to_string()))
    }
}

/// Runs bodies under coordinated transactions.
pub struct TransactionCoordinator {
    stores: StoreRegistry,
    sync: Arc<SyncEngine>,
}

impl TransactionCoordinator {
    pub fn new(stores: StoreRegistry, sync: Arc<SyncEngine>) -> Self {
        Self { stores, sync }
    }

    /// Run `body` with writes to `store_names` staged under one transaction.
    ///
    /// On `Ok` every store commits in listed order. If a commit fails, every
    /// participant is rolled back and [`SyncError::TransactionCommit`] is
    /// returned. On `Err` every participant is rolled back and the body's
    /// error is returned unchanged.
    ///
    /// Dropping the returned future before it completes rolls back and
    /// releases every begun handle.
    pub async fn with_transaction<F, Fut, T, E>(&self, store_names: &[&str], body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SyncError>,
    {
        let (scope, mut guard) = self.begin(store_names).await?;
        match body(scope.clone()).await {
            Ok(value) => {
                self.commit(&scope, &mut guard).await?;
                Ok(value)
            }
            Err(err) => {
                warn!(
                    "transaction body failed; rolling back (txn={}, stores={:?})",
                    scope.id(),
                    scope.stores()
                );
                guard.abort().await;
                Err(err)
            }
        }
    }

    async fn begin(
        &self,
        store_names: &[&str],
    ) -> Result<(TransactionScope, AbandonGuard), SyncError> {
        let mut names: Vec<&str> = Vec::with_capacity(store_names.len());
        for &name in store_names {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut adapters = Vec::with_capacity(names.len());
        for name in &names {
            let adapter = self.stores.get(name)?;
            if !adapter.capabilities().compensating_rollback {
                error!("store cannot join a transaction (store={})", name);
                return Err(SyncError::NonTransactional(name.to_string()));
            }
            adapters.push((name.to_string(), adapter));
        }

        let id = Uuid::new_v4();
        let mut guard = AbandonGuard::new(id);
        for (name, adapter) in adapters {
            match adapter.begin_transaction().await {
                Ok(handle) => guard.participants.push(Participant {
                    name,
                    adapter,
                    handle,
                }),
                Err(err) => {
                    warn!(
                        "begin failed; rolling back started handles (txn={}, store={}, error={})",
                        id, name, err
                    );
                    guard.abort().await;
                    return Err(err.into());
                }
            }
        }
        debug!("transaction started (txn={}, stores={:?})", id, names);

        let scope = TransactionScope {
            inner: Arc::new(ScopeInner {
                id,
                participants: guard.participants.clone(),
                written: Mutex::new(BTreeMap::new()),
                sync: self.sync.clone(),
            }),
        };
        Ok((scope, guard))
    }

    async fn commit(
        &self,
        scope: &TransactionScope,
        guard: &mut AbandonGuard,
    ) -> Result<(), SyncError> {
        let participants = &scope.inner.participants;
        for participant in participants {
            if let Err(source) = participant
                .adapter
                .commit_transaction(participant.handle)
                .await
            {
                error!(
                    "commit failed; rolling back every participant (txn={}, store={}, error={})",
                    scope.id(),
                    participant.name,
                    source
                );
                guard.abort().await;
                return Err(SyncError::TransactionCommit {
                    store: participant.name.clone(),
                    source,
                });
            }
        }
        release_all(participants).await;
        guard.armed = false;
        info!(
            "transaction committed (txn={}, stores={:?})",
            scope.id(),
            scope.stores()
        );
        Ok(())
    }
}

/// Roll back in reverse order. Failures are logged; the caller is already
/// returning the error that triggered the rollback.
async fn rollback_all(participants: &[Participant]) {
    for participant in participants.iter().rev() {
        if let Err(err) = participant
            .adapter
            .rollback_transaction(participant.handle)
            .await
        {
            error!(
                "rollback failed (store={}, handle={}, error={})",
                participant.name, participant.handle, err
            );
        }
    }
}

async fn release_all(participants: &[Participant]) {
    for participant in participants {
        if let Err(err) = participant
            .adapter
            .release_transaction(participant.handle)
            .await
        {
            warn!(
                "release failed (store={}, handle={}, error={})",
                participant.name, participant.handle, err
            );
        }
    }
}
