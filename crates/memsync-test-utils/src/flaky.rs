use async_trait::async_trait;
use memsync_store::{
    Capabilities, Query, Record, SearchResult, StoreAdapter, StoreError, StoreRole, TxnHandle,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Adapter wrapper that injects failures and delays into another adapter.
pub struct FlakyStore {
    inner: Arc<dyn StoreAdapter>,
    fail_commit: AtomicBool,
    fail_store: AtomicBool,
    fail_ids: Mutex<HashSet<String>>,
    search_delay: Mutex<Option<Duration>>,
    no_rollback: AtomicBool,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl FlakyStore {
    pub fn wrap(inner: Arc<dyn StoreAdapter>) -> Self {
        Self {
            inner,
            fail_commit: AtomicBool::new(false),
            fail_store: AtomicBool::new(false),
            fail_ids: Mutex::new(HashSet::new()),
            search_delay: Mutex::new(None),
            no_rollback: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        }
    }

    /// Make every commit fail without reaching the wrapped adapter.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail.
    pub fn fail_stores(&self, fail: bool) {
        self.fail_store.store(fail, Ordering::SeqCst);
    }

    /// Make writes of one id fail.
    pub fn fail_store_for(&self, id: &str) {
        self.fail_ids.lock().insert(id.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_commits(false);
        self.fail_stores(false);
        self.fail_ids.lock().clear();
    }

    /// Sleep before answering searches.
    pub fn delay_search(&self, delay: Duration) {
        *self.search_delay.lock() = Some(delay);
    }

    /// Report no compensating rollback support.
    pub fn without_rollback(self) -> Self {
        self.no_rollback.store(true, Ordering::SeqCst);
        self
    }

    /// Commits forwarded to the wrapped adapter.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    fn check_write(&self, record: &Record) -> Result<(), StoreError> {
        if self.fail_store.load(Ordering::SeqCst) || self.fail_ids.lock().contains(&record.id) {
            return Err(StoreError::Backend(format!(
                "injected write failure for {}",
                record.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn role(&self) -> StoreRole {
        self.inner.role()
    }

    fn capabilities(&self) -> Capabilities {
        let mut capabilities = self.inner.capabilities();
        if self.no_rollback.load(Ordering::SeqCst) {
            capabilities.compensating_rollback = false;
        }
        capabilities
    }

    async fn store(&self, record: Record) -> Result<String, StoreError> {
        self.check_write(&record)?;
        self.inner.store(record).await
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, StoreError> {
        self.inner.retrieve(id).await
    }

    async fn search(&self, query: &Query) -> Result<Vec<SearchResult>, StoreError> {
        let delay = *self.search_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.search(query).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<Record>, StoreError> {
        self.inner.list().await
    }

    async fn begin_transaction(&self) -> Result<TxnHandle, StoreError> {
        self.inner.begin_transaction().await
    }

    async fn store_in_transaction(
        &self,
        handle: TxnHandle,
        record: Record,
    ) -> Result<String, StoreError> {
        self.check_write(&record)?;
        self.inner.store_in_transaction(handle, record).await
    }

    async fn retrieve_in_transaction(
        &self,
        handle: TxnHandle,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.inner.retrieve_in_transaction(handle, id).await
    }

    async fn commit_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(StoreError::CommitFailed {
                store: self.name().to_string(),
                reason: "injected commit failure".to_string(),
            });
        }
        self.inner.commit_transaction(handle).await?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback_transaction(handle).await
    }

    async fn is_transaction_active(&self, handle: TxnHandle) -> bool {
        self.inner.is_transaction_active(handle).await
    }

    async fn release_transaction(&self, handle: TxnHandle) -> Result<(), StoreError> {
        self.inner.release_transaction(handle).await
    }

    async fn related(&self, id: &str) -> Result<Vec<Record>, StoreError> {
        self.inner.related(id).await
    }
}
