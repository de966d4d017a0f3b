//! Per-store propagation queues for eventually consistent writes.
//!
//! Updates are appended to a FIFO queue per target store and applied through
//! the single-record sync path when the queues are flushed. With fan-out on,
//! each applied update is then reconciled into every other registered store,
//! as a direct `update_item` would. In async mode a background tokio task
//! flushes whenever new updates arrive.

use crate::error::SyncError;
use crate::registry::StoreRegistry;
use crate::router::QueryCache;
use crate::sync::SyncEngine;
use log::{debug, error, info, warn};
use memsync_config::PropagationConfig;
use memsync_store::Record;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// A queue that stopped on a failing update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushFailure {
    pub store: String,
    pub id: String,
    pub error: String,
    /// Updates left queued for the store, the failed one included.
    pub remaining: usize,
}

/// An applied update that could not be reconciled into another store.
///
/// The update stays applied to its own store and is not retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutFailure {
    pub source: String,
    pub target: String,
    pub id: String,
    pub error: String,
}

/// Outcome of draining the queues once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Updates applied per store.
    pub applied: BTreeMap<String, usize>,
    pub failures: Vec<FlushFailure>,
    /// Fan-out writes per secondary store.
    #[serde(default)]
    pub propagated: BTreeMap<String, usize>,
    #[serde(default)]
    pub fan_out_failures: Vec<FanOutFailure>,
}

impl FlushReport {
    pub fn total_applied(&self) -> usize {
        self.applied.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.fan_out_failures.is_empty()
    }
}

/// Report of the latest pass and how many enqueued updates it covered.
#[derive(Debug, Clone, Default)]
struct PassOutcome {
    covered: u64,
    report: FlushReport,
}

#[derive(Default)]
struct Queues {
    by_store: BTreeMap<String, VecDeque<Record>>,
    /// Updates ever enqueued; a pass covers everything counted when it starts.
    enqueued: u64,
}

struct QueueShared {
    queues: Mutex<Queues>,
    /// Serializes passes so each store's updates apply in order.
    pass_lock: tokio::sync::Mutex<()>,
    notify: Notify,
    outcome: watch::Sender<PassOutcome>,
    stores: StoreRegistry,
    sync: Arc<SyncEngine>,
    fan_out: bool,
    cache: QueryCache,
}

impl QueueShared {
    async fn run_pass(&self) -> FlushReport {
        let _pass = self.pass_lock.lock().await;
        let (covered, drained) = {
            let mut queues = self.queues.lock();
            let drained: Vec<(String, VecDeque<Record>)> = queues
                .by_store
                .iter_mut()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(store, queue)| (store.clone(), std::mem::take(queue)))
                .collect();
            (queues.enqueued, drained)
        };

        let mut report = FlushReport::default();
        for (store, mut queue) in drained {
            let mut applied = 0;
            while let Some(record) = queue.pop_front() {
                let id = record.id.clone();
                let outcome = self.sync.apply_record(&store, "queue", record.clone()).await;
                if let Err(err) = outcome {
                    queue.push_front(record);
                    warn!(
                        "propagation stopped for store (store={}, id={}, remaining={}, error={})",
                        store,
                        id,
                        queue.len(),
                        err
                    );
                    report.failures.push(FlushFailure {
                        store: store.clone(),
                        id,
                        error: err.to_string(),
                        remaining: queue.len(),
                    });
                    self.requeue(&store, queue);
                    break;
                }
                applied += 1;
                if self.fan_out {
                    self.propagate(&store, record, &mut report).await;
                }
            }
            if applied > 0 {
                report.applied.insert(store, applied);
            }
        }
        if report.total_applied() > 0 {
            self.cache.clear();
        }

        debug!(
            "propagation pass finished (covered={}, applied={}, failures={})",
            covered,
            report.total_applied(),
            report.failures.len()
        );
        self.outcome.send_replace(PassOutcome {
            covered,
            report: report.clone(),
        });
        report
    }

    /// Reconcile an update applied to `source` into every other store.
    async fn propagate(&self, source: &str, record: Record, report: &mut FlushReport) {
        for target in self.stores.names() {
            if target == source {
                continue;
            }
            match self.sync.apply_record(&target, source, record.clone()).await {
                Ok(_) => *report.propagated.entry(target).or_default() += 1,
                Err(err) => {
                    warn!(
                        "fan-out failed (source={}, target={}, id={}, error={})",
                        source, target, record.id, err
                    );
                    report.fan_out_failures.push(FanOutFailure {
                        source: source.to_string(),
                        target,
                        id: record.id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    /// Put unapplied updates back ahead of anything enqueued meanwhile.
    fn requeue(&self, store: &str, mut left: VecDeque<Record>) {
        let mut queues = self.queues.lock();
        let queue = queues.by_store.entry(store.to_string()).or_default();
        left.append(queue);
        *queue = left;
    }
}

/// FIFO propagation queues keyed by target store.
pub struct PropagationQueue {
    stores: StoreRegistry,
    shared: Arc<QueueShared>,
    async_mode: bool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PropagationQueue {
    /// `cache` is cleared after every pass that applied something.
    pub fn new(
        stores: StoreRegistry,
        sync: Arc<SyncEngine>,
        config: &PropagationConfig,
        cache: QueryCache,
    ) -> Self {
        let (outcome, _) = watch::channel(PassOutcome::default());
        Self {
            stores: stores.clone(),
            shared: Arc::new(QueueShared {
                queues: Mutex::new(Queues::default()),
                pass_lock: tokio::sync::Mutex::new(()),
                notify: Notify::new(),
                outcome,
                stores,
                sync,
                fan_out: config.fan_out,
                cache,
            }),
            async_mode: config.async_mode,
            worker: Mutex::new(None),
        }
    }

    pub fn is_async(&self) -> bool {
        self.async_mode
    }

    /// Append `record` to the queue of `store`.
    ///
    /// In async mode this wakes the background worker, starting it on first
    /// use inside a tokio runtime.
    pub fn queue_update(&self, store: &str, record: Record) -> Result<(), SyncError> {
        if !self.stores.contains(store) {
            error!("cannot queue update for unknown store (store={})", store);
            return Err(SyncError::UnknownStore(store.to_string()));
        }
        {
            let mut queues = self.shared.queues.lock();
            queues
                .by_store
                .entry(store.to_string())
                .or_default()
                .push_back(record);
            queues.enqueued += 1;
        }
        if self.async_mode {
            self.ensure_worker();
            self.shared.notify.notify_one();
        }
        Ok(())
    }

    /// Drain every queue now.
    pub async fn flush_queue(&self) -> FlushReport {
        let report = self.shared.run_pass().await;
        info!(
            "flushed propagation queues (applied={}, failures={}, fan_out_failures={})",
            report.total_applied(),
            report.failures.len(),
            report.fan_out_failures.len()
        );
        report
    }

    /// Wait until a pass has covered every update enqueued before this call
    /// and return that pass's report. Without async mode this flushes inline.
    pub async fn wait_for_async(&self) -> Result<FlushReport, SyncError> {
        if !self.async_mode {
            return Ok(self.flush_queue().await);
        }
        let wanted = self.shared.queues.lock().enqueued;
        let mut outcome = self.shared.outcome.subscribe();
        if let Some(report) = covering(&mut outcome, wanted) {
            return Ok(report);
        }
        self.ensure_worker();
        self.shared.notify.notify_one();
        loop {
            outcome
                .changed()
                .await
                .map_err(|_| SyncError::WorkerStopped)?;
            if let Some(report) = covering(&mut outcome, wanted) {
                return Ok(report);
            }
        }
    }

    /// Queue depth per store; stores with empty queues are omitted.
    pub fn pending(&self) -> BTreeMap<String, usize> {
        self.shared
            .queues
            .lock()
            .by_store
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(store, queue)| (store.clone(), queue.len()))
            .collect()
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            debug!("no runtime; propagation worker deferred");
            return;
        };
        let shared = self.shared.clone();
        *worker = Some(runtime.spawn(async move {
            loop {
                shared.notify.notified().await;
                shared.run_pass().await;
            }
        }));
        debug!("propagation worker started");
    }
}

/// Report of the latest pass if it covers `wanted` updates.
fn covering(outcome: &mut watch::Receiver<PassOutcome>, wanted: u64) -> Option<FlushReport> {
    let latest = outcome.borrow_and_update();
    (latest.covered >= wanted).then(|| latest.report.clone())
}

impl Drop for PropagationQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsync_config::SyncConfig;
    use memsync_store::{KeyValueStore, RecordKind, StoreAdapter};
    use pretty_assertions::assert_eq;

    fn config(async_mode: bool, fan_out: bool) -> PropagationConfig {
        PropagationConfig {
            async_mode,
            fan_out,
        }
    }

    fn queue(async_mode: bool) -> (PropagationQueue, Arc<KeyValueStore>) {
        let stores = StoreRegistry::new();
        let lmdb = Arc::new(KeyValueStore::new("lmdb"));
        stores.register(lmdb.clone(), Vec::new());
        let sync = Arc::new(SyncEngine::new(stores.clone(), SyncConfig::default()));
        let queue = PropagationQueue::new(stores, sync, &config(async_mode, true), QueryCache::new());
        (queue, lmdb)
    }

    fn pair(fan_out: bool) -> (PropagationQueue, Arc<KeyValueStore>, Arc<KeyValueStore>) {
        let stores = StoreRegistry::new();
        let lmdb = Arc::new(KeyValueStore::new("lmdb"));
        let redis = Arc::new(KeyValueStore::new("redis"));
        stores.register(lmdb.clone(), Vec::new());
        stores.register(redis.clone(), Vec::new());
        let sync = Arc::new(SyncEngine::new(stores.clone(), SyncConfig::default()));
        let queue = PropagationQueue::new(stores, sync, &config(false, fan_out), QueryCache::new());
        (queue, lmdb, redis)
    }

    #[tokio::test]
    async fn flush_applies_in_order() {
        let (queue, lmdb) = queue(false);
        queue
            .queue_update("lmdb", Record::new("a", RecordKind::Code, "first"))
            .expect("queue");
        queue
            .queue_update("lmdb", Record::new("a", RecordKind::Code, "second"))
            .expect("queue");
        assert_eq!(queue.pending().get("lmdb"), Some(&2));
        assert!(lmdb.retrieve("a").await.expect("retrieve").is_none());

        let report = queue.flush_queue().await;
        assert_eq!(report.applied.get("lmdb"), Some(&2));
        assert!(report.is_clean());
        assert!(queue.pending().is_empty());
        let stored = lmdb.retrieve("a").await.expect("retrieve").expect("record");
        assert_eq!(stored.content, serde_json::json!("second"));
    }

    #[tokio::test]
    async fn failing_queue_does_not_block_others() {
        let stores = StoreRegistry::new();
        let lmdb = Arc::new(KeyValueStore::new("lmdb"));
        let redis = Arc::new(KeyValueStore::new("redis"));
        stores.register(lmdb.clone(), Vec::new());
        stores.register(redis, Vec::new());
        let sync = Arc::new(SyncEngine::new(stores.clone(), SyncConfig::default()));
        let queue = PropagationQueue::new(
            stores.clone(),
            sync,
            &config(false, false),
            QueryCache::new(),
        );

        queue
            .queue_update("redis", Record::new("r1", RecordKind::Code, "one"))
            .expect("queue");
        queue
            .queue_update("redis", Record::new("r2", RecordKind::Code, "two"))
            .expect("queue");
        queue
            .queue_update("lmdb", Record::new("l1", RecordKind::Code, "one"))
            .expect("queue");
        stores.unregister("redis").expect("unregister");

        let report = queue.flush_queue().await;
        assert_eq!(report.applied.get("lmdb"), Some(&1));
        assert_eq!(report.applied.get("redis"), None);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].store, "redis");
        assert_eq!(report.failures[0].id, "r1");
        assert_eq!(report.failures[0].remaining, 2);
        assert_eq!(queue.pending().get("redis"), Some(&2));
        assert!(lmdb.retrieve("l1").await.expect("retrieve").is_some());
    }

    #[tokio::test]
    async fn unknown_store_is_rejected() {
        let (queue, _lmdb) = queue(false);
        let err = queue
            .queue_update("kuzu", Record::new("a", RecordKind::Code, "x"))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownStore(name) if name == "kuzu"));
        assert!(queue.pending().is_empty());
    }

    #[tokio::test]
    async fn worker_delivers_before_wait_returns() {
        let (queue, lmdb) = queue(true);
        queue
            .queue_update("lmdb", Record::new("async1", RecordKind::Code, "later"))
            .expect("queue");
        let report = queue.wait_for_async().await.expect("wait");
        assert!(report.is_clean());
        assert!(lmdb.retrieve("async1").await.expect("retrieve").is_some());
    }

    #[tokio::test]
    async fn wait_without_updates_returns_immediately() {
        let (queue, _lmdb) = queue(true);
        let report = queue.wait_for_async().await.expect("wait");
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn flushed_updates_fan_out_to_other_stores() {
        let (queue, lmdb, redis) = pair(true);
        queue
            .queue_update("lmdb", Record::new("a", RecordKind::Code, "shared"))
            .expect("queue");
        let report = queue.flush_queue().await;
        assert!(report.is_clean());
        assert_eq!(report.applied.get("lmdb"), Some(&1));
        assert_eq!(report.propagated.get("redis"), Some(&1));
        assert!(lmdb.retrieve("a").await.expect("retrieve").is_some());
        let copied = redis.retrieve("a").await.expect("retrieve").expect("record");
        assert_eq!(copied.content, serde_json::json!("shared"));
    }

    #[tokio::test]
    async fn fan_out_off_keeps_updates_local() {
        let (queue, lmdb, redis) = pair(false);
        queue
            .queue_update("lmdb", Record::new("a", RecordKind::Code, "local"))
            .expect("queue");
        let report = queue.flush_queue().await;
        assert!(report.propagated.is_empty());
        assert!(lmdb.retrieve("a").await.expect("retrieve").is_some());
        assert!(redis.retrieve("a").await.expect("retrieve").is_none());
    }

    #[tokio::test]
    async fn applied_pass_clears_the_query_cache() {
        let stores = StoreRegistry::new();
        stores.register(Arc::new(KeyValueStore::new("lmdb")), Vec::new());
        let sync = Arc::new(SyncEngine::new(stores.clone(), SyncConfig::default()));
        let router = crate::router::QueryRouter::new(stores.clone(), Default::default());
        let queue = PropagationQueue::new(stores, sync, &config(false, true), router.cache().clone());

        router
            .route(crate::router::RouteRequest::Cross {
                kinds: Vec::new(),
                query: memsync_store::Query::all(),
            })
            .await
            .expect("route");
        assert_eq!(router.cache().len(), 1);
        queue
            .queue_update("lmdb", Record::new("a", RecordKind::Code, "x"))
            .expect("queue");
        queue.flush_queue().await;
        assert!(router.cache().is_empty());
    }
}
