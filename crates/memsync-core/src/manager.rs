//! The memory manager: one entry point over every registered store.

use crate::builder::build_store;
use crate::error::SyncError;
use crate::queue::{FlushReport, PropagationQueue};
use crate::registry::StoreRegistry;
use crate::router::{QueryRouter, RouteRequest, RouteResponse};
use crate::sync::{ApplyOutcome, ConflictRecord, DirectionReport, SyncEngine, SyncReport, SyncStats};
use crate::transaction::{TransactionCoordinator, TransactionScope};
use log::{debug, info};
use memsync_config::MemsyncConfig;
use memsync_store::model::PHASE_KEY;
use memsync_store::{
    Query, Record, RecordKind, SearchResult, StoreAdapter, StoreRole, WorkflowPhase,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

/// Registry of named stores plus the coordinator, sync engine, propagation
/// queue and router that operate on them.
pub struct MemoryManager {
    config: MemsyncConfig,
    stores: StoreRegistry,
    coordinator: TransactionCoordinator,
    sync: Arc<SyncEngine>,
    queue: PropagationQueue,
    router: QueryRouter,
}

impl MemoryManager {
    /// Manager with no stores registered.
    pub fn new(config: MemsyncConfig) -> Self {
        let stores = StoreRegistry::new();
        let sync = Arc::new(SyncEngine::new(stores.clone(), config.sync.clone()));
        let coordinator = TransactionCoordinator::new(stores.clone(), sync.clone());
        let router = QueryRouter::new(stores.clone(), config.router.clone());
        let queue = PropagationQueue::new(
            stores.clone(),
            sync.clone(),
            &config.propagation,
            router.cache().clone(),
        );
        Self {
            config,
            stores,
            coordinator,
            sync,
            queue,
            router,
        }
    }

    /// Validate `config` and register a bundled adapter for each store entry.
    pub fn from_config(config: MemsyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let manager = Self::new(config);
        for store in &manager.config.stores {
            let adapter = build_store(store)?;
            manager.stores.register(adapter, store.kinds.clone());
        }
        info!(
            "memory manager ready (stores={}, default_store={}, async_mode={})",
            manager.config.stores.len(),
            manager.config.registry.default_store,
            manager.queue.is_async()
        );
        Ok(manager)
    }

    pub fn config(&self) -> &MemsyncConfig {
        &self.config
    }

    /// Shared store map.
    pub fn registry(&self) -> &StoreRegistry {
        &self.stores
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn queue(&self) -> &PropagationQueue {
        &self.queue
    }

    pub fn router(&self) -> &QueryRouter {
        &self.router
    }

    /// Register `adapter`, taking its relevant kinds from the config entry
    /// of the same name.
    pub fn register(&self, adapter: Arc<dyn StoreAdapter>) -> Option<Arc<dyn StoreAdapter>> {
        let kinds = self
            .config
            .store(adapter.name())
            .map(|store| store.kinds.clone())
            .unwrap_or_default();
        self.clear_cache();
        self.stores.register(adapter, kinds)
    }

    pub fn register_with_kinds(
        &self,
        adapter: Arc<dyn StoreAdapter>,
        kinds: Vec<RecordKind>,
    ) -> Option<Arc<dyn StoreAdapter>> {
        self.clear_cache();
        self.stores.register(adapter, kinds)
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn StoreAdapter>, SyncError> {
        self.clear_cache();
        self.stores.unregister(name)
    }

    pub fn adapter(&self, name: &str) -> Result<Arc<dyn StoreAdapter>, SyncError> {
        self.stores.get(name)
    }

    pub fn store_names(&self) -> Vec<String> {
        self.stores.names()
    }

    pub async fn store(&self, store: &str, record: Record) -> Result<String, SyncError> {
        let adapter = self.stores.get(store)?;
        let stored = adapter.store(record).await;
        self.clear_cache();
        Ok(stored?)
    }

    pub async fn retrieve(&self, store: &str, id: &str) -> Result<Option<Record>, SyncError> {
        Ok(self.stores.get(store)?.retrieve(id).await?)
    }

    pub async fn delete(&self, store: &str, id: &str) -> Result<bool, SyncError> {
        let adapter = self.stores.get(store)?;
        let deleted = adapter.delete(id).await;
        self.clear_cache();
        Ok(deleted?)
    }

    pub async fn search(&self, store: &str, query: &Query) -> Result<Vec<SearchResult>, SyncError> {
        Ok(self.stores.get(store)?.search(query).await?)
    }

    /// Tag `record` with `phase` and write it to the default store.
    pub async fn store_with_phase(
        &self,
        mut record: Record,
        phase: WorkflowPhase,
    ) -> Result<String, SyncError> {
        record
            .metadata
            .insert(PHASE_KEY.to_string(), Value::from(phase.as_str()));
        let store = self.config.registry.default_store.as_str();
        debug!(
            "storing phase-tagged record (store={}, id={}, phase={})",
            store, record.id, phase
        );
        self.store(store, record).await
    }

    /// First copy of `id` tagged with `phase`, looking in the default store
    /// before the others.
    pub async fn retrieve_with_phase(
        &self,
        id: &str,
        phase: WorkflowPhase,
    ) -> Result<Option<Record>, SyncError> {
        for adapter in self.default_first() {
            if let Some(record) = adapter.retrieve(id).await? {
                if record.phase() == Some(phase) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Records of `kind` from every store relevant to it, grouped by store.
    pub async fn query_by_kind(
        &self,
        kind: RecordKind,
    ) -> Result<BTreeMap<String, Vec<SearchResult>>, SyncError> {
        self.cross(vec![kind], Query::by_kind(kind)).await
    }

    /// Records matching every metadata filter, grouped by store.
    pub async fn query_by_metadata(
        &self,
        filter: BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, Vec<SearchResult>>, SyncError> {
        let query = Query {
            metadata: filter,
            ..Query::default()
        };
        self.cross(Vec::new(), query).await
    }

    /// Records tagged with `phase` across every store, de-duplicated by id.
    pub async fn query_by_phase(&self, phase: WorkflowPhase) -> Result<Vec<SearchResult>, SyncError> {
        let query = Query::all()
            .with_metadata(PHASE_KEY, phase.as_str())
            .with_limit(usize::MAX);
        Ok(self
            .router
            .route(RouteRequest::Federated { query })
            .await?
            .into_results())
    }

    /// `id` and its graph-related records, ordered by workflow phase.
    ///
    /// Untagged records sort after tagged ones.
    pub async fn query_evolution(&self, id: &str) -> Result<Vec<Record>, SyncError> {
        let mut records: BTreeMap<String, Record> = BTreeMap::new();
        for adapter in self.default_first() {
            if let Some(record) = adapter.retrieve(id).await? {
                records.insert(record.id.clone(), record);
                break;
            }
        }
        for adapter in self.stores.adapters() {
            if adapter.role() != StoreRole::Graph {
                continue;
            }
            for record in adapter.related(id).await? {
                records.entry(record.id.clone()).or_insert(record);
            }
        }
        let mut ordered: Vec<Record> = records.into_values().collect();
        ordered.sort_by(|left, right| {
            (left.phase().is_none(), left.phase(), left.created_at, &left.id).cmp(&(
                right.phase().is_none(),
                right.phase(),
                right.created_at,
                &right.id,
            ))
        });
        Ok(ordered)
    }

    /// Write `record` to `store`, then reconcile it into every other store.
    pub async fn update_item(
        &self,
        store: &str,
        record: Record,
    ) -> Result<BTreeMap<String, ApplyOutcome>, SyncError> {
        self.store(store, record.clone()).await?;
        let mut outcomes = BTreeMap::new();
        for name in self.stores.names() {
            if name == store {
                continue;
            }
            let outcome = self.sync.apply_record(&name, store, record.clone()).await;
            self.clear_cache();
            outcomes.insert(name, outcome?);
        }
        info!(
            "propagated update (store={}, id={}, targets={})",
            store,
            record.id,
            outcomes.len()
        );
        Ok(outcomes)
    }

    /// See [`TransactionCoordinator::with_transaction`].
    pub async fn with_transaction<F, Fut, T, E>(&self, stores: &[&str], body: F) -> Result<T, E>
    where
        F: FnOnce(TransactionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SyncError>,
    {
        let outcome = self.coordinator.with_transaction(stores, body).await;
        self.clear_cache();
        outcome
    }

    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> Result<SyncReport, SyncError> {
        let report = self.sync.synchronize(source, target, bidirectional).await;
        self.clear_cache();
        report
    }

    pub async fn synchronize_core(&self) -> Result<BTreeMap<String, DirectionReport>, SyncError> {
        let reports = self.sync.synchronize_core().await;
        self.clear_cache();
        reports
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.sync.conflict_log()
    }

    pub fn queue_update(&self, store: &str, record: Record) -> Result<(), SyncError> {
        self.queue.queue_update(store, record)?;
        self.clear_cache();
        Ok(())
    }

    pub async fn flush_queue(&self) -> FlushReport {
        self.queue.flush_queue().await
    }

    pub async fn wait_for_async(&self) -> Result<FlushReport, SyncError> {
        self.queue.wait_for_async().await
    }

    pub fn pending(&self) -> BTreeMap<String, usize> {
        self.queue.pending()
    }

    pub async fn route_query(&self, request: RouteRequest) -> Result<RouteResponse, SyncError> {
        self.router.route(request).await
    }

    /// Drop every cached cross-store result.
    pub fn clear_cache(&self) {
        self.router.cache().clear();
    }

    /// Number of cached cross-store queries.
    pub fn cache_size(&self) -> usize {
        self.router.cache().len()
    }

    async fn cross(
        &self,
        kinds: Vec<RecordKind>,
        query: Query,
    ) -> Result<BTreeMap<String, Vec<SearchResult>>, SyncError> {
        match self.router.route(RouteRequest::Cross { kinds, query }).await? {
            RouteResponse::Grouped(groups) => Ok(groups),
            other => {
                let mut groups: BTreeMap<String, Vec<SearchResult>> = BTreeMap::new();
                for result in other.into_results() {
                    groups.entry(result.source.clone()).or_default().push(result);
                }
                Ok(groups)
            }
        }
    }

    /// Adapters with the default store first, then the rest by name.
    fn default_first(&self) -> Vec<Arc<dyn StoreAdapter>> {
        let default = self.config.registry.default_store.as_str();
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        if let Ok(adapter) = self.stores.get(default) {
            seen.insert(default.to_string());
            ordered.push(adapter);
        }
        for adapter in self.stores.adapters() {
            if seen.insert(adapter.name().to_string()) {
                ordered.push(adapter);
            }
        }
        ordered
    }
}
