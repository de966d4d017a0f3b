//! Query routing across registered stores.

use crate::error::SyncError;
use crate::registry::StoreRegistry;
use futures_util::future::join_all;
use log::{debug, warn};
use memsync_config::RouterConfig;
use memsync_store::query::rank;
use memsync_store::{Metadata, Query, RecordKind, SearchResult, StoreAdapter};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Routing strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStrategy {
    Direct,
    Cross,
    Cascading,
    Federated,
    ContextAware,
}

impl QueryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStrategy::Direct => "direct",
            QueryStrategy::Cross => "cross",
            QueryStrategy::Cascading => "cascading",
            QueryStrategy::Federated => "federated",
            QueryStrategy::ContextAware => "context_aware",
        }
    }
}

impl fmt::Display for QueryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueryStrategy {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "direct" => Ok(QueryStrategy::Direct),
            "cross" => Ok(QueryStrategy::Cross),
            "cascading" => Ok(QueryStrategy::Cascading),
            "federated" => Ok(QueryStrategy::Federated),
            "context_aware" => Ok(QueryStrategy::ContextAware),
            other => Err(SyncError::UnsupportedQuery {
                store: "router".to_string(),
                reason: format!("unknown strategy: {other}"),
            }),
        }
    }
}

/// A query and the strategy to answer it with.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteRequest {
    /// One store, results as-is.
    Direct { store: String, query: Query },
    /// Every store relevant to `kinds`, grouped by store.
    Cross { kinds: Vec<RecordKind>, query: Query },
    /// Start at `start`, then follow ids through the role order.
    Cascading { start: String, query: Query },
    /// Every capable store concurrently, merged and ranked.
    Federated { query: Query },
    /// Federated or single-store results re-ranked against `context`.
    ContextAware {
        store: Option<String>,
        query: Query,
        context: Metadata,
    },
}

impl RouteRequest {
    pub fn strategy(&self) -> QueryStrategy {
        match self {
            RouteRequest::Direct { .. } => QueryStrategy::Direct,
            RouteRequest::Cross { .. } => QueryStrategy::Cross,
            RouteRequest::Cascading { .. } => QueryStrategy::Cascading,
            RouteRequest::Federated { .. } => QueryStrategy::Federated,
            RouteRequest::ContextAware { .. } => QueryStrategy::ContextAware,
        }
    }
}

/// Results shaped by the strategy that produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteResponse {
    Results(Vec<SearchResult>),
    /// Cross results keyed by store name.
    Grouped(BTreeMap<String, Vec<SearchResult>>),
    Cascade {
        results: Vec<SearchResult>,
        /// Stores visited, in order.
        path: Vec<String>,
    },
}

impl RouteResponse {
    /// Flatten into one list. Grouped results come out in store name order.
    pub fn into_results(self) -> Vec<SearchResult> {
        match self {
            RouteResponse::Results(results) => results,
            RouteResponse::Grouped(groups) => groups.into_values().flatten().collect(),
            RouteResponse::Cascade { results, .. } => results,
        }
    }
}

type Grouped = BTreeMap<String, Vec<SearchResult>>;

/// Cross-store query results keyed by the serialized kinds and query.
///
/// Clones share the same entries. Writes through the manager and every
/// propagation pass clear it.
#[derive(Clone, Default)]
pub struct QueryCache {
    entries: Arc<Mutex<HashMap<String, Grouped>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kinds: &[RecordKind], query: &Query) -> Option<String> {
        serde_json::to_string(&(kinds, query)).ok()
    }

    fn get(&self, key: &str) -> Option<Grouped> {
        self.entries.lock().get(key).cloned()
    }

    fn insert(&self, key: String, grouped: Grouped) {
        self.entries.lock().insert(key, grouped);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        if !entries.is_empty() {
            debug!("cleared query cache (entries={})", entries.len());
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Dispatches route requests to the registered stores.
pub struct QueryRouter {
    stores: StoreRegistry,
    config: RouterConfig,
    cache: QueryCache,
}

impl QueryRouter {
    pub fn new(stores: StoreRegistry, config: RouterConfig) -> Self {
        Self {
            stores,
            config,
            cache: QueryCache::new(),
        }
    }

    /// Cache of cross-store results, shared with whoever invalidates it.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, SyncError> {
        debug!("routing query (strategy={})", request.strategy());
        match request {
            RouteRequest::Direct { store, query } => {
                let adapter = self.stores.get(&store)?;
                Ok(RouteResponse::Results(adapter.search(&query).await?))
            }
            RouteRequest::Cross { kinds, query } => {
                Ok(RouteResponse::Grouped(self.cross(&kinds, &query).await?))
            }
            RouteRequest::Cascading { start, query } => {
                let (results, path) = self.cascading(&start, &query).await?;
                Ok(RouteResponse::Cascade { results, path })
            }
            RouteRequest::Federated { query } => {
                Ok(RouteResponse::Results(self.federated(&query).await?))
            }
            RouteRequest::ContextAware {
                store,
                query,
                context,
            } => Ok(RouteResponse::Results(
                self.context_aware(store.as_deref(), &query, &context)
                    .await?,
            )),
        }
    }

    async fn cross(&self, kinds: &[RecordKind], query: &Query) -> Result<Grouped, SyncError> {
        let key = self
            .config
            .cache_cross_queries
            .then(|| QueryCache::key(kinds, query))
            .flatten();
        if let Some(hit) = key.as_deref().and_then(|key| self.cache.get(key)) {
            debug!("cross query served from cache (stores={})", hit.len());
            return Ok(hit);
        }
        let grouped = self.cross_uncached(kinds, query).await?;
        if let Some(key) = key {
            self.cache.insert(key, grouped.clone());
        }
        Ok(grouped)
    }

    async fn cross_uncached(&self, kinds: &[RecordKind], query: &Query) -> Result<Grouped, SyncError> {
        let mut grouped = BTreeMap::new();
        for entry in self.stores.serving(kinds) {
            let adapter = &entry.adapter;
            if let Err(err) = query.check_supported(adapter.name(), adapter.capabilities()) {
                debug!("skipping store for cross query (store={}, reason={})", adapter.name(), err);
                continue;
            }
            let results = if kinds.is_empty() || query.kind.is_some() {
                adapter.search(query).await?
            } else {
                let mut results = Vec::new();
                for kind in kinds.iter().filter(|kind| entry.serves(**kind)) {
                    let scoped = query.clone().with_kind(*kind);
                    results.extend(adapter.search(&scoped).await?);
                }
                results
            };
            grouped.insert(adapter.name().to_string(), results);
        }
        Ok(grouped)
    }

    async fn cascading(
        &self,
        start: &str,
        query: &Query,
    ) -> Result<(Vec<SearchResult>, Vec<String>), SyncError> {
        let first = self.stores.get(start)?;
        let mut results = first.search(query).await?;
        let mut path = vec![start.to_string()];
        let mut frontier = referenced_ids(&results);

        let mut hops: BTreeMap<u8, Vec<Arc<dyn StoreAdapter>>> = BTreeMap::new();
        for adapter in self.stores.adapters() {
            if adapter.role().hop() > first.role().hop() {
                hops.entry(adapter.role().hop()).or_default().push(adapter);
            }
        }

        for adapters in hops.into_values() {
            if frontier.is_empty() {
                break;
            }
            let mut found = Vec::new();
            for adapter in adapters {
                for id in &frontier {
                    if let Some(record) = adapter.retrieve(id).await? {
                        found.push(SearchResult::scored(record, 1.0, adapter.name()));
                    }
                }
                path.push(adapter.name().to_string());
            }
            frontier = referenced_ids(&found);
            results.extend(found);
        }
        debug!(
            "cascading query finished (start={}, path={:?}, results={})",
            start,
            path,
            results.len()
        );
        Ok((results, path))
    }

    async fn federated(&self, query: &Query) -> Result<Vec<SearchResult>, SyncError> {
        let capable: Vec<_> = self
            .stores
            .adapters()
            .into_iter()
            .filter(|adapter| {
                query
                    .check_supported(adapter.name(), adapter.capabilities())
                    .is_ok()
            })
            .collect();
        if capable.is_empty() {
            return Err(SyncError::UnsupportedQuery {
                store: "router".to_string(),
                reason: "no registered store can answer this query".to_string(),
            });
        }

        let limit = Duration::from_millis(self.config.federated_timeout_ms);
        let searches = capable.iter().map(|adapter| async move {
            match timeout(limit, adapter.search(query)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        "federated search timed out (store={}, timeout_ms={})",
                        adapter.name(),
                        limit.as_millis()
                    );
                    Ok(Vec::new())
                }
            }
        });

        let mut best: HashMap<String, SearchResult> = HashMap::new();
        for outcome in join_all(searches).await {
            for result in outcome? {
                let better = best
                    .get(result.id())
                    .is_none_or(|current| current.score < result.score);
                if better {
                    best.insert(result.id().to_string(), result);
                }
            }
        }
        let mut merged: Vec<SearchResult> = best.into_values().collect();
        rank(&mut merged);
        merged.truncate(query.limit.unwrap_or(self.config.default_limit));
        Ok(merged)
    }

    async fn context_aware(
        &self,
        store: Option<&str>,
        query: &Query,
        context: &Metadata,
    ) -> Result<Vec<SearchResult>, SyncError> {
        let (candidates, context) = augment(query, context);
        let base = match store {
            Some(store) => self.stores.get(store)?.search(&candidates).await?,
            None => self.federated(&candidates).await?,
        };
        let mut scored: Vec<(f32, SearchResult)> = base
            .into_iter()
            .filter_map(|result| {
                applicability(&result, &context).map(|share| (share, result))
            })
            .collect();
        scored.sort_by(|(left_share, left), (right_share, right)| {
            right_share
                .total_cmp(left_share)
                .then_with(|| right.score.total_cmp(&left.score))
                .then_with(|| left.id().cmp(right.id()))
        });
        let mut results: Vec<SearchResult> =
            scored.into_iter().map(|(_, result)| result).collect();
        results.truncate(query.limit.unwrap_or(self.config.default_limit));
        Ok(results)
    }
}

/// Fold the caller's context into the query.
///
/// The candidate search drops the result cap so re-ranking sees every match.
/// The query's own equality filters join the context as scoring terms, and an
/// explicit filter replaces a context value for the same key. Context keys
/// stay soft: records that lack them are kept, only contradictions are dropped.
fn augment(query: &Query, context: &Metadata) -> (Query, Metadata) {
    let mut merged = context.clone();
    for (path, value) in &query.metadata {
        let previous = merged.insert(path.clone(), value.clone());
        if previous.is_some_and(|previous| previous != *value) {
            debug!("query filter overrides context (key={})", path);
        }
    }
    let candidates = Query {
        limit: Some(usize::MAX),
        ..query.clone()
    };
    (candidates, merged)
}

/// Share of context keys the record matches, or `None` when one contradicts.
fn applicability(result: &SearchResult, context: &Metadata) -> Option<f32> {
    if context.is_empty() {
        return Some(1.0);
    }
    let mut matched = 0usize;
    for (path, expected) in context {
        match result.record.metadata_path(path) {
            Some(actual) if actual == expected => matched += 1,
            Some(Value::Null) | None => {}
            Some(_) => return None,
        }
    }
    Some(matched as f32 / context.len() as f32)
}

/// Ids to look up on the next hop: each record's id plus its references.
fn referenced_ids(results: &[SearchResult]) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    for result in results {
        ids.insert(result.record.id.clone());
        ids.extend(result.record.references());
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use memsync_store::model::REFERENCES_KEY;
    use memsync_store::{GraphStore, KeyValueStore, Record, VectorStore};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn router() -> QueryRouter {
        let stores = StoreRegistry::new();
        let lmdb = Arc::new(KeyValueStore::new("lmdb"));
        let faiss = Arc::new(VectorStore::new("faiss", 5));
        let kuzu = Arc::new(GraphStore::new("kuzu"));
        lmdb.store(
            Record::new("a", RecordKind::Code, "alpha")
                .with_metadata("lang", "rust")
                .with_metadata(REFERENCES_KEY, json!(["b"])),
        )
        .await
        .expect("store");
        lmdb.store(Record::new("d", RecordKind::Documentation, "delta").with_metadata("lang", "go"))
            .await
            .expect("store");
        faiss
            .store(Record::new("b", RecordKind::Code, "beta"))
            .await
            .expect("store");
        kuzu.store(Record::new("b", RecordKind::Code, "beta graph"))
            .await
            .expect("store");
        kuzu.store(Record::new("a", RecordKind::Code, "alpha"))
            .await
            .expect("store");
        stores.register(lmdb, Vec::new());
        stores.register(faiss, vec![RecordKind::Code]);
        stores.register(kuzu, vec![RecordKind::Code]);
        QueryRouter::new(stores, RouterConfig::default())
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!(
            "context_aware".parse::<QueryStrategy>().expect("strategy"),
            QueryStrategy::ContextAware
        );
        let err = "fuzzy".parse::<QueryStrategy>().unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedQuery { .. }));
    }

    #[tokio::test]
    async fn direct_returns_one_store() {
        let router = router().await;
        let results = router
            .route(RouteRequest::Direct {
                store: "lmdb".to_string(),
                query: Query::all(),
            })
            .await
            .expect("route")
            .into_results();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|result| result.source == "lmdb"));
    }

    #[tokio::test]
    async fn cross_groups_by_relevant_store() {
        let router = router().await;
        let response = router
            .route(RouteRequest::Cross {
                kinds: vec![RecordKind::Documentation],
                query: Query::all(),
            })
            .await
            .expect("route");
        let RouteResponse::Grouped(groups) = response else {
            panic!("expected grouped results");
        };
        assert_eq!(groups.keys().cloned().collect::<Vec<_>>(), vec!["lmdb".to_string()]);
        assert_eq!(groups["lmdb"].len(), 1);
        assert_eq!(groups["lmdb"][0].id(), "d");
    }

    #[tokio::test]
    async fn cascading_follows_references() {
        let router = router().await;
        let response = router
            .route(RouteRequest::Cascading {
                start: "lmdb".to_string(),
                query: Query::all().with_metadata("lang", "rust"),
            })
            .await
            .expect("route");
        let RouteResponse::Cascade { results, path } = response else {
            panic!("expected cascade");
        };
        assert_eq!(
            path,
            vec!["lmdb".to_string(), "faiss".to_string(), "kuzu".to_string()]
        );
        let hits: Vec<_> = results
            .iter()
            .map(|result| format!("{}@{}", result.id(), result.source))
            .collect();
        assert_eq!(hits, vec!["a@lmdb", "b@faiss", "b@kuzu"]);
    }

    #[tokio::test]
    async fn federated_dedupes_by_id() {
        let router = router().await;
        let results = router
            .route(RouteRequest::Federated {
                query: Query::all().with_limit(10),
            })
            .await
            .expect("route")
            .into_results();
        let mut ids: Vec<_> = results.iter().map(|result| result.id().to_string()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[tokio::test]
    async fn context_aware_drops_contradictions() {
        let router = router().await;
        let mut context = Metadata::new();
        context.insert("lang".to_string(), json!("rust"));
        let results = router
            .route(RouteRequest::ContextAware {
                store: Some("lmdb".to_string()),
                query: Query::all(),
                context,
            })
            .await
            .expect("route")
            .into_results();
        let ids: Vec<_> = results.iter().map(|result| result.id()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn context_aware_reranks_past_the_result_cap() {
        let router = router().await;
        let mut context = Metadata::new();
        context.insert("lang".to_string(), json!("go"));
        let results = router
            .route(RouteRequest::ContextAware {
                store: Some("lmdb".to_string()),
                query: Query::all().with_limit(1),
                context,
            })
            .await
            .expect("route")
            .into_results();
        let ids: Vec<_> = results.iter().map(|result| result.id()).collect();
        assert_eq!(ids, vec!["d"]);
    }

    #[tokio::test]
    async fn context_aware_lets_query_filters_win() {
        let router = router().await;
        let mut context = Metadata::new();
        context.insert("lang".to_string(), json!("go"));
        context.insert("team".to_string(), json!("core"));
        let results = router
            .route(RouteRequest::ContextAware {
                store: Some("lmdb".to_string()),
                query: Query::all().with_metadata("lang", "rust"),
                context,
            })
            .await
            .expect("route")
            .into_results();
        let ids: Vec<_> = results.iter().map(|result| result.id()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn augment_merges_filters_into_context() {
        let mut context = Metadata::new();
        context.insert("lang".to_string(), json!("go"));
        context.insert("team".to_string(), json!("core"));
        let query = Query::all().with_metadata("lang", "rust").with_limit(3);
        let (candidates, merged) = augment(&query, &context);
        assert_eq!(candidates.limit, Some(usize::MAX));
        assert_eq!(candidates.metadata, query.metadata);
        assert_eq!(merged.get("lang"), Some(&json!("rust")));
        assert_eq!(merged.get("team"), Some(&json!("core")));
    }

    #[tokio::test]
    async fn cross_results_are_cached_until_cleared() {
        let router = router().await;
        let request = || RouteRequest::Cross {
            kinds: vec![RecordKind::Documentation],
            query: Query::all(),
        };
        let first = router.route(request()).await.expect("route").into_results();
        assert_eq!(first.len(), 1);
        assert_eq!(router.cache().len(), 1);

        router
            .stores
            .get("lmdb")
            .expect("lmdb")
            .store(Record::new("e", RecordKind::Documentation, "epsilon"))
            .await
            .expect("store");
        let stale = router.route(request()).await.expect("route").into_results();
        assert_eq!(stale.len(), 1);

        router.cache().clear();
        assert!(router.cache().is_empty());
        let fresh = router.route(request()).await.expect("route").into_results();
        assert_eq!(fresh.len(), 2);
    }

    #[tokio::test]
    async fn cross_cache_can_be_disabled() {
        let router = router().await;
        let router = QueryRouter::new(
            router.stores.clone(),
            RouterConfig {
                cache_cross_queries: false,
                ..RouterConfig::default()
            },
        );
        router
            .route(RouteRequest::Cross {
                kinds: Vec::new(),
                query: Query::all(),
            })
            .await
            .expect("route");
        assert!(router.cache().is_empty());
    }
}
