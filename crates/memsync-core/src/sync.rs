//! Record synchronization between stores.
//!
//! Copies records from a source store into a target store. Records missing
//! from the target are inserted, identical records are left alone, and
//! differing records are reconciled by [`resolve`] under the configured
//! [`ConflictPolicy`]. The engine keeps cumulative [`SyncStats`] and a bounded
//! log of every conflict it resolved.

use crate::error::SyncError;
use crate::registry::StoreRegistry;
use crate::transaction::TransactionScope;
use chrono::{DateTime, Utc};
use log::{debug, info};
use memsync_config::{ConflictPolicy, SyncConfig};
use memsync_store::{Record, StoreAdapter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Outcome of reconciling two copies of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Record the target should hold afterwards.
    pub record: Record,
    /// Whether the copies differed.
    pub conflict: bool,
}

/// Reconcile `existing` (target copy) with `incoming` (source copy).
///
/// The result always carries the existing kind.
pub fn resolve(existing: &Record, incoming: &Record, policy: ConflictPolicy) -> Resolution {
    if existing.same_payload(incoming) {
        return Resolution {
            record: existing.clone(),
            conflict: false,
        };
    }
    let take_incoming = match policy {
        ConflictPolicy::IncomingWins => true,
        ConflictPolicy::NewestVersion => {
            let incoming_rank = (incoming.version().unwrap_or(0), incoming.created_at);
            let existing_rank = (existing.version().unwrap_or(0), existing.created_at);
            incoming_rank >= existing_rank
        }
    };
    let mut record = if take_incoming {
        incoming.clone()
    } else {
        existing.clone()
    };
    record.kind = existing.kind;
    Resolution {
        record,
        conflict: true,
    }
}

/// Cumulative counters across every synchronization run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Records written to a target (inserted or replaced).
    pub synchronized: u64,
    /// Differing overlaps that went through conflict resolution.
    pub conflicts: u64,
}

/// One resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub source: String,
    pub target: String,
    pub existing: Record,
    pub incoming: Record,
    pub chosen: Record,
    pub policy: ConflictPolicy,
    pub resolved_at: DateTime<Utc>,
}

/// Counts for one source to target pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionReport {
    pub source: String,
    pub target: String,
    pub inserted: usize,
    /// Conflicts that replaced the target copy.
    pub updated: usize,
    pub conflicts: usize,
    pub unchanged: usize,
}

impl DirectionReport {
    fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            ..Self::default()
        }
    }

    /// Records written to the target.
    pub fn synchronized(&self) -> usize {
        self.inserted + self.updated
    }

    fn count(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Inserted => self.inserted += 1,
            ApplyOutcome::Updated => {
                self.updated += 1;
                self.conflicts += 1;
            }
            ApplyOutcome::Kept => self.conflicts += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Result of `synchronize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub forward: DirectionReport,
    /// Present for bidirectional runs.
    pub reverse: Option<DirectionReport>,
}

impl SyncReport {
    pub fn conflicts(&self) -> usize {
        self.forward.conflicts + self.reverse.as_ref().map_or(0, |report| report.conflicts)
    }

    pub fn synchronized(&self) -> usize {
        self.forward.synchronized()
            + self
                .reverse
                .as_ref()
                .map_or(0, DirectionReport::synchronized)
    }
}

/// What happened to one record on the single-record path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Target had no copy.
    Inserted,
    /// Target copy differed and was replaced.
    Updated,
    /// Target copy differed and won the resolution.
    Kept,
    /// Target copy was identical.
    Unchanged,
}

/// Where reads and writes of one side of a sync go.
enum Endpoint<'a> {
    Direct(Arc<dyn StoreAdapter>),
    Scoped {
        scope: &'a TransactionScope,
        store: String,
    },
}

impl Endpoint<'_> {
    fn name(&self) -> &str {
        match self {
            Endpoint::Direct(adapter) => adapter.name(),
            Endpoint::Scoped { store, .. } => store,
        }
    }

    async fn list(&self) -> Result<Vec<Record>, SyncError> {
        match self {
            Endpoint::Direct(adapter) => Ok(adapter.list().await?),
            Endpoint::Scoped { scope, store } => scope.list(store).await,
        }
    }

    async fn retrieve(&self, id: &str) -> Result<Option<Record>, SyncError> {
        match self {
            Endpoint::Direct(adapter) => Ok(adapter.retrieve(id).await?),
            Endpoint::Scoped { scope, store } => scope.retrieve(store, id).await,
        }
    }

    async fn store(&self, record: Record) -> Result<(), SyncError> {
        match self {
            Endpoint::Direct(adapter) => adapter.store(record).await.map(|_| ())?,
            Endpoint::Scoped { scope, store } => scope.store(store, record).await.map(|_| ())?,
        }
        Ok(())
    }
}

/// Copies records between registered stores.
pub struct SyncEngine {
    stores: StoreRegistry,
    config: SyncConfig,
    stats: Mutex<SyncStats>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
}

impl SyncEngine {
    pub fn new(stores: StoreRegistry, config: SyncConfig) -> Self {
        Self {
            stores,
            config,
            stats: Mutex::new(SyncStats::default()),
            conflicts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.config.conflict_policy
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.lock()
    }

    /// Retained conflicts, oldest first.
    pub fn conflict_log(&self) -> Vec<ConflictRecord> {
        self.conflicts.lock().iter().cloned().collect()
    }

    /// Copy every record of `source` into `target`, then back when
    /// `bidirectional` is set. Each write commits on its own.
    pub async fn synchronize(
        &self,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> Result<SyncReport, SyncError> {
        let source = Endpoint::Direct(self.stores.get(source)?);
        let target = Endpoint::Direct(self.stores.get(target)?);
        self.run(source, target, bidirectional).await
    }

    /// Synchronize each primary into the hub.
    ///
    /// Keys are `"<source>_to_<hub>"`. Fails before copying anything when a
    /// configured store is not registered.
    pub async fn synchronize_core(&self) -> Result<BTreeMap<String, DirectionReport>, SyncError> {
        let hub = self.config.hub.as_str();
        let mut names: Vec<&str> = self.config.primaries.iter().map(String::as_str).collect();
        names.push(hub);
        self.stores.ensure(&names)?;

        let mut reports = BTreeMap::new();
        for primary in &self.config.primaries {
            let report = self.synchronize(primary, hub, false).await?;
            reports.insert(format!("{primary}_to_{hub}"), report.forward);
        }
        info!(
            "core synchronization finished (hub={}, primaries={})",
            hub,
            self.config.primaries.len()
        );
        Ok(reports)
    }

    /// Single-record path: reconcile `record` into `target` and write it.
    pub async fn apply_record(
        &self,
        target: &str,
        source: &str,
        record: Record,
    ) -> Result<ApplyOutcome, SyncError> {
        let target = Endpoint::Direct(self.stores.get(target)?);
        let outcome = self.apply(&target, source, record).await?;
        self.bump(&[outcome]);
        Ok(outcome)
    }

    /// Synchronize through an open scope so the writes share its atomicity.
    ///
    /// The write side must be a participant of the scope. A source outside
    /// the scope is read from its committed state.
    pub(crate) async fn synchronize_in(
        &self,
        scope: &TransactionScope,
        source: &str,
        target: &str,
        bidirectional: bool,
    ) -> Result<SyncReport, SyncError> {
        let source = self.scoped_endpoint(scope, source, bidirectional)?;
        let target = self.scoped_endpoint(scope, target, true)?;
        self.run(source, target, bidirectional).await
    }

    fn scoped_endpoint<'a>(
        &self,
        scope: &'a TransactionScope,
        store: &str,
        written: bool,
    ) -> Result<Endpoint<'a>, SyncError> {
        if scope.includes(store) {
            return Ok(Endpoint::Scoped {
                scope,
                store: store.to_string(),
            });
        }
        let adapter = self.stores.get(store)?;
        if written {
            return Err(SyncError::NotInTransaction(store.to_string()));
        }
        Ok(Endpoint::Direct(adapter))
    }

    async fn run(
        &self,
        source: Endpoint<'_>,
        target: Endpoint<'_>,
        bidirectional: bool,
    ) -> Result<SyncReport, SyncError> {
        let forward = self.copy(&source, &target).await?;
        let reverse = if bidirectional {
            Some(self.copy(&target, &source).await?)
        } else {
            None
        };
        Ok(SyncReport { forward, reverse })
    }

    async fn copy(
        &self,
        source: &Endpoint<'_>,
        target: &Endpoint<'_>,
    ) -> Result<DirectionReport, SyncError> {
        let mut report = DirectionReport::new(source.name(), target.name());
        let records = source.list().await?;
        debug!(
            "synchronizing (source={}, target={}, records={})",
            source.name(),
            target.name(),
            records.len()
        );
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            let outcome = self.apply(target, source.name(), record).await;
            match outcome {
                Ok(outcome) => {
                    report.count(outcome);
                    outcomes.push(outcome);
                }
                Err(err) => {
                    self.bump(&outcomes);
                    return Err(err);
                }
            }
        }
        self.bump(&outcomes);
        info!(
            "synchronized (source={}, target={}, inserted={}, updated={}, conflicts={}, unchanged={})",
            report.source,
            report.target,
            report.inserted,
            report.updated,
            report.conflicts,
            report.unchanged
        );
        Ok(report)
    }

    async fn apply(
        &self,
        target: &Endpoint<'_>,
        source: &str,
        incoming: Record,
    ) -> Result<ApplyOutcome, SyncError> {
        let Some(existing) = target.retrieve(&incoming.id).await? else {
            target.store(incoming).await?;
            return Ok(ApplyOutcome::Inserted);
        };
        let resolution = resolve(&existing, &incoming, self.policy());
        if !resolution.conflict {
            return Ok(ApplyOutcome::Unchanged);
        }
        let replaced = resolution.record != existing;
        self.log_conflict(ConflictRecord {
            id: existing.id.clone(),
            source: source.to_string(),
            target: target.name().to_string(),
            chosen: resolution.record.clone(),
            existing,
            incoming,
            policy: self.policy(),
            resolved_at: Utc::now(),
        });
        if replaced {
            target.store(resolution.record).await?;
            Ok(ApplyOutcome::Updated)
        } else {
            Ok(ApplyOutcome::Kept)
        }
    }

    fn bump(&self, outcomes: &[ApplyOutcome]) {
        let mut stats = self.stats.lock();
        for outcome in outcomes {
            match outcome {
                ApplyOutcome::Inserted => stats.synchronized += 1,
                ApplyOutcome::Updated => {
                    stats.synchronized += 1;
                    stats.conflicts += 1;
                }
                ApplyOutcome::Kept => stats.conflicts += 1,
                ApplyOutcome::Unchanged => {}
            }
        }
    }

    fn log_conflict(&self, conflict: ConflictRecord) {
        debug!(
            "conflict resolved (id={}, source={}, target={}, policy={})",
            conflict.id, conflict.source, conflict.target, conflict.policy
        );
        let limit = self.config.conflict_log_limit;
        if limit == 0 {
            return;
        }
        let mut log = self.conflicts.lock();
        while log.len() >= limit {
            log.pop_front();
        }
        log.push_back(conflict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use memsync_store::model::VERSION_KEY;
    use memsync_store::{KeyValueStore, RecordKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn record(id: &str, content: &str) -> Record {
        Record::new(id, RecordKind::Code, content)
    }

    #[test]
    fn identical_payloads_are_not_conflicts() {
        let existing = record("a", "alpha");
        let incoming = record("a", "alpha");
        let resolution = resolve(&existing, &incoming, ConflictPolicy::IncomingWins);
        assert!(!resolution.conflict);
        assert_eq!(resolution.record, existing);
    }

    #[test]
    fn incoming_wins_keeps_existing_kind() {
        let existing = record("a", "alpha");
        let incoming = Record::new("a", RecordKind::Documentation, "beta");
        let resolution = resolve(&existing, &incoming, ConflictPolicy::IncomingWins);
        assert!(resolution.conflict);
        assert_eq!(resolution.record.content, json!("beta"));
        assert_eq!(resolution.record.kind, RecordKind::Code);
    }

    #[test]
    fn newest_version_prefers_higher_version() {
        let existing = record("a", "alpha").with_metadata(VERSION_KEY, 3);
        let incoming = record("a", "beta").with_metadata(VERSION_KEY, 2);
        let resolution = resolve(&existing, &incoming, ConflictPolicy::NewestVersion);
        assert!(resolution.conflict);
        assert_eq!(resolution.record.content, json!("alpha"));
    }

    #[test]
    fn newest_version_falls_back_to_created_at_then_incoming() {
        let mut existing = record("a", "alpha");
        let mut incoming = record("a", "beta");
        existing.created_at = incoming.created_at + Duration::seconds(5);
        let kept = resolve(&existing, &incoming, ConflictPolicy::NewestVersion);
        assert_eq!(kept.record.content, json!("alpha"));

        incoming.created_at = existing.created_at;
        let tie = resolve(&existing, &incoming, ConflictPolicy::NewestVersion);
        assert_eq!(tie.record.content, json!("beta"));
    }

    fn engine(limit: usize) -> (SyncEngine, Arc<KeyValueStore>, Arc<KeyValueStore>) {
        let stores = StoreRegistry::new();
        let left = Arc::new(KeyValueStore::new("left"));
        let right = Arc::new(KeyValueStore::new("right"));
        stores.register(left.clone(), Vec::new());
        stores.register(right.clone(), Vec::new());
        let config = SyncConfig {
            conflict_log_limit: limit,
            ..SyncConfig::default()
        };
        (SyncEngine::new(stores, config), left, right)
    }

    #[tokio::test]
    async fn counts_inserts_conflicts_and_unchanged() {
        let (engine, left, right) = engine(8);
        left.store(record("a", "alpha")).await.expect("store");
        left.store(record("b", "beta")).await.expect("store");
        left.store(record("c", "gamma")).await.expect("store");
        right.store(record("b", "beta")).await.expect("store");
        right.store(record("c", "stale")).await.expect("store");

        let report = engine.synchronize("left", "right", false).await.expect("sync");
        assert_eq!(report.forward.inserted, 1);
        assert_eq!(report.forward.conflicts, 1);
        assert_eq!(report.forward.updated, 1);
        assert_eq!(report.forward.unchanged, 1);
        assert_eq!(report.reverse, None);
        assert_eq!(
            engine.stats(),
            SyncStats {
                synchronized: 2,
                conflicts: 1
            }
        );
        let log = engine.conflict_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].id, "c");
        assert_eq!(log[0].chosen.content, json!("gamma"));
    }

    #[tokio::test]
    async fn conflict_log_is_bounded() {
        let (engine, left, right) = engine(2);
        for id in ["a", "b", "c"] {
            left.store(record(id, "new")).await.expect("store");
            right.store(record(id, "old")).await.expect("store");
        }
        let report = engine.synchronize("left", "right", false).await.expect("sync");
        assert_eq!(report.forward.conflicts, 3);
        let ids: Vec<_> = engine
            .conflict_log()
            .into_iter()
            .map(|conflict| conflict.id)
            .collect();
        assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn unknown_store_fails_before_copying() {
        let (engine, left, right) = engine(8);
        left.store(record("a", "alpha")).await.expect("store");
        let err = engine.synchronize("left", "missing", false).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownStore(name) if name == "missing"));
        assert!(right.is_empty());
    }

    #[tokio::test]
    async fn synchronize_core_requires_configured_stores() {
        let (engine, _left, _right) = engine(8);
        let err = engine.synchronize_core().await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownStore(_)));
        assert_eq!(engine.stats(), SyncStats::default());
    }

    #[tokio::test]
    async fn apply_record_reports_outcome() {
        let (engine, _left, right) = engine(8);
        let first = engine
            .apply_record("right", "left", record("a", "alpha"))
            .await
            .expect("apply");
        let again = engine
            .apply_record("right", "left", record("a", "alpha"))
            .await
            .expect("apply");
        let changed = engine
            .apply_record("right", "left", record("a", "beta"))
            .await
            .expect("apply");
        assert_eq!(first, ApplyOutcome::Inserted);
        assert_eq!(again, ApplyOutcome::Unchanged);
        assert_eq!(changed, ApplyOutcome::Updated);
        let stored = right.retrieve("a").await.expect("retrieve").expect("record");
        assert_eq!(stored.content, json!("beta"));
    }
}
