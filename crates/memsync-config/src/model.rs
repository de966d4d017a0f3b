//! Configuration schema for memsync.

use memsync_store::{RecordKind, StoreRole};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Embedding dimension used by vector stores that do not set one.
pub const DEFAULT_VECTOR_DIMENSION: usize = 5;

/// Root config for a memory manager.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemsyncConfig {
    #[serde(default, rename = "$schema")]
    pub schema: Option<String>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub propagation: PropagationConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl MemsyncConfig {
    /// Start building a config programmatically with defaults applied.
    pub fn builder() -> MemsyncConfigBuilder {
        MemsyncConfigBuilder::new()
    }

    /// Look up a store entry by name.
    pub fn store(&self, name: &str) -> Option<&StoreConfig> {
        self.stores.iter().find(|store| store.name == name)
    }
}

/// Builder for assembling a `MemsyncConfig` in code.
#[derive(Debug, Default, Clone)]
pub struct MemsyncConfigBuilder {
    config: MemsyncConfig,
}

impl MemsyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MemsyncConfig::default(),
        }
    }

    /// Append a store entry.
    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.stores.push(store);
        self
    }

    /// Set the store used by phase-tagged writes.
    pub fn default_store(mut self, name: impl Into<String>) -> Self {
        self.config.registry.default_store = name.into();
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn propagation(mut self, propagation: PropagationConfig) -> Self {
        self.config.propagation = propagation;
        self
    }

    pub fn router(mut self, router: RouterConfig) -> Self {
        self.config.router = router;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Finalize and return the built `MemsyncConfig`.
    pub fn build(self) -> MemsyncConfig {
        self.config
    }
}

/// Registry-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Store receiving `store_with_phase` writes.
    #[serde(default = "default_store_name")]
    pub default_store: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_store: default_store_name(),
        }
    }
}

fn default_store_name() -> String {
    "tinydb".to_string()
}

/// One adapter to construct and register.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub name: String,
    pub role: StoreRole,
    /// Record kinds this store is relevant for in cross queries. Empty means all.
    #[serde(default)]
    pub kinds: Vec<RecordKind>,
    /// Embedding dimension for vector stores.
    #[serde(default)]
    pub dimension: Option<usize>,
    /// Backing file for document stores.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, role: StoreRole) -> Self {
        Self {
            name: name.into(),
            role,
            kinds: Vec::new(),
            dimension: None,
            path: None,
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = RecordKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Whether this store should answer a cross query for `kind`.
    pub fn serves(&self, kind: RecordKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// How a differing record is reconciled during synchronization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The record being copied always replaces the target's copy.
    #[default]
    IncomingWins,
    /// The higher `version` metadata wins, then the later `created_at`.
    NewestVersion,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::IncomingWins => f.write_str("incoming_wins"),
            ConflictPolicy::NewestVersion => f.write_str("newest_version"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "incoming_wins" => Ok(ConflictPolicy::IncomingWins),
            "newest_version" => Ok(ConflictPolicy::NewestVersion),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Synchronization engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Target of `synchronize_core`.
    #[serde(default = "default_hub")]
    pub hub: String,
    /// Sources of `synchronize_core`, in order.
    #[serde(default = "default_primaries")]
    pub primaries: Vec<String>,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Maximum retained conflict log entries.
    #[serde(default = "default_conflict_log_limit")]
    pub conflict_log_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            hub: default_hub(),
            primaries: default_primaries(),
            conflict_policy: ConflictPolicy::default(),
            conflict_log_limit: default_conflict_log_limit(),
        }
    }
}

fn default_hub() -> String {
    "kuzu".to_string()
}

fn default_primaries() -> Vec<String> {
    vec!["lmdb".to_string(), "faiss".to_string()]
}

fn default_conflict_log_limit() -> usize {
    256
}

/// Propagation queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    /// Drain queues on a background worker instead of on `flush_queue`.
    #[serde(default)]
    pub async_mode: bool,
    /// Reconcile each flushed update into every other registered store, not
    /// only the store it was queued for.
    #[serde(default = "default_true")]
    pub fan_out: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            async_mode: false,
            fan_out: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Query router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-adapter timeout for federated queries.
    #[serde(default = "default_federated_timeout_ms")]
    pub federated_timeout_ms: u64,
    /// Result limit applied when a query sets none.
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Cache cross-store query results until the next write through the
    /// manager or the propagation queue.
    #[serde(default = "default_true")]
    pub cache_cross_queries: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            federated_timeout_ms: default_federated_timeout_ms(),
            default_limit: default_limit(),
            cache_cross_queries: true,
        }
    }
}

fn default_federated_timeout_ms() -> u64 {
    2000
}

fn default_limit() -> usize {
    5
}

/// Backoff settings for retryable failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Add up to 25% random jitter to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

/// Largest accepted `retry.backoff_multiplier`.
pub const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_jitter() -> bool {
    true
}
