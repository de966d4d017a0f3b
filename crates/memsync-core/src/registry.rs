//! Named store registry shared by the manager's components.

use crate::error::SyncError;
use log::{debug, info, warn};
use memsync_store::{RecordKind, StoreAdapter};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A registered adapter and the record kinds it is relevant for.
#[derive(Clone)]
pub(crate) struct StoreEntry {
    pub(crate) adapter: Arc<dyn StoreAdapter>,
    /// Empty means every kind.
    pub(crate) kinds: Vec<RecordKind>,
}

impl StoreEntry {
    pub(crate) fn serves(&self, kind: RecordKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// Name to adapter map behind a lock that serializes structural changes.
///
/// Clones share the same map.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: Arc<RwLock<BTreeMap<String, StoreEntry>>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under its own name, replacing any previous entry.
    pub fn register(
        &self,
        adapter: Arc<dyn StoreAdapter>,
        kinds: Vec<RecordKind>,
    ) -> Option<Arc<dyn StoreAdapter>> {
        let name = adapter.name().to_string();
        let previous = self
            .stores
            .write()
            .insert(name.clone(), StoreEntry { adapter, kinds })
            .map(|entry| entry.adapter);
        if previous.is_some() {
            warn!("replaced registered store (store={})", name);
        } else {
            info!("registered store (store={})", name);
        }
        previous
    }

    /// Remove a store and return its adapter.
    pub fn unregister(&self, name: &str) -> Result<Arc<dyn StoreAdapter>, SyncError> {
        match self.stores.write().remove(name) {
            Some(entry) => {
                info!("unregistered store (store={})", name);
                Ok(entry.adapter)
            }
            None => Err(unknown(name)),
        }
    }

    /// Resolve a store by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StoreAdapter>, SyncError> {
        self.stores
            .read()
            .get(name)
            .map(|entry| entry.adapter.clone())
            .ok_or_else(|| unknown(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.read().contains_key(name)
    }

    /// Registered names in order.
    pub fn names(&self) -> Vec<String> {
        self.stores.read().keys().cloned().collect()
    }

    /// Snapshot of every adapter in name order.
    pub fn adapters(&self) -> Vec<Arc<dyn StoreAdapter>> {
        self.stores
            .read()
            .values()
            .map(|entry| entry.adapter.clone())
            .collect()
    }

    /// Kinds declared for `name`. Empty means every kind.
    pub fn kinds(&self, name: &str) -> Result<Vec<RecordKind>, SyncError> {
        self.stores
            .read()
            .get(name)
            .map(|entry| entry.kinds.clone())
            .ok_or_else(|| unknown(name))
    }

    /// Fail with `UnknownStore` for the first name that is not registered.
    pub fn ensure(&self, names: &[&str]) -> Result<(), SyncError> {
        let stores = self.stores.read();
        match names.iter().find(|name| !stores.contains_key(**name)) {
            Some(name) => Err(unknown(name)),
            None => Ok(()),
        }
    }

    /// Adapters relevant for any of `kinds`, in name order.
    pub(crate) fn serving(&self, kinds: &[RecordKind]) -> Vec<StoreEntry> {
        self.stores
            .read()
            .values()
            .filter(|entry| kinds.is_empty() || kinds.iter().any(|kind| entry.serves(*kind)))
            .cloned()
            .collect()
    }
}

fn unknown(name: &str) -> SyncError {
    debug!("store lookup failed (store={})", name);
    SyncError::UnknownStore(name.to_string())
}
