//! Public SDK surface for memsync.
//!
//! This crate re-exports the store, config and core crates and provides a
//! small initialization helper to keep consumer setup consistent.

/// Re-export for convenience.
pub use memsync_config as config;
pub use memsync_core as core;
/// Re-export for convenience.
pub use memsync_store as store;

pub use memsync_config::{LayeredConfigOptions, MemsyncConfig};
pub use memsync_core::{MemoryManager, SyncError};
pub use memsync_store::{Record, RecordKind, StoreAdapter, WorkflowPhase};

/// Load the layered config described by `options` and build a manager
/// from it.
pub fn open(options: LayeredConfigOptions) -> Result<MemoryManager, SyncError> {
    let layered = MemsyncConfig::load_layered_with_options(options)?;
    log::info!(
        "opening memory manager (layers={}, stores={})",
        layered.layers.len(),
        layered.config.stores.len()
    );
    MemoryManager::from_config(layered.config)
}

#[inline]
/// Initialize logging using env_logger if the "logging" feature is enabled.
///
/// This is a no-op if the feature is not enabled. Binaries are still expected
/// to call this early in startup to ensure log output is wired up.
pub fn init_logging() {
    #[cfg(feature = "logging")]
    {
        let _ = env_logger::try_init();
    }
}
