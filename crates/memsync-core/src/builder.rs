//! Construct bundled adapters from store config entries.

use crate::error::SyncError;
use log::debug;
use memsync_config::{DEFAULT_VECTOR_DIMENSION, StoreConfig};
use memsync_store::{DocumentStore, GraphStore, KeyValueStore, StoreAdapter, StoreRole, VectorStore};
use std::sync::Arc;

/// Build the bundled adapter for `config.role`.
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn StoreAdapter>, SyncError> {
    debug!(
        "building store (store={}, role={})",
        config.name, config.role
    );
    let adapter: Arc<dyn StoreAdapter> = match config.role {
        StoreRole::KeyValue => Arc::new(KeyValueStore::new(&config.name)),
        StoreRole::Columnar => Arc::new(KeyValueStore::columnar(&config.name)),
        StoreRole::Vector => Arc::new(VectorStore::new(
            &config.name,
            config.dimension.unwrap_or(DEFAULT_VECTOR_DIMENSION),
        )),
        StoreRole::Graph => Arc::new(GraphStore::new(&config.name)),
        StoreRole::Document => {
            let path = config.path.as_ref().ok_or_else(|| {
                SyncError::Config(memsync_config::ConfigError::Invalid(format!(
                    "document store '{}' requires a path",
                    config.name
                )))
            })?;
            Arc::new(DocumentStore::open(&config.name, path)?)
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn builds_each_role() {
        let temp = tempdir().expect("tempdir");
        let configs = [
            StoreConfig::new("lmdb", StoreRole::KeyValue),
            StoreConfig::new("duckdb", StoreRole::Columnar),
            StoreConfig::new("faiss", StoreRole::Vector).with_dimension(8),
            StoreConfig::new("kuzu", StoreRole::Graph),
            StoreConfig::new("tinydb", StoreRole::Document).with_path(temp.path().join("docs.jsonl")),
        ];
        for config in &configs {
            let adapter = build_store(config).expect("adapter");
            assert_eq!(adapter.name(), config.name);
            assert_eq!(adapter.role(), config.role);
        }
    }

    #[test]
    fn document_store_needs_a_path() {
        let err = build_store(&StoreConfig::new("tinydb", StoreRole::Document)).err().unwrap();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
