//! Propagation queue tests.

use memsync_config::PropagationConfig;
use memsync_core::{MemoryManager, SyncError};
use memsync_store::{GraphStore, KeyValueStore, StoreAdapter};
use memsync_test_utils::{FlakyStore, code_record, in_memory_config};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn async_manager() -> MemoryManager {
    let mut config = in_memory_config();
    config.propagation = PropagationConfig {
        async_mode: true,
        ..PropagationConfig::default()
    };
    MemoryManager::from_config(config).expect("manager")
}

#[tokio::test]
async fn async_update_visible_after_wait() {
    let manager = async_manager();
    manager
        .queue_update("kuzu", code_record("async1", "later"))
        .expect("queue");
    assert!(manager.retrieve("kuzu", "async1").await.expect("retrieve").is_none());

    let report = manager.wait_for_async().await.expect("wait");
    assert!(report.is_clean());
    assert_eq!(report.applied.get("kuzu"), Some(&1));
    assert!(manager.retrieve("kuzu", "async1").await.expect("retrieve").is_some());
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn queued_updates_apply_in_fifo_order() {
    let manager = MemoryManager::from_config(in_memory_config()).expect("manager");
    let graph = Arc::new(GraphStore::new("kuzu"));
    manager.register(graph.clone());

    for step in 1..=5 {
        manager
            .queue_update("kuzu", code_record("f", &format!("v{step}")))
            .expect("queue");
    }
    let report = manager.flush_queue().await;
    assert_eq!(report.applied.get("kuzu"), Some(&5));

    let versions: Vec<_> = graph
        .history("f")
        .into_iter()
        .map(|record| record.content)
        .collect();
    assert_eq!(
        versions,
        vec![json!("v1"), json!("v2"), json!("v3"), json!("v4"), json!("v5")]
    );
}

#[tokio::test]
async fn failed_update_blocks_only_its_queue() {
    let manager = MemoryManager::from_config(in_memory_config()).expect("manager");
    let flaky = Arc::new(FlakyStore::wrap(Arc::new(KeyValueStore::new("lmdb"))));
    manager.register(flaky.clone());
    flaky.fail_store_for("b");

    for id in ["a", "b", "c"] {
        manager
            .queue_update("lmdb", code_record(id, id))
            .expect("queue");
    }
    manager
        .queue_update("kuzu", code_record("k", "graph"))
        .expect("queue");

    let report = manager.flush_queue().await;
    assert_eq!(report.applied.get("lmdb"), Some(&1));
    assert_eq!(report.applied.get("kuzu"), Some(&1));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, "b");
    assert_eq!(manager.pending().get("lmdb"), Some(&2));
    assert!(manager.retrieve("lmdb", "c").await.expect("retrieve").is_none());

    flaky.clear_failures();
    let retried = manager.flush_queue().await;
    assert!(retried.is_clean());
    assert_eq!(retried.applied.get("lmdb"), Some(&2));
    assert!(manager.pending().is_empty());
    assert!(manager.retrieve("lmdb", "c").await.expect("retrieve").is_some());
}

#[tokio::test]
async fn unknown_store_is_rejected_up_front() {
    let manager = async_manager();
    let err = manager
        .queue_update("redis", code_record("x", "x"))
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownStore(name) if name == "redis"));
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn wait_covers_updates_queued_across_passes() {
    let manager = async_manager();
    for idx in 0..20 {
        manager
            .queue_update("lmdb", code_record(&format!("n{idx}"), "value"))
            .expect("queue");
        if idx == 9 {
            tokio::task::yield_now().await;
        }
    }
    manager.wait_for_async().await.expect("wait");
    let stored = manager.adapter("lmdb").expect("lmdb").list().await.expect("list");
    assert_eq!(stored.len(), 20);
}

#[tokio::test]
async fn flushed_update_reaches_secondary_stores() {
    let manager = MemoryManager::from_config(in_memory_config()).expect("manager");
    manager
        .queue_update("lmdb", code_record("shared", "everywhere"))
        .expect("queue");

    let report = manager.flush_queue().await;
    assert!(report.is_clean());
    assert_eq!(report.applied.get("lmdb"), Some(&1));
    assert_eq!(report.propagated.get("faiss"), Some(&1));
    assert_eq!(report.propagated.get("kuzu"), Some(&1));
    for store in ["lmdb", "faiss", "kuzu"] {
        let record = manager
            .retrieve(store, "shared")
            .await
            .expect("retrieve")
            .expect("record");
        assert_eq!(record.content, json!("everywhere"));
    }
}

#[tokio::test]
async fn fan_out_failure_leaves_primary_applied() {
    let manager = MemoryManager::from_config(in_memory_config()).expect("manager");
    let flaky = Arc::new(FlakyStore::wrap(Arc::new(GraphStore::new("kuzu"))));
    manager.register(flaky.clone());
    flaky.fail_store_for("x");

    manager
        .queue_update("lmdb", code_record("x", "value"))
        .expect("queue");
    let report = manager.flush_queue().await;
    assert!(!report.is_clean());
    assert!(report.failures.is_empty());
    assert_eq!(report.applied.get("lmdb"), Some(&1));
    assert_eq!(report.fan_out_failures.len(), 1);
    assert_eq!(report.fan_out_failures[0].target, "kuzu");
    assert_eq!(report.fan_out_failures[0].id, "x");
    assert!(manager.pending().is_empty());
    assert!(manager.retrieve("faiss", "x").await.expect("retrieve").is_some());
    assert!(manager.retrieve("kuzu", "x").await.expect("retrieve").is_none());
}

#[tokio::test]
async fn fan_out_can_be_disabled() {
    let mut config = in_memory_config();
    config.propagation.fan_out = false;
    let manager = MemoryManager::from_config(config).expect("manager");
    manager
        .queue_update("lmdb", code_record("local", "only"))
        .expect("queue");
    let report = manager.flush_queue().await;
    assert!(report.propagated.is_empty());
    assert!(manager.retrieve("lmdb", "local").await.expect("retrieve").is_some());
    assert!(manager.retrieve("kuzu", "local").await.expect("retrieve").is_none());
}
