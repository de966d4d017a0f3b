//! Tests for layered configuration loading.

use super::*;
use crate::ConflictPolicy;
use memsync_store::RecordKind;
use pretty_assertions::assert_eq;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write JSON5 contents to a path, creating parent directories if needed.
fn write_json5(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("dir");
    }
    fs::write(path, contents).expect("write");
}

/// Temp project with a `.git` marker and a nested working directory.
fn project() -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().expect("tmp");
    let project_root = temp.path().join("project");
    fs::create_dir_all(project_root.join(".git")).expect("git");
    let cwd = project_root.join("subdir");
    fs::create_dir_all(&cwd).expect("cwd");
    (temp, project_root, cwd)
}

#[test]
fn parse_minimal_config() {
    let config = MemsyncConfig::load_from_str("{}").expect("config");
    assert_eq!(config.registry.default_store, "tinydb");
    assert_eq!(config.sync.hub, "kuzu");
    assert_eq!(
        config.sync.primaries,
        vec!["lmdb".to_string(), "faiss".to_string()]
    );
    assert_eq!(config.sync.conflict_policy, ConflictPolicy::IncomingWins);
    assert_eq!(config.sync.conflict_log_limit, 256);
    assert!(!config.propagation.async_mode);
    assert_eq!(config.router.federated_timeout_ms, 2000);
    assert_eq!(config.retry.max_retries, 3);
}

#[test]
fn parse_store_entries() {
    let json5 = r#"{
        // json5 comments are allowed
        registry: { default_store: "docs" },
        stores: [
            { name: "lmdb", role: "key_value", kinds: ["code", "short_term"] },
            { name: "faiss", role: "vector", dimension: 8 },
            { name: "docs", role: "document", path: "/tmp/docs.jsonl" },
        ],
        sync: { conflict_policy: "newest_version" },
    }"#;
    let config = MemsyncConfig::load_from_str(json5).expect("config");
    assert_eq!(config.stores.len(), 3);
    let lmdb = config.store("lmdb").expect("lmdb");
    assert!(lmdb.serves(RecordKind::Code));
    assert!(!lmdb.serves(RecordKind::Documentation));
    assert!(config.store("faiss").expect("faiss").serves(RecordKind::Documentation));
    assert_eq!(config.store("faiss").and_then(|store| store.dimension), Some(8));
    assert_eq!(config.sync.conflict_policy, ConflictPolicy::NewestVersion);
}

#[test]
fn rejects_unknown_top_level_key() {
    let err = MemsyncConfig::load_from_str("{ unexpected: true }").unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("unknown key"));
    assert!(msg.contains("config:unexpected"));
}

#[test]
fn rejects_invalid_store_role() {
    let json5 = r#"{ stores: [{ name: "x", role: "columnstore" }] }"#;
    let err = MemsyncConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("stores[0].role"));
}

#[test]
fn rejects_unknown_record_kind() {
    let json5 = r#"{ stores: [{ name: "x", role: "graph", kinds: ["memo"] }] }"#;
    let err = MemsyncConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("stores[0].kinds[0]"));
}

#[test]
fn rejects_invalid_conflict_policy() {
    let err = MemsyncConfig::load_from_str(r#"{ sync: { conflict_policy: "oldest" } }"#)
        .unwrap_err();
    assert!(format!("{err}").contains("sync.conflict_policy"));
}

#[test]
fn rejects_document_store_without_path() {
    let json5 = r#"{
        registry: { default_store: "docs" },
        stores: [{ name: "docs", role: "document" }],
    }"#;
    let err = MemsyncConfig::load_from_str(json5).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
}

#[test]
fn rejects_missing_default_store() {
    let json5 = r#"{ stores: [{ name: "lmdb", role: "key_value" }] }"#;
    let err = MemsyncConfig::load_from_str(json5).unwrap_err();
    assert!(format!("{err}").contains("tinydb"));
}

#[test]
fn rejects_out_of_range_backoff_multiplier() {
    for multiplier in ["1e300", "0.5"] {
        let json5 = format!("{{ retry: {{ backoff_multiplier: {multiplier} }} }}");
        let err = MemsyncConfig::load_from_str(&json5).unwrap_err();
        assert!(format!("{err}").contains("backoff_multiplier"), "{multiplier}: {err}");
    }
    let config = MemsyncConfig::load_from_str("{ retry: { backoff_multiplier: 100 } }")
        .expect("upper bound accepted");
    assert_eq!(config.retry.backoff_multiplier, 100.0);
}

#[test]
fn rejects_duplicate_store_names() {
    let json5 = r#"{
        registry: { default_store: "lmdb" },
        stores: [
            { name: "lmdb", role: "key_value" },
            { name: "lmdb", role: "graph" },
        ],
    }"#;
    let err = MemsyncConfig::load_from_str(json5).unwrap_err();
    assert!(matches!(err, ConfigError::DuplicateStore(name) if name == "lmdb"));
}

#[test]
fn layered_config_prefers_repo_over_cwd() {
    let (temp, project_root, cwd) = project();
    let root = temp.path();

    let system_config = root.join("system.json5");
    write_json5(&system_config, "{ sync: { hub: \"system\" } }");
    let user_config = root.join("user.json5");
    write_json5(&user_config, "{ sync: { hub: \"user\" } }");
    write_json5(
        &project_root.join(DEFAULT_CONFIG_FILE),
        "{ sync: { hub: \"project\" } }",
    );
    write_json5(&cwd.join(DEFAULT_CONFIG_FILE), "{ sync: { hub: \"cwd\" } }");
    write_json5(
        &project_root
            .join(DEFAULT_CONFIG_DIR)
            .join(DEFAULT_CONFIG_FILE),
        "{ sync: { hub: \"repo\" } }",
    );

    let mut options = LayeredConfigOptions::isolated(&cwd);
    options.system_config_path = Some(system_config);
    options.user_config_path = Some(user_config);

    let layered = MemsyncConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.sync.hub, "repo");
    let sources: Vec<_> = layered.layers.iter().map(|layer| layer.source).collect();
    assert_eq!(
        sources,
        vec![
            ConfigLayerSource::System,
            ConfigLayerSource::User,
            ConfigLayerSource::Project,
            ConfigLayerSource::Cwd,
            ConfigLayerSource::Repo,
        ]
    );
}

#[test]
fn cwd_at_project_root_is_loaded_once() {
    let (_temp, project_root, _cwd) = project();
    write_json5(
        &project_root.join(DEFAULT_CONFIG_FILE),
        "{ router: { default_limit: 9 } }",
    );
    let layered =
        MemsyncConfig::load_layered_with_options(LayeredConfigOptions::isolated(&project_root))
            .expect("layered");
    assert_eq!(layered.config.router.default_limit, 9);
    assert_eq!(layered.layers.len(), 1);
    assert_eq!(layered.layers[0].source, ConfigLayerSource::Project);
}

#[test]
fn requirements_lock_overrides() {
    let (temp, _project_root, cwd) = project();
    let root = temp.path();

    let system_config = root.join("system.json5");
    write_json5(&system_config, "{ sync: { hub: \"system\" } }");
    let requirements = root.join("requirements.json5");
    write_json5(&requirements, "{ sync: { hub: \"locked\" } }");
    let runtime_config = root.join("runtime.json5");
    write_json5(
        &runtime_config,
        "{ sync: { hub: \"runtime\", conflict_log_limit: 8 } }",
    );

    let mut options = LayeredConfigOptions::isolated(&cwd).with_runtime_path(&runtime_config);
    options.system_config_path = Some(system_config);
    options.requirements_path = Some(requirements);

    let layered = MemsyncConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.sync.hub, "locked");
    assert_eq!(layered.config.sync.conflict_log_limit, 8);
}

#[test]
fn constraints_prevent_list_override() {
    let (temp, project_root, _cwd) = project();
    let root = temp.path();

    let requirements = root.join("requirements.json5");
    write_json5(&requirements, "{ sync: { primaries: [\"lmdb\"] } }");
    let runtime_config = root.join("runtime.json5");
    write_json5(&runtime_config, "{ sync: { primaries: [\"faiss\"] } }");

    let mut options = LayeredConfigOptions::isolated(&project_root).with_runtime_path(&runtime_config);
    options.requirements_path = Some(requirements);

    let layered = MemsyncConfig::load_layered_with_options(options).expect("layered");
    assert_eq!(layered.config.sync.primaries, vec!["lmdb".to_string()]);
}

#[test]
fn missing_runtime_layer_is_an_error() {
    let (temp, project_root, _cwd) = project();
    let options = LayeredConfigOptions::isolated(&project_root)
        .with_runtime_path(temp.path().join("absent.json5"));
    let err = MemsyncConfig::load_layered_with_options(options).unwrap_err();
    assert!(matches!(err, ConfigError::ReadFailed(_)));
}

#[test]
fn schema_errors_name_the_layer() {
    let (temp, project_root, _cwd) = project();
    let runtime_config = temp.path().join("runtime.json5");
    write_json5(&runtime_config, "{ retry: { jitter: \"yes\" } }");
    let options = LayeredConfigOptions::isolated(&project_root).with_runtime_path(&runtime_config);
    let err = MemsyncConfig::load_layered_with_options(options).unwrap_err();
    let msg = format!("{err}");
    assert!(msg.contains("runtime("));
    assert!(msg.contains("retry.jitter"));
}
