//! Schema validation for memsync JSON5 configuration.
//!
//! Runs on raw JSON before serde decoding so that unknown keys and wrong
//! types are reported with the layer and dotted path that caused them.

use super::SchemaMode;
use crate::ConfigError;
use memsync_store::{RecordKind, StoreRole};
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
pub(super) fn validate_layer_schema(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    let allowed = [
        "$schema",
        "registry",
        "stores",
        "sync",
        "propagation",
        "router",
        "retry",
    ];
    ensure_allowed_keys(map, &allowed, layer, "")?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("registry") {
        validate_registry(value, layer, "registry")?;
    }
    if let Some(value) = map.get("stores") {
        validate_stores(value, mode, layer, "stores")?;
    }
    if let Some(value) = map.get("sync") {
        validate_sync(value, layer, "sync")?;
    }
    if let Some(value) = map.get("propagation") {
        let map = expect_object(value, layer, "propagation")?;
        ensure_allowed_keys(map, &["async_mode", "fan_out"], layer, "propagation")?;
        if let Some(value) = map.get("async_mode") {
            expect_bool(value, layer, "propagation.async_mode")?;
        }
        if let Some(value) = map.get("fan_out") {
            expect_bool(value, layer, "propagation.fan_out")?;
        }
    }
    if let Some(value) = map.get("router") {
        validate_router(value, layer, "router")?;
    }
    if let Some(value) = map.get("retry") {
        validate_retry(value, layer, "retry")?;
    }

    Ok(())
}

fn validate_registry(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["default_store"], layer, path)?;
    if let Some(value) = map.get("default_store") {
        expect_string(value, layer, &join_path(path, "default_store"))?;
    }
    Ok(())
}

/// Validate the "stores" list.
fn validate_stores(
    value: &Value,
    mode: SchemaMode,
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    let entries = expect_array(value, layer, path)?;
    let mut names: Vec<&str> = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        let entry_path = format!("{path}[{idx}]");
        let name = validate_store(entry, layer, &entry_path)?;
        // The effective config reports duplicates through `validate`.
        if mode == SchemaMode::Partial && names.contains(&name) {
            return Err(invalid_field(
                layer,
                &join_path(&entry_path, "name"),
                "duplicate store name",
            ));
        }
        names.push(name);
    }
    Ok(())
}

/// Validate one store entry and return its name.
fn validate_store<'a>(value: &'a Value, layer: &str, path: &str) -> Result<&'a str, ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["name", "role", "kinds", "dimension", "path"], layer, path)?;

    let name_path = join_path(path, "name");
    let name = map
        .get("name")
        .ok_or_else(|| invalid_field(layer, &name_path, "missing required field"))?
        .as_str()
        .ok_or_else(|| invalid_field(layer, &name_path, "expected string"))?;

    let role_path = join_path(path, "role");
    let role = map
        .get("role")
        .ok_or_else(|| invalid_field(layer, &role_path, "missing required field"))?;
    validate_role(role, layer, &role_path)?;

    if let Some(value) = map.get("kinds") {
        let kinds_path = join_path(path, "kinds");
        let kinds = expect_array(value, layer, &kinds_path)?;
        for (idx, kind) in kinds.iter().enumerate() {
            let kind_path = format!("{kinds_path}[{idx}]");
            let Some(kind) = kind.as_str() else {
                return Err(invalid_field(layer, &kind_path, "expected string"));
            };
            if kind.parse::<RecordKind>().is_err() {
                return Err(invalid_field(layer, &kind_path, "unknown record kind"));
            }
        }
    }
    if let Some(value) = map.get("dimension") {
        expect_u64(value, layer, &join_path(path, "dimension"))?;
    }
    if let Some(value) = map.get("path") {
        expect_string(value, layer, &join_path(path, "path"))?;
    }
    Ok(name)
}

fn validate_role(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let Some(role) = value.as_str() else {
        return Err(invalid_field(layer, path, "expected string"));
    };
    if role.parse::<StoreRole>().is_ok() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "invalid store role"))
    }
}

/// Validate the "sync" block.
fn validate_sync(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["hub", "primaries", "conflict_policy", "conflict_log_limit"],
        layer,
        path,
    )?;
    if let Some(value) = map.get("hub") {
        expect_string(value, layer, &join_path(path, "hub"))?;
    }
    if let Some(value) = map.get("primaries") {
        validate_string_array(value, layer, &join_path(path, "primaries"))?;
    }
    if let Some(value) = map.get("conflict_policy") {
        let policy_path = join_path(path, "conflict_policy");
        match value.as_str() {
            Some("incoming_wins" | "newest_version") => {}
            Some(_) => return Err(invalid_field(layer, &policy_path, "invalid conflict policy")),
            None => return Err(invalid_field(layer, &policy_path, "expected string")),
        }
    }
    if let Some(value) = map.get("conflict_log_limit") {
        expect_u64(value, layer, &join_path(path, "conflict_log_limit"))?;
    }
    Ok(())
}

fn validate_router(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["federated_timeout_ms", "default_limit", "cache_cross_queries"],
        layer,
        path,
    )?;
    if let Some(value) = map.get("federated_timeout_ms") {
        expect_u64(value, layer, &join_path(path, "federated_timeout_ms"))?;
    }
    if let Some(value) = map.get("default_limit") {
        expect_u64(value, layer, &join_path(path, "default_limit"))?;
    }
    if let Some(value) = map.get("cache_cross_queries") {
        expect_bool(value, layer, &join_path(path, "cache_cross_queries"))?;
    }
    Ok(())
}

fn validate_retry(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "max_retries",
            "initial_backoff_ms",
            "backoff_multiplier",
            "max_backoff_ms",
            "jitter",
        ],
        layer,
        path,
    )?;
    for key in ["max_retries", "initial_backoff_ms", "max_backoff_ms"] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("backoff_multiplier") {
        expect_f64(value, layer, &join_path(path, "backoff_multiplier"))?;
    }
    if let Some(value) = map.get("jitter") {
        expect_bool(value, layer, &join_path(path, "jitter"))?;
    }
    Ok(())
}

fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    value
        .as_object()
        .ok_or_else(|| invalid_field(layer, path, "expected object"))
}

fn expect_array<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Vec<Value>, ConfigError> {
    value
        .as_array()
        .ok_or_else(|| invalid_field(layer, path, "expected array"))
}

fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::String(_) => Ok(()),
        _ => Err(invalid_field(layer, path, "expected string")),
    }
}

fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    match value {
        Value::Bool(_) => Ok(()),
        _ => Err(invalid_field(layer, path, "expected bool")),
    }
}

/// Non-negative integers only.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

fn expect_f64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_number() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected number"))
    }
}

fn validate_string_array(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let entries = expect_array(value, layer, path)?;
    for (idx, entry) in entries.iter().enumerate() {
        expect_string(entry, layer, &format!("{path}[{idx}]"))?;
    }
    Ok(())
}

fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    match map.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => Err(invalid_field(layer, &join_path(path, key), "unknown key")),
        None => Ok(()),
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Build an `InvalidField` error labelled `layer:path`.
fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{path}"),
        message: message.to_string(),
    }
}
