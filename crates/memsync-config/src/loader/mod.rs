//! Layered configuration loader with requirement constraints.
//!
//! Discovers configuration layers (system, user, project, cwd, repo, runtime),
//! validates each against the schema, merges them under the optional
//! requirements layer and produces a final `MemsyncConfig`.

mod layer_io;
mod merge;
mod schema;
mod utils;

#[cfg(test)]
mod tests;

use crate::{ConfigError, MAX_BACKOFF_MULTIPLIER, MemsyncConfig, StoreConfig};
use log::{debug, info};
use memsync_store::StoreRole;
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Config filename looked up in local layers.
const DEFAULT_CONFIG_FILE: &str = "memsync.json5";
/// Config directory under the home directory and repo root.
const DEFAULT_CONFIG_DIR: &str = ".memsync";
/// Entries that mark a project root.
const DEFAULT_PROJECT_ROOT_MARKERS: &[&str] = &[".git"];

#[cfg(unix)]
const SYSTEM_CONFIG_PATH: &str = "/etc/memsync/memsync.json5";
#[cfg(unix)]
const SYSTEM_REQUIREMENTS_PATH: &str = "/etc/memsync/requirements.json5";
#[cfg(windows)]
const SYSTEM_CONFIG_PATH: &str = "C:\\ProgramData\\memsync\\memsync.json5";
#[cfg(windows)]
const SYSTEM_REQUIREMENTS_PATH: &str = "C:\\ProgramData\\memsync\\requirements.json5";

/// Effective config plus the layers it was merged from.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    pub config: MemsyncConfig,
    /// Layers that were found and applied, lowest precedence first.
    pub layers: Vec<ConfigLayer>,
}

/// Origin of a config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayerSource {
    /// Locked values no other layer may override.
    Requirements,
    System,
    User,
    /// `memsync.json5` at the project root.
    Project,
    /// `memsync.json5` in the working directory.
    Cwd,
    /// `.memsync/memsync.json5` at the project root.
    Repo,
    /// Explicit override files, applied last.
    Runtime,
}

impl ConfigLayerSource {
    fn label(&self) -> &'static str {
        match self {
            ConfigLayerSource::Requirements => "requirements",
            ConfigLayerSource::System => "system",
            ConfigLayerSource::User => "user",
            ConfigLayerSource::Project => "project",
            ConfigLayerSource::Cwd => "cwd",
            ConfigLayerSource::Repo => "repo",
            ConfigLayerSource::Runtime => "runtime",
        }
    }
}

/// A layer that contributed to the effective config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayer {
    pub source: ConfigLayerSource,
    pub path: PathBuf,
}

/// Schema validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaMode {
    /// A single layer; required fields may come from another layer.
    Partial,
    /// The merged effective config.
    Full,
}

/// Where to look for layers.
#[derive(Debug, Clone)]
pub struct LayeredConfigOptions {
    /// Working directory used to find local layers.
    pub cwd: PathBuf,
    pub system_config_path: Option<PathBuf>,
    pub user_config_path: Option<PathBuf>,
    pub requirements_path: Option<PathBuf>,
    /// Override files applied last, in order. Each must exist.
    pub runtime_paths: Vec<PathBuf>,
    pub project_root_markers: Vec<String>,
}

impl LayeredConfigOptions {
    /// Default layer locations for `cwd`.
    pub fn new(cwd: impl AsRef<Path>) -> Self {
        Self {
            cwd: cwd.as_ref().to_path_buf(),
            system_config_path: layer_io::default_system_config_path(),
            user_config_path: layer_io::default_user_config_path(),
            requirements_path: layer_io::default_requirements_path(),
            runtime_paths: Vec::new(),
            project_root_markers: DEFAULT_PROJECT_ROOT_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
        }
    }

    /// Only the given working directory; no system, user or requirements files.
    pub fn isolated(cwd: impl AsRef<Path>) -> Self {
        Self {
            system_config_path: None,
            user_config_path: None,
            requirements_path: None,
            ..Self::new(cwd)
        }
    }

    pub fn with_runtime_path(mut self, path: impl AsRef<Path>) -> Self {
        self.runtime_paths.push(path.as_ref().to_path_buf());
        self
    }
}

impl MemsyncConfig {
    /// Load one config file without layering.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        info!("loading config (path={})", path.as_ref().display());
        let contents = fs::read_to_string(path)?;
        let value: Value = json5::from_str(&contents)?;
        config_from_value(value, "config")
    }

    /// Load a config from JSON5 text without layering.
    pub fn load_from_str(contents: &str) -> Result<Self, ConfigError> {
        debug!("loading config from string (len={})", contents.len());
        let value: Value = json5::from_str(contents)?;
        config_from_value(value, "config")
    }

    /// Load the layered stack from the default locations.
    pub fn load_layered(cwd: impl AsRef<Path>) -> Result<LayeredConfig, ConfigError> {
        Self::load_layered_with_options(LayeredConfigOptions::new(cwd))
    }

    /// Load the layered stack.
    ///
    /// Precedence, lowest first: system, user, project, cwd, repo, runtime.
    /// Keys present in the requirements layer cannot be overridden.
    pub fn load_layered_with_options(
        options: LayeredConfigOptions,
    ) -> Result<LayeredConfig, ConfigError> {
        let cwd = utils::normalize_path(&options.cwd)?;
        let project_root = utils::find_project_root(&cwd, &options.project_root_markers);
        debug!(
            "resolving config layers (cwd={}, project_root={:?})",
            cwd.display(),
            project_root
        );

        let mut candidates: Vec<(ConfigLayerSource, PathBuf)> = Vec::new();
        if let Some(path) = &options.system_config_path {
            candidates.push((ConfigLayerSource::System, path.clone()));
        }
        if let Some(path) = &options.user_config_path {
            candidates.push((ConfigLayerSource::User, path.clone()));
        }
        if let Some(root) = &project_root {
            candidates.push((ConfigLayerSource::Project, root.join(DEFAULT_CONFIG_FILE)));
        }
        candidates.push((ConfigLayerSource::Cwd, cwd.join(DEFAULT_CONFIG_FILE)));
        if let Some(root) = &project_root {
            candidates.push((
                ConfigLayerSource::Repo,
                root.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE),
            ));
        }

        let mut layers = Vec::new();
        let requirements = layer_io::load_optional_layer(
            ConfigLayerSource::Requirements,
            options.requirements_path.as_deref(),
        )?;
        let constraints = requirements.as_ref().map(|layer| layer.value.clone());
        let mut merged = constraints
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        if let Some(layer) = requirements {
            layers.push(layer.meta);
        }

        // Project and cwd resolve to the same file when cwd is the root.
        let mut seen = HashSet::new();
        for (source, path) in candidates {
            if !seen.insert(utils::unique_path(&path)) {
                debug!(
                    "skipping duplicate layer (source={:?}, path={})",
                    source,
                    path.display()
                );
                continue;
            }
            if let Some(layer) = layer_io::load_optional_layer(source, Some(&path))? {
                merge::merge_json_with_constraints(&mut merged, &layer.value, constraints.as_ref());
                layers.push(layer.meta);
            }
        }
        for path in &options.runtime_paths {
            let layer = layer_io::load_required_layer(ConfigLayerSource::Runtime, path)?;
            merge::merge_json_with_constraints(&mut merged, &layer.value, constraints.as_ref());
            layers.push(layer.meta);
        }

        let config = config_from_value(merged, "effective")?;
        info!(
            "layered config loaded (layers={}, stores={})",
            layers.len(),
            config.stores.len()
        );
        Ok(LayeredConfig { config, layers })
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for store in &self.stores {
            if !names.insert(store.name.as_str()) {
                return Err(ConfigError::DuplicateStore(store.name.clone()));
            }
            validate_store(store)?;
        }

        if !self.stores.is_empty() && self.store(&self.registry.default_store).is_none() {
            return Err(ConfigError::Invalid(format!(
                "registry.default_store '{}' is not a configured store",
                self.registry.default_store
            )));
        }
        if self.router.federated_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "router.federated_timeout_ms must be positive".to_string(),
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&self.retry.backoff_multiplier) {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_multiplier must be between 1.0 and {MAX_BACKOFF_MULTIPLIER}"
            )));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_store(store: &StoreConfig) -> Result<(), ConfigError> {
    if store.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "store names must not be empty".to_string(),
        ));
    }
    if store.dimension == Some(0) {
        return Err(ConfigError::Invalid(format!(
            "store '{}' has zero embedding dimension",
            store.name
        )));
    }
    if store.role == StoreRole::Document && store.path.is_none() {
        return Err(ConfigError::Invalid(format!(
            "document store '{}' requires a path",
            store.name
        )));
    }
    Ok(())
}

/// A parsed layer and where it came from.
#[derive(Debug, Clone)]
struct LoadedLayer {
    meta: ConfigLayer,
    value: Value,
}

fn config_from_value(value: Value, label: &str) -> Result<MemsyncConfig, ConfigError> {
    schema::validate_layer_schema(&value, SchemaMode::Full, label)?;
    let config: MemsyncConfig = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}
