//! Error types for memsync config loading and validation.

use thiserror::Error;

/// Errors returned while loading or validating config.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading a config file failed.
    #[error("failed to read config: {0}")]
    ReadFailed(#[from] std::io::Error),
    /// A layer is not valid JSON5.
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] json5::Error),
    /// The merged value does not decode into the schema.
    #[error("failed to decode config: {0}")]
    DecodeFailed(#[from] serde_json::Error),
    /// A specific field failed validation. `path` is `layer:dotted.path`.
    #[error("invalid config at {path}: {message}")]
    InvalidField { path: String, message: String },
    /// Two store entries share a name.
    #[error("duplicate store name: {0}")]
    DuplicateStore(String),
    /// Cross-field validation failure.
    #[error("invalid config: {0}")]
    Invalid(String),
}
