//! Configuration errors

use std::path::PathBuf;
use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating the daemon configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The YAML parsed but does not match the typed option sets
    #[error("invalid configuration structure: {0}")]
    Schema(#[source] serde_yaml::Error),

    #[error("secret '{key}' not found in {path}")]
    SecretNotFound { key: String, path: PathBuf },

    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    #[error("circular include of {path}")]
    CircularInclude { path: PathBuf },

    #[error("tag {tag} expects a string argument")]
    InvalidTagArgument { tag: String },

    /// One entry per violated constraint
    #[error("configuration validation failed: {}", .problems.join("; "))]
    Validation { problems: Vec<String> },

    #[error("unknown controller: {0}")]
    UnknownController(String),
}
