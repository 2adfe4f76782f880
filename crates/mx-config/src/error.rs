//! Configuration error types.

use std::path::PathBuf;

/// Errors from configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A config file could not be parsed as TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the file (or `<embedded defaults>`).
        path: String,
        /// The underlying TOML error.
        source: toml::de::Error,
    },

    /// The merged configuration failed validation.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
