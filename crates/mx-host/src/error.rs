//! Hosting error types.
//!
//! Call-path failures are expressed as [`mx_core::CallError`]; this
//! enum covers host lifecycle failures that happen outside any single
//! call.

use std::path::PathBuf;

use mx_core::PluginId;

/// Errors from host lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The host executable could not be spawned.
    #[error("failed to spawn host for plugin '{plugin_id}': {source}")]
    Spawn {
        /// The plugin whose host failed to start.
        plugin_id: PluginId,
        /// The underlying error.
        source: std::io::Error,
    },

    /// The host executable is missing from the plugin directory.
    #[error("host executable not found for plugin '{plugin_id}': {path}")]
    ExecutableMissing {
        /// The plugin whose executable is missing.
        plugin_id: PluginId,
        /// The path that was expected.
        path: PathBuf,
    },

    /// The spawned child exposed no stdio pipes.
    #[error("host for plugin '{plugin_id}' has no stdio channel")]
    NoStdio {
        /// The plugin whose host is broken.
        plugin_id: PluginId,
    },

    /// The run directory could not be prepared.
    #[error("failed to prepare run directory {path}: {source}")]
    RunDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Result type for host lifecycle operations.
pub type HostResult<T> = Result<T, HostError>;
