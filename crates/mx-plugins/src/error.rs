//! Plugin admission error types.

use std::path::PathBuf;

/// Errors from plugin discovery, hashing, and lockfile handling.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// Failed to parse a plugin manifest file.
    #[error("manifest parse error in {path}: {message}")]
    ManifestParse {
        /// Path to the manifest file.
        path: PathBuf,
        /// Parse error message.
        message: String,
    },

    /// A manifest parsed but violated a structural rule.
    #[error("invalid manifest in {path}: {message}")]
    ManifestInvalid {
        /// Path to the manifest file.
        path: PathBuf,
        /// What was wrong.
        message: String,
    },

    /// A symbolic link was found inside a plugin directory.
    ///
    /// Symlinks are rejected outright: following them would make the
    /// artifact hash depend on filesystem state outside the plugin tree.
    #[error("symlink rejected at {path}")]
    SymlinkRejected {
        /// The offending path.
        path: PathBuf,
    },

    /// Lockfile read/write/parse error.
    #[error("lockfile error at {path}: {message}")]
    Lockfile {
        /// Path to the lockfile.
        path: PathBuf,
        /// Error description.
        message: String,
    },

    /// The lockfile declares a schema version this kernel cannot read.
    #[error("unsupported lockfile schema version {found} at {path}")]
    LockfileSchema {
        /// Path to the lockfile.
        path: PathBuf,
        /// The declared schema version.
        found: u32,
    },

    /// I/O error while walking or reading a plugin directory.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The path being read.
        path: PathBuf,
        /// The underlying error.
        source: std::io::Error,
    },
}

/// Result type for plugin admission operations.
pub type PluginResult<T> = Result<T, PluginError>;
