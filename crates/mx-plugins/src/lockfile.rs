//! The plugin lockfile: the pinned trust anchor for plugin content.
//!
//! `plugins.lock` maps each plugin id to the manifest and artifact
//! digests the operator pinned at install time. During boot the
//! recomputed digests of every discovered plugin are checked against
//! this table; an absent entry or a mismatched digest excludes the
//! plugin from loading regardless of its own `enabled` flag. This is a
//! fail-closed invariant, never a warning.
//!
//! # Format
//!
//! TOML with `schema_version = 1` and a flat `[[plugin]]` array of
//! [`LockedPlugin`] entries.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use mx_core::{PluginId, Version};

use crate::error::{PluginError, PluginResult};

/// Current lockfile schema version.
const SCHEMA_VERSION: u32 = 1;

/// The pinned plugin trust table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginLock {
    /// Schema version for forward compatibility.
    schema_version: u32,
    /// Locked plugin entries.
    #[serde(default, rename = "plugin")]
    entries: Vec<LockedPlugin>,
}

/// A single locked plugin entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPlugin {
    /// Unique plugin identifier.
    pub id: PluginId,
    /// Plugin version at lock time.
    pub version: Version,
    /// Expected manifest digest (`blake3:<hex>`).
    pub manifest_digest: String,
    /// Expected artifact digest (`blake3:<hex>`).
    pub artifact_digest: String,
    /// When the entry was pinned.
    pub locked_at: DateTime<Utc>,
}

/// Outcome of checking one plugin's recomputed digests against the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashCheck {
    /// Both digests match the pinned entry.
    Verified,
    /// The plugin has no entry in the lockfile.
    Unlocked,
    /// A recomputed digest differs from the pinned one.
    Mismatch {
        /// Digest recorded in the lockfile.
        expected: String,
        /// Digest computed from disk.
        actual: String,
    },
}

impl HashCheck {
    /// Whether the plugin may load.
    #[must_use]
    pub const fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

impl PluginLock {
    /// Create an empty lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            entries: Vec::new(),
        }
    }

    /// Load a lockfile from disk.
    ///
    /// Acquires a shared (read) lock on the file itself so concurrent
    /// lock writers (installers) cannot produce a torn read.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if the file cannot be read or
    /// parsed, and [`PluginError::LockfileSchema`] for an unknown schema
    /// version.
    pub fn load(path: &Path) -> PluginResult<Self> {
        let file = std::fs::File::open(path).map_err(|e| PluginError::Lockfile {
            path: path.to_path_buf(),
            message: format!("failed to open lockfile: {e}"),
        })?;
        fs2::FileExt::lock_shared(&file).map_err(|e| PluginError::Lockfile {
            path: path.to_path_buf(),
            message: format!("failed to lock lockfile: {e}"),
        })?;
        let result = std::fs::read_to_string(path);
        let _ = fs2::FileExt::unlock(&file);

        let content = result.map_err(|e| PluginError::Lockfile {
            path: path.to_path_buf(),
            message: format!("failed to read lockfile: {e}"),
        })?;
        Self::parse(path, &content)
    }

    /// Load a lockfile, returning an empty lock if the file is absent.
    ///
    /// An empty lock rejects everything, so a missing lockfile fails
    /// closed rather than open.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> PluginResult<Self> {
        match std::fs::metadata(path) {
            Ok(_) => Self::load(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no lockfile; all plugins will be rejected");
                Ok(Self::new())
            },
            Err(e) => Err(PluginError::Lockfile {
                path: path.to_path_buf(),
                message: format!("failed to stat lockfile: {e}"),
            }),
        }
    }

    /// Parse lockfile content.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] on malformed TOML and
    /// [`PluginError::LockfileSchema`] on an unsupported schema version.
    pub fn parse(path: &Path, content: &str) -> PluginResult<Self> {
        let lock: Self = toml::from_str(content).map_err(|e| PluginError::Lockfile {
            path: path.to_path_buf(),
            message: format!("failed to parse lockfile: {e}"),
        })?;
        if lock.schema_version != SCHEMA_VERSION {
            return Err(PluginError::LockfileSchema {
                path: path.to_path_buf(),
                found: lock.schema_version,
            });
        }
        Ok(lock)
    }

    /// Look up the entry for a plugin.
    #[must_use]
    pub fn entry(&self, id: &PluginId) -> Option<&LockedPlugin> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Check recomputed digests against the pinned entry for `id`.
    ///
    /// The manifest digest is compared first; the first mismatch wins.
    #[must_use]
    pub fn check(&self, id: &PluginId, manifest_digest: &str, artifact_digest: &str) -> HashCheck {
        let Some(entry) = self.entry(id) else {
            return HashCheck::Unlocked;
        };
        if entry.manifest_digest != manifest_digest {
            return HashCheck::Mismatch {
                expected: entry.manifest_digest.clone(),
                actual: manifest_digest.to_string(),
            };
        }
        if entry.artifact_digest != artifact_digest {
            return HashCheck::Mismatch {
                expected: entry.artifact_digest.clone(),
                actual: artifact_digest.to_string(),
            };
        }
        HashCheck::Verified
    }

    /// Add or replace an entry (used by installers and tests).
    pub fn pin(&mut self, entry: LockedPlugin) {
        self.entries.retain(|e| e.id != entry.id);
        self.entries.push(entry);
    }

    /// Number of pinned entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the lock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Lockfile`] if serialization fails.
    pub fn to_toml(&self) -> PluginResult<String> {
        toml::to_string_pretty(self).map_err(|e| PluginError::Lockfile {
            path: std::path::PathBuf::from("<memory>"),
            message: format!("failed to serialize lockfile: {e}"),
        })
    }
}

impl Default for PluginLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &'static str, manifest: &str, artifact: &str) -> LockedPlugin {
        LockedPlugin {
            id: PluginId::from_static(id),
            version: Version::new(1, 0, 0),
            manifest_digest: manifest.to_string(),
            artifact_digest: artifact.to_string(),
            locked_at: Utc::now(),
        }
    }

    #[test]
    fn check_verifies_matching_digests() {
        let mut lock = PluginLock::new();
        lock.pin(entry("builtin.ocr", "blake3:aa", "blake3:bb"));

        let id = PluginId::from_static("builtin.ocr");
        assert_eq!(
            lock.check(&id, "blake3:aa", "blake3:bb"),
            HashCheck::Verified
        );
    }

    #[test]
    fn check_flags_mismatch() {
        let mut lock = PluginLock::new();
        lock.pin(entry("mx.core.egress_gateway", "blake3:h1", "blake3:h1"));

        let id = PluginId::from_static("mx.core.egress_gateway");
        let check = lock.check(&id, "blake3:h1", "blake3:h2");
        assert!(matches!(check, HashCheck::Mismatch { ref expected, ref actual }
            if expected == "blake3:h1" && actual == "blake3:h2"));
        assert!(!check.is_verified());
    }

    #[test]
    fn absent_entry_is_unlocked() {
        let lock = PluginLock::new();
        let id = PluginId::from_static("thirdparty.plugin");
        assert_eq!(lock.check(&id, "blake3:aa", "blake3:bb"), HashCheck::Unlocked);
    }

    #[test]
    fn pin_replaces_existing_entry() {
        let mut lock = PluginLock::new();
        lock.pin(entry("builtin.ocr", "blake3:aa", "blake3:bb"));
        lock.pin(entry("builtin.ocr", "blake3:cc", "blake3:dd"));
        assert_eq!(lock.len(), 1);
        let id = PluginId::from_static("builtin.ocr");
        assert_eq!(lock.entry(&id).unwrap().manifest_digest, "blake3:cc");
    }

    #[test]
    fn round_trips_through_toml() {
        let mut lock = PluginLock::new();
        lock.pin(entry("builtin.ocr", "blake3:aa", "blake3:bb"));
        lock.pin(entry("builtin.journal", "blake3:cc", "blake3:dd"));

        let toml_str = lock.to_toml().unwrap();
        let reparsed = PluginLock::parse(Path::new("plugins.lock"), &toml_str).unwrap();
        assert_eq!(reparsed.len(), 2);
        assert!(reparsed.entry(&PluginId::from_static("builtin.ocr")).is_some());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let content = "schema_version = 99\n";
        let err = PluginLock::parse(Path::new("plugins.lock"), content).unwrap_err();
        assert!(matches!(err, PluginError::LockfileSchema { found: 99, .. }));
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let lock = PluginLock::load_or_default(&dir.path().join("plugins.lock")).unwrap();
        assert!(lock.is_empty());
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.lock");

        let mut lock = PluginLock::new();
        lock.pin(entry("builtin.ocr", "blake3:aa", "blake3:bb"));
        std::fs::write(&path, lock.to_toml().unwrap()).unwrap();

        let loaded = PluginLock::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
