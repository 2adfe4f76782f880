//! Config file discovery and layered loading.
//!
//! The `load` algorithm:
//! 1. Parse embedded `defaults.toml` → base
//! 2. Merge `/etc/mx/config.toml` (system)
//! 3. Snapshot the merge so far — this is the *trusted* view
//! 4. Merge `~/.mx/config.toml` (user) — this is the *full* view
//! 5. Deserialize and validate both views
//!
//! Safe mode evaluates policy against the trusted view, so a user-layer
//! override can never widen what a safe-mode boot admits, regardless of
//! merge order.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::types::KernelConfig;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// The merged configuration, retaining both trust views.
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    /// Defaults + system + user.
    full: KernelConfig,
    /// Defaults + system only.
    trusted: KernelConfig,
    /// Paths of the files that contributed, in merge order.
    loaded_files: Vec<PathBuf>,
}

impl LayeredConfig {
    /// The configuration a normal-mode boot uses.
    #[must_use]
    pub fn full(&self) -> &KernelConfig {
        &self.full
    }

    /// The configuration a safe-mode boot uses (user layer ignored).
    #[must_use]
    pub fn trusted(&self) -> &KernelConfig {
        &self.trusted
    }

    /// The view appropriate for the given boot mode.
    #[must_use]
    pub fn effective(&self, safe_mode: bool) -> &KernelConfig {
        if safe_mode { &self.trusted } else { &self.full }
    }

    /// Files that contributed to the merge, in order.
    #[must_use]
    pub fn loaded_files(&self) -> &[PathBuf] {
        &self.loaded_files
    }

    /// Build a layered config directly from a single [`KernelConfig`]
    /// used for both views (tests, embedded callers).
    #[must_use]
    pub fn from_single(config: KernelConfig) -> Self {
        Self {
            trusted: config.clone(),
            full: config,
            loaded_files: Vec::new(),
        }
    }
}

/// Load configuration from the standard locations.
///
/// `home_override` replaces the user's home directory during discovery
/// (used by tests and by `MX_HOME`).
///
/// # Errors
///
/// Returns a [`ConfigError`] if any present file is malformed or the
/// merged result fails validation.
pub fn load(home_override: Option<&Path>) -> ConfigResult<LayeredConfig> {
    let home = home_override.map_or_else(
        || PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())),
        Path::to_path_buf,
    );
    load_from_dirs(Path::new("/etc/mx"), &home.join(".mx"))
}

/// Load configuration from explicit system and user directories.
///
/// Each directory contributes its `config.toml` if present.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any present file is malformed or the
/// merged result fails validation.
pub fn load_from_dirs(system_dir: &Path, user_dir: &Path) -> ConfigResult<LayeredConfig> {
    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|source| ConfigError::Parse {
            path: "<embedded defaults>".to_string(),
            source,
        })?;
    let mut loaded_files = Vec::new();

    let system_path = system_dir.join("config.toml");
    if let Some(overlay) = try_load_file(&system_path)? {
        deep_merge(&mut merged, overlay);
        info!(path = %system_path.display(), "loaded system config");
        loaded_files.push(system_path);
    }

    // Everything up to here is operator-controlled.
    let trusted = deserialize(&merged)?;

    let user_path = user_dir.join("config.toml");
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge(&mut merged, overlay);
        info!(path = %user_path.display(), "loaded user config");
        loaded_files.push(user_path);
    }

    let full = deserialize(&merged)?;

    trusted.validate()?;
    full.validate()?;

    Ok(LayeredConfig {
        full,
        trusted,
        loaded_files,
    })
}

fn deserialize(value: &toml::Value) -> ConfigResult<KernelConfig> {
    value
        .clone()
        .try_into()
        .map_err(|source| ConfigError::Parse {
            path: "<merged config>".to_string(),
            source,
        })
}

/// Read and parse a TOML file, returning `None` if it does not exist.
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        },
    };
    let value = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(value))
}

/// Recursively merge `overlay` into `base`.
///
/// Tables merge key-by-key; every other value (including arrays)
/// replaces the base wholesale.
fn deep_merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        },
        (base_slot, overlay_value) => *base_slot = overlay_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, content: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("config.toml"), content).unwrap();
    }

    #[test]
    fn defaults_load_without_files() {
        let tmp = tempfile::tempdir().unwrap();
        let layered =
            load_from_dirs(&tmp.path().join("etc"), &tmp.path().join("home/.mx")).unwrap();
        assert!(layered.loaded_files().is_empty());
        assert_eq!(layered.full().supervisor.failure_threshold, 3);
        assert_eq!(layered.full(), layered.trusted());
    }

    #[test]
    fn user_layer_merges_into_full_only() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("home/.mx");
        write_config(
            &user_dir,
            "[plugins]\nallowlist = [\"thirdparty.plugin\"]\n",
        );

        let layered = load_from_dirs(&tmp.path().join("etc"), &user_dir).unwrap();

        let third = mx_core::PluginId::from_static("thirdparty.plugin");
        assert!(layered.full().plugins.allowlist.contains(&third));
        assert!(!layered.trusted().plugins.allowlist.contains(&third));
        assert!(layered.effective(true).plugins.allowlist.len() > 1);
    }

    #[test]
    fn system_layer_is_trusted() {
        let tmp = tempfile::tempdir().unwrap();
        let system_dir = tmp.path().join("etc");
        write_config(
            &system_dir,
            "[supervisor]\nfailure_threshold = 5\n",
        );

        let layered = load_from_dirs(&system_dir, &tmp.path().join("home/.mx")).unwrap();
        assert_eq!(layered.trusted().supervisor.failure_threshold, 5);
        assert_eq!(layered.full().supervisor.failure_threshold, 5);
    }

    #[test]
    fn malformed_user_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("home/.mx");
        write_config(&user_dir, "not = [valid");

        let result = load_from_dirs(&tmp.path().join("etc"), &user_dir);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn user_cannot_widen_network_allowlist_invalidly() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("home/.mx");
        write_config(
            &user_dir,
            "[plugins]\nnetwork_allowlist = [\"thirdparty.plugin\"]\n",
        );

        // Validation fails closed on the full view.
        let result = load_from_dirs(&tmp.path().join("etc"), &user_dir);
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn arrays_replace_rather_than_append() {
        let tmp = tempfile::tempdir().unwrap();
        let user_dir = tmp.path().join("home/.mx");
        write_config(&user_dir, "[plugins]\nallowlist = [\"builtin.ocr\"]\n");

        let layered = load_from_dirs(&tmp.path().join("etc"), &user_dir).unwrap();
        assert_eq!(layered.full().plugins.allowlist.len(), 1);
    }
}
