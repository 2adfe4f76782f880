//! Shared fixtures for kernel boot tests.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tempfile::TempDir;

use mx_config::{KernelConfig, LayeredConfig};
use mx_core::{PluginId, Version};
use mx_kernel::BootOptions;
use mx_plugins::lockfile::{LockedPlugin, PluginLock};
use mx_plugins::{hash, LOCKFILE_NAME, MANIFEST_FILE_NAME};

/// A disposable kernel environment: plugin root, lockfile, run/data dirs.
pub struct Fixture {
    root: TempDir,
    lock: PluginLock,
}

impl Fixture {
    pub fn new() -> Self {
        // One subscriber per test binary; later calls are no-ops.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
        Self {
            root: tempfile::tempdir().unwrap(),
            lock: PluginLock::new(),
        }
    }

    pub fn plugin_root(&self) -> PathBuf {
        self.root.path().join("plugins")
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.root.path().join(LOCKFILE_NAME)
    }

    /// Write a plugin directory with a host script and manifest.
    ///
    /// `capability` is the capability entrypoint id; `host_script` is
    /// the shell body of `bin/host`; `manifest_extra` is appended TOML
    /// (tables such as `[permissions]` overrides must be complete).
    pub fn write_plugin(
        &self,
        id: &str,
        capability: &str,
        host_script: &str,
        permissions_toml: &str,
        manifest_extra: &str,
    ) -> PathBuf {
        let dir = self.plugin_root().join(id);
        std::fs::create_dir_all(dir.join("bin")).unwrap();

        let script = format!("#!/bin/sh\n{host_script}\n");
        let host_path = dir.join("bin/host");
        std::fs::write(&host_path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&host_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        // `manifest_extra` sits in the top-level zone so bare keys like
        // `depends_on` parse as manifest fields, not lock-table keys.
        let manifest = format!(
            r#"
plugin_id = "{id}"
version = "1.0.0"
enabled = true
{manifest_extra}

[[entrypoints]]
kind = "capability"
id = "{capability}"
path = "bin/host"
callable = "serve"

{permissions_toml}

[compat]
requires_kernel = "0.1.0"
requires_schema_versions = [1]

[hash_lock]
manifest_sha256 = "blake3:self"
artifact_sha256 = "blake3:self"
"#
        );
        std::fs::write(dir.join(MANIFEST_FILE_NAME), manifest).unwrap();
        dir
    }

    /// Pin a plugin's real on-disk digests into the lockfile.
    pub fn lock_plugin(&mut self, id: &str) {
        let dir = self.plugin_root().join(id);
        let manifest_bytes = std::fs::read(dir.join(MANIFEST_FILE_NAME)).unwrap();
        self.lock.pin(LockedPlugin {
            id: PluginId::new(id).unwrap(),
            version: Version::new(1, 0, 0),
            manifest_digest: hash::hash_manifest_bytes(&manifest_bytes),
            artifact_digest: hash::hash_artifact_tree(&dir).unwrap(),
            locked_at: Utc::now(),
        });
        self.flush_lock();
    }

    /// Pin a plugin with a deliberately wrong artifact digest.
    pub fn lock_plugin_with_bad_digest(&mut self, id: &str) {
        let dir = self.plugin_root().join(id);
        let manifest_bytes = std::fs::read(dir.join(MANIFEST_FILE_NAME)).unwrap();
        self.lock.pin(LockedPlugin {
            id: PluginId::new(id).unwrap(),
            version: Version::new(1, 0, 0),
            manifest_digest: hash::hash_manifest_bytes(&manifest_bytes),
            artifact_digest: "blake3:h1".to_string(),
            locked_at: Utc::now(),
        });
        self.flush_lock();
    }

    fn flush_lock(&self) {
        std::fs::write(self.lockfile_path(), self.lock.to_toml().unwrap()).unwrap();
    }

    /// A config whose allowlist and default pack are the given ids.
    pub fn config(&self, allowlist: &[&str], default_pack: &[&str]) -> KernelConfig {
        let mut config = KernelConfig::default();
        config.plugins.allowlist = to_ids(allowlist);
        config.plugins.default_pack = to_ids(default_pack);
        config
            .plugins
            .network_allowlist
            .insert(PluginId::new("builtin.egress.gateway").unwrap());
        config.supervisor.restart_backoff_ms = 10;
        config
    }

    /// Boot options over this fixture's directories.
    pub fn options(&self, config: KernelConfig) -> BootOptions {
        self.options_layered(LayeredConfig::from_single(config))
    }

    pub fn options_layered(&self, config: LayeredConfig) -> BootOptions {
        BootOptions {
            plugin_roots: vec![self.plugin_root()],
            lockfile_path: self.lockfile_path(),
            run_root: self.root.path().join("run"),
            data_dir: self.root.path().join("data"),
            safe_mode: false,
            config,
            kernel_version: Version::new(0, 1, 0),
            supported_schema_versions: BTreeSet::from([1]),
            inproc_providers: std::collections::BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }
}

fn to_ids(ids: &[&str]) -> BTreeSet<PluginId> {
    ids.iter().map(|s| PluginId::new(s).unwrap()).collect()
}

/// Default permissions block for test manifests.
pub const NO_PERMISSIONS: &str = "[permissions]";
