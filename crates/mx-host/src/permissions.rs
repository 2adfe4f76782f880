//! The permission enforcer.
//!
//! A [`PermissionProfile`] is resolved from a plugin's manifest at
//! registration time — never from ambient state at call time. The
//! profile expands the manifest's `${...}` path templates into a
//! concrete read/read-write allowlist, and [`PermissionGuard`] wraps
//! every registered provider so that a call touching a path outside
//! the allowlist is denied before it reaches the plugin.
//!
//! Checks are always made against the *owning* plugin's declared
//! permissions, not the caller's ambient privileges.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mx_broker::Provider;
use mx_core::{AuditEvent, AuditRecord, AuditSink, CallError, CallOutcome, CapabilityCall, PluginId};
use mx_plugins::{FilesystemAccess, PluginManifest};

/// A plugin's declared permissions resolved to concrete guards.
#[derive(Debug, Clone)]
pub struct PermissionProfile {
    plugin_id: PluginId,
    filesystem: FilesystemAccess,
    read_roots: Vec<PathBuf>,
    write_roots: Vec<PathBuf>,
    network: bool,
    gpu: bool,
    raw_input: bool,
}

impl PermissionProfile {
    /// Resolve a manifest's permissions into concrete path roots.
    ///
    /// `plugin_dir` is the install directory, `run_dir` the plugin's
    /// private run directory, and `data_dir` the kernel data root —
    /// the three template variables a `filesystem_policy` may use.
    ///
    /// The run directory is always read-write: every host owns its own
    /// scratch space. Everything else follows the declared access
    /// level: `none` grants nothing further, `read` grants the install
    /// directory and the policy's read templates, `read_write`
    /// additionally grants the policy's read-write templates.
    #[must_use]
    pub fn resolve(
        manifest: &PluginManifest,
        plugin_dir: &Path,
        run_dir: &Path,
        data_dir: &Path,
    ) -> Self {
        let expand = |template: &String| expand_template(template, plugin_dir, run_dir, data_dir);

        let mut read_roots = vec![run_dir.to_path_buf()];
        let mut write_roots = vec![run_dir.to_path_buf()];

        match manifest.permissions.filesystem {
            FilesystemAccess::None => {},
            FilesystemAccess::Read => {
                read_roots.push(plugin_dir.to_path_buf());
                read_roots.extend(manifest.filesystem_policy.read.iter().map(expand));
            },
            FilesystemAccess::ReadWrite => {
                read_roots.push(plugin_dir.to_path_buf());
                read_roots.extend(manifest.filesystem_policy.read.iter().map(expand));
                let writable: Vec<PathBuf> = manifest
                    .filesystem_policy
                    .read_write
                    .iter()
                    .map(expand)
                    .collect();
                read_roots.extend(writable.iter().cloned());
                write_roots.extend(writable);
            },
        }

        Self {
            plugin_id: manifest.plugin_id.clone(),
            filesystem: manifest.permissions.filesystem,
            read_roots,
            write_roots,
            network: manifest.permissions.network,
            gpu: manifest.permissions.gpu,
            raw_input: manifest.permissions.raw_input,
        }
    }

    /// The owning plugin.
    #[must_use]
    pub const fn plugin_id(&self) -> &PluginId {
        &self.plugin_id
    }

    /// The declared filesystem access level.
    #[must_use]
    pub const fn filesystem(&self) -> FilesystemAccess {
        self.filesystem
    }

    /// Whether the plugin holds the network grant.
    #[must_use]
    pub const fn network(&self) -> bool {
        self.network
    }

    /// GPU flag, carried through unmodified.
    #[must_use]
    pub const fn gpu(&self) -> bool {
        self.gpu
    }

    /// Raw-input flag, carried through unmodified.
    #[must_use]
    pub const fn raw_input(&self) -> bool {
        self.raw_input
    }

    /// Roots the plugin may read.
    #[must_use]
    pub fn read_roots(&self) -> &[PathBuf] {
        &self.read_roots
    }

    /// Roots the plugin may write.
    #[must_use]
    pub fn write_roots(&self) -> &[PathBuf] {
        &self.write_roots
    }

    /// Check one path against the read allowlist.
    ///
    /// # Errors
    ///
    /// Returns the denial reason if the path is relative, contains
    /// `..`, or falls outside every allowed root.
    pub fn check_path(&self, path: &Path) -> Result<(), String> {
        if !path.is_absolute() {
            return Err(format!("path '{}' is not absolute", path.display()));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("path '{}' contains '..'", path.display()));
        }
        if self.read_roots.iter().any(|root| path.starts_with(root)) {
            Ok(())
        } else {
            Err(format!(
                "path '{}' is outside the allowed roots for '{}'",
                path.display(),
                self.plugin_id
            ))
        }
    }

    /// Check a call's declared filesystem paths.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::PermissionDenied`] naming the first path
    /// that falls outside the allowlist.
    pub fn check_call(&self, call: &CapabilityCall) -> Result<(), CallError> {
        for path in &call.fs_paths {
            if let Err(reason) = self.check_path(path) {
                return Err(CallError::PermissionDenied {
                    plugin_id: self.plugin_id.to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// Expand the `${plugin_dir}`, `${run_dir}`, and `${data_dir}` template
/// variables in a policy path.
fn expand_template(template: &str, plugin_dir: &Path, run_dir: &Path, data_dir: &Path) -> PathBuf {
    let expanded = template
        .replace("${plugin_dir}", &plugin_dir.display().to_string())
        .replace("${run_dir}", &run_dir.display().to_string())
        .replace("${data_dir}", &data_dir.display().to_string());
    PathBuf::from(expanded)
}

/// Wraps a provider with its owner's permission profile.
pub struct PermissionGuard {
    profile: Arc<PermissionProfile>,
    inner: Arc<dyn Provider>,
    audit: Arc<dyn AuditSink>,
}

impl PermissionGuard {
    /// Wrap a provider.
    #[must_use]
    pub fn new(
        profile: Arc<PermissionProfile>,
        inner: Arc<dyn Provider>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            profile,
            inner,
            audit,
        }
    }
}

#[async_trait]
impl Provider for PermissionGuard {
    async fn call(&self, call: CapabilityCall) -> CallOutcome {
        if let Err(error) = self.profile.check_call(&call) {
            let reason = match &error {
                CallError::PermissionDenied { reason, .. } => reason.clone(),
                other => other.to_string(),
            };
            debug!(
                plugin_id = %self.profile.plugin_id(),
                capability = %call.capability,
                reason = %reason,
                "permission denied"
            );
            self.audit
                .record(AuditRecord::new(AuditEvent::PermissionDenied {
                    plugin_id: self.profile.plugin_id().clone(),
                    capability: call.capability.clone(),
                    reason,
                }))
                .await;
            return Err(error);
        }
        self.inner.call(call).await
    }
}

impl std::fmt::Debug for PermissionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGuard")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}
