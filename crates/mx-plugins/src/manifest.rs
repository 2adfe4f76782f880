//! Plugin manifest types.
//!
//! A plugin manifest (`plugin.toml`) describes a plugin's identity,
//! entrypoints, permissions, compatibility requirements, and hash lock.
//! Manifests are loaded from disk during discovery and are immutable for
//! the lifetime of a boot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use mx_core::{CapabilityName, PluginId, Version};

use crate::error::PluginError;

/// A plugin manifest loaded from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier.
    pub plugin_id: PluginId,
    /// Semantic version of the plugin.
    pub version: Version,
    /// Whether the plugin wants to load at all.
    pub enabled: bool,
    /// How the plugin's functionality is reached, in declaration order.
    #[serde(rename = "entrypoints")]
    pub entrypoints: Vec<Entrypoint>,
    /// What the plugin may touch.
    pub permissions: Permissions,
    /// Kernel and schema compatibility requirements.
    pub compat: Compat,
    /// Plugins that must be admitted and loaded before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<PluginId>,
    /// Self-declared content digests.
    ///
    /// The external lockfile is the trust anchor; this block is the
    /// plugin author's declaration and is cross-checked only for
    /// diagnostics.
    pub hash_lock: HashLock,
    /// Capabilities this plugin calls through the broker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_capabilities: Vec<CapabilityName>,
    /// Explicit filesystem path grants.
    #[serde(default, skip_serializing_if = "FilesystemPolicy::is_empty")]
    pub filesystem_policy: FilesystemPolicy,
    /// JSON-schema-shaped description of the plugin's settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_schema: Option<toml::Value>,
    /// Default settings applied when the user provides none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_settings: Option<toml::Value>,
    /// Per-capability call contracts, keyed by capability name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub io_contracts: BTreeMap<CapabilityName, IoContract>,
}

/// One way into a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entrypoint {
    /// What the entrypoint provides.
    pub kind: EntrypointKind,
    /// For capability entrypoints, the capability name; otherwise a
    /// plugin-local identifier.
    pub id: String,
    /// Path of the host executable, relative to the plugin directory.
    pub path: PathBuf,
    /// Factory or serve function the host binary dispatches on.
    pub callable: String,
}

/// Category of an entrypoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrypointKind {
    /// Registers a provider in the capability registry.
    Capability,
    /// A background worker with no broker-visible surface.
    Service,
}

impl EntrypointKind {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Capability => "capability",
            Self::Service => "service",
        }
    }
}

/// Declared permissions. Absent fields default to the least privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
    /// Filesystem access level.
    #[serde(default)]
    pub filesystem: FilesystemAccess,
    /// Whether the plugin may be scheduled on the GPU.
    ///
    /// Carried through to the scheduling layer unmodified.
    #[serde(default)]
    pub gpu: bool,
    /// Whether the plugin may observe raw input events.
    ///
    /// Carried through to the sandboxing layer unmodified.
    #[serde(default)]
    pub raw_input: bool,
    /// Whether the plugin may create sockets.
    ///
    /// Only ever honoured for the egress gateway; any other plugin
    /// declaring this is rejected during admission.
    #[serde(default)]
    pub network: bool,
}

/// Filesystem access level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemAccess {
    /// No filesystem access beyond the plugin's own run directory.
    #[default]
    None,
    /// Read-only access to the resolved policy paths.
    Read,
    /// Read and write access to the resolved policy paths.
    ReadWrite,
}

/// Kernel and schema compatibility requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Compat {
    /// Minimum compatible kernel version.
    pub requires_kernel: Version,
    /// Storage schema versions the plugin understands.
    #[serde(default)]
    pub requires_schema_versions: BTreeSet<u32>,
}

/// Self-declared content digests, in `blake3:<hex>` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashLock {
    /// Digest of the manifest file.
    #[serde(rename = "manifest_sha256")]
    pub manifest_digest: String,
    /// Digest of the plugin's artifact tree.
    #[serde(rename = "artifact_sha256")]
    pub artifact_digest: String,
}

/// Explicit filesystem path grants with `${...}` templates.
///
/// Recognised variables: `${plugin_dir}` (the plugin's install
/// directory), `${run_dir}` (its private run directory), `${data_dir}`
/// (the kernel data root).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemPolicy {
    /// Path templates readable by the plugin.
    #[serde(default)]
    pub read: Vec<String>,
    /// Path templates readable and writable by the plugin.
    #[serde(default)]
    pub read_write: Vec<String>,
}

impl FilesystemPolicy {
    /// Whether no grants are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.read_write.is_empty()
    }
}

/// Per-capability call contract overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoContract {
    /// Provider priority when several plugins offer the same capability.
    /// Higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Cap on a single call payload for this capability, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload_bytes: Option<u64>,
}

impl PluginManifest {
    /// Parse a manifest from TOML text and validate its structure.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestParse`] if the TOML is malformed
    /// and [`PluginError::ManifestInvalid`] if a structural rule fails.
    pub fn parse(path: &std::path::Path, content: &str) -> Result<Self, PluginError> {
        let manifest: Self = toml::from_str(content).map_err(|e| PluginError::ManifestParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    /// Validate structural rules that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::ManifestInvalid`] if the manifest has no
    /// entrypoints, a capability entrypoint with an invalid capability
    /// name, an absolute or escaping entrypoint path, or depends on
    /// itself.
    pub fn validate(&self, path: &std::path::Path) -> Result<(), PluginError> {
        let invalid = |message: String| PluginError::ManifestInvalid {
            path: path.to_path_buf(),
            message,
        };

        if self.entrypoints.is_empty() {
            return Err(invalid("at least one entrypoint is required".into()));
        }
        for entrypoint in &self.entrypoints {
            if entrypoint.kind == EntrypointKind::Capability
                && CapabilityName::new(&entrypoint.id).is_err()
            {
                return Err(invalid(format!(
                    "capability entrypoint id '{}' is not a valid capability name",
                    entrypoint.id
                )));
            }
            if entrypoint.path.is_absolute() {
                return Err(invalid(format!(
                    "entrypoint path '{}' must be relative to the plugin directory",
                    entrypoint.path.display()
                )));
            }
            if entrypoint
                .path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(invalid(format!(
                    "entrypoint path '{}' must not escape the plugin directory",
                    entrypoint.path.display()
                )));
            }
            if entrypoint.callable.trim().is_empty() {
                return Err(invalid("entrypoint callable must not be empty".into()));
            }
        }
        if self.depends_on.contains(&self.plugin_id) {
            return Err(invalid("a plugin cannot depend on itself".into()));
        }
        Ok(())
    }

    /// Capability names this plugin provides, in declaration order.
    #[must_use]
    pub fn provided_capabilities(&self) -> Vec<CapabilityName> {
        self.entrypoints
            .iter()
            .filter(|e| e.kind == EntrypointKind::Capability)
            .filter_map(|e| CapabilityName::new(&e.id).ok())
            .collect()
    }

    /// The declared priority for one of this plugin's capabilities.
    #[must_use]
    pub fn priority_for(&self, capability: &CapabilityName) -> i32 {
        self.io_contracts
            .get(capability)
            .map_or(0, |contract| contract.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const MINIMAL: &str = r#"
        plugin_id = "builtin.ocr"
        version = "1.2.0"
        enabled = true

        [[entrypoints]]
        kind = "capability"
        id = "ocr.text"
        path = "bin/ocr-host"
        callable = "serve"

        [permissions]
        filesystem = "read"

        [compat]
        requires_kernel = "0.1.0"
        requires_schema_versions = [1]

        [hash_lock]
        manifest_sha256 = "blake3:aa"
        artifact_sha256 = "blake3:bb"
    "#;

    #[test]
    fn minimal_manifest_parses() {
        let manifest = PluginManifest::parse(Path::new("plugin.toml"), MINIMAL).unwrap();
        assert_eq!(manifest.plugin_id.as_str(), "builtin.ocr");
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert!(manifest.enabled);
        assert_eq!(manifest.permissions.filesystem, FilesystemAccess::Read);
        assert!(!manifest.permissions.network);
        assert!(manifest.depends_on.is_empty());
        assert_eq!(
            manifest.provided_capabilities(),
            vec![CapabilityName::from_static("ocr.text")]
        );
    }

    #[test]
    fn full_manifest_parses() {
        let content = r#"
            plugin_id = "builtin.egress.gateway"
            version = "0.3.1"
            enabled = true
            depends_on = ["builtin.journal"]
            required_capabilities = ["journal.writer"]

            [[entrypoints]]
            kind = "capability"
            id = "egress.send"
            path = "bin/gateway"
            callable = "serve"

            [[entrypoints]]
            kind = "service"
            id = "flusher"
            path = "bin/gateway"
            callable = "flush_loop"

            [permissions]
            filesystem = "read_write"
            network = true

            [compat]
            requires_kernel = "0.1.0"

            [hash_lock]
            manifest_sha256 = "blake3:cc"
            artifact_sha256 = "blake3:dd"

            [filesystem_policy]
            read = ["${plugin_dir}"]
            read_write = ["${run_dir}", "${data_dir}/egress"]

            [io_contracts."egress.send"]
            priority = 10
            max_payload_bytes = 1048576
        "#;
        let manifest = PluginManifest::parse(Path::new("plugin.toml"), content).unwrap();
        assert!(manifest.permissions.network);
        assert_eq!(manifest.entrypoints.len(), 2);
        assert_eq!(manifest.filesystem_policy.read_write.len(), 2);
        assert_eq!(
            manifest.priority_for(&CapabilityName::from_static("egress.send")),
            10
        );
        assert_eq!(
            manifest.priority_for(&CapabilityName::from_static("other.cap")),
            0
        );
    }

    #[test]
    fn missing_required_field_is_parse_error() {
        let content = r#"
            plugin_id = "builtin.ocr"
            version = "1.0.0"
        "#;
        let err = PluginManifest::parse(Path::new("p/plugin.toml"), content).unwrap_err();
        assert!(matches!(err, PluginError::ManifestParse { .. }));
    }

    #[test]
    fn no_entrypoints_is_invalid() {
        let content = r#"
            plugin_id = "builtin.ocr"
            version = "1.0.0"
            enabled = true
            entrypoints = []

            [permissions]

            [compat]
            requires_kernel = "0.1.0"

            [hash_lock]
            manifest_sha256 = "blake3:aa"
            artifact_sha256 = "blake3:bb"
        "#;
        let err = PluginManifest::parse(Path::new("plugin.toml"), content).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn escaping_entrypoint_path_is_invalid() {
        let content = MINIMAL.replace("bin/ocr-host", "../outside");
        let err = PluginManifest::parse(Path::new("plugin.toml"), &content).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn self_dependency_is_invalid() {
        let content = MINIMAL.replace(
            "enabled = true",
            "enabled = true\ndepends_on = [\"builtin.ocr\"]",
        );
        let err = PluginManifest::parse(Path::new("plugin.toml"), &content).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn invalid_capability_entrypoint_id() {
        let content = MINIMAL.replace("id = \"ocr.text\"", "id = \"NotACapability\"");
        let err = PluginManifest::parse(Path::new("plugin.toml"), &content).unwrap_err();
        assert!(matches!(err, PluginError::ManifestInvalid { .. }));
    }

    #[test]
    fn toml_round_trip() {
        let manifest = PluginManifest::parse(Path::new("plugin.toml"), MINIMAL).unwrap();
        let serialized = toml::to_string_pretty(&manifest).unwrap();
        let reparsed = PluginManifest::parse(Path::new("plugin.toml"), &serialized).unwrap();
        assert_eq!(reparsed.plugin_id, manifest.plugin_id);
        assert_eq!(reparsed.hash_lock, manifest.hash_lock);
    }
}
