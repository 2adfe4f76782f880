//! The admission gate: enabled, allowlist, safe mode, compat, and the
//! network-grant invariant.
//!
//! The gate runs after hash verification and before dependency
//! resolution. Every exclusion carries a machine-readable
//! [`RejectReason`] that the kernel turns into an audit event. Security
//! checks (hash, network grant) are never downgraded to warnings.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use mx_config::KernelConfig;
use mx_core::{EGRESS_GATEWAY_PLUGIN_ID, PluginId, Version};

use crate::discovery::DiscoveredPlugin;
use crate::lockfile::{HashCheck, PluginLock};

/// A discovered plugin together with its hash-lock verdict.
#[derive(Debug, Clone)]
pub struct VerifiedPlugin {
    /// The discovered plugin.
    pub plugin: DiscoveredPlugin,
    /// The lockfile verdict for its recomputed digests.
    pub hash_check: HashCheck,
}

impl VerifiedPlugin {
    /// Whether the plugin passed hash-lock verification.
    #[must_use]
    pub const fn hash_ok(&self) -> bool {
        self.hash_check.is_verified()
    }
}

/// Check every discovered plugin against the pinned lockfile.
#[must_use]
pub fn verify_against_lock(plugins: Vec<DiscoveredPlugin>, lock: &PluginLock) -> Vec<VerifiedPlugin> {
    plugins
        .into_iter()
        .map(|plugin| {
            let hash_check = lock.check(
                &plugin.manifest.plugin_id,
                &plugin.manifest_digest,
                &plugin.artifact_digest,
            );
            if !hash_check.is_verified() {
                debug!(
                    plugin_id = %plugin.manifest.plugin_id,
                    ?hash_check,
                    "hash-lock verification failed"
                );
            }
            VerifiedPlugin { plugin, hash_check }
        })
        .collect()
}

/// Why the gate excluded a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Lockfile entry absent or digest mismatch.
    HashRejected {
        /// Digest pinned in the lockfile, if an entry existed.
        expected: Option<String>,
        /// Digest recomputed from disk.
        actual: String,
    },
    /// The manifest sets `enabled = false`.
    Disabled,
    /// The plugin id is not in the effective allowlist.
    NotAllowlisted,
    /// Safe mode admits only the default pack.
    NotInDefaultPack,
    /// `requires_kernel` is not satisfied by this kernel.
    IncompatibleKernel {
        /// The version the manifest requires.
        requires: Version,
    },
    /// The plugin needs a schema version this kernel does not support.
    MissingSchemaVersion {
        /// The unsupported schema version.
        version: u32,
    },
    /// The manifest claims `network = true` without being the
    /// policy-allowlisted egress gateway.
    NetworkGrantDenied,
}

impl RejectReason {
    /// Stable machine-readable identifier for audit records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HashRejected { .. } => "hash_rejected",
            Self::Disabled => "disabled",
            Self::NotAllowlisted => "not_allowlisted",
            Self::NotInDefaultPack => "not_default_pack",
            Self::IncompatibleKernel { .. } => "incompatible_kernel",
            Self::MissingSchemaVersion { .. } => "missing_schema_version",
            Self::NetworkGrantDenied => "network_grant_denied",
        }
    }
}

/// One excluded plugin with its reason.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// The excluded plugin.
    pub plugin_id: PluginId,
    /// Why it was excluded.
    pub reason: RejectReason,
}

/// What the gate admitted and what it turned away.
#[derive(Debug, Default)]
pub struct GateOutcome {
    /// Plugins that passed every check, in input order.
    pub admitted: Vec<DiscoveredPlugin>,
    /// Exclusions with machine-readable reasons.
    pub rejections: Vec<Rejection>,
}

/// The admission gate.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    allowlist: BTreeSet<PluginId>,
    default_pack: BTreeSet<PluginId>,
    network_allowlist: BTreeSet<PluginId>,
    kernel_version: Version,
    supported_schema_versions: BTreeSet<u32>,
}

impl AdmissionGate {
    /// Build a gate from the effective configuration.
    ///
    /// The caller chooses which config view to pass: safe-mode boots
    /// pass the trusted view so user-layer overrides cannot reach the
    /// gate at all.
    #[must_use]
    pub fn new(
        config: &KernelConfig,
        kernel_version: Version,
        supported_schema_versions: BTreeSet<u32>,
    ) -> Self {
        Self {
            allowlist: config.plugins.allowlist.clone(),
            default_pack: config.plugins.default_pack.clone(),
            network_allowlist: config.plugins.network_allowlist.clone(),
            kernel_version,
            supported_schema_versions,
        }
    }

    /// Filter verified plugins down to the admitted set.
    ///
    /// Checks run in a fixed order and the first failure names the
    /// rejection: hash, enabled, allowlist, safe-mode pack, kernel
    /// compatibility, schema versions, network grant.
    #[must_use]
    pub fn filter(&self, verified: Vec<VerifiedPlugin>, safe_mode: bool) -> GateOutcome {
        let mut outcome = GateOutcome::default();

        for candidate in verified {
            let plugin_id = candidate.plugin.manifest.plugin_id.clone();
            match self.check(&candidate, safe_mode) {
                Ok(()) => {
                    info!(plugin_id = %plugin_id, "plugin admitted by gate");
                    outcome.admitted.push(candidate.plugin);
                },
                Err(reason) => {
                    info!(
                        plugin_id = %plugin_id,
                        reason = reason.as_str(),
                        "plugin rejected by gate"
                    );
                    outcome.rejections.push(Rejection { plugin_id, reason });
                },
            }
        }
        outcome
    }

    fn check(&self, candidate: &VerifiedPlugin, safe_mode: bool) -> Result<(), RejectReason> {
        let manifest = &candidate.plugin.manifest;

        match &candidate.hash_check {
            HashCheck::Verified => {},
            HashCheck::Unlocked => {
                return Err(RejectReason::HashRejected {
                    expected: None,
                    actual: candidate.plugin.artifact_digest.clone(),
                });
            },
            HashCheck::Mismatch { expected, actual } => {
                return Err(RejectReason::HashRejected {
                    expected: Some(expected.clone()),
                    actual: actual.clone(),
                });
            },
        }

        if !manifest.enabled {
            return Err(RejectReason::Disabled);
        }
        if !self.allowlist.contains(&manifest.plugin_id) {
            return Err(RejectReason::NotAllowlisted);
        }
        if safe_mode && !self.default_pack.contains(&manifest.plugin_id) {
            return Err(RejectReason::NotInDefaultPack);
        }
        if !manifest.compat.requires_kernel.is_satisfied_by(&self.kernel_version) {
            return Err(RejectReason::IncompatibleKernel {
                requires: manifest.compat.requires_kernel,
            });
        }
        if let Some(&version) = manifest
            .compat
            .requires_schema_versions
            .iter()
            .find(|v| !self.supported_schema_versions.contains(v))
        {
            return Err(RejectReason::MissingSchemaVersion { version });
        }
        if manifest.permissions.network {
            let is_gateway = manifest.plugin_id.as_str() == EGRESS_GATEWAY_PLUGIN_ID;
            if !is_gateway || !self.network_allowlist.contains(&manifest.plugin_id) {
                return Err(RejectReason::NetworkGrantDenied);
            }
        }
        Ok(())
    }
}
