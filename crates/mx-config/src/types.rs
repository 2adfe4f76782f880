//! Kernel configuration types.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use mx_core::{CapabilityName, PluginId};

/// The complete kernel configuration after layer merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    /// Plugin admission policy.
    #[serde(default)]
    pub plugins: PluginPolicy,
    /// Subprocess hosting policy.
    #[serde(default)]
    pub hosting: HostingPolicy,
    /// Supervisor / circuit breaker tunables.
    #[serde(default)]
    pub supervisor: SupervisorPolicy,
    /// Capabilities that must have at least one healthy provider after
    /// boot. Boot fails with a single summary error if any is missing.
    #[serde(default)]
    pub required_capabilities: Vec<CapabilityName>,
}

/// Which plugins may load, and with what privileges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginPolicy {
    /// Plugin ids permitted to load at all.
    #[serde(default)]
    pub allowlist: BTreeSet<PluginId>,
    /// The fixed set admitted in safe mode.
    #[serde(default)]
    pub default_pack: BTreeSet<PluginId>,
    /// Plugin ids whose manifest `network = true` is honoured.
    ///
    /// Validation rejects any entry other than the egress gateway.
    #[serde(default)]
    pub network_allowlist: BTreeSet<PluginId>,
    /// Operator-curated ids allowed to run in-process.
    #[serde(default)]
    pub inproc_allowlist: BTreeSet<PluginId>,
    /// Order same-capability providers by failure history after priority
    /// and plugin id.
    #[serde(default = "default_true")]
    pub prefer_healthy_providers: bool,
}

impl Default for PluginPolicy {
    fn default() -> Self {
        Self {
            allowlist: BTreeSet::new(),
            default_pack: BTreeSet::new(),
            network_allowlist: BTreeSet::new(),
            inproc_allowlist: BTreeSet::new(),
            prefer_healthy_providers: true,
        }
    }
}

/// Subprocess hosting policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostingPolicy {
    /// Spawn subprocess hosts during boot instead of at first use.
    #[serde(default)]
    pub eager_spawn: bool,
    /// Upper bound on a whole (possibly chunked) call or response.
    #[serde(default = "default_max_call_bytes")]
    pub max_call_bytes: u64,
    /// Default per-call timeout in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub default_call_timeout_ms: u64,
}

impl Default for HostingPolicy {
    fn default() -> Self {
        Self {
            eager_spawn: false,
            max_call_bytes: default_max_call_bytes(),
            default_call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Supervisor / circuit breaker tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorPolicy {
    /// Failures within the window that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Rolling failure window in seconds.
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Delay before restarting a crashed host, in milliseconds.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_max_call_bytes() -> u64 {
    32 * 1024 * 1024
}

const fn default_call_timeout_ms() -> u64 {
    30_000
}

const fn default_failure_threshold() -> u32 {
    3
}

const fn default_failure_window_secs() -> u64 {
    60
}

const fn default_restart_backoff_ms() -> u64 {
    500
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            plugins: PluginPolicy::default(),
            hosting: HostingPolicy::default(),
            supervisor: SupervisorPolicy::default(),
            required_capabilities: Vec::new(),
        }
    }
}

impl KernelConfig {
    /// Validate the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConfigError::Validation`] if a tunable is out of
    /// range or the network allowlist names anything other than the
    /// egress gateway.
    pub fn validate(&self) -> crate::ConfigResult<()> {
        if self.supervisor.failure_threshold == 0 {
            return Err(crate::ConfigError::Validation(
                "supervisor.failure_threshold must be at least 1".into(),
            ));
        }
        if self.supervisor.failure_window_secs == 0 {
            return Err(crate::ConfigError::Validation(
                "supervisor.failure_window_secs must be at least 1".into(),
            ));
        }
        if self.hosting.max_call_bytes == 0 {
            return Err(crate::ConfigError::Validation(
                "hosting.max_call_bytes must be nonzero".into(),
            ));
        }
        for id in &self.plugins.network_allowlist {
            if id.as_str() != mx_core::EGRESS_GATEWAY_PLUGIN_ID {
                return Err(crate::ConfigError::Validation(format!(
                    "network_allowlist may only contain '{}', found '{id}'",
                    mx_core::EGRESS_GATEWAY_PLUGIN_ID
                )));
            }
        }
        Ok(())
    }
}
