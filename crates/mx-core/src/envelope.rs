//! The capability call envelope.
//!
//! Every capability invocation, in-process or subprocess, travels as a
//! [`CapabilityCall`] and resolves to a [`CallOutcome`]. Individual
//! capabilities define their own argument payloads; the kernel only
//! interprets the envelope.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::CapabilityName;

/// Default per-call timeout when the caller does not supply one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// A single capability invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCall {
    /// Correlation id, unique per call.
    pub call_id: Uuid,
    /// The capability being invoked.
    pub capability: CapabilityName,
    /// Opaque argument payload for the provider.
    pub args: serde_json::Value,
    /// Per-call timeout in milliseconds.
    pub timeout_ms: u64,
    /// Optional cap on the response payload size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_response_bytes: Option<u64>,
    /// Filesystem paths the call intends to touch.
    ///
    /// The permission enforcer checks these against the owning plugin's
    /// resolved allowlist before dispatch. A provider that touches paths
    /// it did not declare here is stopped by the OS-level sandbox instead.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fs_paths: Vec<PathBuf>,
}

impl CapabilityCall {
    /// Create a call with the default timeout.
    #[must_use]
    pub fn new(capability: CapabilityName, args: serde_json::Value) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            capability,
            args,
            timeout_ms: u64::try_from(DEFAULT_CALL_TIMEOUT.as_millis()).unwrap_or(30_000),
            max_response_bytes: None,
            fs_paths: Vec::new(),
        }
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Declare the filesystem paths this call will touch.
    #[must_use]
    pub fn with_fs_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.fs_paths = paths;
        self
    }

    /// The timeout as a [`Duration`].
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Typed failure of a capability call.
///
/// These are the only error kinds a caller sees; raw internal detail
/// stays out of user-facing and audit surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    /// The call did not complete within its timeout.
    #[error("call to '{capability}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The capability that was invoked.
        capability: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The hosting process died while the call was in flight.
    #[error("host for plugin '{plugin_id}' crashed during call to '{capability}'")]
    Crashed {
        /// The plugin whose host crashed.
        plugin_id: String,
        /// The capability that was invoked.
        capability: String,
    },

    /// The call was denied by the permission enforcer.
    #[error("permission denied for plugin '{plugin_id}': {reason}")]
    PermissionDenied {
        /// The plugin whose permissions were insufficient.
        plugin_id: String,
        /// Why the call was denied.
        reason: String,
    },

    /// The argument payload failed the capability's schema.
    #[error("invalid payload for '{capability}': {reason}")]
    SchemaInvalid {
        /// The capability that was invoked.
        capability: String,
        /// What was wrong with the payload.
        reason: String,
    },

    /// The provider is circuit-broken or otherwise unreachable.
    #[error("capability '{capability}' from plugin '{plugin_id}' is unavailable")]
    Unavailable {
        /// The plugin that owns the provider.
        plugin_id: String,
        /// The capability that was invoked.
        capability: String,
    },

    /// The request or response exceeded the transport's size contract.
    #[error("payload of {size} bytes exceeds the {limit}-byte limit")]
    PayloadTooLarge {
        /// The offending payload size.
        size: u64,
        /// The configured limit.
        limit: u64,
    },

    /// The transport produced a malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result of a capability call: a success payload or a typed error.
pub type CallOutcome = Result<serde_json::Value, CallError>;
