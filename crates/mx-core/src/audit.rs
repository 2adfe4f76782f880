//! Audit event types and sinks.
//!
//! Every admission decision, hash-lock failure, crash, and circuit
//! transition is emitted as an [`AuditEvent`]. The kernel forwards events
//! to the `journal.writer` capability when one is admitted; otherwise
//! they land in the tracing log. Chain-linking and signing of the journal
//! happen downstream and are not this crate's concern.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{CapabilityName, PluginId};
use crate::time::Timestamp;

/// A security-relevant kernel event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A plugin passed every admission stage and was registered.
    PluginAdmitted {
        /// The admitted plugin.
        plugin_id: PluginId,
        /// Manifest version string.
        version: String,
        /// Whether the plugin is hosted in-process.
        inproc: bool,
    },

    /// A plugin was excluded during admission.
    PluginRejected {
        /// The rejected plugin.
        plugin_id: PluginId,
        /// Machine-readable rejection reason (e.g. `not_allowlisted`).
        reason: String,
    },

    /// A plugin's recomputed hash did not match the lockfile.
    HashRejected {
        /// The rejected plugin.
        plugin_id: PluginId,
        /// Digest recorded in the lockfile, if any.
        expected: Option<String>,
        /// Digest computed from disk.
        actual: String,
    },

    /// A subprocess host exited without being asked to.
    HostCrashed {
        /// The plugin whose host died.
        plugin_id: PluginId,
        /// Process exit code, if one was observed.
        exit_code: Option<i32>,
    },

    /// A crashed or degraded host was restarted.
    HostRestarted {
        /// The restarted plugin.
        plugin_id: PluginId,
        /// How many restarts this host has seen.
        restart_count: u32,
    },

    /// A host exceeded the failure threshold and was circuit-broken.
    CircuitOpened {
        /// The circuit-broken plugin.
        plugin_id: PluginId,
        /// Failures observed inside the rolling window.
        failures_in_window: u32,
    },

    /// A previously open circuit was closed by an explicit reload.
    CircuitClosed {
        /// The restored plugin.
        plugin_id: PluginId,
    },

    /// A capability call was denied by the permission enforcer.
    PermissionDenied {
        /// The plugin whose permissions were insufficient.
        plugin_id: PluginId,
        /// The capability being invoked.
        capability: CapabilityName,
        /// Why the call was denied.
        reason: String,
    },

    /// Boot completed and the registry was sealed.
    RegistrySealed {
        /// Number of capabilities registered.
        capability_count: usize,
        /// Number of admitted plugins.
        plugin_count: usize,
        /// Whether the kernel booted in safe mode.
        safe_mode: bool,
    },

    /// An explicit reload swapped in a new registry.
    RegistryReloaded {
        /// Number of capabilities in the new registry.
        capability_count: usize,
    },
}

/// An audit record: one event with identity and time attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Unique record id.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: Timestamp,
    /// The event itself.
    pub event: AuditEvent,
}

impl AuditRecord {
    /// Wrap an event with a fresh id and the current time.
    #[must_use]
    pub fn new(event: AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Timestamp::now(),
            event,
        }
    }
}

/// Destination for audit records.
///
/// Implementations must not fail the caller: auditing is best-effort at
/// this boundary, and a sink that cannot write logs the loss itself.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Record one event.
    async fn record(&self, record: AuditRecord);
}

/// Sink that writes events to the tracing log.
///
/// Used before the `journal.writer` capability exists (early boot) and as
/// the fallback when no journal plugin is admitted.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) {
        match serde_json::to_string(&record.event) {
            Ok(json) => {
                tracing::info!(target: "mx::audit", id = %record.id, event = %json, "audit");
            },
            Err(e) => {
                tracing::warn!(target: "mx::audit", id = %record.id, error = %e, "unserializable audit event");
            },
        }
    }
}

/// Sink that discards everything (for tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: AuditRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_tagged() {
        let event = AuditEvent::PluginRejected {
            plugin_id: PluginId::from_static("thirdparty.plugin"),
            reason: "not_allowlisted".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "plugin_rejected");
        assert_eq!(json["reason"], "not_allowlisted");
    }

    #[test]
    fn record_carries_identity() {
        let a = AuditRecord::new(AuditEvent::CircuitClosed {
            plugin_id: PluginId::from_static("builtin.ocr"),
        });
        let b = AuditRecord::new(AuditEvent::CircuitClosed {
            plugin_id: PluginId::from_static("builtin.ocr"),
        });
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn sinks_accept_records() {
        let record = AuditRecord::new(AuditEvent::RegistrySealed {
            capability_count: 3,
            plugin_count: 2,
            safe_mode: false,
        });
        TracingAuditSink.record(record.clone()).await;
        NullAuditSink.record(record).await;
    }
}
