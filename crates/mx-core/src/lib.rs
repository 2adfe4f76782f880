//! mx Core - Foundation types for the mx plugin kernel.
//!
//! This crate provides:
//! - Validated identifier newtypes (`PluginId`, `CapabilityName`)
//! - The capability call envelope and typed call errors
//! - Audit event types and the `AuditSink` trait
//! - Environment variable policy for spawned plugin hosts
//! - Version management for kernel compatibility gating

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod audit;
pub mod envelope;
pub mod id;
pub mod spawn_env;
pub mod time;
pub mod version;

pub use audit::{AuditEvent, AuditRecord, AuditSink, NullAuditSink, TracingAuditSink};
pub use envelope::{CallError, CallOutcome, CapabilityCall};
pub use id::{CapabilityName, IdError, PluginId};
pub use spawn_env::{base_spawn_env, is_blocked_spawn_env};
pub use time::Timestamp;
pub use version::{Version, VersionParseError};

/// The plugin id that is the only legal holder of the network permission.
///
/// Invariant: a manifest declaring `network = true` is admitted only when
/// its `plugin_id` equals this constant and policy also allowlists it.
pub const EGRESS_GATEWAY_PLUGIN_ID: &str = "builtin.egress.gateway";
