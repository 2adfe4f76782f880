//! Convenience re-exports for downstream crates.

pub use crate::audit::{AuditEvent, AuditRecord, AuditSink};
pub use crate::envelope::{CallError, CallOutcome, CapabilityCall};
pub use crate::id::{CapabilityName, PluginId};
pub use crate::time::Timestamp;
pub use crate::version::Version;
