//! mx Kernel - Boot orchestration.
//!
//! The kernel is deliberately minimal: it loads configuration, verifies
//! trust, and composes a registry of named capabilities. Every feature
//! — capture, storage, retrieval, egress — is supplied by a plugin the
//! kernel has admitted. [`boot`] runs the admission pipeline and hands
//! back a [`Kernel`] whose sealed [`mx_broker::System`] is the sole
//! means of reaching plugin functionality.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod boot;
pub mod error;
pub mod journal;

pub use boot::{BootOptions, BootReport, Kernel, boot};
pub use error::{BootError, BootResult};
pub use journal::{AuditPipe, JournalAuditSink};
