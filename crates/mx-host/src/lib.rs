//! mx Host - Supervised subprocess hosting for plugins.
//!
//! Each admitted plugin runs, by default, in its own subprocess host: a
//! worker process spawned with a sanitized environment and an OS-level
//! sandbox profile, speaking a framed request/response protocol over
//! its standard I/O. This crate provides:
//!
//! - [`rpc`]: the framed, length-bounded RPC channel with chunked
//!   streaming for oversized payloads
//! - [`supervisor`]: the per-host health state machine and circuit
//!   breaker
//! - [`host`]: the hosting runtime tying process lifecycle, RPC, and
//!   supervision together
//! - [`permissions`]: the permission enforcer wrapping every provider
//! - [`sandbox`]: filesystem/resource confinement compiled from the
//!   permission profile
//! - [`stub`]: the deterministic provider installed when a circuit opens

// unsafe_code is denied workspace-wide; the one exception is the
// pre-exec sandbox hook in `sandbox`, which carries its own allow.
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod host;
pub mod permissions;
pub mod rpc;
pub mod sandbox;
pub mod stub;
pub mod supervisor;

pub use error::{HostError, HostResult};
pub use host::{HostHandle, HostProvider, HostSpec};
pub use permissions::{PermissionGuard, PermissionProfile};
pub use rpc::{RpcChannel, WireResponse, MAX_FRAME_PAYLOAD};
pub use sandbox::{ResourceLimits, SandboxProfile};
pub use stub::StubProvider;
pub use supervisor::{HostHealth, RestartDecision, Supervisor};
