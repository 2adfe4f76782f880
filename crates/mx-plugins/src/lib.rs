//! mx Plugins - Discovery, hash-lock verification, and admission.
//!
//! This crate implements the admission pipeline that turns a plugin
//! directory tree into the set of plugins the kernel will host:
//!
//! 1. [`discovery`] walks the layered plugin directories and parses each
//!    `plugin.toml`, collecting per-plugin failures without aborting.
//! 2. [`hash`] computes deterministic blake3 digests for every candidate
//!    and [`lockfile`] checks them against the pinned `plugins.lock` —
//!    a mismatch excludes the plugin, fail closed.
//! 3. [`gate`] applies the enabled / allowlist / safe-mode / compat /
//!    network-grant policy.
//! 4. [`resolve`] orders the survivors by `depends_on`, excluding cycles
//!    and unresolved references along with their dependents.
//!
//! Every exclusion carries a machine-readable [`gate::RejectReason`] so
//! the kernel can audit it.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod discovery;
pub mod error;
pub mod gate;
pub mod hash;
pub mod lockfile;
pub mod manifest;
pub mod resolve;

pub use discovery::{DiscoveredPlugin, DiscoveryFailure, DiscoveryReport, discover};
pub use error::{PluginError, PluginResult};
pub use gate::{
    AdmissionGate, GateOutcome, RejectReason, Rejection, VerifiedPlugin, verify_against_lock,
};
pub use lockfile::{HashCheck, LockedPlugin, PluginLock};
pub use manifest::{
    Compat, Entrypoint, EntrypointKind, FilesystemAccess, FilesystemPolicy, HashLock, IoContract,
    Permissions, PluginManifest,
};
pub use resolve::{ResolveFailure, ResolveOutcome, resolve_load_order};

/// Manifest file name inside each plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// Standard lockfile file name.
pub const LOCKFILE_NAME: &str = "plugins.lock";
