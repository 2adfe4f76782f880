//! mx Broker - The capability registry.
//!
//! The registry ([`System`]) is the single source of truth mapping a
//! capability name to its providers. It is populated during boot,
//! sealed, and then read concurrently by every caller; an explicit
//! reload builds a fresh registry and swaps it in atomically through
//! [`SharedSystem`]. There is no global singleton — each boot produces
//! an independent instance.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod provider;
pub mod registry;

pub use error::{BrokerError, BrokerResult};
pub use provider::{HostingMode, Provider, ProviderHandle};
pub use registry::{SharedSystem, System};
