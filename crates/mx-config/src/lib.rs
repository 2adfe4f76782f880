//! mx Config - Layered kernel configuration.
//!
//! Configuration is merged from three layers: embedded defaults, the
//! system file (`/etc/mx/config.toml`), and the user file
//! (`~/.mx/config.toml`). The loader keeps a second, *trusted* view that
//! stops before the user layer; safe mode evaluates policy against that
//! view so no user override can widen the admitted set.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::{ConfigError, ConfigResult};
pub use loader::{LayeredConfig, load, load_from_dirs};
pub use types::{HostingPolicy, KernelConfig, PluginPolicy, SupervisorPolicy};
