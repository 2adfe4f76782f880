//! Boot error types.

use mx_core::CapabilityName;

/// Errors that fail a whole boot.
///
/// Per-plugin failures never land here — they are recovered locally and
/// reported through the boot report. Only system-wide invariant
/// violations abort a boot.
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Configuration could not be loaded or validated.
    #[error(transparent)]
    Config(#[from] mx_config::ConfigError),

    /// The lockfile exists but cannot be read or parsed.
    #[error(transparent)]
    Lockfile(#[from] mx_plugins::PluginError),

    /// A capability the configuration marks as required ended up with
    /// zero providers.
    #[error("required capabilities have no providers: {}", format_names(.missing))]
    RequiredCapabilityUnavailable {
        /// Every missing required capability, sorted.
        missing: Vec<CapabilityName>,
    },
}

fn format_names(names: &[CapabilityName]) -> String {
    names
        .iter()
        .map(CapabilityName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for boot operations.
pub type BootResult<T> = Result<T, BootError>;
