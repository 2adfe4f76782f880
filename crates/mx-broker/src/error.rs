//! Broker error types.

use mx_core::CapabilityName;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// No provider is registered under the requested name.
    #[error("no provider for capability '{name}'")]
    CapabilityMissing {
        /// The requested capability.
        name: CapabilityName,
    },

    /// Registration was attempted after the registry was sealed.
    #[error("registry is sealed; capability '{name}' cannot be registered")]
    Sealed {
        /// The capability that was being registered.
        name: CapabilityName,
    },
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
