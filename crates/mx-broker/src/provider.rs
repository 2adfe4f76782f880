//! Provider traits and handles.
//!
//! A [`Provider`] is the callable seam between the broker and whatever
//! hosts the plugin — an in-process adapter, a subprocess RPC channel,
//! or the circuit-breaker stub. The broker stores [`ProviderHandle`]s,
//! which carry the metadata the selection order and the permission
//! enforcer need.

use std::sync::Arc;

use async_trait::async_trait;

use mx_core::{CallOutcome, CapabilityCall, CapabilityName, PluginId};

/// A callable capability implementation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Execute one capability call.
    async fn call(&self, call: CapabilityCall) -> CallOutcome;
}

/// Where a plugin's providers execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostingMode {
    /// Inside the kernel process (operator-allowlisted plugins only).
    InProcess,
    /// In a supervised subprocess host (the default).
    Subprocess,
}

impl HostingMode {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "inproc",
            Self::Subprocess => "subprocess",
        }
    }
}

/// One registered provider with its selection metadata.
#[derive(Clone)]
pub struct ProviderHandle {
    /// The plugin that owns the provider.
    pub plugin_id: PluginId,
    /// The capability it provides.
    pub capability: CapabilityName,
    /// Where it executes.
    pub mode: HostingMode,
    /// Declared manifest priority; higher is selected first.
    pub priority: i32,
    /// Historical failure count at seal time, used as the final
    /// ordering key when healthy-provider preference is enabled.
    pub failure_penalty: u32,
    /// GPU scheduling flag, carried through from the manifest unmodified.
    pub gpu: bool,
    /// Raw-input flag, carried through from the manifest unmodified.
    pub raw_input: bool,
    provider: Arc<dyn Provider>,
}

impl ProviderHandle {
    /// Create a handle with neutral metadata.
    #[must_use]
    pub fn new(
        plugin_id: PluginId,
        capability: CapabilityName,
        mode: HostingMode,
        provider: Arc<dyn Provider>,
    ) -> Self {
        Self {
            plugin_id,
            capability,
            mode,
            priority: 0,
            failure_penalty: 0,
            gpu: false,
            raw_input: false,
            provider,
        }
    }

    /// Set the declared priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Record the failure penalty observed at seal time.
    #[must_use]
    pub const fn with_failure_penalty(mut self, penalty: u32) -> Self {
        self.failure_penalty = penalty;
        self
    }

    /// Carry through the informational permission flags.
    #[must_use]
    pub const fn with_flags(mut self, gpu: bool, raw_input: bool) -> Self {
        self.gpu = gpu;
        self.raw_input = raw_input;
        self
    }

    /// Execute one capability call against this provider.
    pub async fn call(&self, call: CapabilityCall) -> CallOutcome {
        self.provider.call(call).await
    }

    /// Swap the underlying provider, keeping the metadata.
    ///
    /// Used by the permission enforcer to wrap a registered provider
    /// with its guard, and by the supervisor to install the stub.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = provider;
        self
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("plugin_id", &self.plugin_id)
            .field("capability", &self.capability)
            .field("mode", &self.mode)
            .field("priority", &self.priority)
            .field("failure_penalty", &self.failure_penalty)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn call(&self, call: CapabilityCall) -> CallOutcome {
            Ok(call.args)
        }
    }

    #[tokio::test]
    async fn handle_dispatches_to_provider() {
        let handle = ProviderHandle::new(
            PluginId::from_static("builtin.ocr"),
            CapabilityName::from_static("ocr.text"),
            HostingMode::Subprocess,
            Arc::new(EchoProvider),
        );
        let call = CapabilityCall::new(
            CapabilityName::from_static("ocr.text"),
            serde_json::json!({"x": 1}),
        );
        let result = handle.call(call).await.unwrap();
        assert_eq!(result["x"], 1);
    }

    #[test]
    fn builder_sets_metadata() {
        let handle = ProviderHandle::new(
            PluginId::from_static("builtin.ocr"),
            CapabilityName::from_static("ocr.text"),
            HostingMode::InProcess,
            Arc::new(EchoProvider),
        )
        .with_priority(5)
        .with_failure_penalty(2)
        .with_flags(true, false);

        assert_eq!(handle.priority, 5);
        assert_eq!(handle.failure_penalty, 2);
        assert!(handle.gpu);
        assert!(!handle.raw_input);
        assert_eq!(handle.mode.as_str(), "inproc");
    }
}
