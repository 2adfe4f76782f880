//! The circuit-breaker stub provider.

use async_trait::async_trait;

use mx_broker::Provider;
use mx_core::{CallError, CallOutcome, CapabilityCall, PluginId};

/// Deterministic provider answering every call with `Unavailable`.
///
/// Installed in place of a host whose circuit has opened, so callers
/// get a clearly-labeled error naming the plugin and capability instead
/// of a connection attempt against a dead process.
#[derive(Debug, Clone)]
pub struct StubProvider {
    plugin_id: PluginId,
}

impl StubProvider {
    /// Create a stub for the given plugin.
    #[must_use]
    pub const fn new(plugin_id: PluginId) -> Self {
        Self { plugin_id }
    }
}

#[async_trait]
impl Provider for StubProvider {
    async fn call(&self, call: CapabilityCall) -> CallOutcome {
        Err(CallError::Unavailable {
            plugin_id: self.plugin_id.to_string(),
            capability: call.capability.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_core::CapabilityName;

    #[tokio::test]
    async fn stub_is_deterministic() {
        let stub = StubProvider::new(PluginId::from_static("builtin.flaky"));
        for _ in 0..3 {
            let call = CapabilityCall::new(
                CapabilityName::from_static("flaky.op"),
                serde_json::json!({}),
            );
            let err = stub.call(call).await.unwrap_err();
            assert_eq!(
                err,
                CallError::Unavailable {
                    plugin_id: "builtin.flaky".to_string(),
                    capability: "flaky.op".to_string(),
                }
            );
        }
    }
}
