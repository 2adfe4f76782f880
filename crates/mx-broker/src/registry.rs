//! The capability registry.
//!
//! [`System`] maps capability names to ordered provider lists. It is
//! append-only while unsealed (boot), then sealed and read-only; the
//! only way to change a sealed registry is to build a new one and swap
//! it through [`SharedSystem`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use mx_core::CapabilityName;

use crate::error::{BrokerError, BrokerResult};
use crate::provider::ProviderHandle;

/// The capability registry handed to CLI/API layers after boot.
#[derive(Debug, Default)]
pub struct System {
    providers: BTreeMap<CapabilityName, Vec<ProviderHandle>>,
    sealed: bool,
    order_by_failures: bool,
}

impl System {
    /// Create an empty, unsealed registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that also orders same-capability
    /// providers by their recorded failure penalty.
    #[must_use]
    pub fn with_failure_ordering() -> Self {
        Self {
            providers: BTreeMap::new(),
            sealed: false,
            order_by_failures: true,
        }
    }

    /// Register a provider. Append-only; only legal before sealing.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Sealed`] if the registry has been sealed.
    pub fn register(&mut self, handle: ProviderHandle) -> BrokerResult<()> {
        if self.sealed {
            return Err(BrokerError::Sealed {
                name: handle.capability.clone(),
            });
        }
        debug!(
            capability = %handle.capability,
            plugin_id = %handle.plugin_id,
            mode = handle.mode.as_str(),
            "registered provider"
        );
        self.providers
            .entry(handle.capability.clone())
            .or_default()
            .push(handle);
        Ok(())
    }

    /// Seal the registry: sort every provider list into its final,
    /// deterministic order and refuse further registration.
    ///
    /// Selection order: declared priority (higher first), then plugin
    /// id lexically, then — when failure ordering is enabled — fewer
    /// recorded failures first.
    pub fn seal(&mut self) {
        let order_by_failures = self.order_by_failures;
        for handles in self.providers.values_mut() {
            handles.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.plugin_id.cmp(&b.plugin_id))
                    .then_with(|| {
                        if order_by_failures {
                            a.failure_penalty.cmp(&b.failure_penalty)
                        } else {
                            std::cmp::Ordering::Equal
                        }
                    })
            });
        }
        self.sealed = true;
        info!(
            capabilities = self.providers.len(),
            "capability registry sealed"
        );
    }

    /// Whether the registry has been sealed.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// The selected provider for a capability.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CapabilityMissing`] naming the requested
    /// capability if no provider is registered under it.
    pub fn get(&self, name: &CapabilityName) -> BrokerResult<&ProviderHandle> {
        self.providers
            .get(name)
            .and_then(|handles| handles.first())
            .ok_or_else(|| BrokerError::CapabilityMissing { name: name.clone() })
    }

    /// Every provider for a capability, in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CapabilityMissing`] if no provider is
    /// registered under the name.
    pub fn all(&self, name: &CapabilityName) -> BrokerResult<&[ProviderHandle]> {
        self.providers
            .get(name)
            .map(Vec::as_slice)
            .filter(|handles| !handles.is_empty())
            .ok_or_else(|| BrokerError::CapabilityMissing { name: name.clone() })
    }

    /// Whether any provider is registered under the name.
    #[must_use]
    pub fn has(&self, name: &CapabilityName) -> bool {
        self.providers
            .get(name)
            .is_some_and(|handles| !handles.is_empty())
    }

    /// All registered capability names, sorted.
    #[must_use]
    pub fn capability_names(&self) -> Vec<&CapabilityName> {
        self.providers.keys().collect()
    }

    /// Number of registered capabilities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Replace the providers owned by one plugin across every
    /// capability, preserving order. Used by the supervisor to install
    /// the circuit-breaker stub without reordering selection.
    pub fn replace_plugin_providers<F>(&mut self, plugin_id: &mx_core::PluginId, mut replace: F)
    where
        F: FnMut(&ProviderHandle) -> ProviderHandle,
    {
        for handles in self.providers.values_mut() {
            for handle in handles.iter_mut() {
                if &handle.plugin_id == plugin_id {
                    *handle = replace(handle);
                }
            }
        }
    }
}

/// Shared, atomically swappable registry handle.
///
/// Readers take a cheap snapshot ([`SharedSystem::current`]); an
/// explicit reload builds a new [`System`] and swaps it in whole, so a
/// live registry is never mutated in place.
#[derive(Debug, Clone)]
pub struct SharedSystem {
    inner: Arc<RwLock<Arc<System>>>,
}

impl SharedSystem {
    /// Wrap a sealed registry.
    #[must_use]
    pub fn new(system: System) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(system))),
        }
    }

    /// Snapshot the current registry.
    ///
    /// The snapshot stays valid across a concurrent swap; callers
    /// holding it simply keep reading the superseded registry.
    #[must_use]
    pub fn current(&self) -> Arc<System> {
        self.inner
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Atomically replace the registry (audited reload path).
    pub fn swap(&self, next: System) {
        let next = Arc::new(next);
        match self.inner.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        info!("capability registry swapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HostingMode, Provider};
    use async_trait::async_trait;
    use mx_core::{CallOutcome, CapabilityCall, PluginId};

    struct TagProvider(&'static str);

    #[async_trait]
    impl Provider for TagProvider {
        async fn call(&self, _call: CapabilityCall) -> CallOutcome {
            Ok(serde_json::json!({ "tag": self.0 }))
        }
    }

    fn handle(plugin: &'static str, capability: &'static str, tag: &'static str) -> ProviderHandle {
        ProviderHandle::new(
            PluginId::from_static(plugin),
            CapabilityName::from_static(capability),
            HostingMode::Subprocess,
            Arc::new(TagProvider(tag)),
        )
    }

    #[test]
    fn get_missing_capability_is_a_named_error() {
        let system = System::new();
        let name = CapabilityName::from_static("storage.metadata");
        let err = system.get(&name).unwrap_err();
        assert_eq!(err, BrokerError::CapabilityMissing { name });
        assert!(err.to_string().contains("storage.metadata"));
    }

    #[test]
    fn register_then_get() {
        let mut system = System::new();
        system
            .register(handle("builtin.storage", "storage.metadata", "a"))
            .unwrap();
        system.seal();

        let name = CapabilityName::from_static("storage.metadata");
        assert!(system.has(&name));
        let selected = system.get(&name).unwrap();
        assert_eq!(selected.plugin_id.as_str(), "builtin.storage");
    }

    #[test]
    fn sealed_registry_rejects_registration() {
        let mut system = System::new();
        system.seal();
        let err = system
            .register(handle("builtin.storage", "storage.metadata", "a"))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Sealed { .. }));
    }

    #[test]
    fn priority_beats_plugin_id() {
        let mut system = System::new();
        system
            .register(handle("plugin.aaa", "search.query", "low"))
            .unwrap();
        system
            .register(handle("plugin.zzz", "search.query", "high").with_priority(10))
            .unwrap();
        system.seal();

        let name = CapabilityName::from_static("search.query");
        assert_eq!(system.get(&name).unwrap().plugin_id.as_str(), "plugin.zzz");
        let all = system.all(&name).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].plugin_id.as_str(), "plugin.aaa");
    }

    #[test]
    fn equal_priority_orders_lexically() {
        let mut system = System::new();
        system
            .register(handle("plugin.zzz", "search.query", "z"))
            .unwrap();
        system
            .register(handle("plugin.aaa", "search.query", "a"))
            .unwrap();
        system.seal();

        let name = CapabilityName::from_static("search.query");
        assert_eq!(system.get(&name).unwrap().plugin_id.as_str(), "plugin.aaa");
    }

    #[test]
    fn failure_penalty_breaks_remaining_ties() {
        // Two providers from the same plugin (two capability entrypoints
        // under one name): priority and plugin id tie, penalty decides.
        let mut system = System::with_failure_ordering();
        system
            .register(handle("plugin.dual", "search.query", "worse").with_failure_penalty(4))
            .unwrap();
        system
            .register(handle("plugin.dual", "search.query", "better").with_failure_penalty(1))
            .unwrap();
        system.seal();

        let name = CapabilityName::from_static("search.query");
        let all = system.all(&name).unwrap();
        assert_eq!(all[0].failure_penalty, 1);
        assert_eq!(all[1].failure_penalty, 4);
    }

    #[test]
    fn sealing_is_deterministic_across_registration_order() {
        let build = |flip: bool| {
            let mut system = System::new();
            let (first, second) = if flip {
                ("plugin.b", "plugin.a")
            } else {
                ("plugin.a", "plugin.b")
            };
            system
                .register(ProviderHandle::new(
                    PluginId::new(first).unwrap(),
                    CapabilityName::from_static("search.query"),
                    HostingMode::Subprocess,
                    Arc::new(TagProvider("x")),
                ))
                .unwrap();
            system
                .register(ProviderHandle::new(
                    PluginId::new(second).unwrap(),
                    CapabilityName::from_static("search.query"),
                    HostingMode::Subprocess,
                    Arc::new(TagProvider("y")),
                ))
                .unwrap();
            system.seal();
            let name = CapabilityName::from_static("search.query");
            system
                .all(&name)
                .unwrap()
                .iter()
                .map(|h| h.plugin_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(build(false), build(true));
    }

    #[tokio::test]
    async fn shared_system_swaps_atomically() {
        let mut first = System::new();
        first
            .register(handle("builtin.storage", "storage.metadata", "v1"))
            .unwrap();
        first.seal();
        let shared = SharedSystem::new(first);

        let snapshot = shared.current();
        assert!(snapshot.has(&CapabilityName::from_static("storage.metadata")));

        let mut second = System::new();
        second
            .register(handle("builtin.storage", "storage.metadata", "v2"))
            .unwrap();
        second
            .register(handle("builtin.search", "search.query", "new"))
            .unwrap();
        second.seal();
        shared.swap(second);

        // Old snapshot still reads the superseded registry.
        assert!(!snapshot.has(&CapabilityName::from_static("search.query")));
        // New snapshots see the replacement.
        assert!(shared
            .current()
            .has(&CapabilityName::from_static("search.query")));
    }

    #[tokio::test]
    async fn replace_plugin_providers_keeps_order() {
        let mut system = System::new();
        system
            .register(handle("plugin.aaa", "search.query", "keep"))
            .unwrap();
        system
            .register(handle("plugin.bbb", "search.query", "replace"))
            .unwrap();
        system.seal();

        let target = PluginId::from_static("plugin.bbb");
        system.replace_plugin_providers(&target, |old| {
            old.clone().with_provider(Arc::new(TagProvider("stub")))
        });

        let name = CapabilityName::from_static("search.query");
        let all = system.all(&name).unwrap();
        assert_eq!(all[0].plugin_id.as_str(), "plugin.aaa");
        let call = CapabilityCall::new(name.clone(), serde_json::json!({}));
        let out = all[1].call(call).await.unwrap();
        assert_eq!(out["tag"], "stub");
    }
}
