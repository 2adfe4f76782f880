//! Audit plumbing: the switchable sink and the journal forwarder.
//!
//! Supervisors and permission guards are created before the registry
//! exists, so they are handed an [`AuditPipe`] that starts out writing
//! to the tracing log. Once boot seals the registry and a
//! `journal.writer` provider is present, the pipe is switched to a
//! [`JournalAuditSink`] and every later event flows to the journal
//! plugin. The journal's own hash chaining happens inside that plugin.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::warn;

use mx_broker::SharedSystem;
use mx_core::{AuditRecord, AuditSink, CapabilityCall, CapabilityName, TracingAuditSink};

/// The capability audit events are forwarded to when available.
pub const JOURNAL_CAPABILITY: &str = "journal.writer";

/// An audit sink whose destination can be swapped at runtime.
pub struct AuditPipe {
    inner: RwLock<Arc<dyn AuditSink>>,
}

impl AuditPipe {
    /// Create a pipe that writes to the tracing log.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Arc::new(TracingAuditSink)),
        })
    }

    /// Replace the destination sink.
    pub fn switch(&self, sink: Arc<dyn AuditSink>) {
        match self.inner.write() {
            Ok(mut guard) => *guard = sink,
            Err(poisoned) => *poisoned.into_inner() = sink,
        }
    }

    fn current(&self) -> Arc<dyn AuditSink> {
        self.inner
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }
}

#[async_trait]
impl AuditSink for AuditPipe {
    async fn record(&self, record: AuditRecord) {
        self.current().record(record).await;
    }
}

impl std::fmt::Debug for AuditPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditPipe").finish_non_exhaustive()
    }
}

/// Forwards audit records to the `journal.writer` capability.
///
/// Best-effort by contract: a failed write is logged and dropped, never
/// surfaced to the code path that produced the event.
pub struct JournalAuditSink {
    system: SharedSystem,
    capability: CapabilityName,
}

impl JournalAuditSink {
    /// Create a forwarder over the booted system.
    #[must_use]
    pub fn new(system: SharedSystem) -> Self {
        Self {
            system,
            capability: CapabilityName::from_static(JOURNAL_CAPABILITY),
        }
    }
}

#[async_trait]
impl AuditSink for JournalAuditSink {
    async fn record(&self, record: AuditRecord) {
        let payload = match serde_json::to_value(&record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "unserializable audit record");
                return;
            },
        };
        let system = self.system.current();
        let Ok(provider) = system.get(&self.capability) else {
            // Journal plugin gone (e.g. circuit-broken out of a reload);
            // fall back to the log rather than lose the event silently.
            TracingAuditSink.record(record).await;
            return;
        };
        let call = CapabilityCall::new(self.capability.clone(), payload);
        if let Err(e) = provider.call(call).await {
            warn!(error = %e, "journal write failed; audit event dropped to log");
            TracingAuditSink.record(record).await;
        }
    }
}

impl std::fmt::Debug for JournalAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalAuditSink")
            .field("capability", &self.capability)
            .finish_non_exhaustive()
    }
}
