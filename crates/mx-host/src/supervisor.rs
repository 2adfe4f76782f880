//! Per-host health supervision and circuit breaking.
//!
//! Each subprocess host owns one [`Supervisor`], the single source of
//! truth for its health. The state machine is
//! `Starting → Active → {Degraded, Crashed} → Restarting → Active`,
//! with a side transition to `CircuitOpen` once the rolling failure
//! count (crashes plus fatal timeouts inside the window) reaches the
//! configured threshold. While the circuit is open every call is
//! answered by the stub; the rest of the kernel keeps operating.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use mx_config::SupervisorPolicy;
use mx_core::{AuditEvent, AuditRecord, AuditSink, PluginId};

/// Health of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostHealth {
    /// The host process is being spawned.
    Starting,
    /// The host is serving calls.
    Active,
    /// The host timed out recently but is still alive.
    Degraded,
    /// The host process exited unexpectedly.
    Crashed,
    /// The host is being respawned after a crash.
    Restarting,
    /// Failures exceeded the threshold; calls go to the stub.
    CircuitOpen,
}

impl HostHealth {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::CircuitOpen => "circuit_open",
        }
    }
}

/// What the hosting runtime should do after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn the host after the backoff delay.
    Restart {
        /// How long to wait before respawning.
        backoff: Duration,
    },
    /// The circuit is open; do not respawn.
    GiveUp,
}

struct Inner {
    health: HostHealth,
    failures: VecDeque<Instant>,
    restart_count: u32,
}

/// The health state machine for one host.
pub struct Supervisor {
    plugin_id: PluginId,
    policy: SupervisorPolicy,
    audit: Arc<dyn AuditSink>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    /// Create a supervisor in the `Starting` state.
    #[must_use]
    pub fn new(plugin_id: PluginId, policy: SupervisorPolicy, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            plugin_id,
            policy,
            audit,
            inner: Mutex::new(Inner {
                health: HostHealth::Starting,
                failures: VecDeque::new(),
                restart_count: 0,
            }),
        }
    }

    /// Current health.
    #[must_use]
    pub fn health(&self) -> HostHealth {
        self.lock().health
    }

    /// Whether calls should be answered by the stub.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        self.health() == HostHealth::CircuitOpen
    }

    /// Failures currently inside the rolling window.
    #[must_use]
    pub fn failures_in_window(&self) -> u32 {
        let mut inner = self.lock();
        Self::prune(&mut inner.failures, self.policy.failure_window_secs);
        u32::try_from(inner.failures.len()).unwrap_or(u32::MAX)
    }

    /// The host finished starting and is serving calls.
    pub fn note_active(&self) {
        let mut inner = self.lock();
        if inner.health != HostHealth::CircuitOpen {
            inner.health = HostHealth::Active;
        }
    }

    /// A call timed out. The host is flagged degraded but not killed —
    /// a transient slow call must not thrash the host into restarts.
    /// The timeout still counts toward the circuit threshold.
    pub async fn record_timeout(&self) {
        let opened = {
            let mut inner = self.lock();
            if inner.health == HostHealth::CircuitOpen {
                false
            } else {
                inner.failures.push_back(Instant::now());
                inner.health = HostHealth::Degraded;
                self.check_threshold(&mut inner)
            }
        };
        if opened {
            self.emit_circuit_opened().await;
        }
    }

    /// The host process exited unexpectedly. Emits the crash audit
    /// record before any restart decision is returned.
    pub async fn record_crash(&self, exit_code: Option<i32>) -> RestartDecision {
        self.audit
            .record(AuditRecord::new(AuditEvent::HostCrashed {
                plugin_id: self.plugin_id.clone(),
                exit_code,
            }))
            .await;

        let (opened, decision) = {
            let mut inner = self.lock();
            inner.failures.push_back(Instant::now());
            if self.check_threshold(&mut inner) {
                (true, RestartDecision::GiveUp)
            } else {
                inner.health = HostHealth::Crashed;
                (
                    false,
                    RestartDecision::Restart {
                        backoff: Duration::from_millis(self.policy.restart_backoff_ms),
                    },
                )
            }
        };
        if opened {
            self.emit_circuit_opened().await;
        } else {
            warn!(plugin_id = %self.plugin_id, ?exit_code, "host crashed; will restart");
        }
        decision
    }

    /// The hosting runtime is respawning the host.
    pub async fn note_restarting(&self) {
        let restart_count = {
            let mut inner = self.lock();
            inner.health = HostHealth::Restarting;
            inner.restart_count = inner.restart_count.saturating_add(1);
            inner.restart_count
        };
        self.audit
            .record(AuditRecord::new(AuditEvent::HostRestarted {
                plugin_id: self.plugin_id.clone(),
                restart_count,
            }))
            .await;
    }

    /// Close the circuit and forget failure history (explicit reload).
    pub async fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.failures.clear();
            inner.health = HostHealth::Starting;
        }
        self.audit
            .record(AuditRecord::new(AuditEvent::CircuitClosed {
                plugin_id: self.plugin_id.clone(),
            }))
            .await;
    }

    /// How many times the host has been restarted.
    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.lock().restart_count
    }

    fn check_threshold(&self, inner: &mut Inner) -> bool {
        Self::prune(&mut inner.failures, self.policy.failure_window_secs);
        let count = u32::try_from(inner.failures.len()).unwrap_or(u32::MAX);
        if count >= self.policy.failure_threshold {
            inner.health = HostHealth::CircuitOpen;
            true
        } else {
            false
        }
    }

    async fn emit_circuit_opened(&self) {
        let failures = self.failures_in_window();
        warn!(
            plugin_id = %self.plugin_id,
            failures_in_window = failures,
            "circuit opened; calls will return unavailable"
        );
        self.audit
            .record(AuditRecord::new(AuditEvent::CircuitOpened {
                plugin_id: self.plugin_id.clone(),
                failures_in_window: failures,
            }))
            .await;
    }

    fn prune(failures: &mut VecDeque<Instant>, window_secs: u64) {
        let window = Duration::from_secs(window_secs);
        let now = Instant::now();
        while let Some(&front) = failures.front() {
            if now.duration_since(front) > window {
                failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("plugin_id", &self.plugin_id)
            .field("health", &self.health())
            .finish_non_exhaustive()
    }
}
