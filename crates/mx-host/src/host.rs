//! The hosting runtime: one supervised subprocess per hosted plugin.
//!
//! A [`HostHandle`] owns everything about one plugin's host: the spawn
//! parameters, the live RPC channel, and the [`Supervisor`] that is
//! the single source of truth for its health. Crash detection is the
//! watchdog's job — a dedicated task awaiting `child.wait()` — never
//! the caller's RPC timeout alone. While the circuit is open, calls are
//! answered by the deterministic stub without touching the process.
//!
//! Calls on one host are serialized (a conservative default bounding
//! worst-case resource use); calls to different hosts proceed fully in
//! parallel, and a blocked call on one host never blocks another.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use mx_broker::Provider;
use mx_core::{CallError, CallOutcome, CapabilityCall, PluginId};
use mx_plugins::PluginManifest;

use crate::error::{HostError, HostResult};
use crate::rpc::RpcChannel;
use crate::sandbox::SandboxProfile;
use crate::stub::StubProvider;
use crate::supervisor::{RestartDecision, Supervisor};

/// Everything needed to (re)spawn one host process.
#[derive(Debug, Clone)]
pub struct HostSpec {
    /// The plugin being hosted.
    pub plugin_id: PluginId,
    /// Absolute path of the host executable.
    pub executable: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Sandbox profile applied before exec.
    pub profile: SandboxProfile,
    /// Extra environment from plugin settings (filtered through the
    /// spawn-env blocklist at spawn time).
    pub extra_env: BTreeMap<String, String>,
    /// Upper bound on a whole call or response.
    pub max_call_bytes: u64,
}

impl HostSpec {
    /// Build a spec from an admitted manifest.
    ///
    /// The first entrypoint's path names the host executable; the host
    /// binary serves every capability the manifest declares, dispatched
    /// by the envelope's capability name.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::ExecutableMissing`] if the entrypoint path
    /// does not exist inside the plugin directory.
    pub fn from_manifest(
        manifest: &PluginManifest,
        plugin_dir: &std::path::Path,
        profile: SandboxProfile,
        max_call_bytes: u64,
    ) -> HostResult<Self> {
        let entrypoint = manifest
            .entrypoints
            .first()
            .ok_or_else(|| HostError::ExecutableMissing {
                plugin_id: manifest.plugin_id.clone(),
                path: plugin_dir.to_path_buf(),
            })?;
        let executable = plugin_dir.join(&entrypoint.path);
        if !executable.is_file() {
            return Err(HostError::ExecutableMissing {
                plugin_id: manifest.plugin_id.clone(),
                path: executable,
            });
        }

        // Default settings ride along as env; the blocklist filter at
        // spawn time has the final say.
        let mut extra_env = BTreeMap::new();
        if let Some(toml::Value::Table(settings)) = &manifest.default_settings {
            for (key, value) in settings {
                if let toml::Value::String(s) = value {
                    extra_env.insert(key.to_ascii_uppercase(), s.clone());
                }
            }
        }

        Ok(Self {
            plugin_id: manifest.plugin_id.clone(),
            executable,
            args: vec!["serve".to_string(), entrypoint.callable.clone()],
            profile,
            extra_env,
            max_call_bytes,
        })
    }
}

/// One live (or circuit-broken) subprocess host.
pub struct HostHandle {
    spec: HostSpec,
    supervisor: Arc<Supervisor>,
    live: Mutex<Option<Arc<RpcChannel>>>,
    call_lock: Mutex<()>,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
    // Handed to the watchdog so a crashed host can reach back into its
    // own handle for the restart.
    weak_self: std::sync::Weak<HostHandle>,
}

impl HostHandle {
    /// Create a handle; the process is spawned lazily at first use (or
    /// eagerly via [`HostHandle::start`]).
    #[must_use]
    pub fn new(spec: HostSpec, supervisor: Arc<Supervisor>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            spec,
            supervisor,
            live: Mutex::new(None),
            call_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            weak_self: weak_self.clone(),
        })
    }

    /// The plugin this host serves.
    #[must_use]
    pub fn plugin_id(&self) -> &PluginId {
        &self.spec.plugin_id
    }

    /// This host's supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    /// Spawn the host process now (eager-spawn policy).
    ///
    /// # Errors
    ///
    /// Returns a [`HostError`] if the process cannot be spawned.
    pub async fn start(&self) -> HostResult<()> {
        self.ensure_started().await.map(|_| ())
    }

    /// Stop the host process without recording a crash.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        *self.live.lock().await = None;
    }

    /// Execute one capability call against this host.
    pub async fn call(&self, call: CapabilityCall) -> CallOutcome {
        if self.supervisor.is_circuit_open() {
            return StubProvider::new(self.spec.plugin_id.clone()).call(call).await;
        }

        // Conservative default: one in-flight call per host.
        let _serial = self.call_lock.lock().await;

        let channel = match self.ensure_started().await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(plugin_id = %self.spec.plugin_id, error = %e, "host unavailable");
                return Err(CallError::Unavailable {
                    plugin_id: self.spec.plugin_id.to_string(),
                    capability: call.capability.to_string(),
                });
            },
        };

        let outcome = channel.call(call).await;
        match &outcome {
            Ok(_) => self.supervisor.note_active(),
            Err(CallError::Timeout { .. }) => {
                // Degrade, do not kill: transient slow calls must not
                // thrash the host into restarts.
                self.supervisor.record_timeout().await;
            },
            // Crash accounting belongs to the watchdog, which sees the
            // exit directly.
            Err(_) => {},
        }
        outcome
    }

    /// Get the live channel, spawning the process if necessary.
    async fn ensure_started(&self) -> HostResult<Arc<RpcChannel>> {
        let mut live = self.live.lock().await;
        if let Some(channel) = live.as_ref() {
            return Ok(Arc::clone(channel));
        }
        let channel = self.spawn_process().await?;
        *live = Some(Arc::clone(&channel));
        self.supervisor.note_active();
        Ok(channel)
    }

    /// Spawn the child process, wire up its RPC channel, and start the
    /// watchdog.
    async fn spawn_process(&self) -> HostResult<Arc<RpcChannel>> {
        let spec = &self.spec;

        let tmp_dir = spec.profile.run_dir.join("tmp");
        std::fs::create_dir_all(&tmp_dir).map_err(|source| HostError::RunDir {
            path: tmp_dir,
            source,
        })?;

        let mut command = Command::new(&spec.executable);
        command
            .args(&spec.args)
            .current_dir(&spec.profile.plugin_dir)
            .env_clear()
            .envs(spec.profile.spawn_env(&spec.extra_env))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        spec.profile.apply_to_command(&mut command);

        let mut child = command.spawn().map_err(|source| HostError::Spawn {
            plugin_id: spec.plugin_id.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or_else(|| HostError::NoStdio {
            plugin_id: spec.plugin_id.clone(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| HostError::NoStdio {
            plugin_id: spec.plugin_id.clone(),
        })?;

        info!(
            plugin_id = %spec.plugin_id,
            executable = %spec.executable.display(),
            "spawned host process"
        );

        let channel = Arc::new(RpcChannel::new(
            spec.plugin_id.clone(),
            stdout,
            stdin,
            spec.max_call_bytes,
        ));

        // The watchdog owns the child and is the only exit detector.
        let weak = self.weak_self.clone();
        let plugin_id = spec.plugin_id.clone();
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let exit_code = status.ok().and_then(|s| s.code());
                    if let Some(handle) = weak.upgrade() {
                        handle.handle_exit(exit_code).await;
                    }
                },
                () = shutdown.notified() => {
                    debug!(plugin_id = %plugin_id, "shutting down host");
                    let _ = child.kill().await;
                },
            }
        });

        Ok(channel)
    }

    /// React to an unexpected child exit: audit, then restart or give
    /// up per the supervisor's decision.
    ///
    /// Boxed rather than an `async fn`: the respawn path re-enters
    /// `spawn_process`, whose watchdog awaits this function again, and
    /// the type erasure is what keeps that future finite.
    fn handle_exit(
        self: Arc<Self>,
        exit_code: Option<i32>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            *self.live.lock().await = None;
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }

            match self.supervisor.record_crash(exit_code).await {
                RestartDecision::Restart { backoff } => {
                    tokio::time::sleep(backoff).await;
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    self.supervisor.note_restarting().await;
                    let mut live = self.live.lock().await;
                    if live.is_none() {
                        match self.spawn_process().await {
                            Ok(channel) => {
                                *live = Some(channel);
                                self.supervisor.note_active();
                            },
                            Err(e) => {
                                drop(live);
                                warn!(
                                    plugin_id = %self.spec.plugin_id,
                                    error = %e,
                                    "restart failed"
                                );
                                // A failed respawn counts like another crash.
                                let _ = self.supervisor.record_crash(None).await;
                            },
                        }
                    }
                },
                RestartDecision::GiveUp => {
                    info!(
                        plugin_id = %self.spec.plugin_id,
                        "circuit open; host will not be restarted"
                    );
                },
            }
        })
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("plugin_id", &self.spec.plugin_id)
            .field("executable", &self.spec.executable)
            .field("health", &self.supervisor.health())
            .finish_non_exhaustive()
    }
}

/// Broker-facing provider dispatching to a [`HostHandle`].
#[derive(Debug, Clone)]
pub struct HostProvider {
    host: Arc<HostHandle>,
}

impl HostProvider {
    /// Wrap a host handle.
    #[must_use]
    pub fn new(host: Arc<HostHandle>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl Provider for HostProvider {
    async fn call(&self, call: CapabilityCall) -> CallOutcome {
        self.host.call(call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_config::SupervisorPolicy;
    use mx_core::{CapabilityName, NullAuditSink};
    use crate::supervisor::HostHealth;
    use std::time::Duration;

    fn spec_for(executable: &str, run_dir: &std::path::Path) -> HostSpec {
        let plugin_id = PluginId::from_static("builtin.test");
        HostSpec {
            plugin_id: plugin_id.clone(),
            executable: PathBuf::from(executable),
            args: Vec::new(),
            profile: SandboxProfile::new(
                plugin_id,
                run_dir.to_path_buf(),
                run_dir.to_path_buf(),
            ),
            extra_env: BTreeMap::new(),
            max_call_bytes: 1024 * 1024,
        }
    }

    fn supervisor(threshold: u32) -> Arc<Supervisor> {
        Arc::new(Supervisor::new(
            PluginId::from_static("builtin.test"),
            SupervisorPolicy {
                failure_threshold: threshold,
                failure_window_secs: 60,
                restart_backoff_ms: 10,
            },
            Arc::new(NullAuditSink),
        ))
    }

    fn call() -> CapabilityCall {
        CapabilityCall::new(
            CapabilityName::from_static("test.op"),
            serde_json::json!({}),
        )
        .with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn missing_executable_surfaces_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/nonexistent/host-binary", dir.path());
        let host = HostHandle::new(spec, supervisor(3));

        let err = host.call(call()).await.unwrap_err();
        assert!(matches!(err, CallError::Unavailable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_host_times_out_and_degrades() {
        // `cat` stays alive and echoes our own request frames back,
        // which the router discards as malformed responses.
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/cat", dir.path());
        let sup = supervisor(3);
        let host = HostHandle::new(spec, Arc::clone(&sup));

        let err = host.call(call()).await.unwrap_err();
        assert!(matches!(err, CallError::Timeout { .. }));
        assert_eq!(sup.health(), HostHealth::Degraded);
        assert_eq!(sup.failures_in_window(), 1);

        host.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exiting_host_fails_call_and_records_crash() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/true", dir.path());
        let sup = supervisor(10);
        let host = HostHandle::new(spec, Arc::clone(&sup));

        let err = host.call(call()).await.unwrap_err();
        assert!(matches!(
            err,
            CallError::Crashed { .. } | CallError::Timeout { .. } | CallError::Protocol(_)
        ));

        // Give the watchdog a moment to observe the exit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sup.failures_in_window() >= 1);

        host.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn circuit_open_answers_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        // Threshold 1: the first crash opens the circuit.
        let spec = spec_for("/bin/true", dir.path());
        let sup = supervisor(1);
        let host = HostHandle::new(spec, Arc::clone(&sup));

        let _ = host.call(call()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(sup.is_circuit_open());

        let err = host.call(call()).await.unwrap_err();
        assert!(matches!(err, CallError::Unavailable { .. }));
    }

    #[test]
    fn host_spec_from_manifest_requires_executable() {
        use mx_plugins::{
            Compat, Entrypoint, EntrypointKind, FilesystemPolicy, HashLock, Permissions,
        };
        use mx_core::Version;

        let dir = tempfile::tempdir().unwrap();
        let manifest = PluginManifest {
            plugin_id: PluginId::from_static("builtin.test"),
            version: Version::new(1, 0, 0),
            enabled: true,
            entrypoints: vec![Entrypoint {
                kind: EntrypointKind::Capability,
                id: "test.op".into(),
                path: "bin/host".into(),
                callable: "serve".into(),
            }],
            permissions: Permissions::default(),
            compat: Compat {
                requires_kernel: Version::new(0, 1, 0),
                requires_schema_versions: std::collections::BTreeSet::new(),
            },
            depends_on: Vec::new(),
            hash_lock: HashLock {
                manifest_digest: "blake3:aa".into(),
                artifact_digest: "blake3:bb".into(),
            },
            required_capabilities: Vec::new(),
            filesystem_policy: FilesystemPolicy::default(),
            settings_schema: None,
            default_settings: None,
            io_contracts: std::collections::BTreeMap::new(),
        };
        let profile = SandboxProfile::new(
            PluginId::from_static("builtin.test"),
            dir.path().join("run"),
            dir.path().to_path_buf(),
        );

        // Executable absent.
        let err = HostSpec::from_manifest(&manifest, dir.path(), profile.clone(), 1024).unwrap_err();
        assert!(matches!(err, HostError::ExecutableMissing { .. }));

        // Present after creating the file.
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/host"), b"#!/bin/sh\n").unwrap();
        let spec = HostSpec::from_manifest(&manifest, dir.path(), profile, 1024).unwrap();
        assert_eq!(spec.args, vec!["serve".to_string(), "serve".to_string()]);
    }
}
