//! Kernel boot: the sequential stages that produce a running system.
//!
//! Boot is deterministic and single-flow: discovery → hash-lock
//! verification → admission gate → dependency resolution → host
//! creation → registry population → permission wrapping → seal. Each
//! per-plugin failure is recovered locally and audited; the kernel
//! still produces a usable (possibly smaller) capability set. Only
//! system-wide invariant violations — an unreadable lockfile, a
//! required capability with zero providers — abort the boot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use mx_broker::{HostingMode, Provider, ProviderHandle, SharedSystem, System};
use mx_config::LayeredConfig;
use mx_core::{
    AuditEvent, AuditRecord, AuditSink, CapabilityName, PluginId, Version,
};
use mx_host::{
    HostHandle, HostProvider, HostSpec, PermissionGuard, PermissionProfile, SandboxProfile,
    Supervisor,
};
use mx_plugins::{
    AdmissionGate, DiscoveredPlugin, PluginLock, RejectReason, ResolveFailure, discover,
    resolve_load_order, verify_against_lock,
};

use crate::error::{BootError, BootResult};
use crate::journal::{AuditPipe, JOURNAL_CAPABILITY, JournalAuditSink};

/// Everything a boot needs.
#[derive(Clone)]
pub struct BootOptions {
    /// Plugin root directories, highest-trust first.
    pub plugin_roots: Vec<PathBuf>,
    /// Path of the pinned lockfile.
    pub lockfile_path: PathBuf,
    /// Root under which each plugin gets its private run directory.
    pub run_root: PathBuf,
    /// Kernel data root (the `${data_dir}` template variable).
    pub data_dir: PathBuf,
    /// Restrict admission to the default pack and ignore user config.
    pub safe_mode: bool,
    /// The layered configuration.
    pub config: LayeredConfig,
    /// The running kernel version checked against `requires_kernel`.
    pub kernel_version: Version,
    /// Storage schema versions this kernel supports.
    pub supported_schema_versions: BTreeSet<u32>,
    /// In-process provider table for operator-allowlisted plugins.
    ///
    /// A plugin runs in-process only when its id is on the config
    /// `inproc_allowlist` AND an entry exists here; everything else is
    /// hosted out of process.
    pub inproc_providers: BTreeMap<PluginId, Arc<dyn Provider>>,
}

impl BootOptions {
    /// Options with defaults for version, schema support, and hosting.
    #[must_use]
    pub fn new(
        plugin_roots: Vec<PathBuf>,
        lockfile_path: PathBuf,
        run_root: PathBuf,
        data_dir: PathBuf,
        config: LayeredConfig,
    ) -> Self {
        Self {
            plugin_roots,
            lockfile_path,
            run_root,
            data_dir,
            safe_mode: false,
            config,
            kernel_version: Version::current(),
            supported_schema_versions: BTreeSet::from([1]),
            inproc_providers: BTreeMap::new(),
        }
    }

    /// Boot in safe mode.
    #[must_use]
    pub const fn with_safe_mode(mut self, safe_mode: bool) -> Self {
        self.safe_mode = safe_mode;
        self
    }

    /// Register an in-process provider for an allowlisted plugin.
    #[must_use]
    pub fn with_inproc_provider(mut self, id: PluginId, provider: Arc<dyn Provider>) -> Self {
        self.inproc_providers.insert(id, provider);
        self
    }
}

/// Summary of what a boot admitted and rejected.
#[derive(Debug, Clone)]
pub struct BootReport {
    /// Whether this was a safe-mode boot.
    pub safe_mode: bool,
    /// Admitted plugins in load order.
    pub admitted: Vec<PluginId>,
    /// Rejected plugins with machine-readable reasons.
    pub rejections: Vec<(PluginId, String)>,
    /// Discovery-stage failures (malformed manifests, symlinks, I/O).
    pub discovery_failures: Vec<String>,
    /// Capabilities registered after sealing.
    pub capability_count: usize,
}

/// A booted kernel: the sealed registry plus its hosts.
pub struct Kernel {
    system: SharedSystem,
    audit: Arc<AuditPipe>,
    hosts: Vec<Arc<HostHandle>>,
    report: BootReport,
    options: BootOptions,
}

impl Kernel {
    /// The capability registry, the sole means of reaching plugin
    /// functionality.
    #[must_use]
    pub fn system(&self) -> &SharedSystem {
        &self.system
    }

    /// What this boot admitted and rejected.
    #[must_use]
    pub fn report(&self) -> &BootReport {
        &self.report
    }

    /// The audit sink events flow through.
    #[must_use]
    pub fn audit(&self) -> Arc<dyn AuditSink> {
        Arc::clone(&self.audit) as Arc<dyn AuditSink>
    }

    /// Stop every subprocess host.
    pub async fn shutdown(&self) {
        for host in &self.hosts {
            host.shutdown().await;
        }
    }

    /// Audited reload: rebuild the registry from disk and swap it in
    /// atomically. Hosts from the previous registry are shut down; an
    /// open circuit on an old host is closed (and audited) as part of
    /// being replaced by its fresh equivalent.
    ///
    /// # Errors
    ///
    /// Fails like a boot would; on error the previous registry keeps
    /// serving unchanged.
    pub async fn reload(&mut self) -> BootResult<&BootReport> {
        let audit: Arc<dyn AuditSink> = Arc::clone(&self.audit) as Arc<dyn AuditSink>;
        let (system, hosts, report) = build(&self.options, &audit).await?;

        for host in &self.hosts {
            if host.supervisor().is_circuit_open() {
                host.supervisor().reset().await;
            }
            host.shutdown().await;
        }

        let capability_count = system.len();
        self.system.swap(system);
        self.hosts = hosts;
        self.report = report;
        self.audit
            .record(AuditRecord::new(AuditEvent::RegistryReloaded {
                capability_count,
            }))
            .await;
        Ok(&self.report)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

/// Run a full boot.
///
/// # Errors
///
/// Returns a [`BootError`] only for system-wide failures; per-plugin
/// problems are reported through the [`BootReport`].
pub async fn boot(options: BootOptions) -> BootResult<Kernel> {
    let audit_pipe = AuditPipe::new();
    let audit: Arc<dyn AuditSink> = Arc::clone(&audit_pipe) as Arc<dyn AuditSink>;

    let (system, hosts, report) = build(&options, &audit).await?;
    let capability_count = system.len();
    let plugin_count = report.admitted.len();
    let shared = SharedSystem::new(system);

    // From here on, audit events flow to the journal plugin when one
    // was admitted.
    let journal = CapabilityName::from_static(JOURNAL_CAPABILITY);
    if shared.current().has(&journal) {
        audit_pipe.switch(Arc::new(JournalAuditSink::new(shared.clone())));
    }
    audit_pipe
        .record(AuditRecord::new(AuditEvent::RegistrySealed {
            capability_count,
            plugin_count,
            safe_mode: options.safe_mode,
        }))
        .await;

    Ok(Kernel {
        system: shared,
        audit: audit_pipe,
        hosts,
        report,
        options,
    })
}

/// The boot pipeline shared by `boot` and `Kernel::reload`.
async fn build(
    options: &BootOptions,
    audit: &Arc<dyn AuditSink>,
) -> BootResult<(System, Vec<Arc<HostHandle>>, BootReport)> {
    let config = options.config.effective(options.safe_mode);
    info!(
        safe_mode = options.safe_mode,
        roots = options.plugin_roots.len(),
        "starting boot"
    );

    // Stage 1: manifest store.
    let discovery = discover(&options.plugin_roots);
    let discovery_failures: Vec<String> = discovery
        .failures
        .iter()
        .map(|f| format!("{}: {}", f.dir.display(), f.error))
        .collect();

    // Stage 2: hash-lock verification (fail closed).
    let lock = PluginLock::load_or_default(&options.lockfile_path)?;
    let verified = verify_against_lock(discovery.plugins, &lock);

    // Stage 3: allowlist / safe-mode / compat gate.
    let gate = AdmissionGate::new(
        config,
        options.kernel_version,
        options.supported_schema_versions.clone(),
    );
    let outcome = gate.filter(verified, options.safe_mode);

    let mut rejections: Vec<(PluginId, String)> = Vec::new();
    for rejection in &outcome.rejections {
        if let RejectReason::HashRejected { expected, actual } = &rejection.reason {
            audit
                .record(AuditRecord::new(AuditEvent::HashRejected {
                    plugin_id: rejection.plugin_id.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                }))
                .await;
        }
        audit
            .record(AuditRecord::new(AuditEvent::PluginRejected {
                plugin_id: rejection.plugin_id.clone(),
                reason: rejection.reason.as_str().to_string(),
            }))
            .await;
        rejections.push((
            rejection.plugin_id.clone(),
            rejection.reason.as_str().to_string(),
        ));
    }

    // Stage 4: dependency resolution.
    let manifests: Vec<_> = outcome.admitted.iter().map(|p| &p.manifest).collect();
    let resolved = resolve_load_order(&manifests);
    for (plugin_id, failure) in &resolved.excluded {
        let reason = match failure {
            ResolveFailure::DependencyCycle { .. } => "dependency_cycle",
            ResolveFailure::UnresolvedDependency { .. } => "unresolved_dependency",
            ResolveFailure::DependentExcluded { .. } => "dependent_excluded",
        };
        warn!(plugin_id = %plugin_id, %failure, "excluded by dependency resolver");
        audit
            .record(AuditRecord::new(AuditEvent::PluginRejected {
                plugin_id: plugin_id.clone(),
                reason: reason.to_string(),
            }))
            .await;
        rejections.push((plugin_id.clone(), reason.to_string()));
    }

    let by_id: BTreeMap<PluginId, DiscoveredPlugin> = outcome
        .admitted
        .into_iter()
        .map(|p| (p.manifest.plugin_id.clone(), p))
        .collect();

    // Stage 5: hosting + registration, in load order.
    let mut system = if config.plugins.prefer_healthy_providers {
        System::with_failure_ordering()
    } else {
        System::new()
    };
    let mut hosts: Vec<Arc<HostHandle>> = Vec::new();
    let mut admitted: Vec<PluginId> = Vec::new();

    for plugin_id in &resolved.order {
        let Some(plugin) = by_id.get(plugin_id) else {
            continue;
        };
        match register_plugin(options, config, plugin, &mut system, audit).await {
            Ok(Some(host)) => {
                hosts.push(host);
                admitted.push(plugin_id.clone());
            },
            Ok(None) => {
                admitted.push(plugin_id.clone());
            },
            Err(reason) => {
                warn!(plugin_id = %plugin_id, reason = %reason, "plugin failed to register");
                audit
                    .record(AuditRecord::new(AuditEvent::PluginRejected {
                        plugin_id: plugin_id.clone(),
                        reason: reason.clone(),
                    }))
                    .await;
                rejections.push((plugin_id.clone(), reason));
            },
        }
    }

    // Stage 6: seal — registration is closed, ordering is final.
    system.seal();

    // Boot-level invariant: every required capability has a provider.
    let missing: Vec<CapabilityName> = config
        .required_capabilities
        .iter()
        .filter(|name| !system.has(name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BootError::RequiredCapabilityUnavailable { missing });
    }

    let report = BootReport {
        safe_mode: options.safe_mode,
        admitted,
        rejections,
        discovery_failures,
        capability_count: system.len(),
    };
    info!(
        admitted = report.admitted.len(),
        rejected = report.rejections.len(),
        capabilities = report.capability_count,
        "boot complete"
    );
    Ok((system, hosts, report))
}

/// Create the host (if any) and register every capability entrypoint of
/// one admitted plugin. Returns the host handle for subprocess-hosted
/// plugins.
async fn register_plugin(
    options: &BootOptions,
    config: &mx_config::KernelConfig,
    plugin: &DiscoveredPlugin,
    system: &mut System,
    audit: &Arc<dyn AuditSink>,
) -> Result<Option<Arc<HostHandle>>, String> {
    let manifest = &plugin.manifest;
    let plugin_id = &manifest.plugin_id;

    let run_dir = options.run_root.join(plugin_id.as_str());
    std::fs::create_dir_all(&run_dir)
        .map_err(|e| format!("run_dir_unavailable: {e}"))?;

    let profile = Arc::new(PermissionProfile::resolve(
        manifest,
        &plugin.dir,
        &run_dir,
        &options.data_dir,
    ));

    let inproc = config.plugins.inproc_allowlist.contains(plugin_id)
        && options.inproc_providers.contains_key(plugin_id);

    let (mode, base_provider, host) = if inproc {
        let provider = Arc::clone(
            options
                .inproc_providers
                .get(plugin_id)
                .ok_or_else(|| "inproc_provider_missing".to_string())?,
        );
        (HostingMode::InProcess, provider, None)
    } else {
        let sandbox = SandboxProfile::new(plugin_id.clone(), run_dir.clone(), plugin.dir.clone())
            .with_read_paths(profile.read_roots().to_vec())
            .with_write_paths(profile.write_roots().to_vec())
            .with_network(profile.network());
        let spec = HostSpec::from_manifest(
            manifest,
            &plugin.dir,
            sandbox,
            config.hosting.max_call_bytes,
        )
        .map_err(|e| format!("host_executable_missing: {e}"))?;

        let supervisor = Arc::new(Supervisor::new(
            plugin_id.clone(),
            config.supervisor.clone(),
            Arc::clone(audit),
        ));
        let host = HostHandle::new(spec, supervisor);
        if config.hosting.eager_spawn {
            if let Err(e) = host.start().await {
                // Lazy respawn at first call still applies; the host is
                // registered regardless.
                warn!(plugin_id = %plugin_id, error = %e, "eager spawn failed");
            }
        }
        let provider: Arc<dyn Provider> = Arc::new(HostProvider::new(Arc::clone(&host)));
        (HostingMode::Subprocess, provider, Some(host))
    };

    for capability in manifest.provided_capabilities() {
        let guarded: Arc<dyn Provider> = Arc::new(PermissionGuard::new(
            Arc::clone(&profile),
            Arc::clone(&base_provider),
            Arc::clone(audit),
        ));
        let handle = ProviderHandle::new(plugin_id.clone(), capability.clone(), mode, guarded)
            .with_priority(manifest.priority_for(&capability))
            .with_flags(profile.gpu(), profile.raw_input());
        system
            .register(handle)
            .map_err(|e| format!("registration_failed: {e}"))?;
    }

    audit
        .record(AuditRecord::new(AuditEvent::PluginAdmitted {
            plugin_id: plugin_id.clone(),
            version: manifest.version.to_string(),
            inproc,
        }))
        .await;

    Ok(host)
}
