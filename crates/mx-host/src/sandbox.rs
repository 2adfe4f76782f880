//! OS-level confinement for subprocess hosts.
//!
//! A [`SandboxProfile`] is compiled from a plugin's resolved permission
//! profile before spawn:
//!
//! - **Linux**: Landlock path rules (kernel 5.13+) applied pre-exec
//! - **Other**: no kernel enforcement; the broker-side permission guard
//!   remains, and a warning is logged
//!
//! The spawn environment is never inherited: it is rebuilt from
//! [`mx_core::base_spawn_env`] with `HOME`/`TMPDIR` pinned to the
//! plugin's private run directory, and manifest-supplied settings are
//! filtered through the spawn-env blocklist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use mx_core::{is_blocked_spawn_env, PluginId};

/// Resource limits applied to a subprocess host.
///
/// Enforced via `setrlimit` in a pre-exec hook on Linux. `RLIMIT_NPROC`
/// is per-UID on Linux, not per-process; the limit must account for
/// everything the user runs. `RLIMIT_AS` limits virtual address space,
/// not RSS.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of processes/threads (`RLIMIT_NPROC`).
    pub max_processes: u64,
    /// Maximum virtual address space in bytes (`RLIMIT_AS`).
    pub max_memory_bytes: u64,
    /// Maximum number of open file descriptors (`RLIMIT_NOFILE`).
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_processes: 64,
            max_memory_bytes: 2 * 1024 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

/// Filesystem and resource confinement for one host process.
#[derive(Debug, Clone)]
pub struct SandboxProfile {
    /// The plugin being confined.
    pub plugin_id: PluginId,
    /// Private run directory — read+write, HOME and TMPDIR point here.
    pub run_dir: PathBuf,
    /// Plugin install directory — read-only (code and assets).
    pub plugin_dir: PathBuf,
    /// Additional read-only paths from the resolved filesystem policy.
    pub read_paths: Vec<PathBuf>,
    /// Additional read+write paths from the resolved filesystem policy.
    pub write_paths: Vec<PathBuf>,
    /// Resource limits for the host process.
    pub resource_limits: ResourceLimits,
    /// Whether the plugin holds the network grant. When `false`, TCP
    /// bind/connect are denied at the kernel level where Landlock
    /// supports it.
    pub network: bool,
}

impl SandboxProfile {
    /// Create a profile granting only the run and install directories.
    #[must_use]
    pub fn new(plugin_id: PluginId, run_dir: PathBuf, plugin_dir: PathBuf) -> Self {
        Self {
            plugin_id,
            run_dir,
            plugin_dir,
            read_paths: Vec::new(),
            write_paths: Vec::new(),
            resource_limits: ResourceLimits::default(),
            network: false,
        }
    }

    /// Grant the network permission (egress gateway only).
    #[must_use]
    pub const fn with_network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    /// Add read-only paths.
    #[must_use]
    pub fn with_read_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.read_paths = paths;
        self
    }

    /// Add read+write paths.
    #[must_use]
    pub fn with_write_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.write_paths = paths;
        self
    }

    /// Override the resource limits.
    #[must_use]
    pub fn with_resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    /// Build the sanitized environment for the host process.
    ///
    /// Starts from the minimal base environment pinned to the run
    /// directory, then applies `extra` entries that survive the
    /// spawn-env blocklist. Blocked keys are dropped with a warning,
    /// never honoured.
    #[must_use]
    pub fn spawn_env(&self, extra: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut env = mx_core::base_spawn_env(&self.run_dir);
        for (key, value) in extra {
            if is_blocked_spawn_env(key) {
                warn!(
                    plugin_id = %self.plugin_id,
                    key = %key,
                    "dropping blocked spawn env var from plugin settings"
                );
                continue;
            }
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// The Landlock path rules for this profile.
    ///
    /// Returns `(path, writable)` pairs; the spawner turns them into
    /// `PathBeneath` rules and applies them pre-exec together with the
    /// resource limits.
    #[must_use]
    pub fn path_rules(&self) -> Vec<(PathBuf, bool)> {
        let mut rules = vec![
            (self.run_dir.clone(), true),
            (self.plugin_dir.clone(), false),
        ];
        for sys_path in &["/usr/lib", "/usr/local/lib", "/usr/bin", "/usr/local/bin", "/bin", "/lib"] {
            let path = Path::new(sys_path);
            if path.exists() {
                rules.push((path.to_path_buf(), false));
            }
        }
        for path in &self.read_paths {
            rules.push((path.clone(), false));
        }
        for path in &self.write_paths {
            rules.push((path.clone(), true));
        }
        rules
    }

    /// Apply this profile to a command about to be spawned.
    ///
    /// On Linux this installs a pre-exec hook enforcing the Landlock
    /// rules and resource limits in the child before `exec`. Elsewhere
    /// it logs that kernel-level enforcement is unavailable; the
    /// broker-side permission guard still applies.
    pub fn apply_to_command(&self, command: &mut tokio::process::Command) {
        self.platform_apply(command);
    }

    #[cfg(target_os = "linux")]
    fn platform_apply(&self, command: &mut tokio::process::Command) {
        use landlock::{
            ABI, Access, AccessFs, AccessNet, PathBeneath, PathFd, Ruleset, RulesetAttr,
            RulesetCreatedAttr,
        };

        let rules = self.path_rules();
        let limits = self.resource_limits.clone();
        let network = self.network;
        let plugin_id = self.plugin_id.to_string();

        // The hook runs in the forked child, pre-exec. Keep it free of
        // allocation-heavy work and never panic.
        #[allow(unsafe_code)]
        // SAFETY: the pre_exec closure only calls async-signal-safe
        // setrlimit and Landlock syscalls.
        unsafe {
            command.pre_exec(move || {
                use nix::sys::resource::{Resource, setrlimit};

                setrlimit(
                    Resource::RLIMIT_NPROC,
                    limits.max_processes,
                    limits.max_processes,
                )
                .map_err(std::io::Error::from)?;
                setrlimit(
                    Resource::RLIMIT_AS,
                    limits.max_memory_bytes,
                    limits.max_memory_bytes,
                )
                .map_err(std::io::Error::from)?;
                setrlimit(
                    Resource::RLIMIT_NOFILE,
                    limits.max_open_files,
                    limits.max_open_files,
                )
                .map_err(std::io::Error::from)?;

                let abi = ABI::V2;
                let mut builder = Ruleset::default()
                    .handle_access(AccessFs::from_all(abi))
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                if !network {
                    // Handling the net access rights without adding any
                    // rule denies all TCP bind/connect (best-effort on
                    // kernels older than Landlock ABI v4).
                    builder = builder
                        .handle_access(AccessNet::from_all(ABI::V5))
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                }
                let mut ruleset = builder
                    .create()
                    .map_err(|e| std::io::Error::other(e.to_string()))?;

                for (path, writable) in &rules {
                    let access = if *writable {
                        AccessFs::from_all(abi)
                    } else {
                        AccessFs::from_read(abi)
                    };
                    let Ok(fd) = PathFd::new(path) else {
                        continue; // declared path absent on this system
                    };
                    ruleset = ruleset
                        .add_rule(PathBeneath::new(fd, access))
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                }

                ruleset
                    .restrict_self()
                    .map_err(|e| std::io::Error::other(format!("landlock for {plugin_id}: {e}")))?;
                Ok(())
            });
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn platform_apply(&self, _command: &mut tokio::process::Command) {
        warn!(
            plugin_id = %self.plugin_id,
            "kernel-level sandboxing is unavailable on this platform; \
             relying on broker-side permission enforcement only"
        );
    }
}
