//! Environment variable policy for spawned plugin hosts.
//!
//! A subprocess host never inherits the kernel's ambient environment.
//! Its environment is built from scratch with [`base_spawn_env`], and any
//! variable a manifest asks to add is refused if it can inject code,
//! libraries, or redirect trust anchors. All spawn sites MUST use this
//! module rather than maintaining their own inline blocklists.

use std::collections::BTreeMap;

/// Env vars that must never be set by untrusted configuration on spawned
/// plugin hosts.
const BLOCKED_SPAWN_ENV: &[&str] = &[
    // Core execution environment
    "HOME",
    "PATH",
    "MX_HOME",
    // Library injection (Linux)
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    // Library injection (macOS)
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "DYLD_FRAMEWORK_PATH",
    // Interpreter code injection
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "NODE_OPTIONS",
    "NODE_PATH",
    "PERL5LIB",
    "RUBYLIB",
    // Shell startup injection
    "BASH_ENV",
    "ENV",
    // TLS/CA trust injection (MITM)
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
    "NODE_EXTRA_CA_CERTS",
    "OPENSSL_CONF",
    // Temp directory redirection
    "TMPDIR",
    "TEMP",
    "TMP",
    // Traffic interception via proxy
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "NO_PROXY",
];

/// Prefixes that are blocked entirely (case-insensitive).
const BLOCKED_PREFIXES: &[&str] = &["ld_", "dyld_"];

/// Returns `true` if `key` must not be set by untrusted configuration on
/// a spawned plugin host.
///
/// Checks both exact matches and blocked prefixes, case-insensitively.
#[must_use]
pub fn is_blocked_spawn_env(key: &str) -> bool {
    if BLOCKED_SPAWN_ENV
        .iter()
        .any(|k| k.eq_ignore_ascii_case(key))
    {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    BLOCKED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// The minimal base environment for a spawned plugin host.
///
/// `run_dir` is the plugin's private run directory; `HOME` and `TMPDIR`
/// are pinned there so a host can never write into ambient cache or temp
/// locations. `PATH` is fixed to the system directories the kernel
/// trusts. Everything else starts absent.
#[must_use]
pub fn base_spawn_env(run_dir: &std::path::Path) -> BTreeMap<String, String> {
    let run = run_dir.display().to_string();
    let mut env = BTreeMap::new();
    env.insert("HOME".to_string(), run.clone());
    env.insert("TMPDIR".to_string(), format!("{run}/tmp"));
    env.insert(
        "PATH".to_string(),
        "/usr/local/bin:/usr/bin:/bin".to_string(),
    );
    env.insert("LANG".to_string(), "C.UTF-8".to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn exact_matches_are_blocked() {
        assert!(is_blocked_spawn_env("LD_PRELOAD"));
        assert!(is_blocked_spawn_env("DYLD_INSERT_LIBRARIES"));
        assert!(is_blocked_spawn_env("NODE_OPTIONS"));
        assert!(is_blocked_spawn_env("PYTHONPATH"));
        assert!(is_blocked_spawn_env("HOME"));
        assert!(is_blocked_spawn_env("PATH"));
        assert!(is_blocked_spawn_env("MX_HOME"));
        assert!(is_blocked_spawn_env("HTTP_PROXY"));
        assert!(is_blocked_spawn_env("HTTPS_PROXY"));
        assert!(is_blocked_spawn_env("ALL_PROXY"));
        assert!(is_blocked_spawn_env("NO_PROXY"));
        assert!(is_blocked_spawn_env("SSL_CERT_FILE"));
        assert!(is_blocked_spawn_env("TMPDIR"));
    }

    #[test]
    fn case_insensitive_matching() {
        assert!(is_blocked_spawn_env("ld_preload"));
        assert!(is_blocked_spawn_env("Http_Proxy"));
        assert!(is_blocked_spawn_env("home"));
    }

    #[test]
    fn prefix_blocking_catches_novel_vars() {
        assert!(is_blocked_spawn_env("LD_DEBUG"));
        assert!(is_blocked_spawn_env("DYLD_PRINT_LIBRARIES"));
    }

    #[test]
    fn safe_vars_are_allowed() {
        assert!(!is_blocked_spawn_env("MY_PLUGIN_SETTING"));
        assert!(!is_blocked_spawn_env("LANG"));
        assert!(!is_blocked_spawn_env("LDFLAGS")); // not ld_ prefix (l-d, not ld_)
        assert!(!is_blocked_spawn_env("TERM"));
    }

    #[test]
    fn base_env_pins_home_and_tmp() {
        let env = base_spawn_env(Path::new("/var/mx/run/builtin.ocr"));
        assert_eq!(env.get("HOME").unwrap(), "/var/mx/run/builtin.ocr");
        assert_eq!(env.get("TMPDIR").unwrap(), "/var/mx/run/builtin.ocr/tmp");
        assert!(!env.contains_key("HTTP_PROXY"));
        assert!(!env.contains_key("LD_PRELOAD"));
    }
}
