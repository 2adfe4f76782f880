//! Plugin discovery: the manifest store.
//!
//! Walks the layered plugin directories (builtin pack first, then user
//! plugins), parses each `plugin.toml`, and computes both content
//! digests per candidate. A malformed plugin is collected as a
//! structured failure and enumeration continues — one bad plugin must
//! not abort discovery.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use mx_core::PluginId;

use crate::MANIFEST_FILE_NAME;
use crate::error::PluginError;
use crate::hash::{hash_artifact_tree, hash_manifest_bytes};
use crate::manifest::PluginManifest;

/// A plugin found on disk with its manifest parsed and digests computed.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// The parsed manifest.
    pub manifest: PluginManifest,
    /// The plugin's install directory.
    pub dir: PathBuf,
    /// Recomputed digest of the manifest file.
    pub manifest_digest: String,
    /// Recomputed digest of the artifact tree.
    pub artifact_digest: String,
}

/// A plugin directory that could not be turned into a candidate.
#[derive(Debug)]
pub struct DiscoveryFailure {
    /// The directory that failed.
    pub dir: PathBuf,
    /// The plugin id, when the manifest parsed far enough to know it.
    pub plugin_id: Option<PluginId>,
    /// What went wrong.
    pub error: PluginError,
}

/// Everything discovery produced: candidates plus structured failures.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Plugins whose manifests parsed and hashed.
    pub plugins: Vec<DiscoveredPlugin>,
    /// Per-directory failures, in walk order.
    pub failures: Vec<DiscoveryFailure>,
}

/// Discover plugins under the given root directories, in order.
///
/// Each immediate subdirectory of a root containing a `plugin.toml` is a
/// candidate. Roots earlier in the slice win duplicate plugin ids: a
/// later duplicate is recorded as a failure, so a user-layer plugin can
/// never shadow a builtin one. Missing roots are skipped silently.
#[must_use]
pub fn discover(roots: &[PathBuf]) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    let mut seen: BTreeSet<PluginId> = BTreeSet::new();

    for root in roots {
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(root = %root.display(), "plugin root missing; skipping");
                continue;
            },
            Err(source) => {
                report.failures.push(DiscoveryFailure {
                    dir: root.clone(),
                    plugin_id: None,
                    error: PluginError::Io {
                        path: root.clone(),
                        source,
                    },
                });
                continue;
            },
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            if !dir.join(MANIFEST_FILE_NAME).is_file() {
                debug!(dir = %dir.display(), "no manifest; skipping directory");
                continue;
            }
            match load_candidate(&dir) {
                Ok(candidate) => {
                    if seen.contains(&candidate.manifest.plugin_id) {
                        warn!(
                            plugin_id = %candidate.manifest.plugin_id,
                            dir = %dir.display(),
                            "duplicate plugin id; keeping the earlier layer"
                        );
                        report.failures.push(DiscoveryFailure {
                            dir,
                            plugin_id: Some(candidate.manifest.plugin_id.clone()),
                            error: PluginError::ManifestInvalid {
                                path: candidate.dir.join(MANIFEST_FILE_NAME),
                                message: format!(
                                    "duplicate plugin id '{}' (already provided by an earlier layer)",
                                    candidate.manifest.plugin_id
                                ),
                            },
                        });
                        continue;
                    }
                    seen.insert(candidate.manifest.plugin_id.clone());
                    report.plugins.push(candidate);
                },
                Err(error) => {
                    warn!(dir = %dir.display(), error = %error, "plugin discovery failure");
                    report.failures.push(DiscoveryFailure {
                        dir,
                        plugin_id: None,
                        error,
                    });
                },
            }
        }
    }

    debug!(
        plugins = report.plugins.len(),
        failures = report.failures.len(),
        "plugin discovery complete"
    );
    report
}

/// Parse and hash one plugin directory.
fn load_candidate(dir: &Path) -> Result<DiscoveredPlugin, PluginError> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let bytes = std::fs::read(&manifest_path).map_err(|source| PluginError::Io {
        path: manifest_path.clone(),
        source,
    })?;
    let content = String::from_utf8(bytes.clone()).map_err(|e| PluginError::ManifestParse {
        path: manifest_path.clone(),
        message: format!("manifest is not UTF-8: {e}"),
    })?;

    let manifest = PluginManifest::parse(&manifest_path, &content)?;
    let manifest_digest = hash_manifest_bytes(&bytes);
    let artifact_digest = hash_artifact_tree(dir)?;

    Ok(DiscoveredPlugin {
        manifest,
        dir: dir.to_path_buf(),
        manifest_digest,
        artifact_digest,
    })
}
