//! Deterministic content hashing for plugin trees.
//!
//! Two digests are computed per plugin: a manifest digest (the manifest
//! file bytes with line endings normalized) and an artifact digest (a
//! recursive hash over every other file in the plugin directory). Both
//! are blake3 and rendered as `blake3:<hex>`.
//!
//! The artifact digest must be identical across operating systems and
//! filesystem iteration orders, so entries are sorted by their
//! normalized relative path (forward slashes, byte-wise ordinal order)
//! before hashing, and symbolic links are rejected outright. The
//! manifest file itself is excluded from the artifact digest — it
//! carries the digests, so including it would be circular — as is the
//! lockfile, should one sit inside a plugin directory.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::{PluginError, PluginResult};
use crate::{LOCKFILE_NAME, MANIFEST_FILE_NAME};

/// Digest prefix identifying the hash algorithm.
const DIGEST_PREFIX: &str = "blake3:";

/// Render a blake3 hash in the `blake3:<hex>` digest form.
fn render(hash: blake3::Hash) -> String {
    format!("{DIGEST_PREFIX}{}", hash.to_hex())
}

/// Digest of a manifest's bytes, with CRLF normalized to LF so the same
/// manifest hashes identically regardless of the checkout's line endings.
#[must_use]
pub fn hash_manifest_bytes(content: &[u8]) -> String {
    let mut hasher = blake3::Hasher::new();
    let mut iter = content.iter().peekable();
    while let Some(&byte) = iter.next() {
        if byte == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        hasher.update(&[byte]);
    }
    render(hasher.finalize())
}

/// Digest of a plugin directory's artifact tree.
///
/// Walks `plugin_dir` recursively, sorts every regular file by its
/// normalized relative path, and feeds
/// `path bytes || 0x00 || content length (u64 LE) || content bytes`
/// per entry into one hasher. Directories contribute only through the
/// paths of the files inside them.
///
/// # Errors
///
/// Returns [`PluginError::SymlinkRejected`] if any entry is a symbolic
/// link, and [`PluginError::Io`] if the tree cannot be read.
pub fn hash_artifact_tree(plugin_dir: &Path) -> PluginResult<String> {
    let mut entries: Vec<(String, std::path::PathBuf)> = Vec::new();

    for entry in WalkDir::new(plugin_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map_or_else(|| plugin_dir.to_path_buf(), Path::to_path_buf);
            PluginError::Io {
                path,
                source: e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            }
        })?;

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(PluginError::SymlinkRejected {
                path: entry.path().to_path_buf(),
            });
        }
        if !file_type.is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(plugin_dir)
            .map_err(|_| PluginError::Io {
                path: entry.path().to_path_buf(),
                source: std::io::Error::other("entry outside plugin directory"),
            })?;
        let normalized = normalize_relative_path(relative);
        if normalized == MANIFEST_FILE_NAME || normalized == LOCKFILE_NAME {
            continue;
        }
        entries.push((normalized, entry.path().to_path_buf()));
    }

    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    let mut hasher = blake3::Hasher::new();
    for (normalized, path) in entries {
        let content = std::fs::read(&path).map_err(|source| PluginError::Io {
            path: path.clone(),
            source,
        })?;
        hasher.update(normalized.as_bytes());
        hasher.update(&[0u8]);
        hasher.update(&u64::try_from(content.len()).unwrap_or(u64::MAX).to_le_bytes());
        hasher.update(&content);
    }
    Ok(render(hasher.finalize()))
}

/// Normalize a relative path to forward slashes.
fn normalize_relative_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn manifest_digest_normalizes_crlf() {
        let unix = hash_manifest_bytes(b"a = 1\nb = 2\n");
        let windows = hash_manifest_bytes(b"a = 1\r\nb = 2\r\n");
        assert_eq!(unix, windows);
        assert!(unix.starts_with("blake3:"));
    }

    #[test]
    fn bare_cr_is_preserved() {
        let with_cr = hash_manifest_bytes(b"a\rb");
        let without = hash_manifest_bytes(b"ab");
        assert_ne!(with_cr, without);
    }

    #[test]
    fn artifact_digest_is_content_addressed() {
        let a = make_tree(&[("bin/host", "binary"), ("data/model.bin", "weights")]);
        let b = make_tree(&[("data/model.bin", "weights"), ("bin/host", "binary")]);
        assert_eq!(
            hash_artifact_tree(a.path()).unwrap(),
            hash_artifact_tree(b.path()).unwrap()
        );
    }

    #[test]
    fn artifact_digest_sees_content_changes() {
        let a = make_tree(&[("bin/host", "binary-v1")]);
        let b = make_tree(&[("bin/host", "binary-v2")]);
        assert_ne!(
            hash_artifact_tree(a.path()).unwrap(),
            hash_artifact_tree(b.path()).unwrap()
        );
    }

    #[test]
    fn artifact_digest_sees_renames() {
        let a = make_tree(&[("bin/host", "binary")]);
        let b = make_tree(&[("bin/host2", "binary")]);
        assert_ne!(
            hash_artifact_tree(a.path()).unwrap(),
            hash_artifact_tree(b.path()).unwrap()
        );
    }

    #[test]
    fn manifest_and_lockfile_are_excluded() {
        let a = make_tree(&[("bin/host", "binary")]);
        let b = make_tree(&[
            ("bin/host", "binary"),
            (MANIFEST_FILE_NAME, "plugin_id = \"x.y\""),
            (LOCKFILE_NAME, "schema_version = 1"),
        ]);
        assert_eq!(
            hash_artifact_tree(a.path()).unwrap(),
            hash_artifact_tree(b.path()).unwrap()
        );
    }

    #[test]
    fn nested_manifest_name_is_included() {
        // Only the top-level manifest is excluded.
        let a = make_tree(&[("bin/host", "binary")]);
        let b = make_tree(&[("bin/host", "binary"), ("nested/plugin.toml", "x = 1")]);
        assert_ne!(
            hash_artifact_tree(a.path()).unwrap(),
            hash_artifact_tree(b.path()).unwrap()
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_rejected() {
        let dir = make_tree(&[("bin/host", "binary")]);
        std::os::unix::fs::symlink("/etc/passwd", dir.path().join("link")).unwrap();
        let err = hash_artifact_tree(dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::SymlinkRejected { .. }));
    }

    #[test]
    fn empty_tree_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let digest = hash_artifact_tree(dir.path()).unwrap();
        assert!(digest.starts_with("blake3:"));
    }
}
