//! Path resolution and workspace-relative normalization
//!
//! Every path-bearing field in the store is persisted workspace-relative
//! when it points inside the open workspace root; absolute paths outside
//! the root are preserved verbatim. This module owns that rule so the
//! store, indexer, and portability rebind all apply it identically.

use std::path::{Path, PathBuf};

use crate::error::{RepoFactsError, Result};

/// Name of the per-workspace state directory holding the store and lease
pub const STORE_DIR_NAME: &str = ".repofacts";

/// Per-workspace state directory
pub fn store_dir(workspace: &Path) -> PathBuf {
    workspace.join(STORE_DIR_NAME)
}

/// SQLite database file for a workspace
pub fn store_db_path(workspace: &Path) -> PathBuf {
    store_dir(workspace).join("store.db")
}

/// Lease file sitting next to the store
pub fn lease_path(workspace: &Path) -> PathBuf {
    store_dir(workspace).join("store.lock")
}

/// Legacy heartbeat-style lock directory from older store layouts
pub fn legacy_lock_dir(workspace: &Path) -> PathBuf {
    store_dir(workspace).join("store.lock.d")
}

/// Canonicalize path for consistent comparison.
///
/// Attempts to resolve symlinks and get the absolute path. If
/// canonicalization fails (e.g., path doesn't exist), returns the
/// original path unchanged.
pub fn canonicalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Check if a path exists and is a directory.
pub fn ensure_directory(path: &Path) -> Result<&Path> {
    if !path.exists() {
        return Err(RepoFactsError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    if !path.is_dir() {
        return Err(RepoFactsError::FileNotFound {
            path: format!("{} is not a directory", path.display()),
        });
    }
    Ok(path)
}

/// Rewrite a stored path per the workspace-relative rule.
///
/// - Absolute and provably inside `root` → workspace-relative
/// - Absolute outside `root` → preserved verbatim
/// - Already relative → unchanged
///
/// Comparison is textual over normalized separators; the store never
/// touches the filesystem here, so moved-away roots still normalize.
pub fn to_workspace_relative(path: &str, root: &Path) -> String {
    let p = Path::new(path);
    if !p.is_absolute() {
        return path.to_string();
    }
    match p.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
        Err(_) => path.to_string(),
    }
}

/// Resolve a stored (usually relative) path against the workspace root.
pub fn from_workspace_relative(path: &str, root: &Path) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Whether `path` names `prefix` itself or something beneath it.
///
/// Textual containment with a separator guard, so "src/lib" does not
/// match "src/library.rs".
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix || path.starts_with(&format!("{}/", prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inside_root_becomes_relative() {
        let root = Path::new("/home/user/project");
        assert_eq!(
            to_workspace_relative("/home/user/project/src/lib.rs", root),
            "src/lib.rs"
        );
    }

    #[test]
    fn test_outside_root_preserved_verbatim() {
        let root = Path::new("/home/user/project");
        assert_eq!(
            to_workspace_relative("/usr/lib/libc.so", root),
            "/usr/lib/libc.so"
        );
    }

    #[test]
    fn test_relative_unchanged() {
        let root = Path::new("/home/user/project");
        assert_eq!(to_workspace_relative("src/lib.rs", root), "src/lib.rs");
    }

    #[test]
    fn test_from_workspace_relative() {
        let root = Path::new("/home/user/project");
        assert_eq!(
            from_workspace_relative("src/lib.rs", root),
            PathBuf::from("/home/user/project/src/lib.rs")
        );
        assert_eq!(
            from_workspace_relative("/etc/hosts", root),
            PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn test_path_prefix_separator_guard() {
        assert!(path_has_prefix("src/lib.rs", "src"));
        assert!(path_has_prefix("src", "src"));
        assert!(!path_has_prefix("src-extra/lib.rs", "src"));
        assert!(path_has_prefix("anything", ""));
    }

    #[test]
    fn test_canonicalize_path_nonexistent() {
        let fake_path = PathBuf::from("/this/path/does/not/exist/xyz");
        assert_eq!(canonicalize_path(&fake_path), fake_path);
    }
}
