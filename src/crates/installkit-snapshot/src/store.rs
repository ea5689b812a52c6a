//! Snapshot path resolution and on-disk layout
//!
//! Cache snapshots are keyed by checkpoint name and live in a single
//! `.data_cache` directory. Where that directory lives is resolved once, at
//! store construction: a configured root (normally a dataset mountpoint)
//! wins, then the `INSTALLKIT_SNAPSHOT_DIR` environment variable, then a
//! per-process directory under the system temp dir.

use crate::error::{Result, SnapshotError};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the default snapshot directory
pub const SNAPSHOT_DIR_ENV: &str = "INSTALLKIT_SNAPSHOT_DIR";

/// Reserved snapshot name marking the most recent successful checkpoint
///
/// Not a valid user-chosen checkpoint name.
pub const LATEST: &str = "latest";

/// Subdirectory holding cache snapshot files
const CACHE_SUBDIR: &str = ".data_cache";

/// Extension for cache snapshot files
const CACHE_EXT: &str = "cache";

/// Resolves and manages on-disk locations for cache snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    /// Create a store rooted at an explicit directory
    ///
    /// Used when a dataset is configured; snapshots then live on the dataset
    /// and are carried along by filesystem snapshot/rollback.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a store at the default location
    ///
    /// Honors `INSTALLKIT_SNAPSHOT_DIR` if set, else uses a per-process
    /// directory under the system temp dir.
    pub fn from_env() -> Self {
        let root = match env::var_os(SNAPSHOT_DIR_ENV) {
            Some(dir) => PathBuf::from(dir),
            None => env::temp_dir().join(format!("installkit-{}", std::process::id())),
        };
        Self { root }
    }

    /// Root directory for this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all cache snapshot files
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_SUBDIR)
    }

    /// Deterministic cache snapshot path for a checkpoint name
    pub fn cache_snapshot_path(&self, name: &str) -> PathBuf {
        self.cache_dir().join(format!("{name}.{CACHE_EXT}"))
    }

    /// Path of the "latest" marker snapshot
    pub fn latest_snapshot_path(&self) -> PathBuf {
        self.cache_snapshot_path(LATEST)
    }

    /// Remove the cache snapshot directory and everything in it
    ///
    /// Safe to call when the directory was never created.
    pub fn cleanup(&self) -> Result<()> {
        let dir = self.cache_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                SnapshotError::Storage(format!("Failed to remove {}: {e}", dir.display()))
            })?;
            tracing::info!(dir = %dir.display(), "Cache snapshot directory removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DataCache;

    #[test]
    fn test_deterministic_paths() {
        let store = SnapshotStore::with_root("/a/mountpoint");
        assert_eq!(
            store.cache_snapshot_path("disk-setup"),
            PathBuf::from("/a/mountpoint/.data_cache/disk-setup.cache")
        );
        assert_eq!(
            store.latest_snapshot_path(),
            PathBuf::from("/a/mountpoint/.data_cache/latest.cache")
        );
    }

    #[test]
    fn test_cleanup_removes_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::with_root(dir.path());

        let cache = DataCache::new();
        cache
            .take_snapshot(&store.cache_snapshot_path("step-one"))
            .unwrap();
        assert!(store.cache_dir().exists());

        store.cleanup().unwrap();
        assert!(!store.cache_dir().exists());

        // Idempotent when nothing is left.
        store.cleanup().unwrap();
    }
}
