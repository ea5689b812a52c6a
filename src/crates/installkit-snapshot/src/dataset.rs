//! Dataset abstraction for copy-on-write filesystem snapshots
//!
//! A [`Dataset`] is an optional external volume that supports named,
//! restorable snapshots (ZFS-style). When one is configured, the execution
//! engine extends rollback beyond the data cache to on-disk side effects.
//! Platform bindings are out of scope here; this crate defines the trait and
//! ships [`MemoryDataset`], a reference implementation that captures a real
//! directory tree into memory so snapshot/rollback semantics can be exercised
//! without any filesystem driver.

use crate::error::{Result, SnapshotError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A filesystem volume supporting named, restorable snapshots
///
/// Engine requirements: snapshots are overwritable when requested, rollback
/// may be recursive, and `snapshot_list` reflects exactly the snapshots that
/// `rollback` would accept.
#[async_trait]
pub trait Dataset: Send + Sync {
    /// Whether the dataset currently exists and can be snapshotted
    async fn exists(&self) -> bool;

    /// Take a named snapshot; with `overwrite`, replace an existing one
    async fn snapshot(&self, name: &str, overwrite: bool) -> Result<()>;

    /// Roll the dataset back to a named snapshot
    async fn rollback(&self, name: &str, recursive: bool) -> Result<()>;

    /// Names of all snapshots currently held, in creation order
    async fn snapshot_list(&self) -> Result<Vec<String>>;

    /// Destroy a named snapshot; missing snapshots are ignored
    async fn destroy(&self, name: &str) -> Result<()>;

    /// Mountpoint of the dataset, if it is backed by a real directory
    fn mountpoint(&self) -> Option<PathBuf>;
}

/// Captured state of one snapshot: relative path -> file bytes
type TreeImage = HashMap<PathBuf, Vec<u8>>;

#[derive(Debug, Default)]
struct MemoryDatasetState {
    /// Snapshot name -> captured tree, in creation order
    snapshots: Vec<(String, TreeImage)>,
    /// Rollbacks performed, newest last (test observability)
    rollback_log: Vec<String>,
}

/// In-memory dataset capturing a directory tree per snapshot
///
/// `snapshot` walks the mountpoint and stores every file's bytes; `rollback`
/// clears the mountpoint and writes the captured image back. With no
/// mountpoint configured only the snapshot-name bookkeeping is performed,
/// which is enough for engines running in degraded no-dataset-directory mode.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    mountpoint: Option<PathBuf>,
    state: Arc<RwLock<MemoryDatasetState>>,
}

impl MemoryDataset {
    /// Create a dataset with no backing directory
    pub fn new() -> Self {
        Self {
            mountpoint: None,
            state: Arc::new(RwLock::new(MemoryDatasetState::default())),
        }
    }

    /// Create a dataset backed by a real directory
    pub fn with_mountpoint(mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: Some(mountpoint.into()),
            state: Arc::new(RwLock::new(MemoryDatasetState::default())),
        }
    }

    /// Rollbacks performed so far, oldest first
    pub async fn rollback_log(&self) -> Vec<String> {
        self.state.read().await.rollback_log.clone()
    }

    fn capture_tree(root: &Path) -> Result<TreeImage> {
        let mut image = TreeImage::new();
        if root.exists() {
            Self::capture_dir(root, root, &mut image)?;
        }
        Ok(image)
    }

    fn capture_dir(root: &Path, dir: &Path, image: &mut TreeImage) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::capture_dir(root, &path, image)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| SnapshotError::Dataset(e.to_string()))?
                    .to_path_buf();
                image.insert(rel, fs::read(&path)?);
            }
        }
        Ok(())
    }

    fn restore_tree(root: &Path, image: &TreeImage) -> Result<()> {
        if root.exists() {
            fs::remove_dir_all(root)?;
        }
        fs::create_dir_all(root)?;
        for (rel, bytes) in image {
            let dest = root.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&dest, bytes)?;
        }
        Ok(())
    }
}

impl Default for MemoryDataset {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dataset for MemoryDataset {
    async fn exists(&self) -> bool {
        true
    }

    async fn snapshot(&self, name: &str, overwrite: bool) -> Result<()> {
        let image = match &self.mountpoint {
            Some(root) => Self::capture_tree(root)?,
            None => TreeImage::new(),
        };

        let mut state = self.state.write().await;
        if let Some(existing) = state.snapshots.iter_mut().find(|(n, _)| n == name) {
            if !overwrite {
                return Err(SnapshotError::Dataset(format!(
                    "Snapshot '{name}' already exists"
                )));
            }
            existing.1 = image;
        } else {
            state.snapshots.push((name.to_string(), image));
        }
        tracing::debug!(snapshot = %name, "Dataset snapshot taken");
        Ok(())
    }

    async fn rollback(&self, name: &str, _recursive: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let image = state
            .snapshots
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, image)| image.clone())
            .ok_or_else(|| SnapshotError::MissingFilesystemSnapshot(name.to_string()))?;

        if let Some(root) = &self.mountpoint {
            Self::restore_tree(root, &image)?;
        }
        state.rollback_log.push(name.to_string());
        tracing::info!(snapshot = %name, "Dataset rolled back");
        Ok(())
    }

    async fn snapshot_list(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state.snapshots.iter().map(|(n, _)| n.clone()).collect())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.snapshots.retain(|(n, _)| n != name);
        Ok(())
    }

    fn mountpoint(&self) -> Option<PathBuf> {
        self.mountpoint.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_overwrite_policy() {
        let dataset = MemoryDataset::new();
        dataset.snapshot("step", false).await.unwrap();

        let err = dataset.snapshot("step", false).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Dataset(_)));

        dataset.snapshot("step", true).await.unwrap();
        assert_eq!(dataset.snapshot_list().await.unwrap(), vec!["step"]);
    }

    #[tokio::test]
    async fn test_rollback_unknown_snapshot() {
        let dataset = MemoryDataset::new();
        let err = dataset.rollback("ghost", true).await.unwrap_err();
        assert!(matches!(err, SnapshotError::MissingFilesystemSnapshot(_)));
    }

    #[tokio::test]
    async fn test_rollback_restores_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ds");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file.txt"), b"before").unwrap();

        let dataset = MemoryDataset::with_mountpoint(&root);
        dataset.snapshot("pristine", false).await.unwrap();

        fs::write(root.join("sub/file.txt"), b"mutated").unwrap();
        fs::write(root.join("extra.txt"), b"junk").unwrap();

        dataset.rollback("pristine", true).await.unwrap();
        assert_eq!(fs::read(root.join("sub/file.txt")).unwrap(), b"before");
        assert!(!root.join("extra.txt").exists());
        assert_eq!(dataset.rollback_log().await, vec!["pristine"]);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dataset = MemoryDataset::new();
        dataset.snapshot("one", false).await.unwrap();
        dataset.destroy("one").await.unwrap();
        dataset.destroy("one").await.unwrap();
        assert!(dataset.snapshot_list().await.unwrap().is_empty());
    }
}
