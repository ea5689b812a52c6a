//! The shared data cache and its snapshot persistence
//!
//! Every checkpoint in an install session reads and writes one shared,
//! hierarchical, in-memory store: the [`DataCache`]. The execution engine
//! treats cache contents as opaque with a single exception: the well-known
//! `engine.completed` node, which records the ordered list of checkpoints
//! that have run to completion. That node is what makes cross-process resume
//! possible: a later process loads the most recent snapshot and compares the
//! recorded completions against its own registrations.
//!
//! Snapshots are whole-cache binary dumps ([`BincodeSerializer`]) written to
//! a file path chosen by the caller; loading a snapshot replaces the cache
//! wholesale. Node keys are kept in a `BTreeMap` so two caches with equal
//! contents always serialize to identical bytes, which is what makes
//! rollback-then-rerun reproducible.

use crate::error::{Result, SnapshotError};
use crate::serializer::{BincodeSerializer, SerializerProtocol};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Well-known node recording which checkpoints have completed
pub const COMPLETED_NODE: &str = "engine.completed";

/// One completed checkpoint as recorded in the cache
///
/// The fields mirror the registration metadata exactly; resumability requires
/// a position-by-position match against the current registrations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedCheckpoint {
    /// Registered checkpoint name
    pub name: String,
    /// Zero-based position in registration order
    pub position: u32,
    /// Factory key the checkpoint was registered under
    pub factory_key: String,
    /// Constructor arguments as registered
    pub args: Value,
    /// Whether a filesystem snapshot was taken before this checkpoint ran
    pub has_fs_snapshot: bool,
}

/// On-disk snapshot envelope
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    created_at: DateTime<Utc>,
    nodes: BTreeMap<String, Value>,
}

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Hierarchical in-memory object store shared by all checkpoints
///
/// Nodes are addressed by dotted string paths (`"target.disk.layout"`); the
/// cache does not interpret the paths, it only stores the values. The cache
/// is a plain value type; the engine wraps it in a lock and hands checkpoints
/// guarded access through their execution context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataCache {
    nodes: BTreeMap<String, Value>,
}

impl DataCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under a node path, replacing any previous value
    pub fn put_node(&mut self, path: impl Into<String>, value: Value) {
        self.nodes.insert(path.into(), value);
    }

    /// Fetch a node value
    pub fn get_node(&self, path: &str) -> Option<&Value> {
        self.nodes.get(path)
    }

    /// Remove a node, returning its value if it existed
    pub fn remove_node(&mut self, path: &str) -> Option<Value> {
        self.nodes.remove(path)
    }

    /// Number of nodes currently stored
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cache holds no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all node paths in sorted order
    pub fn node_paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Record the ordered completed-checkpoint list in the well-known node
    pub fn set_completed_checkpoints(&mut self, completed: &[CompletedCheckpoint]) -> Result<()> {
        let value = serde_json::to_value(completed)?;
        self.nodes.insert(COMPLETED_NODE.to_string(), value);
        Ok(())
    }

    /// Read the completed-checkpoint list; empty if the node is absent
    pub fn completed_checkpoints(&self) -> Result<Vec<CompletedCheckpoint>> {
        match self.nodes.get(COMPLETED_NODE) {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// Serialize the full cache to a snapshot file
    ///
    /// Parent directories are created as needed. The write goes through a
    /// temporary file renamed into place, so a crash mid-write never leaves a
    /// truncated snapshot behind.
    pub fn take_snapshot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_FORMAT_VERSION,
            created_at: Utc::now(),
            nodes: self.nodes.clone(),
        };
        let bytes = BincodeSerializer::new().dumps(&envelope)?;

        let tmp = path.with_extension("partial");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;

        tracing::debug!(path = %path.display(), nodes = self.nodes.len(), "Cache snapshot written");
        Ok(())
    }

    /// Load a cache from a snapshot file, replacing in-memory state
    ///
    /// Fails with [`SnapshotError::MissingCacheSnapshot`] if no file exists at
    /// the path, so callers can distinguish "never snapshotted" from a decode
    /// failure.
    pub fn load_from_snapshot(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SnapshotError::MissingCacheSnapshot(path.to_path_buf()));
        }

        let bytes = fs::read(path)?;
        let envelope: SnapshotEnvelope = BincodeSerializer::new().loads(&bytes)?;
        if envelope.version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::Storage(format!(
                "Unsupported snapshot format version {}",
                envelope.version
            )));
        }

        tracing::debug!(path = %path.display(), nodes = envelope.nodes.len(), "Cache snapshot loaded");
        Ok(Self {
            nodes: envelope.nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_cache() -> DataCache {
        let mut cache = DataCache::new();
        cache.put_node("target.disk", json!({"device": "c0t0d0", "size_mb": 8192}));
        cache.put_node("transfer.manifest", json!("/tmp/manifest.xml"));
        cache
    }

    #[test]
    fn test_put_get_remove_node() {
        let mut cache = sample_cache();
        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get_node("transfer.manifest"),
            Some(&json!("/tmp/manifest.xml"))
        );

        let removed = cache.remove_node("transfer.manifest");
        assert_eq!(removed, Some(json!("/tmp/manifest.xml")));
        assert!(cache.get_node("transfer.manifest").is_none());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.snapshot");

        let cache = sample_cache();
        cache.take_snapshot(&path).unwrap();

        let restored = DataCache::load_from_snapshot(&path).unwrap();
        assert_eq!(cache, restored);
    }

    #[test]
    fn test_missing_snapshot_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.snapshot");

        let err = DataCache::load_from_snapshot(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::MissingCacheSnapshot(_)));
    }

    #[test]
    fn test_snapshot_bytes_deterministic_for_equal_content() {
        let dir = tempfile::tempdir().unwrap();
        let path_a = dir.path().join("a.snapshot");
        let path_b = dir.path().join("b.snapshot");

        // Same nodes inserted in different orders must serialize identically
        // apart from the timestamp header.
        let mut a = DataCache::new();
        a.put_node("x", json!(1));
        a.put_node("y", json!(2));
        let mut b = DataCache::new();
        b.put_node("y", json!(2));
        b.put_node("x", json!(1));

        a.take_snapshot(&path_a).unwrap();
        b.take_snapshot(&path_b).unwrap();

        let restored_a = DataCache::load_from_snapshot(&path_a).unwrap();
        let restored_b = DataCache::load_from_snapshot(&path_b).unwrap();
        assert_eq!(restored_a, restored_b);
    }

    #[test]
    fn test_completed_checkpoints_node() {
        let mut cache = DataCache::new();
        assert!(cache.completed_checkpoints().unwrap().is_empty());

        let completed = vec![CompletedCheckpoint {
            name: "target-instantiation".to_string(),
            position: 0,
            factory_key: "target".to_string(),
            args: json!({"pool": "rpool"}),
            has_fs_snapshot: true,
        }];
        cache.set_completed_checkpoints(&completed).unwrap();

        assert_eq!(cache.completed_checkpoints().unwrap(), completed);
        assert!(cache.get_node(COMPLETED_NODE).is_some());
    }
}
