//! # installkit-snapshot - State Persistence for Install Execution
//!
//! Snapshot and rollback primitives for the installkit execution engine:
//! the shared [`DataCache`] that all checkpoints read and write, binary
//! snapshot persistence for that cache, deterministic snapshot naming, and
//! the [`Dataset`] abstraction for copy-on-write filesystem snapshots.
//!
//! ## Overview
//!
//! An install run is a sequence of checkpoints mutating two shared resources:
//! an in-memory [`DataCache`] and, optionally, an on-disk dataset. Before
//! each checkpoint executes, both are snapshotted under the checkpoint's
//! name; after each success, an additional reserved [`LATEST`] snapshot marks
//! the most recent good state. Rolling back to "just before checkpoint X" is
//! then a pair of restores keyed by X's name.
//!
//! ## Module Organization
//!
//! - [`cache`] - [`DataCache`] and the well-known completed-checkpoints node
//! - [`store`] - [`SnapshotStore`] path resolution and cleanup
//! - [`dataset`] - [`Dataset`] trait and the [`MemoryDataset`] reference impl
//! - [`serializer`] - [`SerializerProtocol`] with bincode/JSON backends
//! - [`error`] - [`SnapshotError`] types
//!
//! ## Quick Start
//!
//! ```rust
//! use installkit_snapshot::{DataCache, SnapshotStore};
//! use serde_json::json;
//!
//! # fn main() -> installkit_snapshot::Result<()> {
//! let dir = std::env::temp_dir().join("installkit-doc-example");
//! let store = SnapshotStore::with_root(&dir);
//!
//! let mut cache = DataCache::new();
//! cache.put_node("target.disk", json!({"device": "c0t0d0"}));
//!
//! // Snapshot before a checkpoint named "disk-setup" runs.
//! let path = store.cache_snapshot_path("disk-setup");
//! cache.take_snapshot(&path)?;
//!
//! // Later: roll the cache back to that point in time.
//! let restored = DataCache::load_from_snapshot(&path)?;
//! assert_eq!(restored.get_node("target.disk"), cache.get_node("target.disk"));
//! # std::fs::remove_dir_all(&dir).ok();
//! # Ok(())
//! # }
//! ```
//!
//! ## See Also
//!
//! - `installkit-engine` - The execution engine built on these primitives

pub mod cache;
pub mod dataset;
pub mod error;
pub mod serializer;
pub mod store;

// Re-export main types
pub use cache::{CompletedCheckpoint, DataCache, COMPLETED_NODE};
pub use dataset::{Dataset, MemoryDataset};
pub use error::{Result, SnapshotError};
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use store::{SnapshotStore, LATEST, SNAPSHOT_DIR_ENV};
