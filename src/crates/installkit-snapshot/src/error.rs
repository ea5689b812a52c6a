//! Error types for snapshot operations

use std::path::PathBuf;
use thiserror::Error;

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors that can occur while snapshotting or restoring state
///
/// `MissingCacheSnapshot` and `MissingFilesystemSnapshot` are deliberately
/// separate variants so callers can tell "nothing to roll back to" apart
/// from a bad argument or a storage failure.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No data cache snapshot file exists at the expected path
    #[error("Data cache snapshot not found: {0}")]
    MissingCacheSnapshot(PathBuf),

    /// The dataset has no snapshot with the expected name
    #[error("Filesystem snapshot not found: {0}")]
    MissingFilesystemSnapshot(String),

    /// Binary serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON encoding error for cache node values
    #[error("Node encoding error: {0}")]
    NodeEncoding(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Dataset operation failed
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Snapshot storage error
    #[error("Storage error: {0}")]
    Storage(String),
}
