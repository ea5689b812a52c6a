//! Error types and error handling for engine operations
//!
//! The taxonomy mirrors how callers are expected to react:
//!
//! - usage errors (`InvalidName`, `Duplicate`, `Unknown`, `OutOfOrder`,
//!   `ExecutionInProgress`, ...) mean the caller passed something wrong and
//!   can be fixed at the call site;
//! - `InitFailed` surfaces before any checkpoint runs;
//! - per-checkpoint execution failures never propagate as `Err` from the
//!   engine; they land in the failed-names list and the error service;
//! - rollback/resume problems are distinct named variants so "nothing to
//!   roll back to" is distinguishable from a bad argument;
//! - `Fatal` is reserved for failures of the engine's own orchestration.

use installkit_snapshot::SnapshotError;
use thiserror::Error;

/// Convenience result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors produced by the install execution engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Checkpoint name failed validation
    #[error("Invalid checkpoint name '{name}': {reason}")]
    InvalidName {
        /// The offending name
        name: String,
        /// Why it was rejected
        reason: String,
    },

    /// A checkpoint with this name is already registered
    #[error("Checkpoint '{0}' is already registered")]
    Duplicate(String),

    /// The name is reserved for internal use
    #[error("Checkpoint name '{0}' is reserved")]
    ReservedName(String),

    /// No registered checkpoint has this name
    #[error("Unknown checkpoint '{0}'")]
    Unknown(String),

    /// No factory is registered under this key
    #[error("No checkpoint factory registered for key '{0}'")]
    UnknownFactory(String),

    /// The operation is not allowed while checkpoints are executing
    #[error("Operation not permitted while an execution is in progress")]
    ExecutionInProgress,

    /// `pause_before` precedes `start_from` in registration order
    #[error("Checkpoint '{pause_before}' precedes '{start_from}' in registration order")]
    OutOfOrder {
        /// The requested pause point
        pause_before: String,
        /// The requested start point
        start_from: String,
    },

    /// A checkpoint before the requested start point has not completed
    #[error("Cannot start execution past incomplete checkpoint '{0}'")]
    IncompleteGap(String),

    /// `insert_before` named a checkpoint that has already completed
    #[error("Cannot insert before completed checkpoint '{0}'")]
    InsertBeforeCompleted(String),

    /// A checkpoint could not be instantiated or weighed
    #[error("Checkpoint '{name}' failed to initialize: {reason}")]
    InitFailed {
        /// Name of the checkpoint that failed to come up
        name: String,
        /// Constructor or estimate failure detail
        reason: String,
    },

    /// The requested resume point is not resumable
    #[error("Checkpoint '{0}' is not resumable")]
    NotResumable(String),

    /// Out-of-process resume was already invoked in this process
    #[error("Resume may only be invoked once per process")]
    ResumeAlreadyUsed,

    /// Filesystem snapshots were mutated in this process; resume state is stale
    #[error("Dataset snapshots have been modified in this process; cannot resume")]
    SnapshotsMutated,

    /// Another engine instance is already live in this process
    #[error("An install engine already exists in this process")]
    AlreadyExists,

    /// Snapshot or rollback subsystem failure
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// A checkpoint's own execution failed
    ///
    /// Contained by the engine: recorded in the error service and surfaced in
    /// the failed-names list, never returned as `Err` from `execute_checkpoints`.
    #[error("Checkpoint '{name}' failed: {reason}")]
    Checkpoint {
        /// Name of the failed checkpoint
        name: String,
        /// Failure detail
        reason: String,
    },

    /// Failure inside the engine's own orchestration logic
    ///
    /// Always aborts the session regardless of the stop-on-error policy.
    #[error("Fatal engine error: {0}")]
    Fatal(String),

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl EngineError {
    /// Create an invalid-name error
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a checkpoint execution failure
    pub fn checkpoint(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an initialization failure
    pub fn init_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InitFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a fatal orchestration error
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }
}
