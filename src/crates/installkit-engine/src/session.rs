//! Per-run execution session types
//!
//! An execution session is the ephemeral state of one `execute_checkpoints`
//! call: the ordered plan of checkpoints to run, the cancellation flag shared
//! between the caller and the worker task, and the progress reporting channel
//! observers can watch.

use crate::checkpoint::Checkpoint;
use crate::progress::Fraction;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Terminal status of an execution session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// All checkpoints in the execution list ran and none failed
    Success,
    /// One or more checkpoints failed
    Failed,
    /// A cancellation request interrupted the session
    Canceled,
    /// A checkpoint could not be instantiated; nothing executed
    InitFailed,
    /// The engine's own orchestration failed; the session was aborted
    Fatal,
}

/// Result of an execution session: status plus failed checkpoint names
///
/// Detailed error objects for the failed names live in the engine's
/// [`ErrorService`](crate::error_service::ErrorService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Terminal session status
    pub status: ExecStatus,
    /// Names of checkpoints whose execution failed, in execution order
    pub failed: Vec<String>,
}

impl ExecResult {
    pub(crate) fn new(status: ExecStatus, failed: Vec<String>) -> Self {
        Self { status, failed }
    }

    /// Whether the session completed with no failures
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Success
    }
}

/// Completion callback invoked from the worker task when a session finishes
pub type CompletionCallback = Box<dyn FnOnce(ExecResult) + Send + 'static>;

/// Options for one `execute_checkpoints` call
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// First checkpoint to run; defaults to the first not-yet-completed one
    pub start_from: Option<String>,
    /// Stop strictly before this checkpoint
    pub pause_before: Option<String>,
    /// Ask checkpoints to simulate without writing persistent state
    pub dry_run: bool,
    /// Stop processing the remaining list after the first failure
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            start_from: None,
            pause_before: None,
            dry_run: false,
            stop_on_error: true,
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the checkpoint to start from
    pub fn with_start_from(mut self, name: impl Into<String>) -> Self {
        self.start_from = Some(name.into());
        self
    }

    /// Set the checkpoint to pause before
    pub fn with_pause_before(mut self, name: impl Into<String>) -> Self {
        self.pause_before = Some(name.into());
        self
    }

    /// Enable dry-run execution
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Continue past failed checkpoints instead of stopping
    pub fn continue_on_error(mut self) -> Self {
        self.stop_on_error = false;
        self
    }
}

/// Cooperative cancellation flag shared between caller and worker
///
/// Setting the flag never interrupts the running checkpoint; it prevents the
/// next one from starting. The in-flight checkpoint is separately offered a
/// `cancel()` call by the engine.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A progress observation published on the session's watch channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    /// Checkpoint the update is attributed to, if any
    pub checkpoint: Option<String>,
    /// Overall session progress
    pub overall: Fraction,
}

impl ProgressUpdate {
    /// Overall progress as a truncated whole percentage
    pub fn percent(&self) -> u8 {
        self.overall.as_percent()
    }
}

/// Publishes normalized progress for one running checkpoint
///
/// A checkpoint self-reports 0-100; the reporter scales that against the
/// checkpoint's precomputed ratio and adds the session's completed base, so
/// overall progress is monotonic and never overshoots.
#[derive(Clone)]
pub struct ProgressReporter {
    checkpoint: String,
    ratio: Fraction,
    base: Fraction,
    reported: Arc<AtomicU8>,
    tx: watch::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub(crate) fn new(
        checkpoint: String,
        ratio: Fraction,
        base: Fraction,
        reported: Arc<AtomicU8>,
        tx: watch::Sender<ProgressUpdate>,
    ) -> Self {
        Self {
            checkpoint,
            ratio,
            base,
            reported,
            tx,
        }
    }

    /// Publish a raw 0-100 progress report from the running checkpoint
    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.reported.store(percent, Ordering::SeqCst);
        let overall = self.base + self.ratio.scale_percent(percent);
        tracing::debug!(
            checkpoint = %self.checkpoint,
            reported = percent,
            overall = %overall,
            "Checkpoint progress"
        );
        let _ = self.tx.send(ProgressUpdate {
            checkpoint: Some(self.checkpoint.clone()),
            overall,
        });
    }
}

/// One entry of a loaded execution plan
pub(crate) struct PlannedCheckpoint {
    pub name: String,
    pub instance: Arc<dyn Checkpoint>,
    pub ratio: Fraction,
    pub log_level: Option<tracing::Level>,
}

/// A fully loaded and weighed execution plan, ready for the worker task
pub(crate) struct ExecutionPlan {
    pub id: Uuid,
    pub checkpoints: Vec<PlannedCheckpoint>,
    pub dry_run: bool,
    pub stop_on_error: bool,
}
