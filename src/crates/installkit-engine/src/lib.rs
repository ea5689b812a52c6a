//! # installkit-engine - Checkpoint-Driven Install Execution
//!
//! The execution core of installkit: an engine that runs an ordered list of
//! named checkpoints, snapshotting application and filesystem state before
//! every step so an interrupted or failed install can be rolled back and
//! resumed instead of restarted.
//!
//! ## Overview
//!
//! `installkit-engine` provides:
//!
//! - **Ordered checkpoint execution** - Registration order is execution
//!   order, with optional insert-before placement
//! - **Snapshot before every step** - Data-cache and (optionally)
//!   filesystem snapshots keyed by checkpoint name, plus a `latest`
//!   snapshot after each success
//! - **Rollback and resume** - Rerun from any completed checkpoint in the
//!   same process, or resume a brand-new process from persisted state
//! - **Exact progress aggregation** - Fixed-point per-checkpoint ratios
//!   that sum to exactly 1, published on a `tokio::sync::watch` channel
//! - **Cooperative cancellation** - The in-flight checkpoint is offered a
//!   cancel hook and allowed to finish; the next one never starts
//! - **Error collection** - Detailed failures land in a shared
//!   [`ErrorService`], keyed by checkpoint name
//!
//! ## Core Concepts
//!
//! ### 1. Checkpoints and the catalog
//!
//! A [`Checkpoint`] is one named unit of install work: an async `execute`
//! taking a [`CheckpointContext`], a relative `progress_estimate`, and an
//! optional `cancel` hook. Implementations are plugged in as factory
//! closures in a [`CheckpointCatalog`] under string keys; registrations
//! reference a key plus JSON constructor arguments, and instantiation is
//! deferred until execution begins.
//!
//! ### 2. The execution session
//!
//! [`InstallEngine::execute_checkpoints`] computes the execution list
//! (bounded by `start_from` and `pause_before`), instantiates and weighs
//! every checkpoint up front, then runs the list sequentially on a spawned
//! worker task. The caller either blocks on the result or hands over a
//! completion callback and returns immediately.
//!
//! ### 3. Snapshots, rollback, resume
//!
//! Before each checkpoint runs, the shared [`DataCache`] is snapshotted
//! under the checkpoint's name, and so is the dataset when one is
//! configured. After each success a `latest` snapshot records the
//! completion history. [`InstallEngine::rollback`] restores the state as of
//! just before a named checkpoint; a new process can ask
//! [`InstallEngine::get_resumable_checkpoints`] which registrations match
//! the persisted history and resume from any of them, once.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use installkit_engine::{
//!     Checkpoint, CheckpointContext, CheckpointRegistration, ExecuteOptions,
//!     InstallEngine, Result,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct DiskSetup;
//!
//! #[async_trait]
//! impl Checkpoint for DiskSetup {
//!     async fn execute(&self, ctx: &CheckpointContext) -> Result<()> {
//!         ctx.report_progress(50);
//!         // partition disks, update the shared cache...
//!         ctx.report_progress(100);
//!         Ok(())
//!     }
//!
//!     fn progress_estimate(&self) -> u32 {
//!         20
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let engine = InstallEngine::builder().build()?;
//!     engine
//!         .catalog()
//!         .register_factory("disk-setup", |_args| Ok(Arc::new(DiskSetup) as _));
//!     engine.register_checkpoint(CheckpointRegistration::new("disks", "disk-setup"))?;
//!
//!     let result = engine.execute_checkpoints(ExecuteOptions::new()).await?;
//!     assert!(result.is_success());
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod error_service;
pub mod progress;
pub mod registry;
pub mod session;

pub use checkpoint::{Checkpoint, CheckpointCatalog, CheckpointContext, CheckpointFactory};
pub use engine::{EngineBuilder, InstallEngine};
pub use error::{EngineError, Result};
pub use error_service::{ErrorService, ENGINE_ERROR_KEY};
pub use progress::{compute_ratios, Fraction, ProgressAggregator};
pub use registry::{validate_name, CheckpointRecord, CheckpointRegistration};
pub use session::{
    CancelFlag, CompletionCallback, ExecResult, ExecStatus, ExecuteOptions, ProgressReporter,
    ProgressUpdate,
};

pub use installkit_snapshot::{CompletedCheckpoint, DataCache, Dataset, MemoryDataset, LATEST};
