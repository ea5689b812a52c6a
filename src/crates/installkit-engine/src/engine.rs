//! The install execution engine
//!
//! [`InstallEngine`] owns the checkpoint registry, the shared data cache,
//! the optional dataset, and the per-session worker task. It orchestrates
//! ordered execution with snapshot-before-each-step, rollback to a named
//! checkpoint, out-of-process resume, cooperative cancellation, and
//! fixed-point progress aggregation.
//!
//! # Execution model
//!
//! Checkpoints run strictly sequentially on a single spawned worker task per
//! session; they mutate one shared cache and one shared dataset and must
//! observe each other's effects in order. `execute_checkpoints` blocks the
//! caller (awaiting the worker's result channel) unless a completion
//! callback is supplied, in which case it returns as soon as the worker is
//! spawned and the callback fires from the worker when the session ends.
//!
//! # One engine per process
//!
//! The Python-era singleton survives as a factory invariant: building a
//! guarded engine while another is live fails with
//! [`EngineError::AlreadyExists`], and dropping the engine releases the
//! guard. `build_detached` skips the guard for embedders that manage their
//! own lifetimes (test harnesses, mainly).

use crate::checkpoint::{Checkpoint, CheckpointCatalog, CheckpointContext};
use crate::error::{EngineError, Result};
use crate::error_service::{ErrorService, ENGINE_ERROR_KEY};
use crate::progress::{compute_ratios, Fraction, ProgressAggregator};
use crate::registry::{CheckpointRegistration, CheckpointRegistry};
use crate::session::{
    CancelFlag, CompletionCallback, ExecResult, ExecStatus, ExecuteOptions, ExecutionPlan,
    PlannedCheckpoint, ProgressReporter, ProgressUpdate,
};
use installkit_snapshot::{
    CompletedCheckpoint, DataCache, Dataset, SnapshotError, SnapshotStore, LATEST,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{Instrument, Level};
use uuid::Uuid;

/// Process-wide guard backing the one-engine-per-process invariant
static ENGINE_LIVE: AtomicBool = AtomicBool::new(false);

/// Builder for [`InstallEngine`]
#[derive(Default)]
pub struct EngineBuilder {
    snapshot_root: Option<PathBuf>,
    dataset: Option<Arc<dyn Dataset>>,
    catalog: Option<CheckpointCatalog>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store cache snapshots under an explicit directory
    ///
    /// Defaults to the dataset mountpoint when a dataset is configured, else
    /// the `INSTALLKIT_SNAPSHOT_DIR` environment variable, else a
    /// per-process temp directory.
    pub fn with_snapshot_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.snapshot_root = Some(root.into());
        self
    }

    /// Attach a dataset for filesystem snapshot/rollback
    ///
    /// Without one the engine runs in degraded mode: rollback covers the
    /// data cache only.
    pub fn with_dataset(mut self, dataset: Arc<dyn Dataset>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Use an existing factory catalog instead of an empty one
    pub fn with_catalog(mut self, catalog: CheckpointCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Build the process-guarded engine
    pub fn build(self) -> Result<InstallEngine> {
        if ENGINE_LIVE.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyExists);
        }
        Ok(self.assemble(true))
    }

    /// Build an engine without the one-per-process guard
    pub fn build_detached(self) -> InstallEngine {
        self.assemble(false)
    }

    fn assemble(self, guarded: bool) -> InstallEngine {
        let store = match (&self.snapshot_root, &self.dataset) {
            (Some(root), _) => SnapshotStore::with_root(root),
            (None, Some(dataset)) => match dataset.mountpoint() {
                Some(mountpoint) => SnapshotStore::with_root(mountpoint),
                None => SnapshotStore::from_env(),
            },
            (None, None) => SnapshotStore::from_env(),
        };

        let (progress_tx, progress_rx) = watch::channel(ProgressUpdate::default());
        InstallEngine {
            inner: Arc::new(EngineInner {
                catalog: self.catalog.unwrap_or_default(),
                registry: StdMutex::new(CheckpointRegistry::new()),
                cache: Arc::new(RwLock::new(DataCache::new())),
                store,
                dataset: self.dataset,
                errors: ErrorService::new(),
                exec: StdMutex::new(ExecState::default()),
                progress_tx,
                progress_rx,
                snapshots_mutated: AtomicBool::new(false),
                resume_used: AtomicBool::new(false),
            }),
            guarded,
        }
    }
}

/// Session bookkeeping guarded by one lock
///
/// The cancel flag is set under the same lock that tracks the currently
/// executing checkpoint, so a cancellation request and the worker's own
/// bookkeeping never race.
#[derive(Default)]
struct ExecState {
    active: bool,
    cancel: CancelFlag,
    current: Option<(String, Arc<dyn Checkpoint>)>,
    worker: Option<JoinHandle<()>>,
}

struct EngineInner {
    catalog: CheckpointCatalog,
    registry: StdMutex<CheckpointRegistry>,
    cache: Arc<RwLock<DataCache>>,
    store: SnapshotStore,
    dataset: Option<Arc<dyn Dataset>>,
    errors: ErrorService,
    exec: StdMutex<ExecState>,
    progress_tx: watch::Sender<ProgressUpdate>,
    #[allow(dead_code)]
    progress_rx: watch::Receiver<ProgressUpdate>,
    snapshots_mutated: AtomicBool,
    resume_used: AtomicBool,
}

/// Outcome of session preparation: either nothing to do, or a loaded plan
enum Prepared {
    Finished(ExecResult),
    Plan(ExecutionPlan),
}

/// Where the worker delivers the session result
enum WorkerSink {
    Channel(oneshot::Sender<std::result::Result<ExecResult, EngineError>>),
    Callback(CompletionCallback),
}

/// Checkpoint-driven install execution engine
pub struct InstallEngine {
    inner: Arc<EngineInner>,
    guarded: bool,
}

impl InstallEngine {
    /// Start building an engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// The factory catalog checkpoints are resolved from
    pub fn catalog(&self) -> &CheckpointCatalog {
        &self.inner.catalog
    }

    /// The shared data cache
    pub fn cache(&self) -> Arc<RwLock<DataCache>> {
        self.inner.cache.clone()
    }

    /// The snapshot store resolving cache snapshot paths
    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.inner.store
    }

    /// The error-collection service holding per-checkpoint failures
    pub fn error_service(&self) -> &ErrorService {
        &self.inner.errors
    }

    /// Subscribe to overall session progress
    pub fn progress(&self) -> watch::Receiver<ProgressUpdate> {
        self.inner.progress_tx.subscribe()
    }

    /// Register a checkpoint
    ///
    /// Fails while a session is active, on invalid or duplicate names, on
    /// the reserved `latest` name, when `insert_before` names a missing or
    /// completed checkpoint, or when the factory key does not resolve. The
    /// factory key is validated eagerly; instantiation is deferred to
    /// execution.
    pub fn register_checkpoint(&self, registration: CheckpointRegistration) -> Result<()> {
        if self.lock_exec().active {
            return Err(EngineError::ExecutionInProgress);
        }
        if !self.inner.catalog.contains(&registration.factory_key) {
            return Err(EngineError::UnknownFactory(registration.factory_key.clone()));
        }
        let mut registry = self.lock_registry();
        registry.register(&registration)?;
        tracing::debug!(checkpoint = %registration.name, factory = %registration.factory_key, "Checkpoint registered");
        Ok(())
    }

    /// Names of all registered checkpoints, in execution order
    pub fn registered_checkpoints(&self) -> Vec<String> {
        self.lock_registry()
            .records()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Whether a registered checkpoint has completed
    pub fn is_completed(&self, name: &str) -> Result<bool> {
        self.lock_registry()
            .get(name)
            .map(|r| r.completed)
            .ok_or_else(|| EngineError::Unknown(name.to_string()))
    }

    /// The exact progress ratio computed for a checkpoint in the last
    /// loaded execution list
    pub fn progress_ratio(&self, name: &str) -> Result<Fraction> {
        self.lock_registry()
            .get(name)
            .map(|r| r.progress_ratio)
            .ok_or_else(|| EngineError::Unknown(name.to_string()))
    }

    /// Execute checkpoints, blocking until the session finishes
    ///
    /// Returns the session result; a fatal engine-internal failure is
    /// returned as `Err` rather than a result. When `start_from` names an
    /// already-completed checkpoint, the engine rolls back to it first so a
    /// rerun never overlays a previous run's state.
    pub async fn execute_checkpoints(&self, options: ExecuteOptions) -> Result<ExecResult> {
        match self.prepare(options).await? {
            Prepared::Finished(result) => Ok(result),
            Prepared::Plan(plan) => {
                let (tx, rx) = oneshot::channel();
                self.spawn_worker(plan, WorkerSink::Channel(tx));
                rx.await
                    .map_err(|_| EngineError::fatal("worker task dropped its result channel"))?
            }
        }
    }

    /// Execute checkpoints, delivering the result to a callback
    ///
    /// Returns as soon as the worker task is spawned; the callback fires
    /// from the worker when the session ends. Fatal engine-internal failures
    /// surface to the callback as [`ExecStatus::Fatal`], with the detail
    /// recorded in the error service under [`ENGINE_ERROR_KEY`].
    pub async fn execute_checkpoints_with_callback(
        &self,
        options: ExecuteOptions,
        callback: CompletionCallback,
    ) -> Result<()> {
        match self.prepare(options).await? {
            Prepared::Finished(result) => {
                callback(result);
                Ok(())
            }
            Prepared::Plan(plan) => {
                self.spawn_worker(plan, WorkerSink::Callback(callback));
                Ok(())
            }
        }
    }

    /// Request cancellation and wait for the worker task to exit
    ///
    /// Cooperative: the in-flight checkpoint is offered its `cancel` hook
    /// and allowed to finish; the next checkpoint never starts. No-op when
    /// nothing is executing.
    pub async fn cancel(&self) {
        let (current, worker) = {
            let mut exec = self.lock_exec();
            if !exec.active {
                return;
            }
            exec.cancel.request();
            (exec.current.clone(), exec.worker.take())
        };

        if let Some((name, checkpoint)) = current {
            tracing::info!(checkpoint = %name, "Forwarding cancel request to in-flight checkpoint");
            checkpoint.cancel().await;
        }
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }

    /// Roll back the data cache (and dataset, if configured) to the state
    /// captured just before `target` executed
    ///
    /// Completed-in-process checkpoints use their recorded snapshot paths;
    /// otherwise the deterministic paths are recomputed and, when a dataset
    /// is configured, the filesystem snapshot must exist. Resets every
    /// checkpoint at or after `target` to incomplete.
    pub async fn rollback(&self, target: &str) -> Result<()> {
        if self.lock_exec().active {
            return Err(EngineError::ExecutionInProgress);
        }
        self.rollback_to(target).await
    }

    /// Rollback body shared with session preparation, which holds the
    /// session reservation itself
    async fn rollback_to(&self, target: &str) -> Result<()> {
        let (index, completed, recorded_path, recorded_fs) = {
            let registry = self.lock_registry();
            let index = registry
                .index_of(target)
                .ok_or_else(|| EngineError::Unknown(target.to_string()))?;
            let record = &registry.records()[index];
            (
                index,
                record.completed,
                record.cache_snapshot_path.clone(),
                record.fs_snapshot_name.clone(),
            )
        };

        let (cache_path, fs_name) = match (completed, recorded_path) {
            // In-process fast path: the snapshot locations were recorded
            // when the pre-execution snapshot was taken.
            (true, Some(path)) => (path, recorded_fs),
            // Out-of-process path: recompute deterministically and require
            // the filesystem snapshot when a dataset is configured.
            _ => {
                let path = self.inner.store.cache_snapshot_path(target);
                let fs_name = match &self.inner.dataset {
                    Some(dataset) if dataset.exists().await => {
                        let snapshots = dataset.snapshot_list().await?;
                        if !snapshots.iter().any(|s| s == target) {
                            return Err(SnapshotError::MissingFilesystemSnapshot(
                                target.to_string(),
                            )
                            .into());
                        }
                        Some(target.to_string())
                    }
                    _ => None,
                };
                (path, fs_name)
            }
        };

        self.restore(&cache_path, fs_name.as_deref()).await?;
        self.lock_registry().reset_completed_from(index);
        tracing::info!(target = %target, "Rolled back to checkpoint");
        Ok(())
    }

    /// Out-of-process resume: restore state as of just before `start_from`
    /// and execute from there, blocking until the session finishes
    ///
    /// May only be invoked once per process; fails if dataset snapshots
    /// were already mutated in this process or if `start_from` is not among
    /// [`get_resumable_checkpoints`](Self::get_resumable_checkpoints).
    pub async fn resume_execute_checkpoints(
        &self,
        start_from: &str,
        options: ExecuteOptions,
    ) -> Result<ExecResult> {
        let options = self.prepare_resume(start_from, options).await?;
        self.execute_checkpoints(options).await
    }

    /// Out-of-process resume delivering the result to a callback
    pub async fn resume_execute_checkpoints_with_callback(
        &self,
        start_from: &str,
        options: ExecuteOptions,
        callback: CompletionCallback,
    ) -> Result<()> {
        let options = self.prepare_resume(start_from, options).await?;
        self.execute_checkpoints_with_callback(options, callback)
            .await
    }

    /// Checkpoint names that can be resumed from, in registration order
    ///
    /// Compares the completion history in the most recent `latest` cache
    /// snapshot against the current registrations, position by position;
    /// matching stops at the first divergence. The checkpoint following the
    /// last match is also offered, and with no history at all the first
    /// registered checkpoint is offered.
    pub async fn get_resumable_checkpoints(&self) -> Result<Vec<String>> {
        let (_, resumable) = self.matched_history().await?;
        Ok(resumable)
    }

    /// Destroy all snapshots and reset completion state
    ///
    /// Forbidden while a session is active. After cleanup no rollback
    /// target exists, so every checkpoint is reset to incomplete.
    pub async fn cleanup_checkpoints(&self) -> Result<()> {
        if self.lock_exec().active {
            return Err(EngineError::ExecutionInProgress);
        }

        let mut names = self.registered_checkpoints();
        names.push(LATEST.to_string());

        if let Some(dataset) = &self.inner.dataset {
            if dataset.exists().await {
                let existing = dataset.snapshot_list().await?;
                for name in &names {
                    if existing.iter().any(|s| s == name) {
                        dataset.destroy(name).await?;
                    }
                }
            }
        }
        self.inner.store.cleanup()?;

        self.lock_registry().reset_all();
        self.inner
            .cache
            .write()
            .await
            .set_completed_checkpoints(&[])?;
        tracing::info!("Checkpoint snapshots and completion state cleaned up");
        Ok(())
    }

    // ---- session preparation ----

    async fn prepare(&self, options: ExecuteOptions) -> Result<Prepared> {
        // Check and reserve in one critical section so two overlapping
        // calls can never both pass the guard; the reservation is released
        // on every path that does not hand a plan to the worker.
        {
            let mut exec = self.lock_exec();
            if exec.active {
                return Err(EngineError::ExecutionInProgress);
            }
            exec.active = true;
            exec.cancel = CancelFlag::new();
            exec.current = None;
        }

        match self.prepare_session(&options).await {
            Ok(Prepared::Plan(plan)) => {
                let _ = self.inner.progress_tx.send(ProgressUpdate::default());
                Ok(Prepared::Plan(plan))
            }
            Ok(finished) => {
                self.release_session();
                Ok(finished)
            }
            Err(error) => {
                self.release_session();
                Err(error)
            }
        }
    }

    /// Build the execution plan for an already-reserved session
    async fn prepare_session(&self, options: &ExecuteOptions) -> Result<Prepared> {
        // Rerunning a completed checkpoint reverts to its pre-execution
        // state first, so the rerun never observes a later run's effects.
        if let Some(start) = &options.start_from {
            let completed = {
                let registry = self.lock_registry();
                registry
                    .get(start)
                    .map(|r| r.completed)
                    .ok_or_else(|| EngineError::Unknown(start.clone()))?
            };
            if completed {
                self.rollback_to(start).await?;
            }
        }

        let names = self.compute_execution_list(options)?;
        if names.is_empty() {
            return Ok(Prepared::Finished(ExecResult::new(
                ExecStatus::Success,
                Vec::new(),
            )));
        }

        match self.load_and_weigh(&names) {
            Ok(checkpoints) => Ok(Prepared::Plan(ExecutionPlan {
                id: Uuid::new_v4(),
                checkpoints,
                dry_run: options.dry_run,
                stop_on_error: options.stop_on_error,
            })),
            Err(failed_name) => Ok(Prepared::Finished(ExecResult::new(
                ExecStatus::InitFailed,
                vec![failed_name],
            ))),
        }
    }

    fn release_session(&self) {
        let mut exec = self.lock_exec();
        exec.active = false;
        exec.current = None;
    }

    /// Compute the ordered sub-list of checkpoint names to execute
    fn compute_execution_list(&self, options: &ExecuteOptions) -> Result<Vec<String>> {
        let registry = self.lock_registry();
        let records = registry.records();

        let start = match &options.start_from {
            Some(name) => registry
                .index_of(name)
                .ok_or_else(|| EngineError::Unknown(name.clone()))?,
            None => match registry.first_incomplete() {
                Some(index) => index,
                None => return Ok(Vec::new()),
            },
        };

        // Cannot resume past an unexecuted gap.
        for record in &records[..start] {
            if !record.completed {
                return Err(EngineError::IncompleteGap(record.name.clone()));
            }
        }

        let end = match &options.pause_before {
            Some(name) => {
                let index = registry
                    .index_of(name)
                    .ok_or_else(|| EngineError::Unknown(name.clone()))?;
                if index < start {
                    return Err(EngineError::OutOfOrder {
                        pause_before: name.clone(),
                        start_from: records[start].name.clone(),
                    });
                }
                index
            }
            None => records.len(),
        };

        Ok(records[start..end].iter().map(|r| r.name.clone()).collect())
    }

    /// Instantiate each checkpoint and compute exact progress ratios
    ///
    /// On any instantiation failure returns the failing name; no partial
    /// list is ever executed.
    fn load_and_weigh(
        &self,
        names: &[String],
    ) -> std::result::Result<Vec<PlannedCheckpoint>, String> {
        let mut instances = Vec::with_capacity(names.len());
        let mut estimates = Vec::with_capacity(names.len());

        for name in names {
            let (factory_key, args, log_level) = {
                let registry = self.lock_registry();
                let record = match registry.get(name) {
                    Some(record) => record,
                    None => return Err(name.clone()),
                };
                (record.factory_key.clone(), record.args.clone(), record.log_level)
            };

            let instance = match self
                .inner
                .catalog
                .resolve(&factory_key)
                .and_then(|factory| factory(&args))
            {
                Ok(instance) => instance,
                Err(error) => {
                    tracing::error!(checkpoint = %name, error = %error, "Checkpoint failed to initialize");
                    self.inner
                        .errors
                        .record(name.clone(), EngineError::init_failed(name, error.to_string()));
                    return Err(name.clone());
                }
            };

            // Zero-weight checkpoints would vanish from the progress math.
            let estimate = instance.progress_estimate().max(1);
            estimates.push(estimate);
            instances.push((name.clone(), instance, log_level, estimate));
        }

        let ratios = compute_ratios(&estimates);
        let mut registry = self.lock_registry();
        let mut planned = Vec::with_capacity(instances.len());
        for ((name, instance, log_level, estimate), ratio) in
            instances.into_iter().zip(ratios.into_iter())
        {
            if let Some(record) = registry.get_mut(&name) {
                record.progress_estimate = estimate;
                record.progress_ratio = ratio;
                record.progress_reported = 0;
            }
            planned.push(PlannedCheckpoint {
                name,
                instance,
                ratio,
                log_level,
            });
        }
        Ok(planned)
    }

    fn spawn_worker(&self, plan: ExecutionPlan, sink: WorkerSink) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let (result, fatal) = run_plan(&inner, plan).await;

            {
                let mut exec = inner
                    .exec
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                exec.active = false;
                exec.current = None;
            }

            match sink {
                WorkerSink::Channel(tx) => {
                    let outcome = match fatal {
                        Some(error) => Err(error),
                        None => Ok(result),
                    };
                    let _ = tx.send(outcome);
                }
                WorkerSink::Callback(callback) => {
                    if let Some(error) = fatal {
                        inner.errors.record(ENGINE_ERROR_KEY, error);
                    }
                    callback(result);
                }
            }
        });
        self.lock_exec().worker = Some(handle);
    }

    // ---- resume ----

    async fn prepare_resume(
        &self,
        start_from: &str,
        mut options: ExecuteOptions,
    ) -> Result<ExecuteOptions> {
        if self.lock_exec().active {
            return Err(EngineError::ExecutionInProgress);
        }
        if self.inner.resume_used.load(Ordering::SeqCst) {
            return Err(EngineError::ResumeAlreadyUsed);
        }
        if self.inner.snapshots_mutated.load(Ordering::SeqCst) {
            return Err(EngineError::SnapshotsMutated);
        }

        let (matched, resumable) = self.matched_history().await?;
        if !resumable.iter().any(|name| name == start_from) {
            return Err(EngineError::NotResumable(start_from.to_string()));
        }
        self.inner.resume_used.store(true, Ordering::SeqCst);

        let start_index = {
            let registry = self.lock_registry();
            registry
                .index_of(start_from)
                .ok_or_else(|| EngineError::Unknown(start_from.to_string()))?
        };

        if let Some(entry) = matched.iter().find(|e| e.name == start_from) {
            // Resuming at a previously-completed checkpoint: restore its
            // pre-execution snapshot.
            let cache_path = self.inner.store.cache_snapshot_path(start_from);
            let fs_name = if entry.has_fs_snapshot {
                Some(start_from.to_string())
            } else {
                None
            };
            self.restore(&cache_path, fs_name.as_deref()).await?;
        } else {
            // Resuming at the next unexecuted checkpoint: restore the most
            // recent successful state.
            let fs_name = if matched.iter().any(|e| e.has_fs_snapshot) {
                Some(LATEST)
            } else {
                None
            };
            self.restore(&self.inner.store.latest_snapshot_path(), fs_name)
                .await?;
        }

        // In-memory completion flags were never set in this process; the
        // checkpoints before the resume point are known-complete from the
        // restored history.
        {
            let mut registry = self.lock_registry();
            for (index, record) in registry.records_mut().iter_mut().enumerate() {
                record.completed = index < start_index;
            }
        }

        tracing::info!(start_from = %start_from, "Resuming out-of-process execution");
        options.start_from = Some(start_from.to_string());
        Ok(options)
    }

    /// Match the restored completion history against current registrations
    ///
    /// Returns the matched completed entries (the longest matching prefix)
    /// and the resumable names derived from them.
    async fn matched_history(&self) -> Result<(Vec<CompletedCheckpoint>, Vec<String>)> {
        let records: Vec<(String, String, serde_json::Value)> = {
            let registry = self.lock_registry();
            registry
                .records()
                .iter()
                .map(|r| (r.name.clone(), r.factory_key.clone(), r.args.clone()))
                .collect()
        };
        if records.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let latest_path = self.inner.store.latest_snapshot_path();
        if !latest_path.exists() {
            return Ok((Vec::new(), vec![records[0].0.clone()]));
        }
        let snapshot_cache = DataCache::load_from_snapshot(&latest_path)?;
        let history = snapshot_cache.completed_checkpoints()?;

        let fs_snapshots = match &self.inner.dataset {
            Some(dataset) if dataset.exists().await => dataset.snapshot_list().await?,
            _ => Vec::new(),
        };

        let mut matched = Vec::new();
        let mut resumable = Vec::new();
        for (position, (name, factory_key, args)) in records.iter().enumerate() {
            match history.get(position) {
                Some(entry)
                    if entry.position == position as u32
                        && entry.name == *name
                        && entry.factory_key == *factory_key
                        && entry.args == *args =>
                {
                    // A recorded filesystem snapshot must still exist; one
                    // that was never taken is tolerated by its absence.
                    if entry.has_fs_snapshot && !fs_snapshots.iter().any(|s| s == name) {
                        break;
                    }
                    matched.push(entry.clone());
                    resumable.push(name.clone());
                }
                _ => break,
            }
        }

        // The step after the last completed match is also a valid resume
        // point; with no match at all this offers the first registration.
        if resumable.len() < records.len() {
            resumable.push(records[resumable.len()].0.clone());
        }
        Ok((matched, resumable))
    }

    // ---- shared internals ----

    /// Restore dataset (optionally) then data cache from snapshot sources
    async fn restore(&self, cache_path: &std::path::Path, fs_name: Option<&str>) -> Result<()> {
        if let (Some(fs), Some(dataset)) = (fs_name, &self.inner.dataset) {
            dataset.rollback(fs, true).await?;
        }
        let restored = DataCache::load_from_snapshot(cache_path)?;
        *self.inner.cache.write().await = restored;
        Ok(())
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, CheckpointRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_exec(&self) -> std::sync::MutexGuard<'_, ExecState> {
        self.inner
            .exec
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for InstallEngine {
    fn drop(&mut self) {
        if self.guarded {
            ENGINE_LIVE.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for InstallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallEngine")
            .field("checkpoints", &self.registered_checkpoints())
            .field("has_dataset", &self.inner.dataset.is_some())
            .field("snapshot_root", &self.inner.store.root())
            .finish()
    }
}

/// Run a loaded plan to completion on the worker task
///
/// Returns the session result plus, for engine-internal failures, the fatal
/// error that aborted the session.
async fn run_plan(
    inner: &Arc<EngineInner>,
    plan: ExecutionPlan,
) -> (ExecResult, Option<EngineError>) {
    let cancel = {
        inner
            .exec
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel
            .clone()
    };
    let mut aggregator = ProgressAggregator::new();
    let mut failed: Vec<String> = Vec::new();
    let mut canceled = false;

    tracing::info!(
        session = %plan.id,
        checkpoints = plan.checkpoints.len(),
        dry_run = plan.dry_run,
        "Execution session started"
    );

    for planned in &plan.checkpoints {
        if cancel.is_requested() {
            tracing::info!(next = %planned.name, "Cancellation requested; not starting next checkpoint");
            canceled = true;
            break;
        }

        if let Err(error) = snapshot_before(inner, &planned.name).await {
            return (
                ExecResult::new(ExecStatus::Fatal, failed),
                Some(EngineError::fatal(format!(
                    "snapshot before '{}' failed: {error}",
                    planned.name
                ))),
            );
        }

        {
            let mut exec = inner
                .exec
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            exec.current = Some((planned.name.clone(), planned.instance.clone()));
        }

        let reported = Arc::new(AtomicU8::new(0));
        let reporter = ProgressReporter::new(
            planned.name.clone(),
            planned.ratio,
            aggregator.completed(),
            reported.clone(),
            inner.progress_tx.clone(),
        );
        let context = CheckpointContext::new(
            planned.name.clone(),
            plan.dry_run,
            inner.cache.clone(),
            cancel.clone(),
            reporter,
        );

        let span = checkpoint_span(&planned.name, planned.log_level);
        let outcome = planned.instance.execute(&context).instrument(span).await;

        {
            let mut exec = inner
                .exec
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            exec.current = None;
        }

        match outcome {
            Ok(()) => {
                aggregator.complete(planned.ratio);
                {
                    let mut registry = inner
                        .registry
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(record) = registry.get_mut(&planned.name) {
                        record.completed = true;
                        record.progress_reported = 100;
                    }
                }
                let _ = inner.progress_tx.send(ProgressUpdate {
                    checkpoint: Some(planned.name.clone()),
                    overall: aggregator.completed(),
                });
                tracing::info!(
                    checkpoint = %planned.name,
                    overall = %aggregator.completed(),
                    "Checkpoint completed"
                );

                if let Err(error) = snapshot_latest(inner).await {
                    return (
                        ExecResult::new(ExecStatus::Fatal, failed),
                        Some(EngineError::fatal(format!(
                            "latest snapshot after '{}' failed: {error}",
                            planned.name
                        ))),
                    );
                }
            }
            Err(error) => {
                tracing::error!(checkpoint = %planned.name, error = %error, "Checkpoint failed");
                {
                    let mut registry = inner
                        .registry
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    if let Some(record) = registry.get_mut(&planned.name) {
                        record.progress_reported = reported.load(Ordering::SeqCst);
                    }
                }
                inner.errors.record(planned.name.clone(), error);
                failed.push(planned.name.clone());
                if plan.stop_on_error {
                    break;
                }
            }
        }
    }

    let status = if canceled {
        ExecStatus::Canceled
    } else if failed.is_empty() {
        ExecStatus::Success
    } else {
        ExecStatus::Failed
    };
    tracing::info!(session = %plan.id, status = ?status, failed = failed.len(), "Execution session finished");
    (ExecResult::new(status, failed), None)
}

/// Snapshot cache and dataset under the checkpoint's name, pre-execution
async fn snapshot_before(inner: &Arc<EngineInner>, name: &str) -> Result<()> {
    let cache_path = inner.store.cache_snapshot_path(name);
    {
        let cache = inner.cache.read().await;
        cache.take_snapshot(&cache_path)?;
    }

    let mut fs_name = None;
    if let Some(dataset) = &inner.dataset {
        if dataset.exists().await {
            dataset.snapshot(name, true).await?;
            inner.snapshots_mutated.store(true, Ordering::SeqCst);
            fs_name = Some(name.to_string());
        }
    }

    let mut registry = inner
        .registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(record) = registry.get_mut(name) {
        record.cache_snapshot_path = Some(cache_path);
        record.fs_snapshot_name = fs_name;
    }
    Ok(())
}

/// Record completion history in the cache and refresh the `latest` snapshot
async fn snapshot_latest(inner: &Arc<EngineInner>) -> Result<()> {
    let entries = {
        let registry = inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.completed_entries()
    };
    {
        let mut cache = inner.cache.write().await;
        cache.set_completed_checkpoints(&entries)?;
    }
    {
        let cache = inner.cache.read().await;
        cache.take_snapshot(&inner.store.latest_snapshot_path())?;
    }

    if let Some(dataset) = &inner.dataset {
        if dataset.exists().await {
            dataset.snapshot(LATEST, true).await?;
            inner.snapshots_mutated.store(true, Ordering::SeqCst);
        }
    }
    Ok(())
}

/// Span for one checkpoint's execution, honoring its log-level override
fn checkpoint_span(name: &str, level: Option<Level>) -> tracing::Span {
    let level = level.unwrap_or(Level::INFO);
    if level == Level::TRACE {
        tracing::trace_span!("checkpoint", name = %name)
    } else if level == Level::DEBUG {
        tracing::debug_span!("checkpoint", name = %name)
    } else if level == Level::WARN {
        tracing::warn_span!("checkpoint", name = %name)
    } else if level == Level::ERROR {
        tracing::error_span!("checkpoint", name = %name)
    } else {
        tracing::info_span!("checkpoint", name = %name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;
    use async_trait::async_trait;

    struct NoopCheckpoint;

    #[async_trait]
    impl Checkpoint for NoopCheckpoint {
        async fn execute(&self, _ctx: &CheckpointContext) -> Result<()> {
            Ok(())
        }

        fn progress_estimate(&self) -> u32 {
            1
        }
    }

    fn detached_engine() -> InstallEngine {
        let dir = tempfile::tempdir().unwrap().into_path();
        let engine = InstallEngine::builder()
            .with_snapshot_root(dir)
            .build_detached();
        engine
            .catalog()
            .register_factory("noop", |_| Ok(Arc::new(NoopCheckpoint) as _));
        engine
    }

    #[test]
    fn test_single_engine_guard() {
        let first = InstallEngine::builder().build().unwrap();
        let err = InstallEngine::builder().build().unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists));

        drop(first);
        let again = InstallEngine::builder().build().unwrap();
        drop(again);
    }

    #[test]
    fn test_register_requires_known_factory() {
        let engine = detached_engine();
        let err = engine
            .register_checkpoint(CheckpointRegistration::new("a", "missing-factory"))
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownFactory(_)));
    }

    #[test]
    fn test_register_rejected_while_active() {
        let engine = detached_engine();
        engine.lock_exec().active = true;

        let err = engine
            .register_checkpoint(CheckpointRegistration::new("a", "noop"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionInProgress));

        engine.lock_exec().active = false;
        engine
            .register_checkpoint(CheckpointRegistration::new("a", "noop"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_execution_list_bounds() {
        let engine = detached_engine();
        for name in ["a", "b", "c"] {
            engine
                .register_checkpoint(CheckpointRegistration::new(name, "noop"))
                .unwrap();
        }

        let list = engine
            .compute_execution_list(&ExecuteOptions::new())
            .unwrap();
        assert_eq!(list, vec!["a", "b", "c"]);

        let list = engine
            .compute_execution_list(&ExecuteOptions::new().with_pause_before("c"))
            .unwrap();
        assert_eq!(list, vec!["a", "b"]);

        // pause_before preceding start_from in registration order
        let err = engine
            .compute_execution_list(
                &ExecuteOptions::new().with_start_from("b").with_pause_before("a"),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::OutOfOrder { .. }));

        // Gap: "a" has not completed, so starting at "b" is a usage error.
        let err = engine
            .compute_execution_list(&ExecuteOptions::new().with_start_from("b"))
            .unwrap_err();
        assert!(matches!(err, EngineError::IncompleteGap(_)));

        let err = engine
            .compute_execution_list(&ExecuteOptions::new().with_start_from("ghost"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let engine = detached_engine();
        engine.cancel().await;
    }

    #[tokio::test]
    async fn test_rollback_unknown_checkpoint() {
        let engine = detached_engine();
        let err = engine.rollback("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::Unknown(_)));
    }
}
