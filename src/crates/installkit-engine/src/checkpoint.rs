//! The checkpoint contract and the factory catalog
//!
//! A checkpoint is one named unit of install work. The engine requires three
//! things of it: `execute` (fallible, dry-run aware), a one-shot relative
//! progress estimate, and an optional best-effort `cancel` hook. Everything
//! a checkpoint needs at runtime (the shared data cache, progress
//! reporting, the cancellation flag) arrives through its
//! [`CheckpointContext`]; checkpoints never touch engine-owned resources
//! directly.
//!
//! Checkpoints are plugged in by name: implementations are registered as
//! factory closures in a [`CheckpointCatalog`] under a string key, and
//! checkpoint registrations reference that key plus JSON constructor
//! arguments. Registration validates the key eagerly; instantiation is
//! deferred until execution begins.

use crate::error::{EngineError, Result};
use crate::session::{CancelFlag, ProgressReporter};
use async_trait::async_trait;
use installkit_snapshot::DataCache;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// A single named, ordered unit of install work
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Perform the work, returning `Err` to signal failure
    ///
    /// Must be safe to call with `ctx.dry_run()` set, meaning "simulate,
    /// write no persistent state."
    async fn execute(&self, ctx: &CheckpointContext) -> Result<()>;

    /// Relative time-weight of this checkpoint, called once before execution
    ///
    /// Non-positive estimates are clamped to 1 by the engine so every
    /// checkpoint contributes weight.
    fn progress_estimate(&self) -> u32;

    /// Best-effort cooperative cancellation hook
    ///
    /// The engine calls this when cancellation is requested while the
    /// checkpoint is in flight; implementations may ignore it.
    async fn cancel(&self) {}
}

/// Runtime context handed to a checkpoint for the duration of its execution
pub struct CheckpointContext {
    name: String,
    dry_run: bool,
    cache: Arc<RwLock<DataCache>>,
    cancel: CancelFlag,
    reporter: ProgressReporter,
}

impl CheckpointContext {
    pub(crate) fn new(
        name: String,
        dry_run: bool,
        cache: Arc<RwLock<DataCache>>,
        cancel: CancelFlag,
        reporter: ProgressReporter,
    ) -> Self {
        Self {
            name,
            dry_run,
            cache,
            cancel,
            reporter,
        }
    }

    /// Name this checkpoint was registered under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this execution is a simulation
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    /// Shared data cache; all checkpoint state flows through here
    pub fn cache(&self) -> &Arc<RwLock<DataCache>> {
        &self.cache
    }

    /// Whether session cancellation has been requested
    ///
    /// Long-running checkpoints should poll this and wind down early.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Report raw progress in `0..=100` for this checkpoint
    pub fn report_progress(&self, percent: u8) {
        self.reporter.report(percent);
    }
}

/// Factory closure producing a checkpoint instance from JSON arguments
pub type CheckpointFactory = Arc<dyn Fn(&Value) -> Result<Arc<dyn Checkpoint>> + Send + Sync>;

/// Maps string keys to checkpoint factories
///
/// This replaces load-by-module-path reflection: implementations register a
/// factory under a key, and checkpoint registrations name that key. Cheap to
/// clone; clones share the same underlying map.
#[derive(Clone, Default)]
pub struct CheckpointCatalog {
    factories: Arc<StdRwLock<HashMap<String, CheckpointFactory>>>,
}

impl CheckpointCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a key, replacing any previous registration
    pub fn register_factory<F>(&self, key: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn Checkpoint>> + Send + Sync + 'static,
    {
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.insert(key.into(), Arc::new(factory));
    }

    /// Whether a factory is registered under the key
    pub fn contains(&self, key: &str) -> bool {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories.contains_key(key)
    }

    /// Resolve a factory by key
    pub fn resolve(&self, key: &str) -> Result<CheckpointFactory> {
        let factories = self
            .factories
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        factories
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFactory(key.to_string()))
    }
}

impl std::fmt::Debug for CheckpointCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .factories
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CheckpointCatalog").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

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

    #[test]
    fn test_catalog_register_and_resolve() {
        let catalog = CheckpointCatalog::new();
        assert!(!catalog.contains("noop"));

        catalog.register_factory("noop", |_args| Ok(Arc::new(NoopCheckpoint) as _));
        assert!(catalog.contains("noop"));

        let factory = catalog.resolve("noop").unwrap();
        let checkpoint = factory(&json!({})).unwrap();
        assert_eq!(checkpoint.progress_estimate(), 1);
    }

    #[test]
    fn test_catalog_unknown_factory() {
        let catalog = CheckpointCatalog::new();
        let err = catalog.resolve("missing").err().unwrap();
        assert!(matches!(err, EngineError::UnknownFactory(_)));
    }

    #[test]
    fn test_catalog_clones_share_state() {
        let catalog = CheckpointCatalog::new();
        let clone = catalog.clone();
        catalog.register_factory("noop", |_args| Ok(Arc::new(NoopCheckpoint) as _));
        assert!(clone.contains("noop"));
    }
}
