//! Shared error-collection service
//!
//! Execution results carry only a status and the failed checkpoint names;
//! the detailed error objects are deposited here, keyed by checkpoint name,
//! for callers to inspect after the fact. The engine never prints to a
//! terminal itself.

use crate::error::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Name under which engine-internal (non-checkpoint) errors are recorded
pub const ENGINE_ERROR_KEY: &str = "engine";

/// Thread-safe store of execution errors keyed by checkpoint name
#[derive(Debug, Clone, Default)]
pub struct ErrorService {
    inner: Arc<RwLock<HashMap<String, Vec<Arc<EngineError>>>>>,
}

impl ErrorService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error against a checkpoint name
    pub fn record(&self, name: impl Into<String>, error: EngineError) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.entry(name.into()).or_default().push(Arc::new(error));
    }

    /// All errors recorded against a checkpoint name, oldest first
    pub fn errors_for(&self, name: &str) -> Vec<Arc<EngineError>> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.get(name).cloned().unwrap_or_default()
    }

    /// Names that have at least one recorded error
    pub fn failed_names(&self) -> Vec<String> {
        let inner = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Discard all recorded errors
    pub fn clear(&self) {
        let mut inner = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let service = ErrorService::new();
        assert!(service.errors_for("transfer").is_empty());

        service.record("transfer", EngineError::checkpoint("transfer", "pkg plan failed"));
        service.record("transfer", EngineError::checkpoint("transfer", "retry failed"));

        let errors = service.errors_for("transfer");
        assert_eq!(errors.len(), 2);
        assert!(errors[0].to_string().contains("pkg plan failed"));
        assert_eq!(service.failed_names(), vec!["transfer"]);
    }

    #[test]
    fn test_clear() {
        let service = ErrorService::new();
        service.record("a", EngineError::Custom("boom".to_string()));
        service.clear();
        assert!(service.failed_names().is_empty());
    }
}
