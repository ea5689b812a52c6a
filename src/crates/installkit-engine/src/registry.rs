//! Checkpoint registration records and the ordered registry
//!
//! One [`CheckpointRecord`] exists per registered checkpoint, in
//! registration order; that order is execution order unless a registration
//! asks to be inserted before an existing record. Records carry the static
//! metadata (name, factory key, arguments, log level) plus the mutable
//! bookkeeping the engine maintains across a session: the completion flag,
//! the progress weights, and the snapshot paths recorded the moment a
//! pre-execution snapshot is taken.

use crate::error::{EngineError, Result};
use crate::progress::Fraction;
use installkit_snapshot::{CompletedCheckpoint, LATEST};
use serde_json::Value;
use std::path::PathBuf;
use tracing::Level;

/// Maximum checkpoint name length
const MAX_NAME_LEN: usize = 256;

/// Validate a user-chosen checkpoint name
///
/// ASCII letters, digits, `.`, `-` and `_` only; 1-256 characters; the
/// reserved `latest` marker is rejected.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::invalid_name(name, "name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::invalid_name(
            name,
            format!("name exceeds {MAX_NAME_LEN} characters"),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(EngineError::invalid_name(
            name,
            "only ASCII letters, digits, '.', '-' and '_' are allowed",
        ));
    }
    if name == LATEST {
        return Err(EngineError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// A checkpoint registration request
#[derive(Debug, Clone)]
pub struct CheckpointRegistration {
    /// Unique checkpoint name
    pub name: String,
    /// Catalog key resolving to the checkpoint's factory
    pub factory_key: String,
    /// JSON constructor arguments passed to the factory
    pub args: Value,
    /// Insert before this existing checkpoint instead of appending
    pub insert_before: Option<String>,
    /// Logging verbosity override for this checkpoint's execution
    pub log_level: Option<Level>,
}

impl CheckpointRegistration {
    pub fn new(name: impl Into<String>, factory_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            factory_key: factory_key.into(),
            args: Value::Null,
            insert_before: None,
            log_level: None,
        }
    }

    /// Set the constructor arguments
    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    /// Insert before an existing, not-yet-completed checkpoint
    pub fn insert_before(mut self, name: impl Into<String>) -> Self {
        self.insert_before = Some(name.into());
        self
    }

    /// Override the log level during this checkpoint's execution
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }
}

/// Registration record plus per-session bookkeeping for one checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Unique checkpoint name
    pub name: String,
    /// Catalog key for the checkpoint factory
    pub factory_key: String,
    /// Constructor arguments as registered
    pub args: Value,
    /// Logging verbosity override
    pub log_level: Option<Level>,
    /// Whether this checkpoint has successfully run (or was restored as run)
    pub completed: bool,
    /// Relative weight, clamped to at least 1 at load time
    pub progress_estimate: u32,
    /// This checkpoint's exact share of the active execution list
    pub progress_ratio: Fraction,
    /// Most recent raw 0-100 progress the checkpoint reported
    pub progress_reported: u8,
    /// Cache snapshot path, set when the pre-execution snapshot is taken
    pub cache_snapshot_path: Option<PathBuf>,
    /// Filesystem snapshot name, set when one is taken
    pub fs_snapshot_name: Option<String>,
}

impl CheckpointRecord {
    fn from_registration(reg: &CheckpointRegistration) -> Self {
        Self {
            name: reg.name.clone(),
            factory_key: reg.factory_key.clone(),
            args: reg.args.clone(),
            log_level: reg.log_level,
            completed: false,
            progress_estimate: 1,
            progress_ratio: Fraction::ZERO,
            progress_reported: 0,
            cache_snapshot_path: None,
            fs_snapshot_name: None,
        }
    }

    /// The completed-checkpoint entry recorded in the data cache for resume
    pub(crate) fn as_completed(&self, position: usize) -> CompletedCheckpoint {
        CompletedCheckpoint {
            name: self.name.clone(),
            position: position as u32,
            factory_key: self.factory_key.clone(),
            args: self.args.clone(),
            has_fs_snapshot: self.fs_snapshot_name.is_some(),
        }
    }
}

/// Ordered sequence of checkpoint records; insertion order is execution order
#[derive(Debug, Default)]
pub(crate) struct CheckpointRegistry {
    records: Vec<CheckpointRecord>,
}

impl CheckpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint, validating name uniqueness and insert position
    ///
    /// The caller (the engine) is responsible for rejecting registration
    /// while a session is active and for validating the factory key.
    pub fn register(&mut self, reg: &CheckpointRegistration) -> Result<()> {
        validate_name(&reg.name)?;
        if self.index_of(&reg.name).is_some() {
            return Err(EngineError::Duplicate(reg.name.clone()));
        }

        let position = match &reg.insert_before {
            Some(before) => {
                let idx = self
                    .index_of(before)
                    .ok_or_else(|| EngineError::Unknown(before.clone()))?;
                if self.records[idx].completed {
                    return Err(EngineError::InsertBeforeCompleted(before.clone()));
                }
                idx
            }
            None => self.records.len(),
        };

        self.records
            .insert(position, CheckpointRecord::from_registration(reg));
        Ok(())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&CheckpointRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CheckpointRecord> {
        self.records.iter_mut().find(|r| r.name == name)
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [CheckpointRecord] {
        &mut self.records
    }

    /// Index of the first checkpoint that has not completed
    pub fn first_incomplete(&self) -> Option<usize> {
        self.records.iter().position(|r| !r.completed)
    }

    /// Reset completion at and after the given index (rollback semantics)
    pub fn reset_completed_from(&mut self, index: usize) {
        for record in self.records.iter_mut().skip(index) {
            record.completed = false;
            record.progress_reported = 0;
        }
    }

    /// Reset all completion flags and snapshot bookkeeping (cleanup semantics)
    pub fn reset_all(&mut self) {
        for record in &mut self.records {
            record.completed = false;
            record.progress_reported = 0;
            record.cache_snapshot_path = None;
            record.fs_snapshot_name = None;
        }
    }

    /// Completed-checkpoint entries for the cache's well-known node
    pub fn completed_entries(&self) -> Vec<CompletedCheckpoint> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.completed)
            .map(|(i, r)| r.as_completed(i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reg(name: &str) -> CheckpointRegistration {
        CheckpointRegistration::new(name, "factory")
    }

    #[test]
    fn test_validate_name_rules() {
        assert!(validate_name("disk-setup.1_a").is_ok());

        assert!(matches!(
            validate_name(""),
            Err(EngineError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name("bad/name"),
            Err(EngineError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name("spaced name"),
            Err(EngineError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name(&"x".repeat(257)),
            Err(EngineError::InvalidName { .. })
        ));
        assert!(matches!(
            validate_name("latest"),
            Err(EngineError::ReservedName(_))
        ));
    }

    #[test]
    fn test_registration_order_is_execution_order() {
        let mut registry = CheckpointRegistry::new();
        registry.register(&reg("a")).unwrap();
        registry.register(&reg("c")).unwrap();
        registry.register(&reg("b").insert_before("c")).unwrap();

        let names: Vec<&str> = registry.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = CheckpointRegistry::new();
        registry.register(&reg("a")).unwrap();
        assert!(matches!(
            registry.register(&reg("a")),
            Err(EngineError::Duplicate(_))
        ));
    }

    #[test]
    fn test_insert_before_unknown_or_completed() {
        let mut registry = CheckpointRegistry::new();
        registry.register(&reg("a")).unwrap();

        assert!(matches!(
            registry.register(&reg("b").insert_before("ghost")),
            Err(EngineError::Unknown(_))
        ));

        registry.get_mut("a").unwrap().completed = true;
        assert!(matches!(
            registry.register(&reg("b").insert_before("a")),
            Err(EngineError::InsertBeforeCompleted(_))
        ));
    }

    #[test]
    fn test_reset_completed_from() {
        let mut registry = CheckpointRegistry::new();
        for name in ["a", "b", "c"] {
            registry.register(&reg(name)).unwrap();
        }
        for record in registry.records_mut() {
            record.completed = true;
        }

        registry.reset_completed_from(1);
        let flags: Vec<bool> = registry.records().iter().map(|r| r.completed).collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn test_completed_entries_track_positions() {
        let mut registry = CheckpointRegistry::new();
        registry
            .register(&reg("a").with_args(json!({"pool": "rpool"})))
            .unwrap();
        registry.register(&reg("b")).unwrap();
        registry.get_mut("a").unwrap().completed = true;

        let entries = registry.completed_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].position, 0);
        assert_eq!(entries[0].args, json!({"pool": "rpool"}));
    }
}
