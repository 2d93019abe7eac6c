//! Error taxonomy for pipeline orchestration
//!
//! Errors are split by concern, each with a `XxxResult<T>` alias:
//! - [`DefinitionError`]: configuration/programmer errors caught before any unit runs
//! - [`ProgressError`]: illegal progress-record operations
//! - [`CheckpointError`]: checkpoint lookups
//! - [`ExecutorError`], [`StorageError`], [`AssessorError`]: collaborator failures
//! - [`UnitFailure`]: the recorded failure of a single unit attempt (gate evidence, not an error path)
//! - [`OrchestrationError`]: what `Orchestrator::execute` returns when it cannot produce a result
//!
//! Escalation is deliberately absent here: it is a `PipelineResult` outcome.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for definition validation
pub type DefinitionResult<T> = Result<T, DefinitionError>;

/// Configuration errors detected at pipeline-construction time
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    /// Pipeline has no phases
    #[error("Pipeline '{pipeline}' has no phases")]
    EmptyPipeline { pipeline: String },

    /// Phase has no work units
    #[error("Phase '{phase}' has no work units")]
    EmptyPhase { phase: String },

    /// Two phases share a name
    #[error("Duplicate phase name: {phase}")]
    DuplicatePhase { phase: String },

    /// Two units share an id (ids are unique across the whole pipeline)
    #[error("Duplicate work unit id '{unit}' in phase '{phase}'")]
    DuplicateUnit { phase: String, unit: String },

    /// Dependency references a unit outside the phase
    #[error("Unknown dependency '{dependency}' in unit '{unit}' of phase '{phase}': no unit with that id exists in the phase")]
    UnknownDependency {
        phase: String,
        unit: String,
        dependency: String,
    },

    /// Unit depends on itself
    #[error("Unit '{unit}' in phase '{phase}' depends on itself")]
    SelfDependency { phase: String, unit: String },

    /// Dependency cycle inside a phase
    #[error("Cycle detected in dependencies of phase '{phase}'. Involved units: {units:?}")]
    DependencyCycle { phase: String, units: Vec<String> },

    /// Declared input references an unknown unit
    #[error("Unit '{unit}' declares input '{input}' which does not exist")]
    UnknownInput { unit: String, input: String },

    /// Declared input references a unit of a later phase
    #[error("Unit '{unit}' in phase '{phase}' declares input '{input}' from later phase '{input_phase}'")]
    InputFromLaterPhase {
        phase: String,
        unit: String,
        input: String,
        input_phase: String,
    },

    /// Declared input references a unit that never stores its output
    #[error("Unit '{unit}' declares input '{input}' which has no output domain")]
    InputWithoutDomain { unit: String, input: String },

    /// Gate threshold table has no entry for a phase
    #[error("Gate threshold table has no entry for phase '{phase}'")]
    MissingGate { phase: String },

    /// Threshold outside 0.0..=1.0 or non-positive weight
    #[error("Invalid gate threshold for phase '{phase}': {message}")]
    InvalidThreshold { phase: String, message: String },

    /// Orchestrator setting out of range
    #[error("Invalid orchestrator setting '{setting}': {message}")]
    InvalidSetting { setting: String, message: String },
}

impl DefinitionError {
    /// Create an invalid threshold error
    pub fn invalid_threshold(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            phase: phase.into(),
            message: message.into(),
        }
    }

    /// Create an invalid setting error
    pub fn invalid_setting(setting: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for progress store operations
pub type ProgressResult<T> = Result<T, ProgressError>;

/// Errors from the progress store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProgressError {
    /// No record registered for the unit
    #[error("No progress record for unit '{unit}'")]
    UnknownUnit { unit: String },

    /// Status transition would regress or skip the lifecycle
    #[error("Invalid status transition for unit '{unit}' from {from} to {to}")]
    InvalidTransition {
        unit: String,
        from: String,
        to: String,
    },

    /// Re-registration must move to a strictly newer attempt
    #[error("Unit '{unit}' already registered for attempt {existing} (requested {requested})")]
    StaleAttempt {
        unit: String,
        existing: u32,
        requested: u32,
    },
}

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors from the checkpoint store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("No checkpoint saved for phase '{phase}'")]
    NotFound { phase: String },
}

/// Errors surfaced by a unit executor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Executor timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Executor failed: {0}")]
    Failed(String),

    #[error("Execution cancelled")]
    Cancelled,
}

/// Result type alias for storage collaborator calls
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the storage collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed storage value for {domain}/{key}: {message}")]
    Malformed {
        domain: String,
        key: String,
        message: String,
    },
}

/// Errors surfaced by the quality assessor
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssessorError {
    #[error("Assessor unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed assessment: {0}")]
    Malformed(String),
}

/// Why a single unit attempt failed.
///
/// Recorded on the unit's result and handed to the quality gate as evidence.
/// Never propagated as an `Err` out of the orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitFailure {
    /// Dispatch exceeded the per-unit timeout
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Executor reported an error
    #[error("executor error: {message}")]
    Executor { message: String },

    /// Executor returned data that breaks its contract
    #[error("contract violation by executor for unit '{unit}' (phase '{phase}', attempt {attempt}): {detail}")]
    ContractViolation {
        unit: String,
        phase: String,
        attempt: u32,
        detail: String,
    },

    /// An upstream unit in the same phase failed
    #[error("dependency '{dependency}' failed")]
    DependencyFailed { dependency: String },

    /// Unit was never dispatched (emergency or critical abort)
    #[error("not dispatched: {reason}")]
    NotDispatched { reason: String },
}

impl UnitFailure {
    /// Whether this failure came from the dispatch timing out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the unit was actually handed to the executor
    pub fn was_dispatched(&self) -> bool {
        !matches!(
            self,
            Self::DependencyFailed { .. } | Self::NotDispatched { .. }
        )
    }
}

/// Result type alias for orchestrator runs
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Errors that prevent the orchestrator from producing a `PipelineResult`
#[derive(Error, Debug)]
pub enum OrchestrationError {
    /// Pipeline definition, gate table or settings are invalid
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// A phase was about to start without its predecessor passing its gate
    #[error("Phase '{phase}' cannot start: predecessor '{predecessor}' has not passed its gate")]
    PhaseOrdering { phase: String, predecessor: String },

    /// Internal gate state machine was driven illegally
    #[error("Gate state error for phase '{phase}': {message}")]
    GateState { phase: String, message: String },
}

/// Result type alias for persistence operations
pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Errors from saving/loading run snapshots and pipeline files
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Snapshot {path} has version {found}, newest supported is {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error(transparent)]
    Definition(#[from] DefinitionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_carries_context() {
        let err = DefinitionError::UnknownDependency {
            phase: "design".into(),
            unit: "b".into(),
            dependency: "ghost".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ghost"));
        assert!(msg.contains("design"));
    }

    #[test]
    fn test_contract_violation_names_unit_phase_and_attempt() {
        let failure = UnitFailure::ContractViolation {
            unit: "api".into(),
            phase: "implementation".into(),
            attempt: 2,
            detail: "success without output".into(),
        };
        let msg = failure.to_string();
        assert!(msg.contains("api"));
        assert!(msg.contains("implementation"));
        assert!(msg.contains("attempt 2"));
        assert!(failure.was_dispatched());
    }

    #[test]
    fn test_skipped_units_were_not_dispatched() {
        let dep = UnitFailure::DependencyFailed {
            dependency: "a".into(),
        };
        let cancelled = UnitFailure::NotDispatched {
            reason: "user abort".into(),
        };
        assert!(!dep.was_dispatched());
        assert!(!cancelled.was_dispatched());
        assert!(UnitFailure::Timeout { after_ms: 10 }.is_timeout());
    }

    #[test]
    fn test_unit_failure_serializes_with_kind_tag() {
        let json = serde_json::to_string(&UnitFailure::Timeout { after_ms: 500 }).unwrap();
        assert!(json.contains("\"kind\":\"timeout\""));
        let back: UnitFailure = serde_json::from_str(&json).unwrap();
        assert!(back.is_timeout());
    }

    #[test]
    fn test_orchestration_error_converts_from_definition_error() {
        let err: OrchestrationError = DefinitionError::MissingGate {
            phase: "delivery".into(),
        }
        .into();
        assert!(matches!(
            err,
            OrchestrationError::Definition(DefinitionError::MissingGate { .. })
        ));
        assert!(err.to_string().contains("delivery"));
    }

    #[test]
    fn test_all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ProgressError::UnknownUnit { unit: "x".into() });
        assert_std_error(&CheckpointError::NotFound { phase: "x".into() });
        assert_std_error(&ExecutorError::Cancelled);
        assert_std_error(&StorageError::Unavailable("down".into()));
        assert_std_error(&AssessorError::Malformed("bad".into()));
    }
}
