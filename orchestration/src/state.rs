//! Execution state of a pipeline run
//!
//! Holds the latest result per unit, run metrics, per-phase gate state and an
//! append-only execution log. The log and metrics survive rollbacks; results
//! and the current phase are what a checkpoint restores.

use crate::definition::{PhaseName, UnitId};
use crate::error::UnitFailure;
use crate::gate::PhaseGateState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a single unit attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitResult {
    pub unit_id: UnitId,
    pub phase: PhaseName,
    pub attempt: u32,
    pub output: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<UnitFailure>,
    pub timestamp: DateTime<Utc>,
}

impl WorkUnitResult {
    pub fn succeeded(
        unit_id: impl Into<String>,
        phase: impl Into<String>,
        attempt: u32,
        output: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            phase: phase.into(),
            attempt,
            output: output.into(),
            success: true,
            duration_ms,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        unit_id: impl Into<String>,
        phase: impl Into<String>,
        attempt: u32,
        error: UnitFailure,
        duration_ms: u64,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            phase: phase.into(),
            attempt,
            output: String::new(),
            success: false,
            duration_ms,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }

    /// Keep partial output produced alongside a failure
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Kind of entry in the execution log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEntryKind {
    PhaseStarted { attempt: u32 },
    /// Every attempt's result is kept here, even once superseded
    UnitFinished { result: WorkUnitResult },
    GateEvaluated { outcome: String, composite: f64 },
    CheckpointSaved { checkpoint_id: String },
    RolledBack { checkpoint_id: String, retry: u32 },
    PhaseAdvanced { overridden: bool },
    Escalated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub phase: PhaseName,
    pub kind: LogEntryKind,
    pub at: DateTime<Utc>,
}

/// Append-only record of what happened during a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn append(&mut self, phase: impl Into<String>, kind: LogEntryKind) {
        let sequence = self.entries.len() as u64;
        self.entries.push(LogEntry {
            sequence,
            phase: phase.into(),
            kind,
            at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters accumulated over the whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub units_dispatched: u64,
    pub units_succeeded: u64,
    pub units_failed: u64,
    pub timeouts: u64,
    pub total_retries: u64,
    pub evidence_passes: u64,
    pub gate_evaluations: u64,
    pub rollbacks: u64,
    pub elapsed_ms: u64,
}

/// Mutable state of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub current_phase: Option<PhaseName>,
    /// Latest result per unit id
    pub results: BTreeMap<UnitId, WorkUnitResult>,
    pub metrics: RunMetrics,
    pub gates: BTreeMap<PhaseName, PhaseGateState>,
    pub log: ExecutionLog,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current_phase: None,
            results: BTreeMap::new(),
            metrics: RunMetrics::default(),
            gates: BTreeMap::new(),
            log: ExecutionLog::default(),
        }
    }

    /// Record a unit result, replacing any earlier attempt's result
    pub fn record(&mut self, result: WorkUnitResult) {
        if result.success {
            self.metrics.units_succeeded += 1;
        } else {
            self.metrics.units_failed += 1;
            if result.error.as_ref().is_some_and(UnitFailure::is_timeout) {
                self.metrics.timeouts += 1;
            }
        }
        self.log.append(
            result.phase.clone(),
            LogEntryKind::UnitFinished {
                result: result.clone(),
            },
        );
        self.results.insert(result.unit_id.clone(), result);
    }

    pub fn result(&self, unit: &str) -> Option<&WorkUnitResult> {
        self.results.get(unit)
    }

    /// Results belonging to one phase, ordered by unit id
    pub fn phase_results(&self, phase: &str) -> Vec<&WorkUnitResult> {
        self.results.values().filter(|r| r.phase == phase).collect()
    }

    /// Failed unit ids of a phase, ordered by unit id
    pub fn failed_units(&self, phase: &str) -> Vec<UnitId> {
        self.phase_results(phase)
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| r.unit_id.clone())
            .collect()
    }

    pub fn gate_state(&self, phase: &str) -> Option<&PhaseGateState> {
        self.gates.get(phase)
    }

    /// Gate state for a phase, created on first use
    pub fn gate_state_mut(&mut self, phase: &str) -> &mut PhaseGateState {
        self.gates
            .entry(phase.to_string())
            .or_insert_with(|| PhaseGateState::new(phase))
    }

    /// Retries consumed so far by a phase
    pub fn retry_count(&self, phase: &str) -> u32 {
        self.gates.get(phase).map(|g| g.retries).unwrap_or(0)
    }

    /// Roll back to a checkpointed state.
    ///
    /// Restores results and the current phase. Metrics, gate states and the
    /// execution log are kept so retries stay monotonic and the history of
    /// the failed attempt is not lost.
    pub fn restore_from(&mut self, snapshot: &ExecutionState) {
        self.current_phase = snapshot.current_phase.clone();
        self.results = snapshot.results.clone();
        self.metrics.rollbacks += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_replaces_previous_attempt_and_counts() {
        let mut state = ExecutionState::new("run-1");
        state.record(WorkUnitResult::failed(
            "a",
            "design",
            1,
            UnitFailure::Timeout { after_ms: 100 },
            100,
        ));
        state.record(WorkUnitResult::succeeded("a", "design", 2, "done", 5));

        assert_eq!(state.result("a").unwrap().attempt, 2);
        assert_eq!(state.metrics.units_failed, 1);
        assert_eq!(state.metrics.timeouts, 1);
        assert_eq!(state.metrics.units_succeeded, 1);
        assert_eq!(state.log.len(), 2);
        assert!(state.failed_units("design").is_empty());
        // The superseded attempt stays in the log
        assert!(matches!(
            &state.log.entries()[0].kind,
            LogEntryKind::UnitFinished { result } if result.attempt == 1 && !result.success
        ));
    }

    #[test]
    fn test_phase_results_filter_by_phase() {
        let mut state = ExecutionState::new("run-1");
        state.record(WorkUnitResult::succeeded("a", "one", 1, "x", 1));
        state.record(WorkUnitResult::failed(
            "b",
            "two",
            1,
            UnitFailure::Executor {
                message: "boom".into(),
            },
            1,
        ));
        assert_eq!(state.phase_results("one").len(), 1);
        assert_eq!(state.failed_units("two"), vec!["b"]);
    }

    #[test]
    fn test_restore_keeps_log_metrics_and_gates() {
        let mut state = ExecutionState::new("run-1");
        state.current_phase = Some("one".into());
        let snapshot = state.clone();

        state.record(WorkUnitResult::succeeded("a", "one", 1, "x", 1));
        state.gate_state_mut("one").retries = 2;
        state.restore_from(&snapshot);

        assert!(state.results.is_empty());
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.metrics.units_succeeded, 1);
        assert_eq!(state.metrics.rollbacks, 1);
        assert_eq!(state.retry_count("one"), 2);
    }

    #[test]
    fn test_log_sequence_is_monotonic() {
        let mut log = ExecutionLog::default();
        log.append("one", LogEntryKind::PhaseStarted { attempt: 1 });
        log.append("one", LogEntryKind::PhaseAdvanced { overridden: false });
        let seqs: Vec<u64> = log.entries().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
    }
}
