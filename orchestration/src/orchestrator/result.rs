//! What a pipeline run returns

use crate::checkpoint::CheckpointStore;
use crate::definition::{PhaseName, UnitId};
use crate::gate::{EscalationReason, GateDecision, GateVerdict};
use crate::progress::ProgressRecord;
use crate::state::{ExecutionState, RunMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every phase passed its gate (or was overridden)
    Completed,
    /// A gate escalated and nobody overrode it
    Escalated,
    /// A critical unit failed
    Aborted,
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Escalated => write!(f, "escalated"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// One gate evaluation and what was done about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRecord {
    pub phase: PhaseName,
    pub verdict: GateVerdict,
    pub decision: GateDecision,
    pub override_reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Evidence trail surfaced when automatic progression halts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub run_id: String,
    pub phase: PhaseName,
    pub reason: EscalationReason,
    /// Every verdict the phase received, oldest first
    pub verdicts: Vec<GateVerdict>,
    pub failed_units: Vec<UnitId>,
    /// Hints from the last verdict
    pub remediation: Vec<String>,
    pub escalated_at: DateTime<Utc>,
}

impl Escalation {
    pub fn is_overridable(&self) -> bool {
        self.reason.is_overridable()
    }
}

/// Outcome of `Orchestrator::execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: String,
    pub pipeline: String,
    pub status: PipelineStatus,
    /// Every gate evaluation in order
    pub gate_history: Vec<GateRecord>,
    /// Set when the run stopped on an escalation or abort
    pub escalation: Option<Escalation>,
    /// Escalations that were overridden along the way
    pub overrides: Vec<Escalation>,
    pub metrics: RunMetrics,
    pub state: ExecutionState,
    pub progress: Vec<ProgressRecord>,
    pub checkpoints: CheckpointStore,
}

impl PipelineResult {
    pub fn is_completed(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Gate records of one phase, in order
    pub fn gate_records(&self, phase: &str) -> Vec<&GateRecord> {
        self.gate_history
            .iter()
            .filter(|r| r.phase == phase)
            .collect()
    }

    pub fn total_retries(&self) -> u64 {
        self.metrics.total_retries
    }
}
