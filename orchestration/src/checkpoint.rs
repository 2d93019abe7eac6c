//! Checkpoint store
//!
//! Append-only history of execution-state snapshots keyed by phase. Saving
//! never mutates or drops an earlier checkpoint; restoring always returns the
//! most recently saved one for the phase.

use crate::definition::PhaseName;
use crate::error::{CheckpointError, CheckpointResult};
use crate::state::ExecutionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// When a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Immediately before a gate evaluation; the rollback target
    PreGate,
    /// After an innocent verdict
    PhasePassed,
    /// After an escalation was overridden
    Overridden,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreGate => write!(f, "pre_gate"),
            Self::PhasePassed => write!(f, "phase_passed"),
            Self::Overridden => write!(f, "overridden"),
        }
    }
}

/// Snapshot of execution state at a phase boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub phase: PhaseName,
    pub kind: CheckpointKind,
    /// Store-wide, strictly increasing
    pub sequence: u64,
    /// Phase attempt the snapshot belongs to (1 = first run)
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub state: ExecutionState,
    /// Whatever the storage collaborator chose to snapshot
    pub storage: Option<serde_json::Value>,
}

/// Append-only checkpoint history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStore {
    history: BTreeMap<PhaseName, Vec<Checkpoint>>,
    next_sequence: u64,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a snapshot and return its id
    pub fn save(
        &mut self,
        phase: &str,
        kind: CheckpointKind,
        attempt: u32,
        state: &ExecutionState,
        storage: Option<serde_json::Value>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let checkpoint = Checkpoint {
            id: id.clone(),
            phase: phase.to_string(),
            kind,
            sequence: self.next_sequence,
            attempt,
            created_at: Utc::now(),
            state: state.clone(),
            storage,
        };
        self.next_sequence += 1;
        self.history
            .entry(phase.to_string())
            .or_default()
            .push(checkpoint);
        debug!(phase, %kind, attempt, checkpoint_id = %id, "Checkpoint saved");
        id
    }

    /// Most recent checkpoint of a phase, of any kind
    pub fn latest(&self, phase: &str) -> Option<&Checkpoint> {
        self.history.get(phase).and_then(|h| h.last())
    }

    /// Most recent checkpoint of a phase with the given kind
    pub fn latest_of_kind(&self, phase: &str, kind: CheckpointKind) -> Option<&Checkpoint> {
        self.history
            .get(phase)
            .and_then(|h| h.iter().rev().find(|c| c.kind == kind))
    }

    /// State of the most recent checkpoint of a phase
    pub fn restore_latest(&self, phase: &str) -> CheckpointResult<&Checkpoint> {
        self.latest(phase).ok_or_else(|| CheckpointError::NotFound {
            phase: phase.to_string(),
        })
    }

    /// Every checkpoint of a phase, oldest first
    pub fn history(&self, phase: &str) -> &[Checkpoint] {
        self.history.get(phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.history.values().flatten().find(|c| c.id == id)
    }

    pub fn phases(&self) -> impl Iterator<Item = &PhaseName> {
        self.history.keys()
    }

    pub fn len(&self) -> usize {
        self.history.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
