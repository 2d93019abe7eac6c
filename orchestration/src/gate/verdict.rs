//! Gate verdicts, decisions and the per-phase gate state machine
//!
//! ```text
//! Pending -> Evaluating
//! Evaluating -> Innocent | Guilty | InsufficientEvidence
//! Guilty -> Evaluating                (retry)
//! InsufficientEvidence -> Evaluating  (another evidence pass)
//! any non-terminal -> Escalated
//! ```
//!
//! `Innocent` and `Escalated` are terminal. An escalated phase only lets the
//! pipeline continue if it was explicitly overridden.

use super::thresholds::QualityComponent;
use crate::definition::{PhaseName, UnitId};
use crate::emergency::EmergencyTrigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of evaluating one phase's evidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    /// Pass
    Innocent,
    /// Fail, retryable
    Guilty,
    InsufficientEvidence,
}

impl fmt::Display for VerdictOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Innocent => write!(f, "innocent"),
            Self::Guilty => write!(f, "guilty"),
            Self::InsufficientEvidence => write!(f, "insufficient_evidence"),
        }
    }
}

/// A critical component that scored below its own minimum
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentShortfall {
    pub component: QualityComponent,
    pub score: f64,
    pub minimum: f64,
}

/// Result of one gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub phase: PhaseName,
    pub outcome: VerdictOutcome,
    pub composite: Option<f64>,
    pub minimum: f64,
    pub shortfalls: Vec<ComponentShortfall>,
    /// Required components with no score
    pub missing: Vec<QualityComponent>,
    /// Free-text hints for the next attempt
    pub remediation: Vec<String>,
    /// Units to re-run if the phase is retried
    pub implicated_units: Vec<UnitId>,
    /// Retries consumed when the verdict was produced
    pub retry_count: u32,
    pub emergency: Option<EmergencyTrigger>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateVerdict {
    pub fn is_innocent(&self) -> bool {
        self.outcome == VerdictOutcome::Innocent
    }
}

/// Why a phase escalated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EscalationReason {
    RetriesExhausted { retries: u32, max: u32 },
    InsufficientEvidence { passes: u32 },
    Emergency { trigger: EmergencyTrigger },
    CriticalUnitFailed { unit: UnitId, error: String },
}

impl EscalationReason {
    /// Whether an escalation handler may override this escalation
    pub fn is_overridable(&self) -> bool {
        matches!(
            self,
            Self::RetriesExhausted { .. } | Self::InsufficientEvidence { .. }
        )
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted { retries, max } => {
                write!(f, "retries exhausted ({retries}/{max})")
            }
            Self::InsufficientEvidence { passes } => {
                write!(f, "insufficient evidence after {passes} evidence passes")
            }
            Self::Emergency { trigger } => write!(f, "emergency: {trigger}"),
            Self::CriticalUnitFailed { unit, error } => {
                write!(f, "critical unit '{unit}' failed: {error}")
            }
        }
    }
}

/// What the orchestrator should do after a verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GateDecision {
    /// Checkpoint and move to the next phase
    Advance,
    /// Roll back and re-run the implicated units with remediation
    Retry {
        retry: u32,
        units: Vec<UnitId>,
        hints: Vec<String>,
    },
    /// Re-collect evidence without re-running units
    GatherEvidence { pass: u32 },
    /// Halt automatic progression
    Escalate { reason: EscalationReason },
}

/// Stage of a phase's gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    Pending,
    Evaluating,
    Innocent,
    Guilty,
    InsufficientEvidence,
    Escalated,
}

impl GateStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Innocent | Self::Escalated)
    }
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Evaluating => write!(f, "Evaluating"),
            Self::Innocent => write!(f, "Innocent"),
            Self::Guilty => write!(f, "Guilty"),
            Self::InsufficientEvidence => write!(f, "InsufficientEvidence"),
            Self::Escalated => write!(f, "Escalated"),
        }
    }
}

impl From<VerdictOutcome> for GateStage {
    fn from(outcome: VerdictOutcome) -> Self {
        match outcome {
            VerdictOutcome::Innocent => Self::Innocent,
            VerdictOutcome::Guilty => Self::Guilty,
            VerdictOutcome::InsufficientEvidence => Self::InsufficientEvidence,
        }
    }
}

fn is_legal_transition(from: GateStage, to: GateStage) -> bool {
    use GateStage::*;

    if to == Escalated && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Evaluating)
            | (Evaluating, Innocent)
            | (Evaluating, Guilty)
            | (Evaluating, InsufficientEvidence)
            | (Guilty, Evaluating)
            | (InsufficientEvidence, Evaluating)
    )
}

/// Illegal move of a gate state machine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateTransitionError {
    #[error("Illegal gate transition for phase '{phase}': {from} -> {to}")]
    Illegal {
        phase: String,
        from: GateStage,
        to: GateStage,
    },

    #[error("Phase '{phase}' cannot be overridden: {reason}")]
    NotOverridable { phase: String, reason: String },
}

/// Gate bookkeeping for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseGateState {
    pub phase: PhaseName,
    pub stage: GateStage,
    /// Only ever increases
    pub retries: u32,
    pub evidence_passes: u32,
    pub verdicts: Vec<GateVerdict>,
    pub escalation: Option<EscalationReason>,
    pub override_reason: Option<String>,
    /// Every stage entered, in order
    pub history: Vec<GateStage>,
}

impl PhaseGateState {
    pub fn new(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            stage: GateStage::Pending,
            retries: 0,
            evidence_passes: 0,
            verdicts: Vec::new(),
            escalation: None,
            override_reason: None,
            history: vec![GateStage::Pending],
        }
    }

    pub fn advance(&mut self, to: GateStage) -> Result<(), GateTransitionError> {
        if !is_legal_transition(self.stage, to) {
            return Err(GateTransitionError::Illegal {
                phase: self.phase.clone(),
                from: self.stage,
                to,
            });
        }
        self.stage = to;
        self.history.push(to);
        Ok(())
    }

    /// Move to `Escalated`, recording why
    pub fn escalate(&mut self, reason: EscalationReason) -> Result<(), GateTransitionError> {
        self.advance(GateStage::Escalated)?;
        self.escalation = Some(reason);
        Ok(())
    }

    /// Let the pipeline continue past an escalated phase
    pub fn record_override(&mut self, reason: impl Into<String>) -> Result<(), GateTransitionError> {
        match &self.escalation {
            Some(escalation) if self.stage == GateStage::Escalated => {
                if !escalation.is_overridable() {
                    return Err(GateTransitionError::NotOverridable {
                        phase: self.phase.clone(),
                        reason: escalation.to_string(),
                    });
                }
                self.override_reason = Some(reason.into());
                Ok(())
            }
            _ => Err(GateTransitionError::NotOverridable {
                phase: self.phase.clone(),
                reason: format!("gate is {} and not escalated", self.stage),
            }),
        }
    }

    pub fn is_overridden(&self) -> bool {
        self.override_reason.is_some()
    }

    /// Innocent, or escalated and explicitly overridden
    pub fn is_passed(&self) -> bool {
        self.stage == GateStage::Innocent
            || (self.stage == GateStage::Escalated && self.is_overridden())
    }

    pub fn last_verdict(&self) -> Option<&GateVerdict> {
        self.verdicts.last()
    }
}
