//! Quality gates evaluated at phase boundaries
//!
//! - [`thresholds`]: per-phase minimums, critical components and weights
//! - [`evidence`]: what a phase hands to its gate
//! - [`verdict`]: verdicts, decisions and the per-phase gate state machine
//! - [`remediation`]: deterministic hints for retried attempts
//! - [`engine`]: the Quality Gate Engine tying these together

pub mod engine;
pub mod evidence;
pub mod remediation;
pub mod thresholds;
pub mod verdict;

pub use engine::{GatePolicy, QualityGateEngine};
pub use evidence::{
    Assessment, AssessmentSource, EvidenceBundle, PhaseEvidence, UnitEvidence, UnitOutcome,
};
pub use thresholds::{
    ComponentThreshold, ComponentWeight, GateTable, PhaseGateConfig, QualityComponent,
    REFERENCE_PHASES,
};
pub use verdict::{
    ComponentShortfall, EscalationReason, GateDecision, GateStage, GateTransitionError,
    GateVerdict, PhaseGateState, VerdictOutcome,
};
