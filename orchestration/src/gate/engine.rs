//! Quality Gate Engine: deterministic verdicts and retry/escalation decisions
//!
//! `evaluate` turns an evidence bundle into a verdict using the phase's
//! thresholds. `decide` feeds the verdict through the phase's gate state
//! machine and returns what the orchestrator should do next. No I/O happens
//! here.

use super::evidence::{AssessmentSource, EvidenceBundle, UnitOutcome};
use super::remediation::remediation_hints;
use super::thresholds::{GateTable, QualityComponent};
use super::verdict::{
    ComponentShortfall, EscalationReason, GateDecision, GateStage, GateTransitionError,
    GateVerdict, PhaseGateState, VerdictOutcome,
};
use crate::error::{DefinitionError, DefinitionResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Retry and evidence-gathering bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatePolicy {
    /// Remediated retries allowed per phase before escalating
    pub max_retries: u32,
    /// Extra evidence passes allowed per phase before escalating
    pub max_evidence_passes: u32,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_evidence_passes: 2,
        }
    }
}

/// The Quality Gate Engine
#[derive(Debug, Clone)]
pub struct QualityGateEngine {
    table: GateTable,
    policy: GatePolicy,
}

impl QualityGateEngine {
    pub fn new(table: GateTable, policy: GatePolicy) -> Self {
        Self { table, policy }
    }

    pub fn table(&self) -> &GateTable {
        &self.table
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Evaluate a phase's evidence against its thresholds
    pub fn evaluate(&self, bundle: &EvidenceBundle, retry_count: u32) -> DefinitionResult<GateVerdict> {
        let phase = &bundle.evidence.phase;
        let config = self
            .table
            .get(phase)
            .ok_or_else(|| DefinitionError::MissingGate {
                phase: phase.clone(),
            })?;

        let mut notes = Vec::new();
        let (scores, composite) = match &bundle.assessment {
            AssessmentSource::External { assessment } => {
                let mut scores = BTreeMap::new();
                for (component, score) in &assessment.scores {
                    if is_valid_score(*score) {
                        scores.insert(*component, *score);
                    } else {
                        notes.push(format!("discarded {component} score {score}: outside 0.0..=1.0"));
                    }
                }
                let composite = match assessment.composite {
                    Some(c) if is_valid_score(c) => Some(c),
                    Some(c) => {
                        notes.push(format!("discarded composite {c}: outside 0.0..=1.0"));
                        None
                    }
                    None => config.composite(&scores),
                };
                (scores, composite)
            }
            AssessmentSource::Derived { completion_ratio } => {
                (BTreeMap::new(), Some(*completion_ratio))
            }
            AssessmentSource::Unavailable { reason } => {
                notes.push(format!("assessment unavailable: {reason}"));
                (BTreeMap::new(), None)
            }
        };

        let missing: Vec<QualityComponent> = config
            .required_components()
            .into_iter()
            .filter(|c| !scores.contains_key(c))
            .collect();

        let unreported: Vec<&str> = bundle
            .evidence
            .units
            .iter()
            .filter(|u| matches!(u.outcome, UnitOutcome::Missing))
            .map(|u| u.unit_id.as_str())
            .collect();
        if !unreported.is_empty() {
            notes.push(format!("no result recorded for: {}", unreported.join(", ")));
        }

        let shortfalls: Vec<ComponentShortfall> = config
            .critical
            .iter()
            .filter_map(|t| {
                scores
                    .get(&t.component)
                    .filter(|score| **score < t.min)
                    .map(|score| ComponentShortfall {
                        component: t.component,
                        score: *score,
                        minimum: t.min,
                    })
            })
            .collect();

        let outcome = match composite {
            None => VerdictOutcome::InsufficientEvidence,
            Some(_) if !missing.is_empty() || !unreported.is_empty() => {
                VerdictOutcome::InsufficientEvidence
            }
            Some(c) if c < config.min_composite || !shortfalls.is_empty() => VerdictOutcome::Guilty,
            Some(_) => VerdictOutcome::Innocent,
        };

        let failed_units = bundle.evidence.failed_units();
        let implicated_units = match outcome {
            VerdictOutcome::Innocent => Vec::new(),
            _ if failed_units.is_empty() => bundle
                .evidence
                .units
                .iter()
                .map(|u| u.unit_id.clone())
                .collect(),
            _ => failed_units.clone(),
        };
        let remediation = match outcome {
            VerdictOutcome::Innocent => Vec::new(),
            _ => remediation_hints(
                composite,
                config.min_composite,
                &shortfalls,
                &missing,
                &failed_units,
            ),
        };

        debug!(
            phase = %phase,
            outcome = %outcome,
            composite = ?composite,
            minimum = config.min_composite,
            shortfalls = shortfalls.len(),
            missing = missing.len(),
            "Gate evaluated"
        );

        Ok(GateVerdict {
            phase: phase.clone(),
            outcome,
            composite,
            minimum: config.min_composite,
            shortfalls,
            missing,
            remediation,
            implicated_units,
            retry_count,
            emergency: bundle.emergency_trigger().cloned(),
            notes,
            evaluated_at: Utc::now(),
        })
    }

    /// Record a verdict on the phase's gate state and decide the next step.
    ///
    /// Emergencies escalate regardless of scores. Retries and evidence passes
    /// are counted here and never decrease.
    pub fn decide(
        &self,
        state: &mut PhaseGateState,
        verdict: GateVerdict,
    ) -> Result<GateDecision, GateTransitionError> {
        state.advance(GateStage::Evaluating)?;
        let emergency = verdict.emergency.clone();
        let outcome = verdict.outcome;
        let implicated = verdict.implicated_units.clone();
        let hints = verdict.remediation.clone();
        state.verdicts.push(verdict);

        if let Some(trigger) = emergency {
            warn!(phase = %state.phase, %trigger, "Emergency forces escalation");
            let reason = EscalationReason::Emergency { trigger };
            state.escalate(reason.clone())?;
            return Ok(GateDecision::Escalate { reason });
        }

        state.advance(outcome.into())?;

        match outcome {
            VerdictOutcome::Innocent => {
                info!(phase = %state.phase, retries = state.retries, "Gate passed");
                Ok(GateDecision::Advance)
            }
            VerdictOutcome::Guilty => {
                if state.retries >= self.policy.max_retries {
                    let reason = EscalationReason::RetriesExhausted {
                        retries: state.retries,
                        max: self.policy.max_retries,
                    };
                    warn!(phase = %state.phase, %reason, "Escalating phase");
                    state.escalate(reason.clone())?;
                    return Ok(GateDecision::Escalate { reason });
                }
                state.retries += 1;
                info!(
                    phase = %state.phase,
                    retry = state.retries,
                    max = self.policy.max_retries,
                    units = ?implicated,
                    "Gate failed, retrying with remediation"
                );
                Ok(GateDecision::Retry {
                    retry: state.retries,
                    units: implicated,
                    hints,
                })
            }
            VerdictOutcome::InsufficientEvidence => {
                if state.evidence_passes >= self.policy.max_evidence_passes {
                    let reason = EscalationReason::InsufficientEvidence {
                        passes: state.evidence_passes,
                    };
                    warn!(phase = %state.phase, %reason, "Escalating phase");
                    state.escalate(reason.clone())?;
                    return Ok(GateDecision::Escalate { reason });
                }
                state.evidence_passes += 1;
                info!(
                    phase = %state.phase,
                    pass = state.evidence_passes,
                    "Evidence insufficient, gathering again"
                );
                Ok(GateDecision::GatherEvidence {
                    pass: state.evidence_passes,
                })
            }
        }
    }
}

fn is_valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=1.0).contains(&score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::EmergencyTrigger;
    use crate::error::UnitFailure;
    use crate::gate::evidence::{Assessment, PhaseEvidence, UnitEvidence};
    use crate::gate::thresholds::PhaseGateConfig;
    use crate::state::WorkUnitResult;

    fn engine(min: f64) -> QualityGateEngine {
        let table = GateTable::new().with_phase(
            "design",
            PhaseGateConfig::new(min).with_critical(QualityComponent::Security, 0.8),
        );
        QualityGateEngine::new(table, GatePolicy::default())
    }

    fn evidence(failed: &[&str]) -> PhaseEvidence {
        let units = ["a", "b", "c"]
            .iter()
            .map(|id| {
                let result = if failed.contains(id) {
                    WorkUnitResult::failed(
                        *id,
                        "design",
                        1,
                        UnitFailure::Timeout { after_ms: 5 },
                        5,
                    )
                } else {
                    WorkUnitResult::succeeded(*id, "design", 1, "ok", 5)
                };
                UnitEvidence::from_result(&result, None)
            })
            .collect();
        PhaseEvidence {
            phase: "design".into(),
            attempt: 0,
            units,
        }
    }

    fn scored(composite: f64, security: f64) -> Assessment {
        Assessment::new()
            .with_composite(composite)
            .with_score(QualityComponent::Security, security)
    }

    #[test]
    fn test_composite_below_minimum_is_guilty() {
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.70, 0.9));
        let verdict = engine(0.75).evaluate(&bundle, 0).unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Guilty);
        assert_eq!(verdict.implicated_units, vec!["a", "b", "c"]);
        assert!(verdict.remediation[0].contains("0.70 below threshold 0.75"));
    }

    #[test]
    fn test_critical_component_below_minimum_is_guilty() {
        let bundle = EvidenceBundle::external(evidence(&["b"]), scored(0.95, 0.5));
        let verdict = engine(0.75).evaluate(&bundle, 1).unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Guilty);
        assert_eq!(verdict.shortfalls[0].component, QualityComponent::Security);
        assert_eq!(verdict.implicated_units, vec!["b"]);
        assert_eq!(verdict.retry_count, 1);
        assert!(verdict
            .remediation
            .iter()
            .any(|h| h.contains("re-examine input validation")));
    }

    #[test]
    fn test_passing_scores_are_innocent() {
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.80, 0.85));
        let verdict = engine(0.75).evaluate(&bundle, 0).unwrap();
        assert!(verdict.is_innocent());
        assert!(verdict.remediation.is_empty());
        assert!(verdict.implicated_units.is_empty());
    }

    #[test]
    fn test_missing_critical_score_is_insufficient() {
        let bundle =
            EvidenceBundle::external(evidence(&[]), Assessment::new().with_composite(0.9));
        let verdict = engine(0.75).evaluate(&bundle, 0).unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::InsufficientEvidence);
        assert_eq!(verdict.missing, vec![QualityComponent::Security]);
    }

    #[test]
    fn test_unavailable_assessor_is_insufficient() {
        let bundle = EvidenceBundle::unavailable(evidence(&[]), "timed out");
        let verdict = engine(0.75).evaluate(&bundle, 0).unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::InsufficientEvidence);
        assert!(verdict.notes[0].contains("timed out"));
    }

    #[test]
    fn test_out_of_range_scores_are_discarded() {
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.9, 7.0));
        let verdict = engine(0.75).evaluate(&bundle, 0).unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::InsufficientEvidence);
        assert!(verdict.notes.iter().any(|n| n.contains("security")));
    }

    #[test]
    fn test_derived_assessment_uses_completion_ratio() {
        let table = GateTable::uniform(["design"], 0.6);
        let engine = QualityGateEngine::new(table, GatePolicy::default());
        let verdict = engine
            .evaluate(&EvidenceBundle::derived(evidence(&["c"])), 0)
            .unwrap();
        assert!(verdict.is_innocent());
        let verdict = engine
            .evaluate(&EvidenceBundle::derived(evidence(&["b", "c"])), 0)
            .unwrap();
        assert_eq!(verdict.outcome, VerdictOutcome::Guilty);
    }

    #[test]
    fn test_unknown_phase_is_a_definition_error() {
        let mut ev = evidence(&[]);
        ev.phase = "ghost".into();
        assert!(matches!(
            engine(0.75).evaluate(&EvidenceBundle::derived(ev), 0),
            Err(DefinitionError::MissingGate { .. })
        ));
    }

    #[test]
    fn test_retries_are_bounded_then_escalate() {
        let engine = engine(0.75);
        let mut state = PhaseGateState::new("design");
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.5, 0.9));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let verdict = engine.evaluate(&bundle, state.retries).unwrap();
            match engine.decide(&mut state, verdict).unwrap() {
                GateDecision::Retry { retry, .. } => seen.push(retry),
                other => panic!("expected retry, got {other:?}"),
            }
        }
        assert_eq!(seen, vec![1, 2, 3]);

        let verdict = engine.evaluate(&bundle, state.retries).unwrap();
        let decision = engine.decide(&mut state, verdict).unwrap();
        assert_eq!(
            decision,
            GateDecision::Escalate {
                reason: EscalationReason::RetriesExhausted { retries: 3, max: 3 }
            }
        );
        assert_eq!(state.stage, GateStage::Escalated);
        assert_eq!(state.verdicts.len(), 4);
        assert_eq!(state.retries, 3);
    }

    #[test]
    fn test_guilty_then_innocent() {
        let engine = engine(0.75);
        let mut state = PhaseGateState::new("design");

        let first = engine
            .evaluate(&EvidenceBundle::external(evidence(&[]), scored(0.70, 0.9)), 0)
            .unwrap();
        assert!(matches!(
            engine.decide(&mut state, first).unwrap(),
            GateDecision::Retry { retry: 1, .. }
        ));

        let second = engine
            .evaluate(&EvidenceBundle::external(evidence(&[]), scored(0.80, 0.9)), 1)
            .unwrap();
        assert_eq!(engine.decide(&mut state, second).unwrap(), GateDecision::Advance);
        assert!(state.is_passed());
    }

    #[test]
    fn test_insufficient_evidence_passes_are_bounded() {
        let engine = engine(0.75);
        let mut state = PhaseGateState::new("design");
        let bundle = EvidenceBundle::unavailable(evidence(&[]), "down");

        for expected in 1..=2 {
            let verdict = engine.evaluate(&bundle, 0).unwrap();
            assert_eq!(
                engine.decide(&mut state, verdict).unwrap(),
                GateDecision::GatherEvidence { pass: expected }
            );
        }
        let verdict = engine.evaluate(&bundle, 0).unwrap();
        assert!(matches!(
            engine.decide(&mut state, verdict).unwrap(),
            GateDecision::Escalate {
                reason: EscalationReason::InsufficientEvidence { passes: 2 }
            }
        ));
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn test_emergency_escalates_regardless_of_scores() {
        let engine = engine(0.75);
        let mut state = PhaseGateState::new("design");
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.99, 0.99))
            .with_emergency(Some(EmergencyTrigger::UserAbort));
        let verdict = engine.evaluate(&bundle, 0).unwrap();
        assert!(verdict.is_innocent());
        let decision = engine.decide(&mut state, verdict).unwrap();
        assert_eq!(
            decision,
            GateDecision::Escalate {
                reason: EscalationReason::Emergency {
                    trigger: EmergencyTrigger::UserAbort
                }
            }
        );
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn test_decide_after_terminal_stage_is_rejected() {
        let engine = engine(0.75);
        let mut state = PhaseGateState::new("design");
        let bundle = EvidenceBundle::external(evidence(&[]), scored(0.9, 0.9));
        let verdict = engine.evaluate(&bundle, 0).unwrap();
        engine.decide(&mut state, verdict.clone()).unwrap();
        assert!(engine.decide(&mut state, verdict).is_err());
    }
}
