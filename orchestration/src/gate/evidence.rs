//! Evidence handed to the quality gate at a phase boundary

use super::thresholds::QualityComponent;
use crate::definition::{PhaseName, UnitId};
use crate::emergency::EmergencyTrigger;
use crate::error::UnitFailure;
use crate::progress::OutputSummary;
use crate::state::WorkUnitResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What happened to one unit in the evaluated attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitOutcome {
    Succeeded,
    Failed { failure: UnitFailure },
    /// No result was ever recorded for the unit
    Missing,
}

/// One unit's contribution to the phase evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitEvidence {
    pub unit_id: UnitId,
    pub attempt: u32,
    pub outcome: UnitOutcome,
    pub summary: Option<OutputSummary>,
    pub duration_ms: u64,
}

impl UnitEvidence {
    pub fn from_result(result: &WorkUnitResult, summary: Option<OutputSummary>) -> Self {
        let outcome = match (&result.error, result.success) {
            (None, true) => UnitOutcome::Succeeded,
            (Some(failure), _) => UnitOutcome::Failed {
                failure: failure.clone(),
            },
            (None, false) => UnitOutcome::Failed {
                failure: UnitFailure::Executor {
                    message: "unit reported failure without an error".into(),
                },
            },
        };
        Self {
            unit_id: result.unit_id.clone(),
            attempt: result.attempt,
            outcome,
            summary,
            duration_ms: result.duration_ms,
        }
    }

    pub fn missing(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            attempt: 0,
            outcome: UnitOutcome::Missing,
            summary: None,
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, UnitOutcome::Succeeded)
    }
}

/// Everything the phase produced in one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEvidence {
    pub phase: PhaseName,
    /// 1 for the first attempt, then one more per retry
    pub attempt: u32,
    pub units: Vec<UnitEvidence>,
}

impl PhaseEvidence {
    /// Fraction of units that succeeded
    pub fn completion_ratio(&self) -> f64 {
        if self.units.is_empty() {
            return 0.0;
        }
        let ok = self.units.iter().filter(|u| u.succeeded()).count();
        ok as f64 / self.units.len() as f64
    }

    /// Units that did not succeed, in evidence order
    pub fn failed_units(&self) -> Vec<UnitId> {
        self.units
            .iter()
            .filter(|u| !u.succeeded())
            .map(|u| u.unit_id.clone())
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.units.iter().all(UnitEvidence::succeeded)
    }
}

/// Externally computed quality scores for a phase
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    #[serde(default)]
    pub scores: BTreeMap<QualityComponent, f64>,
    /// Precomputed composite; takes precedence over the weighted mean
    #[serde(default)]
    pub composite: Option<f64>,
    /// Assessor-detected condition that must escalate immediately
    #[serde(default)]
    pub emergency: Option<EmergencyTrigger>,
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Assessment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_score(mut self, component: QualityComponent, score: f64) -> Self {
        self.scores.insert(component, score);
        self
    }

    pub fn with_composite(mut self, composite: f64) -> Self {
        self.composite = Some(composite);
        self
    }

    pub fn with_emergency(mut self, trigger: EmergencyTrigger) -> Self {
        self.emergency = Some(trigger);
        self
    }
}

/// Where the scores in an evidence bundle came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AssessmentSource {
    /// Returned by the configured assessor
    External { assessment: Assessment },
    /// No assessor configured; composite is the unit completion ratio
    Derived { completion_ratio: f64 },
    /// The assessor failed or timed out
    Unavailable { reason: String },
}

/// Evidence plus scores, as seen by the gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub evidence: PhaseEvidence,
    pub assessment: AssessmentSource,
    /// Pipeline-level emergency raised while the phase ran
    pub emergency: Option<EmergencyTrigger>,
}

impl EvidenceBundle {
    /// Bundle without an assessor: score is the completion ratio
    pub fn derived(evidence: PhaseEvidence) -> Self {
        let completion_ratio = evidence.completion_ratio();
        Self {
            evidence,
            assessment: AssessmentSource::Derived { completion_ratio },
            emergency: None,
        }
    }

    pub fn external(evidence: PhaseEvidence, assessment: Assessment) -> Self {
        Self {
            evidence,
            assessment: AssessmentSource::External { assessment },
            emergency: None,
        }
    }

    pub fn unavailable(evidence: PhaseEvidence, reason: impl Into<String>) -> Self {
        Self {
            evidence,
            assessment: AssessmentSource::Unavailable {
                reason: reason.into(),
            },
            emergency: None,
        }
    }

    pub fn with_emergency(mut self, trigger: Option<EmergencyTrigger>) -> Self {
        self.emergency = trigger;
        self
    }

    /// Pipeline emergency first, then one reported by the assessor
    pub fn emergency_trigger(&self) -> Option<&EmergencyTrigger> {
        self.emergency.as_ref().or(match &self.assessment {
            AssessmentSource::External { assessment } => assessment.emergency.as_ref(),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(outcomes: &[(&str, bool)]) -> PhaseEvidence {
        let units = outcomes
            .iter()
            .map(|(id, ok)| {
                let result = if *ok {
                    WorkUnitResult::succeeded(*id, "p", 1, "out", 1)
                } else {
                    WorkUnitResult::failed(
                        *id,
                        "p",
                        1,
                        UnitFailure::Executor {
                            message: "boom".into(),
                        },
                        1,
                    )
                };
                UnitEvidence::from_result(&result, None)
            })
            .collect();
        PhaseEvidence {
            phase: "p".into(),
            attempt: 0,
            units,
        }
    }

    #[test]
    fn test_completion_ratio_and_failed_units() {
        let ev = evidence(&[("a", true), ("b", false), ("c", true), ("d", true)]);
        assert!((ev.completion_ratio() - 0.75).abs() < 1e-9);
        assert_eq!(ev.failed_units(), vec!["b"]);
        assert!(!ev.all_succeeded());
    }

    #[test]
    fn test_missing_units_count_as_failed() {
        let mut ev = evidence(&[("a", true)]);
        ev.units.push(UnitEvidence::missing("b"));
        assert_eq!(ev.failed_units(), vec!["b"]);
    }

    #[test]
    fn test_pipeline_emergency_takes_precedence() {
        let assessment = Assessment::new().with_emergency(EmergencyTrigger::CatastrophicBuildFailure {
            detail: "linker".into(),
        });
        let bundle = EvidenceBundle::external(evidence(&[("a", true)]), assessment.clone());
        assert!(matches!(
            bundle.emergency_trigger(),
            Some(EmergencyTrigger::CatastrophicBuildFailure { .. })
        ));

        let bundle = EvidenceBundle::external(evidence(&[("a", true)]), assessment)
            .with_emergency(Some(EmergencyTrigger::UserAbort));
        assert_eq!(bundle.emergency_trigger(), Some(&EmergencyTrigger::UserAbort));
    }

    #[test]
    fn test_assessment_deserializes_component_scores() {
        let assessment: Assessment =
            serde_json::from_str(r#"{"scores":{"security":0.9,"accuracy":0.7}}"#).unwrap();
        assert_eq!(assessment.scores[&QualityComponent::Security], 0.9);
        assert!(assessment.composite.is_none());
    }
}
