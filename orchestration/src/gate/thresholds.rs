//! Per-phase gate thresholds
//!
//! Each phase has a minimum composite score, a set of critical components with
//! their own minimums, optional component weights for computing a composite,
//! and components whose scores must be present for a verdict.
//!
//! The reference table uses the progression
//! 0.75 -> 0.80 -> 0.85 -> 0.90 -> 0.92 -> 0.88 -> 0.95. The sixth phase dips
//! because it gates a different set of critical components.

use crate::definition::PipelineDefinition;
use crate::error::{DefinitionError, DefinitionResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Scored quality dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityComponent {
    Accuracy,
    Completeness,
    Consistency,
    Security,
    Performance,
    Maintainability,
    Testability,
}

impl QualityComponent {
    pub const ALL: [QualityComponent; 7] = [
        Self::Accuracy,
        Self::Completeness,
        Self::Consistency,
        Self::Security,
        Self::Performance,
        Self::Maintainability,
        Self::Testability,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Completeness => "completeness",
            Self::Consistency => "consistency",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Maintainability => "maintainability",
            Self::Testability => "testability",
        }
    }
}

impl fmt::Display for QualityComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum score for one critical component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentThreshold {
    pub component: QualityComponent,
    pub min: f64,
}

/// Weight of one component in the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentWeight {
    pub component: QualityComponent,
    pub weight: f64,
}

/// Gate configuration for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseGateConfig {
    pub min_composite: f64,
    /// Components that fail the gate on their own when below `min`
    #[serde(default)]
    pub critical: Vec<ComponentThreshold>,
    /// Empty means every scored component counts equally
    #[serde(default)]
    pub weights: Vec<ComponentWeight>,
    /// Components that must be scored, on top of the critical ones
    #[serde(default)]
    pub required: Vec<QualityComponent>,
}

impl PhaseGateConfig {
    pub fn new(min_composite: f64) -> Self {
        Self {
            min_composite,
            critical: Vec::new(),
            weights: Vec::new(),
            required: Vec::new(),
        }
    }

    pub fn with_critical(mut self, component: QualityComponent, min: f64) -> Self {
        self.critical.push(ComponentThreshold { component, min });
        self
    }

    pub fn with_weight(mut self, component: QualityComponent, weight: f64) -> Self {
        self.weights.push(ComponentWeight { component, weight });
        self
    }

    pub fn with_required(mut self, component: QualityComponent) -> Self {
        self.required.push(component);
        self
    }

    /// Components whose score must be present: required plus critical
    pub fn required_components(&self) -> Vec<QualityComponent> {
        let mut components: Vec<QualityComponent> = self
            .required
            .iter()
            .copied()
            .chain(self.critical.iter().map(|c| c.component))
            .collect();
        components.sort();
        components.dedup();
        components
    }

    /// Weighted mean of the available scores, `None` when nothing is scored
    pub fn composite(&self, scores: &BTreeMap<QualityComponent, f64>) -> Option<f64> {
        if scores.is_empty() {
            return None;
        }
        if self.weights.is_empty() {
            let sum: f64 = scores.values().sum();
            return Some(sum / scores.len() as f64);
        }
        let (weighted, total) = self
            .weights
            .iter()
            .filter_map(|w| scores.get(&w.component).map(|s| (s * w.weight, w.weight)))
            .fold((0.0, 0.0), |(acc, tw), (v, w)| (acc + v, tw + w));
        (total > 0.0).then(|| weighted / total)
    }

    fn validate(&self, phase: &str) -> DefinitionResult<()> {
        check_unit_interval(phase, "min_composite", self.min_composite)?;
        for threshold in &self.critical {
            check_unit_interval(phase, threshold.component.as_str(), threshold.min)?;
        }
        for weight in &self.weights {
            if !(weight.weight.is_finite() && weight.weight > 0.0) {
                return Err(DefinitionError::invalid_threshold(
                    phase,
                    format!(
                        "weight for {} must be positive, got {}",
                        weight.component, weight.weight
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn check_unit_interval(phase: &str, what: &str, value: f64) -> DefinitionResult<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(DefinitionError::invalid_threshold(
            phase,
            format!("{what} must be within 0.0..=1.0, got {value}"),
        ))
    }
}

/// Phase names of the reference table, in order
pub const REFERENCE_PHASES: [&str; 7] = [
    "understanding",
    "exploration",
    "design",
    "implementation",
    "verification",
    "optimization",
    "delivery",
];

const REFERENCE_MINIMUMS: [f64; 7] = [0.75, 0.80, 0.85, 0.90, 0.92, 0.88, 0.95];

fn reference_config(position: usize) -> PhaseGateConfig {
    use QualityComponent::*;
    let idx = position.min(REFERENCE_MINIMUMS.len() - 1);
    let config = PhaseGateConfig::new(REFERENCE_MINIMUMS[idx]);
    match idx {
        0 => config.with_critical(Accuracy, 0.70),
        1 => config.with_critical(Completeness, 0.75),
        2 => config
            .with_critical(Consistency, 0.80)
            .with_critical(Security, 0.80),
        3 => config
            .with_critical(Accuracy, 0.85)
            .with_critical(Security, 0.85),
        4 => config
            .with_critical(Testability, 0.90)
            .with_critical(Accuracy, 0.90),
        5 => config
            .with_critical(Performance, 0.85)
            .with_critical(Maintainability, 0.80),
        _ => config
            .with_critical(Completeness, 0.95)
            .with_critical(Security, 0.90),
    }
}

/// Threshold table keyed by phase name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GateTable {
    phases: BTreeMap<String, PhaseGateConfig>,
}

impl GateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase(mut self, phase: impl Into<String>, config: PhaseGateConfig) -> Self {
        self.phases.insert(phase.into(), config);
        self
    }

    pub fn insert(&mut self, phase: impl Into<String>, config: PhaseGateConfig) {
        self.phases.insert(phase.into(), config);
    }

    /// The seven-phase reference table
    pub fn reference() -> Self {
        Self::progression(REFERENCE_PHASES)
    }

    /// Map phases, in order, onto the reference progression.
    ///
    /// Phases beyond the seventh reuse the last reference entry.
    pub fn progression<I, S>(phases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phases = phases
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name.into(), reference_config(idx)))
            .collect();
        Self { phases }
    }

    /// Same minimum composite and no critical components for every phase
    pub fn uniform<I, S>(phases: I, min_composite: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let phases = phases
            .into_iter()
            .map(|name| (name.into(), PhaseGateConfig::new(min_composite)))
            .collect();
        Self { phases }
    }

    pub fn get(&self, phase: &str) -> Option<&PhaseGateConfig> {
        self.phases.get(phase)
    }

    pub fn phases(&self) -> impl Iterator<Item = (&String, &PhaseGateConfig)> {
        self.phases.iter()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Check that every phase of `definition` has a valid entry
    pub fn covers(&self, definition: &PipelineDefinition) -> DefinitionResult<()> {
        for phase in &definition.phases {
            let config = self
                .phases
                .get(&phase.name)
                .ok_or_else(|| DefinitionError::MissingGate {
                    phase: phase.name.clone(),
                })?;
            config.validate(&phase.name)?;
        }
        Ok(())
    }
}
