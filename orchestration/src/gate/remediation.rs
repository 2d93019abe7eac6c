//! Deterministic remediation hints
//!
//! Hints depend only on the verdict's shortfalls, missing components and
//! failed units, so the same evidence always yields the same text.

use super::thresholds::QualityComponent;
use super::verdict::ComponentShortfall;
use crate::definition::UnitId;

/// What to re-examine when a component scores low
pub fn component_guidance(component: QualityComponent) -> &'static str {
    match component {
        QualityComponent::Accuracy => {
            "re-check results against the task requirements and correct factual errors"
        }
        QualityComponent::Completeness => {
            "cover every requirement of the task and finish partial work"
        }
        QualityComponent::Consistency => {
            "align naming, interfaces and decisions with peer units"
        }
        QualityComponent::Security => "re-examine input validation and secret handling",
        QualityComponent::Performance => {
            "profile hot paths and remove needless allocations or blocking calls"
        }
        QualityComponent::Maintainability => {
            "simplify structure, remove duplication and document non-obvious code"
        }
        QualityComponent::Testability => {
            "add tests for uncovered behavior and make dependencies injectable"
        }
    }
}

/// Build hints for a failed or inconclusive verdict
pub fn remediation_hints(
    composite: Option<f64>,
    minimum: f64,
    shortfalls: &[ComponentShortfall],
    missing: &[QualityComponent],
    failed_units: &[UnitId],
) -> Vec<String> {
    let mut hints = Vec::new();

    if let Some(composite) = composite {
        if composite < minimum {
            hints.push(format!(
                "composite score {composite:.2} below threshold {minimum:.2}: raise overall quality before resubmitting"
            ));
        }
    }

    for shortfall in shortfalls {
        hints.push(format!(
            "{} score {:.2} below threshold {:.2}: {}",
            shortfall.component,
            shortfall.score,
            shortfall.minimum,
            component_guidance(shortfall.component)
        ));
    }

    for component in missing {
        hints.push(format!(
            "no {component} score was reported: make the output assessable for {component}"
        ));
    }

    for unit in failed_units {
        hints.push(format!(
            "unit '{unit}' did not complete successfully: address its error before anything else"
        ));
    }

    hints
}
