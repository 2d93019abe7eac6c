//! Human-readable rendering of plans and run results

use orchestration::{PipelineDefinition, PipelineResult, UnitGraph};
use std::fmt::Write;

/// Dispatch waves of every phase, in run order
pub fn render_plan(definition: &PipelineDefinition, graphs: &[UnitGraph]) -> String {
    let mut out = format!("Pipeline: {}\n", definition.name);
    for (idx, graph) in graphs.iter().enumerate() {
        let _ = writeln!(out, "\n{}. {} ({} units)", idx + 1, graph.phase(), graph.len());
        for (wave, units) in graph.waves().iter().enumerate() {
            let _ = writeln!(out, "   wave {}: {}", wave + 1, units.join(", "));
        }
    }
    out
}

/// Summary of a finished run
pub fn render_summary(result: &PipelineResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Pipeline {} ({}): {}",
        result.pipeline, result.run_id, result.status
    );
    let m = &result.metrics;
    let _ = writeln!(
        out,
        "Units: {} dispatched, {} succeeded, {} failed ({} timeouts)",
        m.units_dispatched, m.units_succeeded, m.units_failed, m.timeouts
    );
    let _ = writeln!(
        out,
        "Gates: {} evaluations, {} retries, {} rollbacks, {:.1}s elapsed",
        m.gate_evaluations,
        m.total_retries,
        m.rollbacks,
        m.elapsed_ms as f64 / 1000.0
    );

    out.push_str("\nGate history:\n");
    for record in &result.gate_history {
        let composite = record
            .verdict
            .composite
            .map_or_else(|| "n/a".to_string(), |c| format!("{c:.2}"));
        let _ = write!(
            out,
            "  {:<16} {:<22} composite {} (min {:.2})",
            record.phase,
            record.verdict.outcome.to_string(),
            composite,
            record.verdict.minimum
        );
        match &record.override_reason {
            Some(reason) => {
                let _ = writeln!(out, " overridden: {reason}");
            }
            None => out.push('\n'),
        }
    }

    for escalation in &result.overrides {
        let _ = writeln!(out, "\nOverridden in {}: {}", escalation.phase, escalation.reason);
    }

    if let Some(escalation) = &result.escalation {
        let _ = writeln!(
            out,
            "\nHalted in phase {}: {}",
            escalation.phase, escalation.reason
        );
        if !escalation.failed_units.is_empty() {
            let _ = writeln!(out, "Failed units: {}", escalation.failed_units.join(", "));
        }
        if !escalation.remediation.is_empty() {
            out.push_str("Remediation:\n");
            for hint in &escalation.remediation {
                let _ = writeln!(out, "  - {hint}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::{Phase, WorkUnitSpec};

    #[test]
    fn test_plan_lists_waves() {
        let definition = PipelineDefinition::new("svc").with_phase(
            Phase::new("design")
                .with_unit(WorkUnitSpec::new("a", "A"))
                .with_unit(WorkUnitSpec::new("b", "B").depends_on("a"))
                .with_unit(WorkUnitSpec::new("c", "C").depends_on("a")),
        );
        let graphs = definition.validate().unwrap();
        let plan = render_plan(&definition, &graphs);
        assert!(plan.contains("1. design (3 units)"));
        assert!(plan.contains("wave 1: a"));
        assert!(plan.contains("wave 2: b, c"));
    }
}
