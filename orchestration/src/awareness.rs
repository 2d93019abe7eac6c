//! Situational awareness briefings
//!
//! Renders what a unit's peers in the same phase have done, are doing and
//! have claimed, so concurrently running units can coordinate without
//! messaging each other. Building a briefing only reads the stores; with the
//! same store contents and reference time the output is identical.

use crate::claims::SharedClaimCoordinator;
use crate::progress::{ProgressRecord, SharedProgressStore, UnitStatus};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt::Write;

/// Briefing returned when no peer has anything to report
pub const NO_PEER_ACTIVITY: &str =
    "## Situational Awareness\nNo peer activity in this phase yet. You are working independently.";

/// Builds peer-context briefings from the shared stores
#[derive(Debug, Clone)]
pub struct SituationalAwarenessBuilder {
    progress: SharedProgressStore,
    claims: SharedClaimCoordinator,
}

impl SituationalAwarenessBuilder {
    pub fn new(progress: SharedProgressStore, claims: SharedClaimCoordinator) -> Self {
        Self { progress, claims }
    }

    /// Briefing for `unit_id` in `phase`, with elapsed times measured at `now`
    pub fn build(&self, unit_id: &str, phase: &str, now: DateTime<Utc>) -> String {
        let peers: Vec<ProgressRecord> = self
            .progress
            .by_phase(phase)
            .into_iter()
            .filter(|r| r.unit_id != unit_id)
            .collect();
        let completed: Vec<&ProgressRecord> = peers
            .iter()
            .filter(|r| r.status == UnitStatus::Completed)
            .collect();
        let active: Vec<&ProgressRecord> = peers
            .iter()
            .filter(|r| r.status == UnitStatus::Active)
            .collect();
        let failed: Vec<&ProgressRecord> = peers
            .iter()
            .filter(|r| r.status == UnitStatus::Failed)
            .collect();
        let claimed = self.claims.conflicts(unit_id);

        let mut decisions = BTreeSet::new();
        for record in &completed {
            if let Some(summary) = &record.summary {
                for decision in &summary.decisions {
                    decisions.insert(format!("{} (from {})", decision, record.unit_id));
                }
            }
        }

        if completed.is_empty() && active.is_empty() && failed.is_empty() && claimed.is_empty() {
            return NO_PEER_ACTIVITY.to_string();
        }

        let mut out = String::from("## Situational Awareness\n");

        if !completed.is_empty() {
            out.push_str("\n### Completed peers\n");
            for record in &completed {
                let _ = write!(out, "- {}", record.unit_id);
                match record.summary.as_ref().and_then(|s| s.key_findings.first()) {
                    Some(finding) => {
                        let _ = writeln!(out, ": {finding}");
                    }
                    None => out.push('\n'),
                }
            }
        }

        if !active.is_empty() {
            out.push_str("\n### Active peers\n");
            for record in &active {
                let elapsed = record.elapsed_ms(now).unwrap_or(0);
                let _ = writeln!(
                    out,
                    "- {} (running for {:.1}s)",
                    record.unit_id,
                    elapsed as f64 / 1000.0
                );
            }
        }

        if !failed.is_empty() {
            out.push_str("\n### Failed peers\n");
            for record in &failed {
                let _ = writeln!(
                    out,
                    "- {}: {}",
                    record.unit_id,
                    record.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }

        if !decisions.is_empty() {
            out.push_str("\n### Peer decisions\n");
            for decision in &decisions {
                let _ = writeln!(out, "- {decision}");
            }
        }

        if !claimed.is_empty() {
            out.push_str("\n### Files claimed by peers (avoid modifying)\n");
            for claim in &claimed {
                let _ = writeln!(out, "- {} ({} by {})", claim.path, claim.op, claim.unit_id);
            }
        }

        out.push_str(
            "\n### Coordination\nStay consistent with peer decisions. If you must touch a claimed file, say so explicitly in your output.\n",
        );
        out
    }

    /// Briefing measured against the current time
    pub fn build_now(&self, unit_id: &str, phase: &str) -> String {
        self.build(unit_id, phase, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::FileClaimCoordinator;
    use crate::definition::ClaimOp;
    use crate::progress::{OutputSummary, ProgressStore};

    fn builder() -> (SituationalAwarenessBuilder, SharedProgressStore, SharedClaimCoordinator) {
        let progress = ProgressStore::shared();
        let claims = FileClaimCoordinator::shared();
        (
            SituationalAwarenessBuilder::new(progress.clone(), claims.clone()),
            progress,
            claims,
        )
    }

    #[test]
    fn test_no_peer_activity() {
        let (builder, progress, _) = builder();
        progress.register("me", "impl", 1).unwrap();
        progress.register("peer", "impl", 1).unwrap();
        assert_eq!(builder.build_now("me", "impl"), NO_PEER_ACTIVITY);
    }

    #[test]
    fn test_briefing_lists_peers_decisions_and_claims() {
        let (builder, progress, claims) = builder();
        for unit in ["me", "done", "busy", "other_phase"] {
            let phase = if unit == "other_phase" { "design" } else { "impl" };
            progress.register(unit, phase, 1).unwrap();
        }
        progress.mark_active("done").unwrap();
        progress
            .mark_completed(
                "done",
                OutputSummary::extract("Decision: use tokio\nFinding: parser is slow"),
            )
            .unwrap();
        progress.mark_active("busy").unwrap();
        claims.claim("src/api.rs", "busy", ClaimOp::Write, "impl");
        claims.claim("src/mine.rs", "me", ClaimOp::Write, "impl");

        let briefing = builder.build_now("me", "impl");
        assert!(briefing.contains("- done: parser is slow"));
        assert!(briefing.contains("- busy (running for"));
        assert!(briefing.contains("use tokio (from done)"));
        assert!(briefing.contains("src/api.rs (write by busy)"));
        assert!(!briefing.contains("src/mine.rs"));
        assert!(!briefing.contains("other_phase"));
        assert!(briefing.contains("### Coordination"));
    }

    #[test]
    fn test_failed_peers_are_reported_with_their_error() {
        let (builder, progress, _) = builder();
        progress.register("me", "impl", 1).unwrap();
        progress.register("broken", "impl", 1).unwrap();
        progress.mark_active("broken").unwrap();
        progress.mark_failed("broken", "build broke").unwrap();

        let briefing = builder.build_now("me", "impl");
        assert_ne!(briefing, NO_PEER_ACTIVITY);
        assert!(briefing.contains("### Failed peers"));
        assert!(briefing.contains("- broken: build broke"));
    }

    #[test]
    fn test_same_state_same_briefing() {
        let (builder, progress, claims) = builder();
        progress.register("me", "impl", 1).unwrap();
        progress.register("busy", "impl", 1).unwrap();
        progress.mark_active("busy").unwrap();
        claims.claim("b.rs", "busy", ClaimOp::Write, "impl");
        claims.claim("a.rs", "busy", ClaimOp::Read, "impl");

        let now = Utc::now();
        let first = builder.build("me", "impl", now);
        let second = builder.build("me", "impl", now);
        assert_eq!(first, second);
        assert!(first.find("a.rs").unwrap() < first.find("b.rs").unwrap());
    }
}
