//! Shared per-unit progress records
//!
//! Concurrently running units read each other's progress through this store.
//! Status only moves forward within an attempt:
//!
//! ```text
//! Pending -> Active -> Completed | Failed
//! Pending -> Failed           (never dispatched)
//! ```
//!
//! A retry registers a strictly newer attempt, which resets the record to
//! `Pending` without touching older history.

use super::summary::OutputSummary;
use crate::definition::{PhaseName, UnitId};
use crate::error::{ProgressError, ProgressResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Lifecycle status of a unit attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

fn is_legal_transition(from: UnitStatus, to: UnitStatus) -> bool {
    use UnitStatus::*;
    matches!(
        (from, to),
        (Pending, Active) | (Pending, Failed) | (Active, Completed) | (Active, Failed)
    )
}

/// Progress of one unit's current attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub unit_id: UnitId,
    pub phase: PhaseName,
    pub attempt: u32,
    pub status: UnitStatus,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<OutputSummary>,
    pub error: Option<String>,
}

impl ProgressRecord {
    /// Time spent active, measured against `now` while still running
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or(now);
        Some((end - started).num_milliseconds().max(0) as u64)
    }
}

/// Thread-safe progress store
#[derive(Debug, Default)]
pub struct ProgressStore {
    records: RwLock<BTreeMap<UnitId, ProgressRecord>>,
}

/// Shared handle to a progress store
pub type SharedProgressStore = Arc<ProgressStore>;

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedProgressStore {
        Arc::new(Self::new())
    }

    // A panicking writer cannot leave a record half-updated, so poisoned
    // locks are safe to recover.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<UnitId, ProgressRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<UnitId, ProgressRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a unit attempt as `Pending`.
    ///
    /// Registering the same attempt again is a no-op; an older attempt is rejected.
    pub fn register(&self, unit_id: &str, phase: &str, attempt: u32) -> ProgressResult<()> {
        let mut records = self.write();
        if let Some(existing) = records.get(unit_id) {
            if existing.attempt == attempt {
                return Ok(());
            }
            if existing.attempt > attempt {
                return Err(ProgressError::StaleAttempt {
                    unit: unit_id.to_string(),
                    existing: existing.attempt,
                    requested: attempt,
                });
            }
        }
        records.insert(
            unit_id.to_string(),
            ProgressRecord {
                unit_id: unit_id.to_string(),
                phase: phase.to_string(),
                attempt,
                status: UnitStatus::Pending,
                registered_at: Utc::now(),
                started_at: None,
                completed_at: None,
                summary: None,
                error: None,
            },
        );
        debug!(unit = unit_id, phase, attempt, "Registered unit progress");
        Ok(())
    }

    fn transition(
        &self,
        unit_id: &str,
        to: UnitStatus,
        apply: impl FnOnce(&mut ProgressRecord),
    ) -> ProgressResult<()> {
        let mut records = self.write();
        let record = records
            .get_mut(unit_id)
            .ok_or_else(|| ProgressError::UnknownUnit {
                unit: unit_id.to_string(),
            })?;
        if !is_legal_transition(record.status, to) {
            return Err(ProgressError::InvalidTransition {
                unit: unit_id.to_string(),
                from: record.status.to_string(),
                to: to.to_string(),
            });
        }
        record.status = to;
        apply(record);
        Ok(())
    }

    pub fn mark_active(&self, unit_id: &str) -> ProgressResult<()> {
        self.transition(unit_id, UnitStatus::Active, |r| {
            r.started_at = Some(Utc::now());
        })
    }

    pub fn mark_completed(&self, unit_id: &str, summary: OutputSummary) -> ProgressResult<()> {
        self.transition(unit_id, UnitStatus::Completed, |r| {
            r.completed_at = Some(Utc::now());
            r.summary = Some(summary);
        })
    }

    pub fn mark_failed(&self, unit_id: &str, error: impl Into<String>) -> ProgressResult<()> {
        let error = error.into();
        self.transition(unit_id, UnitStatus::Failed, |r| {
            r.completed_at = Some(Utc::now());
            r.error = Some(error);
        })
    }

    pub fn get(&self, unit_id: &str) -> Option<ProgressRecord> {
        self.read().get(unit_id).cloned()
    }

    /// Records of a phase, ordered by unit id
    pub fn by_phase(&self, phase: &str) -> Vec<ProgressRecord> {
        self.read()
            .values()
            .filter(|r| r.phase == phase)
            .cloned()
            .collect()
    }

    /// Records currently `Active`, ordered by unit id
    pub fn active(&self) -> Vec<ProgressRecord> {
        self.read()
            .values()
            .filter(|r| r.status == UnitStatus::Active)
            .cloned()
            .collect()
    }

    /// All records, ordered by unit id
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_moves_forward() {
        let store = ProgressStore::new();
        store.register("a", "design", 1).unwrap();
        assert_eq!(store.get("a").unwrap().status, UnitStatus::Pending);

        store.mark_active("a").unwrap();
        assert_eq!(store.active().len(), 1);

        store
            .mark_completed("a", OutputSummary::extract("Decision: go"))
            .unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.status, UnitStatus::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(record.summary.unwrap().decisions, vec!["go"]);
        assert!(store.active().is_empty());
    }

    #[test]
    fn test_status_never_regresses() {
        let store = ProgressStore::new();
        store.register("a", "design", 1).unwrap();
        store.mark_active("a").unwrap();
        store.mark_completed("a", OutputSummary::default()).unwrap();

        assert!(matches!(
            store.mark_active("a"),
            Err(ProgressError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.mark_failed("a", "late"),
            Err(ProgressError::InvalidTransition { .. })
        ));
        assert_eq!(store.get("a").unwrap().status, UnitStatus::Completed);
    }

    #[test]
    fn test_pending_can_fail_without_dispatch() {
        let store = ProgressStore::new();
        store.register("a", "design", 1).unwrap();
        store.mark_failed("a", "dependency failed").unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.status, UnitStatus::Failed);
        assert!(record.started_at.is_none());
    }

    #[test]
    fn test_newer_attempt_resets_record() {
        let store = ProgressStore::new();
        store.register("a", "design", 1).unwrap();
        store.mark_active("a").unwrap();
        store.mark_failed("a", "boom").unwrap();

        store.register("a", "design", 2).unwrap();
        let record = store.get("a").unwrap();
        assert_eq!(record.attempt, 2);
        assert_eq!(record.status, UnitStatus::Pending);

        assert!(matches!(
            store.register("a", "design", 1),
            Err(ProgressError::StaleAttempt { .. })
        ));
    }

    #[test]
    fn test_unknown_unit_is_an_error() {
        let store = ProgressStore::new();
        assert!(matches!(
            store.mark_active("ghost"),
            Err(ProgressError::UnknownUnit { .. })
        ));
    }

    #[test]
    fn test_by_phase_and_clear() {
        let store = ProgressStore::new();
        store.register("a", "one", 1).unwrap();
        store.register("b", "two", 1).unwrap();
        assert_eq!(store.by_phase("two").len(), 1);
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_elapsed_uses_reference_time_while_active() {
        let store = ProgressStore::new();
        store.register("a", "one", 1).unwrap();
        store.mark_active("a").unwrap();
        let record = store.get("a").unwrap();
        let later = record.started_at.unwrap() + chrono::Duration::milliseconds(1500);
        assert_eq!(record.elapsed_ms(later), Some(1500));
    }
}
