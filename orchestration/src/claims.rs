//! File claim coordination
//!
//! Records which unit claimed which file so peers can be warned before they
//! touch it. Claims are advisory: a new claim on a path replaces the old one
//! and nothing is ever blocked.

use crate::definition::{ClaimOp, PhaseName, UnitId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// A unit's claim on a file path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClaim {
    pub path: String,
    pub unit_id: UnitId,
    pub op: ClaimOp,
    pub phase: PhaseName,
    pub claimed_at: DateTime<Utc>,
}

/// Thread-safe path -> claim map
#[derive(Debug, Default)]
pub struct FileClaimCoordinator {
    claims: RwLock<BTreeMap<String, FileClaim>>,
}

/// Shared handle to a claim coordinator
pub type SharedClaimCoordinator = Arc<FileClaimCoordinator>;

impl FileClaimCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedClaimCoordinator {
        Arc::new(Self::new())
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, FileClaim>> {
        self.claims.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, FileClaim>> {
        self.claims.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim a path for a unit, returning the claim it replaced (if any)
    pub fn claim(
        &self,
        path: &str,
        unit_id: &str,
        op: ClaimOp,
        phase: &str,
    ) -> Option<FileClaim> {
        let claim = FileClaim {
            path: path.to_string(),
            unit_id: unit_id.to_string(),
            op,
            phase: phase.to_string(),
            claimed_at: Utc::now(),
        };
        let previous = self.write().insert(path.to_string(), claim);
        if let Some(prev) = previous.as_ref().filter(|p| p.unit_id != unit_id) {
            debug!(
                path,
                unit = unit_id,
                previous_owner = %prev.unit_id,
                "File claim replaced"
            );
        }
        previous
    }

    pub fn get(&self, path: &str) -> Option<FileClaim> {
        self.read().get(path).cloned()
    }

    /// Claims held by other units, ordered by path
    pub fn conflicts(&self, unit_id: &str) -> Vec<FileClaim> {
        self.read()
            .values()
            .filter(|c| c.unit_id != unit_id)
            .cloned()
            .collect()
    }

    /// Claims held by a unit, ordered by path
    pub fn claims_of(&self, unit_id: &str) -> Vec<FileClaim> {
        self.read()
            .values()
            .filter(|c| c.unit_id == unit_id)
            .cloned()
            .collect()
    }

    /// All claims, ordered by path
    pub fn all(&self) -> Vec<FileClaim> {
        self.read().values().cloned().collect()
    }

    /// Drop the claims made during one phase
    pub fn clear_phase(&self, phase: &str) -> usize {
        let mut claims = self.write();
        let before = claims.len();
        claims.retain(|_, c| c.phase != phase);
        before - claims.len()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
