//! Orchestrator settings
//!
//! Defaults are fixed; `with_env_overrides` applies `PIPELINE_*` variables on
//! top, the way deployment overrides are layered onto a pipeline file.

use crate::error::{DefinitionError, DefinitionResult};
use crate::gate::GatePolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// When file claims are cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimScope {
    /// Cleared after each phase passes
    #[default]
    Phase,
    /// Kept for the whole run
    Run,
}

/// Settings for one orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Units of one phase running at the same time
    pub max_concurrency: usize,
    /// Per-dispatch executor timeout
    pub unit_timeout_secs: u64,
    /// Remediated retries per phase before escalating
    pub max_retries: u32,
    /// Extra evidence-gathering passes per phase before escalating
    pub max_evidence_passes: u32,
    /// Timeout for one quality assessor call
    pub assessor_timeout_secs: u64,
    pub claim_scope: ClaimScope,
    /// Upstream output longer than this is truncated in prompts
    pub max_input_chars: usize,
    /// Write a run snapshot here after every phase boundary
    pub snapshot_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            unit_timeout_secs: 600,
            max_retries: 3,
            max_evidence_passes: 2,
            assessor_timeout_secs: 120,
            claim_scope: ClaimScope::Phase,
            max_input_chars: 8_000,
            snapshot_path: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }

    pub fn assessor_timeout(&self) -> Duration {
        Duration::from_secs(self.assessor_timeout_secs)
    }

    pub fn gate_policy(&self) -> GatePolicy {
        GatePolicy {
            max_retries: self.max_retries,
            max_evidence_passes: self.max_evidence_passes,
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_unit_timeout_secs(mut self, secs: u64) -> Self {
        self.unit_timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Apply `PIPELINE_MAX_CONCURRENCY`, `PIPELINE_UNIT_TIMEOUT_SECS` and
    /// `PIPELINE_MAX_RETRIES`. Unparseable values are ignored with a warning.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_number("PIPELINE_MAX_CONCURRENCY") {
            self.max_concurrency = v as usize;
        }
        if let Some(v) = env_number("PIPELINE_UNIT_TIMEOUT_SECS") {
            self.unit_timeout_secs = v;
        }
        if let Some(v) = env_number("PIPELINE_MAX_RETRIES") {
            self.max_retries = v.min(u32::MAX as u64) as u32;
        }
        self
    }

    pub fn validate(&self) -> DefinitionResult<()> {
        if self.max_concurrency == 0 {
            return Err(DefinitionError::invalid_setting(
                "max_concurrency",
                "must be at least 1",
            ));
        }
        if self.unit_timeout_secs == 0 {
            return Err(DefinitionError::invalid_setting(
                "unit_timeout_secs",
                "must be at least 1",
            ));
        }
        if self.assessor_timeout_secs == 0 {
            return Err(DefinitionError::invalid_setting(
                "assessor_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring unparseable override");
            None
        }
    }
}
