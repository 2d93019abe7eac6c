//! Run snapshots on disk
//!
//! A snapshot is the pipeline definition plus everything needed to inspect a
//! run after the fact: execution state, checkpoint history and the progress
//! records. Written as pretty JSON so it can be diffed and read by hand.

use crate::checkpoint::CheckpointStore;
use crate::definition::PipelineDefinition;
use crate::error::{PersistenceError, PersistenceResult};
use crate::progress::ProgressRecord;
use crate::state::ExecutionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Serializable record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Schema version for forward compatibility
    pub version: u32,
    pub pipeline: PipelineDefinition,
    pub state: ExecutionState,
    pub checkpoints: CheckpointStore,
    pub progress: Vec<ProgressRecord>,
    pub saved_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn capture(
        pipeline: &PipelineDefinition,
        state: &ExecutionState,
        checkpoints: &CheckpointStore,
        progress: Vec<ProgressRecord>,
    ) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            pipeline: pipeline.clone(),
            state: state.clone(),
            checkpoints: checkpoints.clone(),
            progress,
            saved_at: Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    /// Write the snapshot, creating parent directories as needed
    pub fn save(&self, path: &Path) -> PersistenceResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| PersistenceError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| PersistenceError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), run_id = %self.run_id(), "Run snapshot saved");
        Ok(())
    }

    pub fn load(path: &Path) -> PersistenceResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PersistenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let snapshot: Self =
            serde_json::from_str(&content).map_err(|source| PersistenceError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        if snapshot.version > Self::CURRENT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: snapshot.version,
                supported: Self::CURRENT_VERSION,
            });
        }
        Ok(snapshot)
    }
}
