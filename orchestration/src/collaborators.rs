//! External collaborators: executor, artifact storage, quality assessor and
//! escalation handler
//!
//! The orchestrator only depends on these traits. [`InMemoryStorage`] and
//! [`HaltOnEscalation`] are the defaults when nothing else is configured.

use crate::definition::{PhaseName, UnitId};
use crate::error::{AssessorError, ExecutorError, StorageError, StorageResult};
use crate::gate::{Assessment, PhaseEvidence};
use crate::orchestrator::result::Escalation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// One dispatch handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub unit_id: UnitId,
    pub phase: PhaseName,
    pub attempt: u32,
    pub prompt: String,
    pub timeout: Duration,
}

/// What the executor reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorOutput {
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
}

impl ExecutorOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Runs a single work unit.
///
/// The orchestrator wraps every call in its own timeout, so implementations
/// may ignore `request.timeout`; honoring it lets them clean up early.
#[async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, ExecutorError>;
}

/// Shared handle to an executor
pub type SharedExecutor = Arc<dyn UnitExecutor>;

/// Best-effort artifact cache for cross-phase handoff
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    async fn put(&self, domain: &str, key: &str, value: &str) -> StorageResult<()>;

    /// `Ok(None)` is a miss, not an error
    async fn get(&self, domain: &str, key: &str) -> StorageResult<Option<String>>;

    /// State to embed in checkpoints; `None` when the backend cannot snapshot
    async fn snapshot(&self) -> StorageResult<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Roll back to a value produced by [`ArtifactStorage::snapshot`]
    async fn restore(&self, _snapshot: &serde_json::Value) -> StorageResult<()> {
        Ok(())
    }
}

/// Shared handle to a storage backend
pub type SharedStorage = Arc<dyn ArtifactStorage>;

/// Scores a phase's evidence
#[async_trait]
pub trait QualityAssessor: Send + Sync {
    async fn assess(&self, evidence: &PhaseEvidence) -> Result<Assessment, AssessorError>;
}

/// Shared handle to an assessor
pub type SharedAssessor = Arc<dyn QualityAssessor>;

/// How an escalation was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum EscalationResolution {
    /// Stop the pipeline with status `Escalated`
    Halt,
    /// Continue past the escalated phase
    Override { reason: String },
}

/// Decides whether an escalated phase may be overridden
#[async_trait]
pub trait EscalationHandler: Send + Sync {
    async fn resolve(&self, escalation: &Escalation) -> EscalationResolution;
}

/// Shared handle to an escalation handler
pub type SharedEscalationHandler = Arc<dyn EscalationHandler>;

/// Never overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct HaltOnEscalation;

#[async_trait]
impl EscalationHandler for HaltOnEscalation {
    async fn resolve(&self, _escalation: &Escalation) -> EscalationResolution {
        EscalationResolution::Halt
    }
}

/// Process-local storage keyed by `(domain, key)`
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    entries: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ArtifactStorage for InMemoryStorage {
    async fn put(&self, domain: &str, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .write()
            .await
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, domain: &str, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(domain)
            .and_then(|d| d.get(key))
            .cloned())
    }

    async fn snapshot(&self) -> StorageResult<Option<serde_json::Value>> {
        let entries = self.entries.read().await;
        serde_json::to_value(&*entries)
            .map(Some)
            .map_err(|e| StorageError::Unavailable(format!("snapshot failed: {e}")))
    }

    async fn restore(&self, snapshot: &serde_json::Value) -> StorageResult<()> {
        let restored: BTreeMap<String, BTreeMap<String, String>> =
            serde_json::from_value(snapshot.clone()).map_err(|e| StorageError::Malformed {
                domain: "*".into(),
                key: "*".into(),
                message: e.to_string(),
            })?;
        *self.entries.write().await = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_put_get() {
        let storage = InMemoryStorage::new();
        assert_eq!(storage.get("arch", "a").await.unwrap(), None);
        storage.put("arch", "a", "layered").await.unwrap();
        assert_eq!(
            storage.get("arch", "a").await.unwrap().as_deref(),
            Some("layered")
        );
        assert_eq!(storage.get("other", "a").await.unwrap(), None);
        assert_eq!(storage.len().await, 1);
    }

    #[tokio::test]
    async fn test_in_memory_snapshot_restore() {
        let storage = InMemoryStorage::new();
        storage.put("arch", "a", "v1").await.unwrap();
        let snapshot = storage.snapshot().await.unwrap().unwrap();

        storage.put("arch", "a", "v2").await.unwrap();
        storage.put("arch", "b", "new").await.unwrap();
        storage.restore(&snapshot).await.unwrap();

        assert_eq!(storage.get("arch", "a").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(storage.get("arch", "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_restore_rejects_malformed_snapshot() {
        let storage = InMemoryStorage::new();
        let err = storage
            .restore(&serde_json::json!({"arch": 5}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Malformed { .. }));
    }
}
