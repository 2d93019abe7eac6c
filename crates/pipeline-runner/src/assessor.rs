//! Quality assessment and escalation handling for command-line runs

use crate::executor::split_command;
use anyhow::Result;
use async_trait::async_trait;
use orchestration::gate::PhaseEvidence;
use orchestration::{
    Assessment, AssessorError, Escalation, EscalationHandler, EscalationResolution,
    QualityAssessor,
};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Runs an external scorer: phase evidence as JSON on stdin, an
/// [`Assessment`] as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandAssessor {
    program: String,
    args: Vec<String>,
}

impl CommandAssessor {
    pub fn new(command: &str) -> Result<Self> {
        let (program, args) = split_command(command)?;
        Ok(Self { program, args })
    }
}

#[async_trait]
impl QualityAssessor for CommandAssessor {
    async fn assess(&self, evidence: &PhaseEvidence) -> Result<Assessment, AssessorError> {
        let payload = serde_json::to_vec(evidence)
            .map_err(|e| AssessorError::Malformed(format!("evidence did not serialize: {e}")))?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("PIPELINE_PHASE", &evidence.phase)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AssessorError::Unavailable(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&payload).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| AssessorError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AssessorError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            warn!(phase = %evidence.phase, error = %e, "Assessor output is not an assessment");
            AssessorError::Malformed(e.to_string())
        })
    }
}

/// Overrides every overridable escalation with a fixed reason
#[derive(Debug, Clone)]
pub struct OverrideEscalations {
    reason: String,
}

impl OverrideEscalations {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl EscalationHandler for OverrideEscalations {
    async fn resolve(&self, escalation: &Escalation) -> EscalationResolution {
        info!(phase = %escalation.phase, reason = %escalation.reason, "Overriding escalation");
        EscalationResolution::Override {
            reason: self.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestration::QualityComponent;

    fn evidence() -> PhaseEvidence {
        PhaseEvidence {
            phase: "design".into(),
            attempt: 1,
            units: Vec::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_assessor_parses_stdout() {
        let assessor = CommandAssessor::new(
            r#"sh -c 'cat > /dev/null; echo "{\"scores\":{\"security\":0.9},\"composite\":0.85}"'"#,
        )
        .unwrap();
        let assessment = assessor.assess(&evidence()).await.unwrap();
        assert_eq!(assessment.composite, Some(0.85));
        assert_eq!(assessment.scores.get(&QualityComponent::Security), Some(&0.9));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_assessor_rejects_garbage() {
        let assessor = CommandAssessor::new("sh -c 'cat > /dev/null; echo not-json'").unwrap();
        let err = assessor.assess(&evidence()).await.unwrap_err();
        assert!(matches!(err, AssessorError::Malformed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_assessor_is_unavailable() {
        let assessor = CommandAssessor::new("sh -c 'exit 1'").unwrap();
        let err = assessor.assess(&evidence()).await.unwrap_err();
        assert!(matches!(err, AssessorError::Unavailable(_)));
    }
}
