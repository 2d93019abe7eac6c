//! Executors backed by external processes
//!
//! [`CommandExecutor`] runs one process per unit dispatch: the prompt goes to
//! stdin, stdout becomes the unit output. [`EchoExecutor`] never leaves the
//! process and is used for dry runs.

use anyhow::{bail, Result};
use async_trait::async_trait;
use orchestration::{ExecutionRequest, ExecutorError, ExecutorOutput, UnitExecutor};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Longest stderr excerpt carried into a failure message
const MAX_STDERR_CHARS: usize = 500;

/// Split a shell-style command line into program and arguments
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let Some(mut parts) = shlex::split(command) else {
        bail!("unbalanced quotes in command: {command}");
    };
    if parts.is_empty() {
        bail!("command is empty");
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

/// Runs each unit as a child process.
///
/// The child sees `PIPELINE_UNIT_ID`, `PIPELINE_PHASE` and
/// `PIPELINE_ATTEMPT` in its environment and is killed when the
/// orchestrator gives up on it.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(command: &str) -> Result<Self> {
        let (program, args) = split_command(command)?;
        Ok(Self {
            program,
            args,
            working_dir: None,
        })
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl UnitExecutor for CommandExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, ExecutorError> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env("PIPELINE_UNIT_ID", &request.unit_id)
            .env("PIPELINE_PHASE", &request.phase)
            .env("PIPELINE_ATTEMPT", request.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExecutorError::Failed(format!("failed to start {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = request.prompt;
            let unit = request.unit_id.clone();
            // Written from its own task so a chatty child cannot deadlock on a full pipe
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(%unit, error = %e, "Child closed stdin early");
                }
            });
        }

        let output = match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ExecutorError::Failed(format!("failed to wait on child: {e}"))),
            Err(_elapsed) => {
                warn!(unit = %request.unit_id, program = %self.program, "Child process timed out");
                return Err(ExecutorError::Timeout {
                    after_ms: request.timeout.as_millis() as u64,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(ExecutorOutput::success(stdout));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", self.program, output.status)
        } else {
            stderr.chars().take(MAX_STDERR_CHARS).collect()
        };
        Ok(ExecutorOutput {
            output: stdout,
            success: false,
            error: Some(message),
        })
    }
}

/// Succeeds immediately, reporting what it would have run
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl UnitExecutor for EchoExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutorOutput, ExecutorError> {
        Ok(ExecutorOutput::success(format!(
            "Decision: dry run of {} (attempt {})\nFinding: prompt of {} characters was not executed",
            request.unit_id,
            request.attempt,
            request.prompt.chars().count()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(unit: &str, timeout: Duration) -> ExecutionRequest {
        ExecutionRequest {
            unit_id: unit.into(),
            phase: "design".into(),
            attempt: 1,
            prompt: "# Task: hello".into(),
            timeout,
        }
    }

    #[test]
    fn test_split_command() {
        let (program, args) = split_command("sh -c 'echo \"hi there\"'").unwrap();
        assert_eq!(program, "sh");
        assert_eq!(args, vec!["-c", "echo \"hi there\""]);
        assert!(split_command("   ").is_err());
        assert!(split_command("sh -c 'unterminated").is_err());
    }

    #[tokio::test]
    async fn test_echo_executor_reports_prompt_size() {
        let output = EchoExecutor
            .execute(request("api", Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(output.success);
        assert!(output.output.contains("dry run of api"));
        assert!(output.output.contains("13 characters"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_pipes_prompt_and_env() {
        let executor = CommandExecutor::new("sh -c 'cat; echo; echo \"unit=$PIPELINE_UNIT_ID\"'").unwrap();
        let output = executor
            .execute(request("api", Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(output.success);
        assert!(output.output.contains("# Task: hello"));
        assert!(output.output.contains("unit=api"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_reports_stderr() {
        let executor = CommandExecutor::new("sh -c 'echo broken >&2; exit 3'").unwrap();
        let output = executor
            .execute(request("api", Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.error.as_deref(), Some("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_executor_times_out() {
        let executor = CommandExecutor::new("sleep 30").unwrap();
        let err = executor
            .execute(request("api", Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert_eq!(err, ExecutorError::Timeout { after_ms: 200 });
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let executor = CommandExecutor::new("definitely-not-a-real-program-4821").unwrap();
        let err = executor
            .execute(request("api", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(ref m) if m.contains("failed to start")));
    }
}
