//! Runner tests: pipeline files driven through the library and the binary.

use orchestration::{Orchestrator, PipelineFile, PipelineStatus, RunSnapshot};
use pipeline_runner::{render_summary, EchoExecutor, OverrideEscalations};
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

const PIPELINE: &str = r#"
name = "notes-service"

[orchestrator]
max_concurrency = 2

[[phases]]
name = "design"

[[phases.units]]
id = "api"
task = "Design the notes API"
output_domain = "architecture"

[[phases.units]]
id = "storage"
task = "Pick a storage layout"
depends_on = ["api"]

[[phases]]
name = "implementation"

[[phases.units]]
id = "handlers"
task = "Implement the handlers"
inputs = ["api"]

[gates.design]
min_composite = 0.8

[gates.implementation]
min_composite = 0.8
"#;

fn write_pipeline(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("pipeline.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn dry_run_completes_and_writes_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot_path = dir.path().join("snapshot.json");
    let file = PipelineFile::load(write_pipeline(dir.path(), PIPELINE)).unwrap();
    let (definition, config, gates) = file.into_parts().unwrap();

    let result = Orchestrator::new(
        config.with_snapshot_path(&snapshot_path),
        gates,
        Arc::new(EchoExecutor),
    )
    .execute(&definition)
    .await
    .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    let summary = render_summary(&result);
    assert!(summary.contains("notes-service"));
    assert!(summary.contains("completed"));
    assert!(summary.contains("design"));

    let snapshot = RunSnapshot::load(&snapshot_path).unwrap();
    assert_eq!(snapshot.run_id(), result.run_id);
}

#[tokio::test]
async fn unreachable_gate_is_overridden_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    let content = PIPELINE.replace(
        "[gates.implementation]\nmin_composite = 0.8",
        "[gates.implementation]\nmin_composite = 0.8\ncritical = [{ component = \"security\", min = 0.9 }]",
    );
    let (definition, config, gates) = PipelineFile::load(write_pipeline(dir.path(), &content))
        .unwrap()
        .into_parts()
        .unwrap();

    // Without an assessor no security score is ever reported
    let result = Orchestrator::new(config, gates, Arc::new(EchoExecutor))
        .with_escalation_handler(Arc::new(OverrideEscalations::new("manual sign-off")))
        .execute(&definition)
        .await
        .unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert_eq!(result.overrides.len(), 1);
    assert_eq!(result.overrides[0].phase, "implementation");
    assert!(render_summary(&result).contains("overridden: manual sign-off"));
}

#[test]
fn validate_command_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pipeline(dir.path(), PIPELINE);
    let output = Command::new(env!("CARGO_BIN_EXE_pipeline-runner"))
        .arg("validate")
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("notes-service: 2 phases, 3 units, 2 gates: ok"));
}

#[test]
fn plan_command_prints_waves() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pipeline(dir.path(), PIPELINE);
    let output = Command::new(env!("CARGO_BIN_EXE_pipeline-runner"))
        .arg("plan")
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("wave 1: api"));
    assert!(stdout.contains("wave 2: storage"));
}

#[test]
fn dry_run_command_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_pipeline(dir.path(), PIPELINE);
    let output = Command::new(env!("CARGO_BIN_EXE_pipeline-runner"))
        .args(["run", "--dry-run", "--output", "json"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["status"], "completed");
}

#[test]
fn cycle_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let content = PIPELINE.replace(
        "task = \"Design the notes API\"",
        "task = \"Design the notes API\"\ndepends_on = [\"storage\"]",
    );
    let path = write_pipeline(dir.path(), &content);
    let output = Command::new(env!("CARGO_BIN_EXE_pipeline-runner"))
        .arg("validate")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Cycle detected"));
}
