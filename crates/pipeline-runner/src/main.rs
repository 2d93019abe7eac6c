use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use orchestration::{
    EmergencyTrigger, Orchestrator, PipelineFile, PipelineStatus, RunContext, RunSnapshot,
    SharedExecutor,
};
use pipeline_runner::{
    init_tracing, render_plan, render_summary, CommandAssessor, CommandExecutor, EchoExecutor,
    OverrideEscalations,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

/// Run phase-gated agent pipelines
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline file
    Run {
        /// Path to the pipeline TOML file
        pipeline: PathBuf,

        /// Command run once per unit; receives the prompt on stdin
        #[arg(long, conflicts_with = "dry_run")]
        command: Option<String>,

        /// Echo prompts instead of running anything
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Command scoring each phase; receives evidence JSON on stdin
        #[arg(long)]
        assessor_command: Option<String>,

        /// Map phases onto the reference gate progression
        #[arg(long, default_value_t = false)]
        reference_gates: bool,

        /// Override overridable escalations with this reason
        #[arg(long)]
        override_escalations: Option<String>,

        /// Write a run snapshot here (overrides the pipeline file)
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Working directory for unit commands
        #[arg(long)]
        workdir: Option<PathBuf>,

        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        output: OutputFormat,
    },

    /// Print the dispatch waves of every phase
    Plan { pipeline: PathBuf },

    /// Check a pipeline file without running it
    Validate { pipeline: PathBuf },

    /// Summarize a saved run snapshot
    Inspect { snapshot: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    match args.command {
        Command::Run {
            pipeline,
            command,
            dry_run,
            assessor_command,
            reference_gates,
            override_escalations,
            snapshot,
            workdir,
            output,
        } => {
            let mut file = PipelineFile::load(&pipeline)?;
            file.reference_gates |= reference_gates;
            let (definition, config, gates) = file.into_parts()?;
            let mut config = config.with_env_overrides();
            if let Some(path) = snapshot {
                config = config.with_snapshot_path(path);
            }

            let executor: SharedExecutor = match (command, dry_run) {
                (_, true) => Arc::new(EchoExecutor),
                (Some(command), false) => {
                    let mut executor = CommandExecutor::new(&command)?;
                    if let Some(dir) = workdir {
                        executor = executor.with_working_dir(dir);
                    }
                    Arc::new(executor)
                }
                (None, false) => bail!("either --command or --dry-run is required"),
            };

            let mut orchestrator = Orchestrator::new(config, gates, executor);
            if let Some(command) = assessor_command {
                orchestrator = orchestrator.with_assessor(Arc::new(CommandAssessor::new(&command)?));
            }
            if let Some(reason) = override_escalations {
                orchestrator = orchestrator.with_escalation_handler(Arc::new(OverrideEscalations::new(reason)));
            }

            let ctx = RunContext::new();
            let emergency = ctx.emergency.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, stopping dispatch");
                    emergency.raise(EmergencyTrigger::UserAbort);
                }
            });

            info!(pipeline = %definition.name, phases = definition.phases.len(), "Starting run");
            let result = orchestrator.execute_in(&definition, ctx).await?;

            match output {
                OutputFormat::Text => print!("{}", render_summary(&result)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }

            Ok(match result.status {
                PipelineStatus::Completed => ExitCode::SUCCESS,
                PipelineStatus::Escalated => ExitCode::from(2),
                PipelineStatus::Aborted => ExitCode::from(3),
            })
        }

        Command::Plan { pipeline } => {
            let (definition, _, _) = PipelineFile::load(&pipeline)?.into_parts()?;
            let graphs = definition.validate()?;
            print!("{}", render_plan(&definition, &graphs));
            Ok(ExitCode::SUCCESS)
        }

        Command::Validate { pipeline } => {
            let (definition, _, gates) = PipelineFile::load(&pipeline)?.into_parts()?;
            let units: usize = definition.phases.iter().map(|p| p.units.len()).sum();
            println!(
                "{}: {} phases, {} units, {} gates: ok",
                definition.name,
                definition.phases.len(),
                units,
                gates.len()
            );
            Ok(ExitCode::SUCCESS)
        }

        Command::Inspect { snapshot } => {
            let snapshot = RunSnapshot::load(&snapshot)
                .with_context(|| format!("reading snapshot {}", snapshot.display()))?;
            let state = &snapshot.state;
            println!(
                "Run {} of {} (saved {})",
                snapshot.run_id(),
                snapshot.pipeline.name,
                snapshot.saved_at
            );
            println!(
                "Current phase: {}",
                state.current_phase.as_deref().unwrap_or("none")
            );
            for phase in &snapshot.pipeline.phases {
                let stage = state
                    .gate_state(&phase.name)
                    .map_or_else(|| "not started".to_string(), |g| g.stage.to_string());
                let failed = state.failed_units(&phase.name);
                println!(
                    "  {:<16} {:<22} checkpoints {}  failed units: {}",
                    phase.name,
                    stage,
                    snapshot.checkpoints.history(&phase.name).len(),
                    if failed.is_empty() { "none".to_string() } else { failed.join(", ") }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
