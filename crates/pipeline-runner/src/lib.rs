//! Command-line runner for phase-gated agent pipelines
//!
//! Wires the orchestration engine to external processes: each work unit and
//! each quality assessment is a child process speaking stdin/stdout.

pub mod assessor;
pub mod executor;
pub mod report;

pub use assessor::{CommandAssessor, OverrideEscalations};
pub use executor::{split_command, CommandExecutor, EchoExecutor};
pub use report::{render_plan, render_summary};

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// `info` level.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
