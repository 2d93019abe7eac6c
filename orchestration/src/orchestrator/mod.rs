//! The Pipeline Orchestrator
//!
//! Runs phases in order, dispatches each phase's units in dependency order
//! and drives the phase's quality gate to a verdict before moving on.

pub mod config;
pub mod engine;
pub mod prompt;
pub mod result;

pub use config::{ClaimScope, OrchestratorConfig};
pub use engine::{Orchestrator, RunContext};
pub use prompt::{build_prompt, fetch_inputs, UpstreamInput};
pub use result::{Escalation, GateRecord, PipelineResult, PipelineStatus};
