//! Pipeline Orchestration Engine
//!
//! Runs multi-phase work pipelines made of work units executed by external
//! agents. The engine provides:
//! - Phase-ordered scheduling with quality gates at every phase boundary
//! - Dependency-aware, bounded-concurrency dispatch inside a phase
//! - Remediated retries, escalation and explicit overrides
//! - Checkpoints and rollback of execution state and storage
//! - Shared progress, file claims and peer briefings for concurrent units
//!
//! # Usage
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use orchestration::{ExecutionRequest, ExecutorError, ExecutorOutput, UnitExecutor};
//! use orchestration::{GateTable, Orchestrator, OrchestratorConfig, Phase, PipelineDefinition, WorkUnitSpec};
//!
//! # struct Agent;
//! # #[async_trait::async_trait]
//! # impl UnitExecutor for Agent {
//! #     async fn execute(&self, _: ExecutionRequest) -> Result<ExecutorOutput, ExecutorError> {
//! #         Ok(ExecutorOutput::success("done"))
//! #     }
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = PipelineDefinition::new("service").with_phase(
//!     Phase::new("design")
//!         .with_unit(WorkUnitSpec::new("api", "Design the API"))
//!         .with_unit(WorkUnitSpec::new("schema", "Design the schema").depends_on("api")),
//! );
//! let gates = GateTable::uniform(["design"], 0.8);
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), gates, Arc::new(Agent));
//! let result = orchestrator.execute(&pipeline).await?;
//! println!("{}", result.status);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod awareness;
pub mod checkpoint;
pub mod claims;
pub mod collaborators;
pub mod config;
pub mod definition;
pub mod emergency;
pub mod error;
pub mod events;
pub mod gate;
pub mod orchestrator;
pub mod persistence;
pub mod progress;
pub mod state;

pub use awareness::SituationalAwarenessBuilder;
pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
pub use claims::{FileClaim, FileClaimCoordinator, SharedClaimCoordinator};
pub use collaborators::{
    ArtifactStorage, EscalationHandler, EscalationResolution, ExecutionRequest, ExecutorOutput,
    HaltOnEscalation, InMemoryStorage, QualityAssessor, SharedAssessor, SharedEscalationHandler,
    SharedExecutor, SharedStorage, UnitExecutor,
};
pub use config::PipelineFile;
pub use definition::{
    ClaimOp, FileIntent, Phase, PhaseName, PipelineDefinition, UnitGraph, UnitId, WorkUnitSpec,
};
pub use emergency::{EmergencyChannel, EmergencyTrigger, SharedEmergencyChannel};
pub use error::{
    AssessorError, DefinitionError, ExecutorError, OrchestrationError, OrchestrationResult,
    PersistenceError, StorageError, UnitFailure,
};
pub use events::{EventBus, EventFilter, PipelineEvent, SharedEventBus};
pub use gate::{
    Assessment, EscalationReason, GateDecision, GatePolicy, GateTable, GateVerdict,
    PhaseGateConfig, QualityComponent, QualityGateEngine, VerdictOutcome,
};
pub use orchestrator::{
    ClaimScope, Escalation, GateRecord, Orchestrator, OrchestratorConfig, PipelineResult,
    PipelineStatus, RunContext,
};
pub use persistence::RunSnapshot;
pub use progress::{OutputSummary, ProgressRecord, ProgressStore, SharedProgressStore, UnitStatus};
pub use state::{ExecutionState, RunMetrics, WorkUnitResult};
