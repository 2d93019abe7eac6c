//! Pipeline Orchestrator
//!
//! ## Lifecycle
//!
//! ```text
//! execute(definition)
//!   → validate definition, gate table and settings (fail fast)
//!   → for each phase, in order:
//!       register units as pending
//!       loop:
//!         dispatch ready units (dependency order, bounded concurrency)
//!         loop:
//!           gather evidence → pre-gate checkpoint → evaluate → decide
//!           Advance        → checkpoint, next phase
//!           GatherEvidence → evaluate again
//!           Retry          → roll back, re-run implicated units with hints
//!           Escalate       → ask the escalation handler, else halt
//!   → PipelineResult
//! ```
//!
//! Only executor calls and storage I/O suspend. Execution state is owned by
//! the control loop; dispatched units only touch the progress store, the
//! claim coordinator and storage.

use super::config::{ClaimScope, OrchestratorConfig};
use super::prompt::{build_prompt, fetch_inputs};
use super::result::{Escalation, GateRecord, PipelineResult, PipelineStatus};
use crate::awareness::SituationalAwarenessBuilder;
use crate::checkpoint::{CheckpointKind, CheckpointStore};
use crate::claims::{FileClaimCoordinator, SharedClaimCoordinator};
use crate::collaborators::{
    EscalationResolution, ExecutionRequest, ExecutorOutput, HaltOnEscalation, InMemoryStorage,
    SharedAssessor, SharedEscalationHandler, SharedExecutor, SharedStorage,
};
use crate::definition::{ClaimOp, Phase, PipelineDefinition, UnitGraph, UnitId, WorkUnitSpec};
use crate::emergency::{EmergencyChannel, SharedEmergencyChannel};
use crate::error::{ExecutorError, OrchestrationError, OrchestrationResult, UnitFailure};
use crate::events::{PipelineEvent, SharedEventBus};
use crate::gate::{
    EscalationReason, EvidenceBundle, GateDecision, GateTable, GateTransitionError, PhaseEvidence,
    QualityGateEngine, UnitEvidence,
};
use crate::persistence::RunSnapshot;
use crate::progress::{OutputSummary, ProgressStore, SharedProgressStore, UnitStatus};
use crate::state::{ExecutionState, LogEntryKind, WorkUnitResult};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-run shared stores and emergency channel.
///
/// Each run gets its own instances; pass them in to observe or abort a run
/// from outside. A trigger raised on one run's channel never reaches another.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub progress: SharedProgressStore,
    pub claims: SharedClaimCoordinator,
    pub emergency: SharedEmergencyChannel,
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            progress: ProgressStore::shared(),
            claims: FileClaimCoordinator::shared(),
            emergency: EmergencyChannel::shared(),
        }
    }

    pub fn with_emergency_channel(mut self, channel: SharedEmergencyChannel) -> Self {
        self.emergency = channel;
        self
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable bookkeeping of one run, owned by the control loop
struct Run {
    state: ExecutionState,
    checkpoints: CheckpointStore,
    gate_history: Vec<GateRecord>,
    overrides: Vec<Escalation>,
    escalation: Option<Escalation>,
    started: Instant,
}

impl Run {
    fn run_id(&self) -> &str {
        &self.state.run_id
    }
}

/// How a phase ended
enum PhaseOutcome {
    Passed,
    Halted(PipelineStatus),
}

/// Why dispatching stopped early
enum Halt {
    Emergency(String),
    Critical { unit: UnitId, failure: UnitFailure },
}

impl Halt {
    fn reason(&self) -> String {
        match self {
            Self::Emergency(trigger) => format!("emergency: {trigger}"),
            Self::Critical { unit, .. } => format!("critical unit '{unit}' failed"),
        }
    }
}

/// Everything a dispatched unit needs, cloned into its task
#[derive(Clone)]
struct UnitTask {
    run_id: String,
    phase: String,
    executor: SharedExecutor,
    storage: SharedStorage,
    progress: SharedProgressStore,
    claims: SharedClaimCoordinator,
    awareness: SituationalAwarenessBuilder,
    events: Option<SharedEventBus>,
    domains: Arc<HashMap<UnitId, String>>,
    remediation: Arc<Vec<String>>,
    timeout: Duration,
    max_input_chars: usize,
}

impl UnitTask {
    async fn run(self, unit: WorkUnitSpec, attempt: u32, _permit: OwnedSemaphorePermit) -> WorkUnitResult {
        let started = Instant::now();
        // Storage reads and the executor call share one timeout budget
        let deadline = tokio::time::Instant::now() + self.timeout;

        if let Err(e) = self.progress.mark_active(&unit.id) {
            warn!(unit = %unit.id, error = %e, "Progress update rejected");
        }
        for file in &unit.files {
            self.claims.claim(&file.path, &unit.id, file.op, &self.phase);
        }

        let fetched = tokio::time::timeout_at(
            deadline,
            fetch_inputs(
                self.storage.as_ref(),
                &unit,
                &self.domains,
                self.max_input_chars,
            ),
        )
        .await;
        let inputs = match fetched {
            Ok(Ok(inputs)) => inputs,
            Err(_elapsed) => {
                warn!(unit = %unit.id, "Timed out reading upstream inputs");
                let failure = UnitFailure::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                };
                return self.fail(&unit, attempt, failure, started, None);
            }
            Ok(Err(e)) => {
                let failure = UnitFailure::ContractViolation {
                    unit: unit.id.clone(),
                    phase: self.phase.clone(),
                    attempt,
                    detail: format!("storage returned malformed data: {e}"),
                };
                return self.fail(&unit, attempt, failure, started, None);
            }
        };

        let briefing = self.awareness.build_now(&unit.id, &self.phase);
        let prompt = build_prompt(
            &unit,
            &self.phase,
            attempt,
            &briefing,
            &inputs,
            &self.remediation,
        );

        if let Some(bus) = &self.events {
            bus.publish(PipelineEvent::UnitDispatched {
                run_id: self.run_id.clone(),
                phase: self.phase.clone(),
                unit_id: unit.id.clone(),
                attempt,
                timestamp: Utc::now(),
            });
        }
        debug!(unit = %unit.id, phase = %self.phase, attempt, prompt_len = prompt.len(), "Dispatching unit");

        let request = ExecutionRequest {
            unit_id: unit.id.clone(),
            phase: self.phase.clone(),
            attempt,
            prompt,
            timeout: deadline.saturating_duration_since(tokio::time::Instant::now()),
        };

        // Run the executor in its own task so a panic is contained to this unit
        let executor = self.executor.clone();
        let mut handle = tokio::spawn(async move { executor.execute(request).await });
        let outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ExecutorError::Failed(format!(
                "executor task failed: {join_err}"
            ))),
            Err(_elapsed) => {
                handle.abort();
                warn!(
                    unit = %unit.id,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Unit exceeded timeout"
                );
                Err(ExecutorError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        match outcome {
            Ok(output) => self.complete(&unit, attempt, output, started).await,
            Err(ExecutorError::Timeout { after_ms }) => {
                self.fail(&unit, attempt, UnitFailure::Timeout { after_ms }, started, None)
            }
            Err(e) => {
                let failure = UnitFailure::Executor {
                    message: e.to_string(),
                };
                self.fail(&unit, attempt, failure, started, None)
            }
        }
    }

    async fn complete(
        &self,
        unit: &WorkUnitSpec,
        attempt: u32,
        output: ExecutorOutput,
        started: Instant,
    ) -> WorkUnitResult {
        let violation = |detail: &str| UnitFailure::ContractViolation {
            unit: unit.id.clone(),
            phase: self.phase.clone(),
            attempt,
            detail: detail.to_string(),
        };

        if !output.success {
            let failure = match output.error.as_deref().map(str::trim) {
                Some(message) if !message.is_empty() => UnitFailure::Executor {
                    message: message.to_string(),
                },
                _ => violation("executor reported failure without an error"),
            };
            return self.fail(unit, attempt, failure, started, Some(output.output));
        }
        if output.output.trim().is_empty() {
            return self.fail(
                unit,
                attempt,
                violation("executor reported success with empty output"),
                started,
                None,
            );
        }

        let summary = OutputSummary::extract(&output.output);
        for path in &summary.files() {
            self.claims.claim(path, &unit.id, ClaimOp::Write, &self.phase);
        }
        if let Err(e) = self.progress.mark_completed(&unit.id, summary) {
            warn!(unit = %unit.id, error = %e, "Progress update rejected");
        }

        if let Some(domain) = &unit.output_domain {
            if let Err(e) = self.storage.put(domain, &unit.id, &output.output).await {
                warn!(unit = %unit.id, %domain, error = %e, "Failed to store unit output");
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(unit = %unit.id, phase = %self.phase, attempt, duration_ms, "Unit completed");
        WorkUnitResult::succeeded(&unit.id, &self.phase, attempt, output.output, duration_ms)
    }

    fn fail(
        &self,
        unit: &WorkUnitSpec,
        attempt: u32,
        failure: UnitFailure,
        started: Instant,
        partial_output: Option<String>,
    ) -> WorkUnitResult {
        warn!(unit = %unit.id, phase = %self.phase, attempt, error = %failure, "Unit failed");
        if let Err(e) = self.progress.mark_failed(&unit.id, failure.to_string()) {
            warn!(unit = %unit.id, error = %e, "Progress update rejected");
        }
        let duration_ms = started.elapsed().as_millis() as u64;
        let result = WorkUnitResult::failed(&unit.id, &self.phase, attempt, failure, duration_ms);
        match partial_output {
            Some(output) => result.with_output(output),
            None => result,
        }
    }
}

/// Top-level pipeline scheduler
pub struct Orchestrator {
    config: OrchestratorConfig,
    gates: QualityGateEngine,
    executor: SharedExecutor,
    storage: SharedStorage,
    assessor: Option<SharedAssessor>,
    escalation_handler: SharedEscalationHandler,
    events: Option<SharedEventBus>,
}

impl Orchestrator {
    /// Create an orchestrator with in-memory storage, no assessor and an
    /// escalation handler that never overrides
    pub fn new(config: OrchestratorConfig, gate_table: GateTable, executor: SharedExecutor) -> Self {
        let gates = QualityGateEngine::new(gate_table, config.gate_policy());
        Self {
            config,
            gates,
            executor,
            storage: InMemoryStorage::shared(),
            assessor: None,
            escalation_handler: Arc::new(HaltOnEscalation),
            events: None,
        }
    }

    pub fn with_storage(mut self, storage: SharedStorage) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_assessor(mut self, assessor: SharedAssessor) -> Self {
        self.assessor = Some(assessor);
        self
    }

    pub fn with_escalation_handler(mut self, handler: SharedEscalationHandler) -> Self {
        self.escalation_handler = handler;
        self
    }

    pub fn with_event_bus(mut self, bus: SharedEventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a pipeline with fresh per-run stores and emergency channel
    pub async fn execute(
        &self,
        definition: &PipelineDefinition,
    ) -> OrchestrationResult<PipelineResult> {
        self.execute_in(definition, RunContext::new()).await
    }

    /// Run a pipeline against caller-provided stores, cleared first.
    ///
    /// A trigger already raised on `ctx.emergency` stops the run before any
    /// unit is dispatched.
    pub async fn execute_in(
        &self,
        definition: &PipelineDefinition,
        ctx: RunContext,
    ) -> OrchestrationResult<PipelineResult> {
        self.config.validate()?;
        let graphs = definition.validate()?;
        self.gates.table().covers(definition)?;

        ctx.progress.clear();
        ctx.claims.clear();

        let domains: Arc<HashMap<UnitId, String>> = Arc::new(
            definition
                .phases
                .iter()
                .flat_map(|p| &p.units)
                .filter_map(|u| u.output_domain.clone().map(|d| (u.id.clone(), d)))
                .collect(),
        );

        let mut run = Run {
            state: ExecutionState::new(Uuid::new_v4().to_string()),
            checkpoints: CheckpointStore::new(),
            gate_history: Vec::new(),
            overrides: Vec::new(),
            escalation: None,
            started: Instant::now(),
        };

        info!(
            run_id = %run.run_id(),
            pipeline = %definition.name,
            phases = definition.phases.len(),
            "Pipeline run started"
        );
        self.publish(PipelineEvent::RunStarted {
            run_id: run.run_id().to_string(),
            pipeline: definition.name.clone(),
            phases: definition.phases.len(),
            timestamp: Utc::now(),
        });

        let mut status = PipelineStatus::Completed;
        for (idx, (phase, graph)) in definition.phases.iter().zip(&graphs).enumerate() {
            if idx > 0 {
                let predecessor = &definition.phases[idx - 1].name;
                let passed = run
                    .state
                    .gate_state(predecessor)
                    .is_some_and(|g| g.is_passed());
                if !passed {
                    return Err(OrchestrationError::PhaseOrdering {
                        phase: phase.name.clone(),
                        predecessor: predecessor.clone(),
                    });
                }
            }

            let outcome = self
                .run_phase(&mut run, phase, graph, &ctx, &domains)
                .await?;
            self.persist(definition, &run, &ctx);
            if let PhaseOutcome::Halted(halted) = outcome {
                status = halted;
                break;
            }
        }

        run.state.metrics.elapsed_ms = run.started.elapsed().as_millis() as u64;
        info!(
            run_id = %run.run_id(),
            %status,
            elapsed_ms = run.state.metrics.elapsed_ms,
            retries = run.state.metrics.total_retries,
            "Pipeline run finished"
        );
        self.publish(PipelineEvent::RunFinished {
            run_id: run.run_id().to_string(),
            status,
            elapsed_ms: run.state.metrics.elapsed_ms,
            timestamp: Utc::now(),
        });
        self.persist(definition, &run, &ctx);

        Ok(PipelineResult {
            run_id: run.state.run_id.clone(),
            pipeline: definition.name.clone(),
            status,
            gate_history: run.gate_history,
            escalation: run.escalation,
            overrides: run.overrides,
            metrics: run.state.metrics.clone(),
            progress: ctx.progress.snapshot(),
            checkpoints: run.checkpoints,
            state: run.state,
        })
    }

    async fn run_phase(
        &self,
        run: &mut Run,
        phase: &Phase,
        graph: &UnitGraph,
        ctx: &RunContext,
        domains: &Arc<HashMap<UnitId, String>>,
    ) -> OrchestrationResult<PhaseOutcome> {
        let name = phase.name.as_str();
        run.state.current_phase = Some(name.to_string());
        run.state.gate_state_mut(name);

        info!(run_id = %run.run_id(), phase = name, units = phase.units.len(), "Phase started");
        let mut attempt: u32 = 1;
        let mut to_run = phase.unit_ids();
        let mut remediation: Arc<Vec<String>> = Arc::new(Vec::new());
        self.phase_started(run, phase, attempt, to_run.clone());

        loop {
            let halt = self
                .dispatch(run, phase, graph, ctx, domains, &to_run, remediation.clone())
                .await;

            if let Some(Halt::Critical { unit, failure }) = halt {
                let reason = EscalationReason::CriticalUnitFailed {
                    unit,
                    error: failure.to_string(),
                };
                run.state
                    .gate_state_mut(name)
                    .escalate(reason.clone())
                    .map_err(gate_error)?;
                let escalation = self.escalate(run, name, reason);
                run.escalation = Some(escalation);
                return Ok(PhaseOutcome::Halted(PipelineStatus::Aborted));
            }

            loop {
                let bundle = self.gather_evidence(phase, attempt, &run.state, ctx).await;

                let storage_snapshot = match self.storage.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(phase = name, error = %e, "Storage snapshot failed; checkpoint holds execution state only");
                        None
                    }
                };
                let checkpoint_id = run.checkpoints.save(
                    name,
                    CheckpointKind::PreGate,
                    attempt,
                    &run.state,
                    storage_snapshot,
                );
                self.checkpoint_saved(run, name, checkpoint_id);

                let verdict = self.gates.evaluate(&bundle, run.state.retry_count(name))?;
                run.state.metrics.gate_evaluations += 1;
                let outcome = verdict.outcome;
                let composite = verdict.composite;
                let decision = self
                    .gates
                    .decide(run.state.gate_state_mut(name), verdict.clone())
                    .map_err(gate_error)?;

                run.state.log.append(
                    name,
                    LogEntryKind::GateEvaluated {
                        outcome: outcome.to_string(),
                        composite: composite.unwrap_or(0.0),
                    },
                );
                run.gate_history.push(GateRecord {
                    phase: name.to_string(),
                    verdict,
                    decision: decision.clone(),
                    override_reason: None,
                    recorded_at: Utc::now(),
                });
                self.publish(PipelineEvent::GateEvaluated {
                    run_id: run.run_id().to_string(),
                    phase: name.to_string(),
                    outcome,
                    composite,
                    decision: decision.clone(),
                    timestamp: Utc::now(),
                });

                match decision {
                    GateDecision::Advance => {
                        let id = run.checkpoints.save(
                            name,
                            CheckpointKind::PhasePassed,
                            attempt,
                            &run.state,
                            None,
                        );
                        self.checkpoint_saved(run, name, id);
                        self.phase_advanced(run, name, false, ctx);
                        return Ok(PhaseOutcome::Passed);
                    }
                    GateDecision::GatherEvidence { pass } => {
                        run.state.metrics.evidence_passes += 1;
                        debug!(phase = name, pass, "Re-gathering evidence");
                    }
                    GateDecision::Retry { retry, units, hints } => {
                        run.state.metrics.total_retries += 1;
                        self.roll_back(run, name, retry).await;
                        attempt = retry + 1;
                        to_run = units;
                        remediation = Arc::new(hints);
                        self.phase_started(run, phase, attempt, to_run.clone());
                        break;
                    }
                    GateDecision::Escalate { reason } => {
                        let escalation = self.escalate(run, name, reason);
                        if escalation.is_overridable() {
                            if let EscalationResolution::Override { reason: why } =
                                self.escalation_handler.resolve(&escalation).await
                            {
                                run.state
                                    .gate_state_mut(name)
                                    .record_override(why.clone())
                                    .map_err(gate_error)?;
                                if let Some(record) = run.gate_history.last_mut() {
                                    record.override_reason = Some(why.clone());
                                }
                                warn!(phase = name, reason = %why, "Escalation overridden");
                                let id = run.checkpoints.save(
                                    name,
                                    CheckpointKind::Overridden,
                                    attempt,
                                    &run.state,
                                    None,
                                );
                                self.checkpoint_saved(run, name, id);
                                run.overrides.push(escalation);
                                self.phase_advanced(run, name, true, ctx);
                                return Ok(PhaseOutcome::Passed);
                            }
                        }
                        run.escalation = Some(escalation);
                        return Ok(PhaseOutcome::Halted(PipelineStatus::Escalated));
                    }
                }
            }
        }
    }

    /// Dispatch `units` of `phase` in dependency order with bounded concurrency.
    ///
    /// Returns why dispatching stopped early, if it did. In-flight units always
    /// run to completion or timeout.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        run: &mut Run,
        phase: &Phase,
        graph: &UnitGraph,
        ctx: &RunContext,
        domains: &Arc<HashMap<UnitId, String>>,
        units: &[UnitId],
        remediation: Arc<Vec<String>>,
    ) -> Option<Halt> {
        let selected: HashSet<&str> = units.iter().map(String::as_str).collect();
        let mut pending: Vec<UnitId> = graph
            .topological_order()
            .into_iter()
            .filter(|id| selected.contains(id.as_str()))
            .collect();
        let mut attempts: HashMap<UnitId, u32> = HashMap::new();
        for id in &pending {
            let attempt = ctx.progress.get(id).map_or(1, |r| {
                if r.status == UnitStatus::Pending {
                    r.attempt
                } else {
                    r.attempt + 1
                }
            });
            if let Err(e) = ctx.progress.register(id, &phase.name, attempt) {
                warn!(unit = %id, error = %e, "Progress registration rejected");
            }
            attempts.insert(id.clone(), attempt);
        }

        let task = UnitTask {
            run_id: run.run_id().to_string(),
            phase: phase.name.clone(),
            executor: self.executor.clone(),
            storage: self.storage.clone(),
            progress: ctx.progress.clone(),
            claims: ctx.claims.clone(),
            awareness: SituationalAwarenessBuilder::new(ctx.progress.clone(), ctx.claims.clone()),
            events: self.events.clone(),
            domains: domains.clone(),
            remediation,
            timeout: self.config.unit_timeout(),
            max_input_chars: self.config.max_input_chars,
        };

        let slots = Arc::new(Semaphore::new(self.config.max_concurrency));
        let stop: CancellationToken = ctx.emergency.token();
        let mut in_flight: HashSet<UnitId> = HashSet::new();
        let mut join_set: JoinSet<WorkUnitResult> = JoinSet::new();
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() {
                if let Some(trigger) = ctx.emergency.triggered() {
                    warn!(phase = %phase.name, %trigger, "Emergency: no further units will be dispatched");
                    halt = Some(Halt::Emergency(trigger.to_string()));
                }
            }

            if halt.is_none() {
                // Settle units whose dependencies failed, then start what is ready
                let mut i = 0;
                while i < pending.len() {
                    let id = pending[i].clone();
                    let deps = graph.dependencies(&id);
                    let unresolved = |d: &str| in_flight.contains(d) || pending.iter().any(|p| p == d);
                    if let Some(dep) = deps
                        .iter()
                        .find(|d| !unresolved(d.as_str()) && dependency_failed(run, d))
                    {
                        pending.remove(i);
                        let failure = UnitFailure::DependencyFailed {
                            dependency: dep.clone(),
                        };
                        self.record_skipped(run, ctx, &phase.name, &id, attempts[&id], failure.clone());
                        if phase.unit(&id).is_some_and(|u| u.critical) {
                            warn!(phase = %phase.name, unit = %id, "Critical unit lost a dependency; halting dispatch");
                            stop.cancel();
                            halt = Some(Halt::Critical { unit: id, failure });
                            break;
                        }
                        i = 0;
                        continue;
                    }
                    let ready = deps
                        .iter()
                        .all(|d| !unresolved(d.as_str()) && dependency_succeeded(run, d));
                    if ready {
                        let Ok(permit) = slots.clone().try_acquire_owned() else {
                            break;
                        };
                        pending.remove(i);
                        let Some(spec) = phase.unit(&id).cloned() else {
                            continue;
                        };
                        let attempt = attempts[&id];
                        run.state.metrics.units_dispatched += 1;
                        in_flight.insert(id);
                        join_set.spawn(task.clone().run(spec, attempt, permit));
                        continue;
                    }
                    i += 1;
                }
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok(result)) => {
                            in_flight.remove(&result.unit_id);
                            let critical = !result.success
                                && phase.unit(&result.unit_id).is_some_and(|u| u.critical);
                            if critical && halt.is_none() {
                                let failure = result.error.clone().unwrap_or(UnitFailure::Executor {
                                    message: "unknown failure".into(),
                                });
                                warn!(phase = %phase.name, unit = %result.unit_id, "Critical unit failed; halting dispatch");
                                stop.cancel();
                                halt = Some(Halt::Critical {
                                    unit: result.unit_id.clone(),
                                    failure,
                                });
                            }
                            self.record(run, result);
                        }
                        Some(Err(e)) => warn!(phase = %phase.name, error = %e, "Unit task failed to join"),
                        None => {}
                    }
                }
                _ = stop.cancelled(), if halt.is_none() => {}
            }
        }

        // Anything still in flight here lost its task
        for id in in_flight.drain() {
            let failure = UnitFailure::Executor {
                message: "unit task ended without a result".into(),
            };
            let result = WorkUnitResult::failed(&id, &phase.name, attempts[&id], failure, 0);
            self.record(run, result);
        }

        if let Some(halt) = &halt {
            let reason = halt.reason();
            for id in pending.drain(..) {
                let failure = UnitFailure::NotDispatched {
                    reason: reason.clone(),
                };
                self.record_skipped(run, ctx, &phase.name, &id, attempts[&id], failure);
            }
        } else {
            for id in pending.drain(..) {
                let failure = UnitFailure::NotDispatched {
                    reason: "dependencies never resolved".into(),
                };
                self.record_skipped(run, ctx, &phase.name, &id, attempts[&id], failure);
            }
        }

        halt
    }

    fn record(&self, run: &mut Run, result: WorkUnitResult) {
        self.publish(PipelineEvent::UnitFinished {
            run_id: run.run_id().to_string(),
            phase: result.phase.clone(),
            unit_id: result.unit_id.clone(),
            success: result.success,
            duration_ms: result.duration_ms,
            timestamp: Utc::now(),
        });
        run.state.record(result);
    }

    fn record_skipped(
        &self,
        run: &mut Run,
        ctx: &RunContext,
        phase: &str,
        unit: &str,
        attempt: u32,
        failure: UnitFailure,
    ) {
        debug!(phase, unit, reason = %failure, "Unit not dispatched");
        if let Err(e) = ctx.progress.mark_failed(unit, failure.to_string()) {
            warn!(unit, error = %e, "Progress update rejected");
        }
        self.record(run, WorkUnitResult::failed(unit, phase, attempt, failure, 0));
    }

    async fn gather_evidence(
        &self,
        phase: &Phase,
        attempt: u32,
        state: &ExecutionState,
        ctx: &RunContext,
    ) -> EvidenceBundle {
        let units = phase
            .units
            .iter()
            .map(|u| match state.result(&u.id) {
                Some(result) => UnitEvidence::from_result(
                    result,
                    ctx.progress.get(&u.id).and_then(|r| r.summary),
                ),
                None => UnitEvidence::missing(&u.id),
            })
            .collect();
        let evidence = PhaseEvidence {
            phase: phase.name.clone(),
            attempt,
            units,
        };

        let emergency = ctx.emergency.triggered();
        if emergency.is_some() {
            return EvidenceBundle::derived(evidence).with_emergency(emergency);
        }

        let Some(assessor) = &self.assessor else {
            return EvidenceBundle::derived(evidence);
        };
        let timeout = self.config.assessor_timeout();
        match tokio::time::timeout(timeout, assessor.assess(&evidence)).await {
            Ok(Ok(assessment)) => EvidenceBundle::external(evidence, assessment),
            Ok(Err(e)) => {
                warn!(phase = %phase.name, error = %e, "Quality assessor failed");
                EvidenceBundle::unavailable(evidence, e.to_string())
            }
            Err(_elapsed) => {
                warn!(
                    phase = %phase.name,
                    timeout_secs = timeout.as_secs(),
                    "Quality assessor timed out"
                );
                EvidenceBundle::unavailable(
                    evidence,
                    format!("assessor timed out after {}s", timeout.as_secs()),
                )
            }
        }
    }

    async fn roll_back(&self, run: &mut Run, phase: &str, retry: u32) {
        let checkpoint = match run.checkpoints.restore_latest(phase) {
            Ok(checkpoint) => checkpoint.clone(),
            Err(e) => {
                warn!(phase, error = %e, "Nothing to roll back to");
                return;
            }
        };
        run.state.restore_from(&checkpoint.state);
        if let Some(snapshot) = &checkpoint.storage {
            if let Err(e) = self.storage.restore(snapshot).await {
                warn!(phase, error = %e, "Storage rollback failed");
            }
        }
        info!(phase, retry, checkpoint_id = %checkpoint.id, "Rolled back to checkpoint");
        run.state.log.append(
            phase,
            LogEntryKind::RolledBack {
                checkpoint_id: checkpoint.id.clone(),
                retry,
            },
        );
        self.publish(PipelineEvent::RolledBack {
            run_id: run.run_id().to_string(),
            phase: phase.to_string(),
            checkpoint_id: checkpoint.id,
            retry,
            timestamp: Utc::now(),
        });
    }

    fn escalate(&self, run: &mut Run, phase: &str, reason: EscalationReason) -> Escalation {
        let gate = run.state.gate_state(phase);
        let verdicts = gate.map(|g| g.verdicts.clone()).unwrap_or_default();
        let remediation = verdicts
            .last()
            .map(|v| v.remediation.clone())
            .unwrap_or_default();
        warn!(run_id = %run.run_id(), phase, %reason, "Phase escalated");
        run.state.log.append(
            phase,
            LogEntryKind::Escalated {
                reason: reason.to_string(),
            },
        );
        self.publish(PipelineEvent::Escalated {
            run_id: run.run_id().to_string(),
            phase: phase.to_string(),
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        Escalation {
            run_id: run.run_id().to_string(),
            phase: phase.to_string(),
            reason,
            verdicts,
            failed_units: run.state.failed_units(phase),
            remediation,
            escalated_at: Utc::now(),
        }
    }

    fn phase_started(&self, run: &mut Run, phase: &Phase, attempt: u32, units: Vec<UnitId>) {
        run.state
            .log
            .append(&phase.name, LogEntryKind::PhaseStarted { attempt });
        self.publish(PipelineEvent::PhaseStarted {
            run_id: run.run_id().to_string(),
            phase: phase.name.clone(),
            attempt,
            units,
            timestamp: Utc::now(),
        });
    }

    fn phase_advanced(&self, run: &mut Run, phase: &str, overridden: bool, ctx: &RunContext) {
        if self.config.claim_scope == ClaimScope::Phase {
            let cleared = ctx.claims.clear_phase(phase);
            debug!(phase, cleared, "Cleared phase file claims");
        }
        info!(run_id = %run.run_id(), phase, overridden, "Phase advanced");
        run.state
            .log
            .append(phase, LogEntryKind::PhaseAdvanced { overridden });
        self.publish(PipelineEvent::PhaseAdvanced {
            run_id: run.run_id().to_string(),
            phase: phase.to_string(),
            overridden,
            timestamp: Utc::now(),
        });
    }

    fn checkpoint_saved(&self, run: &mut Run, phase: &str, checkpoint_id: String) {
        run.state.log.append(
            phase,
            LogEntryKind::CheckpointSaved {
                checkpoint_id: checkpoint_id.clone(),
            },
        );
        self.publish(PipelineEvent::CheckpointSaved {
            run_id: run.run_id().to_string(),
            phase: phase.to_string(),
            checkpoint_id,
            timestamp: Utc::now(),
        });
    }

    fn persist(&self, definition: &PipelineDefinition, run: &Run, ctx: &RunContext) {
        let Some(path) = &self.config.snapshot_path else {
            return;
        };
        let snapshot = RunSnapshot::capture(
            definition,
            &run.state,
            &run.checkpoints,
            ctx.progress.snapshot(),
        );
        if let Err(e) = snapshot.save(path) {
            warn!(path = %path.display(), error = %e, "Failed to persist run snapshot");
        }
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

fn dependency_failed(run: &Run, dep: &str) -> bool {
    run.state.result(dep).is_some_and(|r| !r.success)
}

fn dependency_succeeded(run: &Run, dep: &str) -> bool {
    run.state.result(dep).is_some_and(|r| r.success)
}

fn gate_error(e: GateTransitionError) -> OrchestrationError {
    let phase = match &e {
        GateTransitionError::Illegal { phase, .. } | GateTransitionError::NotOverridable { phase, .. } => {
            phase.clone()
        }
    };
    OrchestrationError::GateState {
        phase,
        message: e.to_string(),
    }
}
