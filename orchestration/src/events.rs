//! Pipeline event bus
//!
//! Broadcasts lifecycle events of a run (phase starts, dispatches, verdicts,
//! checkpoints, escalations) to any number of observers over a Tokio
//! broadcast channel. Publishing never blocks the orchestrator; events sent
//! while nobody listens are dropped.

use crate::definition::{PhaseName, UnitId};
use crate::gate::{EscalationReason, GateDecision, VerdictOutcome};
use crate::orchestrator::result::PipelineStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Something that happened during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: String,
        pipeline: String,
        phases: usize,
        timestamp: DateTime<Utc>,
    },
    PhaseStarted {
        run_id: String,
        phase: PhaseName,
        attempt: u32,
        units: Vec<UnitId>,
        timestamp: DateTime<Utc>,
    },
    UnitDispatched {
        run_id: String,
        phase: PhaseName,
        unit_id: UnitId,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    UnitFinished {
        run_id: String,
        phase: PhaseName,
        unit_id: UnitId,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    GateEvaluated {
        run_id: String,
        phase: PhaseName,
        outcome: VerdictOutcome,
        composite: Option<f64>,
        decision: GateDecision,
        timestamp: DateTime<Utc>,
    },
    CheckpointSaved {
        run_id: String,
        phase: PhaseName,
        checkpoint_id: String,
        timestamp: DateTime<Utc>,
    },
    RolledBack {
        run_id: String,
        phase: PhaseName,
        checkpoint_id: String,
        retry: u32,
        timestamp: DateTime<Utc>,
    },
    PhaseAdvanced {
        run_id: String,
        phase: PhaseName,
        overridden: bool,
        timestamp: DateTime<Utc>,
    },
    Escalated {
        run_id: String,
        phase: PhaseName,
        reason: EscalationReason,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: String,
        status: PipelineStatus,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Stable snake_case name of the event
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseStarted { .. } => "phase_started",
            Self::UnitDispatched { .. } => "unit_dispatched",
            Self::UnitFinished { .. } => "unit_finished",
            Self::GateEvaluated { .. } => "gate_evaluated",
            Self::CheckpointSaved { .. } => "checkpoint_saved",
            Self::RolledBack { .. } => "rolled_back",
            Self::PhaseAdvanced { .. } => "phase_advanced",
            Self::Escalated { .. } => "escalated",
            Self::RunFinished { .. } => "run_finished",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseStarted { run_id, .. }
            | Self::UnitDispatched { run_id, .. }
            | Self::UnitFinished { run_id, .. }
            | Self::GateEvaluated { run_id, .. }
            | Self::CheckpointSaved { run_id, .. }
            | Self::RolledBack { run_id, .. }
            | Self::PhaseAdvanced { run_id, .. }
            | Self::Escalated { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }

    /// Phase the event belongs to, if any
    pub fn phase(&self) -> Option<&str> {
        match self {
            Self::PhaseStarted { phase, .. }
            | Self::UnitDispatched { phase, .. }
            | Self::UnitFinished { phase, .. }
            | Self::GateEvaluated { phase, .. }
            | Self::CheckpointSaved { phase, .. }
            | Self::RolledBack { phase, .. }
            | Self::PhaseAdvanced { phase, .. }
            | Self::Escalated { phase, .. } => Some(phase),
            Self::RunStarted { .. } | Self::RunFinished { .. } => None,
        }
    }
}

/// Shared reference to an EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus for pipeline events
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: PipelineEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events matching `filter`
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Event filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<String>,
    pub phase: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    /// Matches every event
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &PipelineEvent) -> bool {
        if let Some(ref run_id) = self.run_id {
            if event.run_id() != run_id {
                return false;
            }
        }

        // Run-level events carry no phase and pass a phase filter
        if let (Some(phase), Some(event_phase)) = (&self.phase, event.phase()) {
            if event_phase != phase {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Receiver that only yields events matching its filter
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<PipelineEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<PipelineEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching event
    pub async fn recv(&mut self) -> Result<PipelineEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
