//! System-wide event set and broadcast fan-out.
//!
//! Every component emits typed events instead of calling into its peers;
//! subscribers (the monitor, the learning pipeline, external dashboards)
//! receive them over a `tokio::sync::broadcast` channel. Senders never
//! block and never fail the emitting operation: an event with no
//! subscribers is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted across the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// An execution was created and phase 0 entered.
    ExecutionStarted { execution_id: Uuid, project: String },
    /// An execution reached a terminal status.
    ExecutionFinished { execution_id: Uuid, status: String },
    /// A phase moved to in-progress.
    PhaseStarted { execution_id: Uuid, phase: usize },
    /// A phase reached a terminal status.
    PhaseCompleted {
        execution_id: Uuid,
        phase: usize,
        status: String,
    },
    /// A transition was taken in the workflow graph.
    TransitionTaken {
        execution_id: Uuid,
        from: usize,
        reason: String,
        to: String,
    },
    /// An approval decision was recorded.
    ApprovalDecided {
        execution_id: Uuid,
        phase: usize,
        decision: String,
    },
    /// A message was published onto the bus.
    MessagePublished { message_id: Uuid, priority: String },
    /// A message delivery failed and will retry.
    MessageRetried { message_id: Uuid, retry: u32 },
    /// A message exhausted its retries and was dead-lettered.
    MessageDeadLettered { message_id: Uuid },
    /// An escalation was raised.
    Escalated {
        execution_id: Option<Uuid>,
        original_message_id: Option<Uuid>,
        reason: String,
    },
    /// An error was captured by the learning pipeline.
    ErrorCaptured {
        error_id: String,
        category: String,
        severity: String,
    },
    /// A fix proposal passed validation.
    FixValidated { change_id: String, confidence: f64 },
    /// A fix was applied to system state.
    FixApplied { change_id: String },
    /// A fix application was rejected or blocked.
    FixRejected { change_id: String, reason: String },
    /// A rollback completed.
    RollbackComplete { change_id: String, trigger: String },
    /// An audit integrity check failed. Fatal for automated apply.
    IntegrityViolation { audit_id: String },
    /// A monitor threshold alert fired.
    AlertRaised {
        alert_id: Uuid,
        name: String,
        severity: String,
    },
}

impl SystemEvent {
    /// A short label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SystemEvent::ExecutionStarted { .. } => "execution_started",
            SystemEvent::ExecutionFinished { .. } => "execution_finished",
            SystemEvent::PhaseStarted { .. } => "phase_started",
            SystemEvent::PhaseCompleted { .. } => "phase_completed",
            SystemEvent::TransitionTaken { .. } => "transition_taken",
            SystemEvent::ApprovalDecided { .. } => "approval_decided",
            SystemEvent::MessagePublished { .. } => "message_published",
            SystemEvent::MessageRetried { .. } => "message_retried",
            SystemEvent::MessageDeadLettered { .. } => "message_dead_lettered",
            SystemEvent::Escalated { .. } => "escalated",
            SystemEvent::ErrorCaptured { .. } => "error_captured",
            SystemEvent::FixValidated { .. } => "fix_validated",
            SystemEvent::FixApplied { .. } => "fix_applied",
            SystemEvent::FixRejected { .. } => "fix_rejected",
            SystemEvent::RollbackComplete { .. } => "rollback_complete",
            SystemEvent::IntegrityViolation { .. } => "integrity_violation",
            SystemEvent::AlertRaised { .. } => "alert_raised",
        }
    }
}

/// Cloneable handle for emitting and subscribing to [`SystemEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    /// Create an event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event. Dropped silently when nobody is subscribed.
    pub fn emit(&self, event: SystemEvent) {
        tracing::debug!(kind = event.kind(), "event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
