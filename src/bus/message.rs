//! Message entity, priority classes and status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Routing class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    PhaseEntry,
    Execution,
    ValidationGate,
    DeploymentApproval,
    Escalation,
    PhaseTransition,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::PhaseEntry => "phase_entry",
            MessageType::Execution => "execution",
            MessageType::ValidationGate => "validation_gate",
            MessageType::DeploymentApproval => "deployment_approval",
            MessageType::Escalation => "escalation",
            MessageType::PhaseTransition => "phase_transition",
        }
    }
}

/// Priority class. Ordering: `Critical > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// Queue index, 0 = CRITICAL .. 3 = LOW.
    pub fn queue_index(&self) -> usize {
        *self as usize
    }

    /// Base priority fixed by phase: 0–3 HIGH, 4–5 CRITICAL, 6–10 NORMAL,
    /// 11 LOW.
    pub fn for_phase(phase: usize) -> Self {
        match phase {
            0..=3 => Priority::High,
            4 | 5 => Priority::Critical,
            6..=10 => Priority::Normal,
            _ => Priority::Low,
        }
    }

    /// Effective priority: the phase base, upgraded to CRITICAL for
    /// escalations, deployment approvals and validation gates.
    pub fn compute(phase: usize, message_type: MessageType) -> Self {
        match message_type {
            MessageType::Escalation
            | MessageType::DeploymentApproval
            | MessageType::ValidationGate => Priority::Critical,
            _ => Priority::for_phase(phase),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
    DeadLettered,
}

/// A routing unit. The payload is opaque to the bus; only id, priority,
/// targets and status are inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMessage {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub phase: usize,
    pub message_type: MessageType,
    pub payload: Value,
    /// Resolved target agent ids. May be empty for notification-only
    /// messages (e.g. escalations), which complete without delivery.
    pub targets: Vec<String>,
    pub priority: Priority,
    pub needs_approval: bool,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub status: MessageStatus,
}

impl PhaseMessage {
    /// Build a message with its priority computed from phase and type.
    pub fn new(
        execution_id: Uuid,
        phase: usize,
        message_type: MessageType,
        payload: Value,
        targets: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            execution_id,
            phase,
            message_type,
            payload,
            targets,
            priority: Priority::compute(phase, message_type),
            needs_approval: false,
            created_at: Utc::now(),
            retry_count: 0,
            status: MessageStatus::Pending,
        }
    }

    /// Flag the message as requiring an approval decision downstream.
    pub fn with_approval(mut self) -> Self {
        self.needs_approval = true;
        self
    }
}
