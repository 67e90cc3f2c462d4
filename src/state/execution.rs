//! Execution and per-phase state entities.
//!
//! An [`Execution`] is one run of the twelve-phase workflow. It owns one
//! [`PhaseState`] per phase and an append-only event log. Phase status
//! changes are validated against the declared transition graph: pending →
//! in-progress → {completed, failed, skipped} and nothing else.

use crate::workflow::PHASE_COUNT;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    /// Parked: awaiting an approval decision or an explicit resume.
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Whether the execution can still make progress.
    pub fn is_active(&self) -> bool {
        matches!(self, ExecutionStatus::Running | ExecutionStatus::Paused)
    }

    /// Whether the execution is finished for good.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one phase within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    /// Whether `next` is a legal successor of `self` in the phase-state
    /// graph. Terminal states have no successors.
    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        matches!(
            (self, next),
            (PhaseStatus::Pending, PhaseStatus::InProgress)
                | (PhaseStatus::InProgress, PhaseStatus::Completed)
                | (PhaseStatus::InProgress, PhaseStatus::Failed)
                | (PhaseStatus::InProgress, PhaseStatus::Skipped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

/// State of one (execution, phase) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseState {
    pub phase: usize,
    pub name: String,
    pub status: PhaseStatus,
    /// Agent ids assigned for this run of the phase.
    #[serde(default)]
    pub assigned_agents: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Opaque per-agent outputs, keyed by agent id.
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    /// Error description when the phase failed.
    pub error: Option<String>,
}

impl PhaseState {
    pub fn new(phase: usize, name: &str) -> Self {
        Self {
            phase,
            name: name.to_string(),
            status: PhaseStatus::Pending,
            assigned_agents: Vec::new(),
            started_at: None,
            ended_at: None,
            outputs: HashMap::new(),
            error: None,
        }
    }

    /// Move to a new status, enforcing the legal transition graph.
    /// Re-entering a phase (back-edge re-run) resets it to pending first
    /// via [`PhaseState::reset_for_rerun`], never through this method.
    pub fn transition(&mut self, next: PhaseStatus, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            PhaseStatus::InProgress => self.started_at = Some(now),
            _ if next.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
        self.status = next;
        true
    }

    /// Reset a terminal phase back to pending for a declared back-edge
    /// re-run (2→2, 4→4). Outputs and errors of the prior attempt are
    /// cleared.
    pub fn reset_for_rerun(&mut self) {
        self.status = PhaseStatus::Pending;
        self.started_at = None;
        self.ended_at = None;
        self.outputs.clear();
        self.error = None;
    }
}

/// One entry in the execution's append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLogEntry {
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: String,
}

/// A single run of the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: Uuid,
    pub project: String,
    pub status: ExecutionStatus,
    /// Index of the phase the execution is currently at, 0..=11.
    pub current_phase: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Total wall-clock duration in milliseconds, set on completion.
    pub duration_ms: Option<i64>,
    /// Opaque context map carried across phases.
    #[serde(default)]
    pub context: HashMap<String, Value>,
    /// One state per phase, ordered by index.
    pub phases: Vec<PhaseState>,
    /// Append-only event log.
    #[serde(default)]
    pub log: Vec<ExecutionLogEntry>,
}

impl Execution {
    /// Create a fresh execution with every phase pending.
    pub fn new(project: &str, phase_names: &[String]) -> Self {
        debug_assert_eq!(phase_names.len(), PHASE_COUNT);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project: project.to_string(),
            status: ExecutionStatus::Running,
            current_phase: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            duration_ms: None,
            context: HashMap::new(),
            phases: phase_names
                .iter()
                .enumerate()
                .map(|(i, name)| PhaseState::new(i, name))
                .collect(),
            log: Vec::new(),
        }
    }

    /// Mutable access to one phase state.
    pub fn phase_mut(&mut self, index: usize) -> Option<&mut PhaseState> {
        self.phases.get_mut(index)
    }

    /// Shared access to one phase state.
    pub fn phase(&self, index: usize) -> Option<&PhaseState> {
        self.phases.get(index)
    }

    /// Append to the event log and bump `updated_at`.
    pub fn log_event(&mut self, kind: &str, detail: impl Into<String>) {
        let now = Utc::now();
        self.log.push(ExecutionLogEntry {
            at: now,
            kind: kind.to_string(),
            detail: detail.into(),
        });
        self.updated_at = now;
    }

    /// Highest-indexed phase in `completed`, if any.
    pub fn last_completed_phase(&self) -> Option<usize> {
        self.phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Completed)
            .map(|p| p.phase)
            .max()
    }

    /// Mark the execution terminal with the given status.
    pub fn finish(&mut self, status: ExecutionStatus) {
        debug_assert!(status.is_terminal());
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds());
        self.updated_at = now;
    }
}
