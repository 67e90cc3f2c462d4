//! Phase controller: owns the execution lifecycle.
//!
//! Drives the twelve-phase workflow over the message bus: starts
//! executions, records agent outputs and artifacts, evaluates
//! transitions (including the declared back-edges), parks executions at
//! approval gates with expiring tokens, fans out to the parallel group
//! and joins it, and writes checkpoints at every defined trigger point.
//! A phase state is never observable as completed before its checkpoint
//! is durable: the checkpoint is written before the execution record.

use crate::bus::{MessageBus, MessageType, PhaseMessage};
use crate::config::{ApprovalConfig, ExpiryResolution};
use crate::errors::OrchestratorError;
use crate::events::{EventBus, SystemEvent};
use crate::state::{
    Artifact, CheckpointReason, Execution, ExecutionStatus, PhaseStatus, StateStore,
};
use crate::registry::ArtifactDraft;
use crate::workflow::{TransitionReason, TransitionTarget, WorkflowDefinition};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// An approval decision submitted by a human.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Revise,
}

/// A pending approval gate for one (execution, phase).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub token_id: Uuid,
    pub execution_id: Uuid,
    pub phase: usize,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ApprovalToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Where an evaluated transition landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Entered the given phase.
    Advanced(usize),
    /// Fanned out to two parallel phases.
    FannedOut(usize, usize),
    /// Deployment unwound; execution failed.
    RolledBack,
    /// Halted pending human action.
    Escalated,
    /// The workflow finished.
    Completed,
}

/// Join bookkeeping for the parallel group.
#[derive(Debug, Default)]
struct JoinState {
    completed: HashSet<usize>,
    failed: HashSet<usize>,
}

#[derive(Default)]
struct ControllerState {
    approvals: HashMap<(Uuid, usize), ApprovalToken>,
    /// Human approval granted for (execution, phase), gates outstanding.
    approved: HashSet<(Uuid, usize)>,
    /// All auto-validation gates passed, approval outstanding.
    gates_passed: HashSet<(Uuid, usize)>,
    joins: HashMap<Uuid, JoinState>,
    /// Auto-validation gate reports for (execution, phase).
    gate_results: HashMap<(Uuid, usize), HashMap<String, bool>>,
}

/// The controller. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct PhaseController {
    workflow: Arc<WorkflowDefinition>,
    store: Arc<StateStore>,
    bus: MessageBus,
    events: EventBus,
    approval: ApprovalConfig,
    state: Arc<Mutex<ControllerState>>,
}

impl PhaseController {
    pub fn new(
        workflow: WorkflowDefinition,
        store: Arc<StateStore>,
        bus: MessageBus,
        events: EventBus,
        approval: ApprovalConfig,
    ) -> Self {
        Self {
            workflow: Arc::new(workflow),
            store,
            bus,
            events,
            approval,
            state: Arc::new(Mutex::new(ControllerState::default())),
        }
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// Create an execution, checkpoint it, and enter phase 0.
    pub async fn start(
        &self,
        project: &str,
        context: HashMap<String, Value>,
    ) -> Result<Uuid, OrchestratorError> {
        let phase_names: Vec<String> = self
            .workflow
            .phases()
            .iter()
            .map(|p| p.name.clone())
            .collect();
        let mut execution = Execution::new(project, &phase_names);
        execution.context = context;
        execution.log_event("execution_started", format!("project {}", project));

        self.store
            .create_checkpoint(&execution, CheckpointReason::WorkflowStart, Value::Null)?;
        self.store.save_execution(&execution)?;
        self.events.emit(SystemEvent::ExecutionStarted {
            execution_id: execution.id,
            project: project.to_string(),
        });

        let id = execution.id;
        self.enter_phase(&mut execution, 0, None).await?;
        self.store.save_execution(&execution)?;
        Ok(id)
    }

    /// Record one agent's output and artifacts for the current phase.
    pub async fn record_agent_output(
        &self,
        execution_id: Uuid,
        agent_id: &str,
        output: Value,
        artifacts: Vec<ArtifactDraft>,
    ) -> Result<(), OrchestratorError> {
        let mut execution = self.store.load_execution(execution_id)?;
        if !execution.status.is_active() {
            return Err(OrchestratorError::NotRunning(execution_id));
        }
        let phase = execution.current_phase;

        for draft in artifacts {
            let version = self.store.next_artifact_version(execution_id, &draft.name)?;
            let artifact =
                Artifact::new(execution_id, phase, agent_id, &draft.name, draft.content, version);
            self.store.register_artifact(&artifact)?;
            execution.log_event(
                "artifact_registered",
                format!("{} v{} by {}", artifact.meta.name, version, agent_id),
            );
        }

        if let Some(phase_state) = execution.phase_mut(phase) {
            phase_state.outputs.insert(agent_id.to_string(), output);
        }
        execution.log_event("agent_output", format!("{} in phase {}", agent_id, phase));
        self.store.save_execution(&execution)?;
        Ok(())
    }

    /// Mark the current phase completed. Approval-gated phases park; the
    /// rest auto-advance on their declared reason; the parallel group
    /// joins when both siblings are done.
    pub async fn complete_phase(
        &self,
        execution_id: Uuid,
        phase: usize,
    ) -> Result<Option<TransitionOutcome>, OrchestratorError> {
        let mut execution = self.store.load_execution(execution_id)?;
        if !execution.status.is_active() {
            return Err(OrchestratorError::NotRunning(execution_id));
        }

        let now = Utc::now();
        if let Some(phase_state) = execution.phase_mut(phase) {
            phase_state.transition(PhaseStatus::Completed, now);
        }
        execution.log_event("phase_complete", format!("phase {}", phase));

        // Checkpoint first: completed must never be observable before
        // its checkpoint is durable.
        self.store
            .create_checkpoint(&execution, CheckpointReason::PhaseComplete, Value::Null)?;
        self.store.save_execution(&execution)?;
        self.events.emit(SystemEvent::PhaseCompleted {
            execution_id,
            phase,
            status: "completed".to_string(),
        });

        // Parallel group: record and join when both siblings are done.
        if let Some(sibling) = self.workflow.parallel_sibling(phase) {
            let (both_done, sibling_failed) = {
                let mut state = self.state.lock().await;
                let join = state.joins.entry(execution_id).or_default();
                join.completed.insert(phase);
                (
                    join.completed.contains(&sibling),
                    join.failed.contains(&sibling),
                )
            };
            if sibling_failed {
                // The sibling already failed; with both terminal, the
                // execution terminates.
                let mut execution = self.store.load_execution(execution_id)?;
                self.finish_execution(
                    &mut execution,
                    ExecutionStatus::Failed,
                    &format!("parallel sibling of phase {} failed", phase),
                )
                .await?;
                return Ok(None);
            }
            if both_done {
                let join_target = self
                    .workflow
                    .join_target(phase)
                    .expect("parallel phases declare a join target");
                let mut execution = self.store.load_execution(execution_id)?;
                self.enter_phase(&mut execution, join_target, None).await?;
                self.store.save_execution(&execution)?;
                self.state.lock().await.joins.remove(&execution_id);
                return Ok(Some(TransitionOutcome::Advanced(join_target)));
            }
            return Ok(None);
        }

        // Approval-gated phases wait for a decision (phase 4 also for
        // its validation gates, handled in record_gate_result).
        if self.workflow.approval_required(phase) {
            let mut execution = self.store.load_execution(execution_id)?;
            execution.status = ExecutionStatus::Paused;
            execution.log_event("awaiting_approval", format!("phase {}", phase));
            self.store.save_execution(&execution)?;
            return Ok(None);
        }

        // Automated phases advance on their declared reason.
        let reason = match phase {
            6 => TransitionReason::Passed,
            _ => TransitionReason::Complete,
        };
        Ok(Some(self.evaluate_transition(execution_id, reason).await?))
    }

    /// Mark a phase failed. Fatal to the execution unless its parallel
    /// sibling is still running, in which case the sibling finishes
    /// before the execution terminates.
    pub async fn fail_phase(
        &self,
        execution_id: Uuid,
        phase: usize,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let mut execution = self.store.load_execution(execution_id)?;
        let now = Utc::now();
        if let Some(phase_state) = execution.phase_mut(phase) {
            phase_state.transition(PhaseStatus::Failed, now);
            phase_state.error = Some(error.to_string());
        }
        execution.log_event("phase_failed", format!("phase {}: {}", phase, error));
        self.events.emit(SystemEvent::PhaseCompleted {
            execution_id,
            phase,
            status: "failed".to_string(),
        });

        if let Some(sibling) = self.workflow.parallel_sibling(phase) {
            let sibling_terminal = execution
                .phase(sibling)
                .map(|p| p.status.is_terminal())
                .unwrap_or(true);
            {
                let mut state = self.state.lock().await;
                let join = state.joins.entry(execution_id).or_default();
                join.failed.insert(phase);
            }
            if !sibling_terminal {
                // Let the sibling run to a terminal state first.
                self.store
                    .create_checkpoint(&execution, CheckpointReason::Error, Value::Null)?;
                self.store.save_execution(&execution)?;
                return Ok(());
            }
        }

        self.finish_execution(&mut execution, ExecutionStatus::Failed, error)
            .await
    }

    /// Record one auto-validation gate report for phase 4. When every
    /// declared gate has reported, the phase advances on
    /// `validation_passed` or loops back on `validation_failed`.
    pub async fn record_gate_result(
        &self,
        execution_id: Uuid,
        gate: &str,
        passed: bool,
    ) -> Result<Option<TransitionOutcome>, OrchestratorError> {
        let execution = self.store.load_execution(execution_id)?;
        let phase = execution.current_phase;
        let declared = self.workflow.validation_gates(phase);
        if declared.is_empty() {
            return Err(OrchestratorError::InvalidTransition {
                phase,
                reason: format!("gate '{}' reported but phase declares none", gate),
            });
        }

        let verdict = {
            let mut state = self.state.lock().await;
            let results = state.gate_results.entry((execution_id, phase)).or_default();
            results.insert(gate.to_string(), passed);
            if results.len() < declared.len() {
                None
            } else {
                let all_passed = declared.iter().all(|g| results.get(g).copied().unwrap_or(false));
                state.gate_results.remove(&(execution_id, phase));
                Some(all_passed)
            }
        };

        match verdict {
            None => Ok(None),
            Some(true) => {
                // The phase exits only when both the gates and the human
                // approval are in.
                if self.workflow.approval_required(phase) {
                    let mut state = self.state.lock().await;
                    if !state.approved.remove(&(execution_id, phase)) {
                        state.gates_passed.insert((execution_id, phase));
                        return Ok(None);
                    }
                }
                Ok(Some(
                    self.evaluate_transition(execution_id, TransitionReason::ValidationPassed)
                        .await?,
                ))
            }
            Some(false) => {
                {
                    let mut state = self.state.lock().await;
                    state.approved.remove(&(execution_id, phase));
                    state.gates_passed.remove(&(execution_id, phase));
                }
                Ok(Some(
                    self.evaluate_transition(execution_id, TransitionReason::ValidationFailed)
                        .await?,
                ))
            }
        }
    }

    /// Submit a human approval decision for a parked phase.
    pub async fn submit_approval(
        &self,
        execution_id: Uuid,
        phase: usize,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> Result<Option<TransitionOutcome>, OrchestratorError> {
        let token = {
            let mut state = self.state.lock().await;
            state
                .approvals
                .remove(&(execution_id, phase))
                .ok_or(OrchestratorError::NoPendingApproval { phase })?
        };
        if token.is_expired() {
            // Put expiry handling through the same path as the sweeper.
            self.resolve_expired(execution_id, phase).await?;
            return Err(OrchestratorError::ApprovalExpired { phase });
        }

        self.events.emit(SystemEvent::ApprovalDecided {
            execution_id,
            phase,
            decision: format!("{:?}", decision).to_lowercase(),
        });
        if let Some(feedback) = feedback {
            let mut execution = self.store.load_execution(execution_id)?;
            execution.log_event("approval_feedback", feedback);
            self.store.save_execution(&execution)?;
        }

        match decision {
            ApprovalDecision::Approve => {
                // Resume from the parked state.
                let mut execution = self.store.load_execution(execution_id)?;
                if execution.status == ExecutionStatus::Paused {
                    execution.status = ExecutionStatus::Running;
                    self.store.save_execution(&execution)?;
                }
                let reason = match phase {
                    5 => TransitionReason::DeploymentSucceeded,
                    11 => TransitionReason::Complete,
                    4 => {
                        // Approval granted; the gates decide the exit.
                        let mut state = self.state.lock().await;
                        if state.gates_passed.remove(&(execution_id, phase)) {
                            drop(state);
                            TransitionReason::ValidationPassed
                        } else {
                            state.approved.insert((execution_id, phase));
                            return Ok(None);
                        }
                    }
                    _ => TransitionReason::Approved,
                };
                Ok(Some(self.evaluate_transition(execution_id, reason).await?))
            }
            ApprovalDecision::Reject => {
                if phase == 5 {
                    return Ok(Some(
                        self.evaluate_transition(execution_id, TransitionReason::DeploymentRejected)
                            .await?,
                    ));
                }
                let mut execution = self.store.load_execution(execution_id)?;
                self.finish_execution(
                    &mut execution,
                    ExecutionStatus::Failed,
                    &format!("phase {} rejected", phase),
                )
                .await?;
                Ok(None)
            }
            ApprovalDecision::Revise => {
                // Re-run the current phase with the feedback on record.
                let mut execution = self.store.load_execution(execution_id)?;
                execution.status = ExecutionStatus::Running;
                if let Some(phase_state) = execution.phase_mut(phase) {
                    phase_state.reset_for_rerun();
                }
                self.enter_phase(&mut execution, phase, None).await?;
                self.store.save_execution(&execution)?;
                Ok(Some(TransitionOutcome::Advanced(phase)))
            }
        }
    }

    /// Resolve approval tokens that expired, applying the configured
    /// default decision. Returns the executions touched.
    pub async fn check_expired_approvals(&self) -> Result<Vec<Uuid>, OrchestratorError> {
        let expired: Vec<(Uuid, usize)> = {
            let state = self.state.lock().await;
            state
                .approvals
                .values()
                .filter(|t| t.is_expired())
                .map(|t| (t.execution_id, t.phase))
                .collect()
        };
        let mut touched = Vec::new();
        for (execution_id, phase) in expired {
            self.state.lock().await.approvals.remove(&(execution_id, phase));
            self.resolve_expired(execution_id, phase).await?;
            touched.push(execution_id);
        }
        Ok(touched)
    }

    async fn resolve_expired(&self, execution_id: Uuid, phase: usize) -> Result<(), OrchestratorError> {
        tracing::warn!(%execution_id, phase, "approval token expired");
        match self.approval.expiry_resolution {
            ExpiryResolution::Reject => {
                let mut execution = self.store.load_execution(execution_id)?;
                self.finish_execution(
                    &mut execution,
                    ExecutionStatus::Failed,
                    &format!("approval for phase {} expired", phase),
                )
                .await
            }
            ExpiryResolution::Approve => {
                let mut execution = self.store.load_execution(execution_id)?;
                execution.status = ExecutionStatus::Running;
                execution.log_event("approval_expired", format!("phase {} auto-approved", phase));
                self.store.save_execution(&execution)?;
                let reason = match phase {
                    5 => TransitionReason::DeploymentSucceeded,
                    11 => TransitionReason::Complete,
                    4 => {
                        let mut state = self.state.lock().await;
                        if state.gates_passed.remove(&(execution_id, phase)) {
                            drop(state);
                            TransitionReason::ValidationPassed
                        } else {
                            state.approved.insert((execution_id, phase));
                            return Ok(());
                        }
                    }
                    _ => TransitionReason::Approved,
                };
                self.evaluate_transition(execution_id, reason).await.map(|_| ())
            }
        }
    }

    /// Evaluate one edge of the transition table.
    pub async fn evaluate_transition(
        &self,
        execution_id: Uuid,
        reason: TransitionReason,
    ) -> Result<TransitionOutcome, OrchestratorError> {
        let mut execution = self.store.load_execution(execution_id)?;
        if execution.status.is_terminal() {
            return Err(OrchestratorError::NotRunning(execution_id));
        }
        let from = execution.current_phase;
        let target = self.workflow.next(from, reason).ok_or_else(|| {
            OrchestratorError::InvalidTransition {
                phase: from,
                reason: reason.as_str().to_string(),
            }
        })?;

        self.events.emit(SystemEvent::TransitionTaken {
            execution_id,
            from,
            reason: reason.as_str().to_string(),
            to: format!("{:?}", target),
        });
        // Transition notification for bus accounting.
        let _ = self
            .bus
            .publish(PhaseMessage::new(
                execution_id,
                from,
                MessageType::PhaseTransition,
                json!({"from": from, "reason": reason.as_str()}),
                Vec::new(),
            ))
            .await;

        match target {
            TransitionTarget::Phase { index } => {
                execution.status = ExecutionStatus::Running;
                // Back-edges re-run already-terminal phases.
                if index <= from {
                    for i in index..=from {
                        if let Some(phase_state) = execution.phase_mut(i)
                            && phase_state.status.is_terminal()
                        {
                            phase_state.reset_for_rerun();
                        }
                    }
                }
                self.enter_phase(&mut execution, index, None).await?;
                self.store.save_execution(&execution)?;
                Ok(TransitionOutcome::Advanced(index))
            }
            TransitionTarget::FanOut { first, second } => {
                execution.status = ExecutionStatus::Running;
                let join_token = Uuid::new_v4();
                {
                    let mut state = self.state.lock().await;
                    state.joins.entry(execution_id).or_default();
                }
                self.enter_phase(&mut execution, first, Some(join_token)).await?;
                self.enter_phase(&mut execution, second, Some(join_token)).await?;
                self.store.save_execution(&execution)?;
                Ok(TransitionOutcome::FannedOut(first, second))
            }
            TransitionTarget::Rollback => {
                // Resources created by the deployment phase are flagged
                // for removal; the execution fails.
                execution
                    .context
                    .insert("rollback_resources".to_string(), json!(true));
                execution.log_event("rollback", "deployment rejected; unwinding resources");
                self.escalate(&mut execution, "deployment_rejected", None).await?;
                self.finish_execution(&mut execution, ExecutionStatus::Failed, "deployment rolled back")
                    .await?;
                Ok(TransitionOutcome::RolledBack)
            }
            TransitionTarget::Escalation => {
                self.escalate(&mut execution, "deployment_failed", None).await?;
                execution.status = ExecutionStatus::Paused;
                execution.log_event("escalated", "halted pending human action");
                self.store.save_execution(&execution)?;
                Ok(TransitionOutcome::Escalated)
            }
            TransitionTarget::End => {
                self.finish_execution(&mut execution, ExecutionStatus::Completed, "workflow complete")
                    .await?;
                Ok(TransitionOutcome::Completed)
            }
        }
    }

    /// Cancel an execution: drop its queued messages, discard in-flight
    /// outputs, release gates and monitors.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), OrchestratorError> {
        let mut execution = self.store.load_execution(execution_id)?;
        if execution.status.is_terminal() {
            return Err(OrchestratorError::NotRunning(execution_id));
        }
        execution.log_event("cancelled", "execution cancelled");
        self.finish_execution(&mut execution, ExecutionStatus::Cancelled, "cancelled")
            .await
    }

    /// Resume the most recently updated resumable execution.
    pub async fn resume_latest(&self) -> Result<(Uuid, usize), OrchestratorError> {
        let resume = self.store.resume_latest()?;
        let mut execution = self.store.load_execution(resume.execution_id)?;
        execution.status = ExecutionStatus::Running;
        execution.log_event("resumed", format!("at phase {}", resume.resume_phase));
        self.enter_phase(&mut execution, resume.resume_phase, None).await?;
        self.store.save_execution(&execution)?;
        Ok((resume.execution_id, resume.resume_phase))
    }

    /// A pending approval token, if one exists.
    pub async fn pending_approval(&self, execution_id: Uuid, phase: usize) -> Option<ApprovalToken> {
        self.state
            .lock()
            .await
            .approvals
            .get(&(execution_id, phase))
            .cloned()
    }

    async fn enter_phase(
        &self,
        execution: &mut Execution,
        index: usize,
        join_token: Option<Uuid>,
    ) -> Result<(), OrchestratorError> {
        let phase_def = self
            .workflow
            .phase(index)
            .ok_or(OrchestratorError::InvalidTransition {
                phase: index,
                reason: "no such phase".to_string(),
            })?;

        execution.current_phase = index;
        if let Some(phase_state) = execution.phase_mut(index) {
            if phase_state.status.is_terminal() {
                phase_state.reset_for_rerun();
            }
            phase_state.assigned_agents = phase_def.agents.clone();
            phase_state.transition(PhaseStatus::InProgress, Utc::now());
        }
        execution.log_event("phase_entry", format!("phase {} ({})", index, phase_def.name));
        self.events.emit(SystemEvent::PhaseStarted {
            execution_id: execution.id,
            phase: index,
        });

        // Stale gate and approval bookkeeping from a prior attempt must
        // not leak into a re-run.
        {
            let mut state = self.state.lock().await;
            state.approved.remove(&(execution.id, index));
            state.gates_passed.remove(&(execution.id, index));
            state.gate_results.remove(&(execution.id, index));
        }

        // Approval-gated phases carry a token from entry; the exit waits
        // on its resolution.
        if phase_def.approval_required {
            let now = Utc::now();
            let token = ApprovalToken {
                token_id: Uuid::new_v4(),
                execution_id: execution.id,
                phase: index,
                issued_at: now,
                expires_at: now + Duration::milliseconds(self.approval.expiry_ms as i64),
            };
            self.state
                .lock()
                .await
                .approvals
                .insert((execution.id, index), token);
        }

        let mut payload = json!({
            "phase": index,
            "name": phase_def.name,
            "expected_artifacts": phase_def.expected_artifacts,
            "context": execution.context,
        });
        if let Some(token) = join_token {
            payload["join_token"] = json!(token);
        }
        let mut message = PhaseMessage::new(
            execution.id,
            index,
            MessageType::PhaseEntry,
            payload,
            phase_def.agents.clone(),
        );
        if phase_def.approval_required {
            message = message.with_approval();
        }
        self.bus.publish(message).await?;
        Ok(())
    }

    async fn escalate(
        &self,
        execution: &mut Execution,
        reason: &str,
        original_message_id: Option<Uuid>,
    ) -> Result<(), OrchestratorError> {
        let message = PhaseMessage::new(
            execution.id,
            execution.current_phase,
            MessageType::Escalation,
            json!({
                "reason": reason,
                "phase": execution.current_phase,
                "original_message_id": original_message_id,
            }),
            Vec::new(),
        );
        let _ = self.bus.publish(message).await;
        self.events.emit(SystemEvent::Escalated {
            execution_id: Some(execution.id),
            original_message_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn finish_execution(
        &self,
        execution: &mut Execution,
        status: ExecutionStatus,
        detail: &str,
    ) -> Result<(), OrchestratorError> {
        execution.finish(status);
        execution.log_event("execution_finished", detail);
        let reason = match status {
            ExecutionStatus::Completed => CheckpointReason::PhaseComplete,
            _ => CheckpointReason::Error,
        };
        self.store.create_checkpoint(execution, reason, Value::Null)?;
        self.store.save_execution(execution)?;

        // Terminal executions hold no queued work.
        self.bus.cancel_execution(execution.id).await;
        {
            let mut state = self.state.lock().await;
            state.approvals.retain(|(id, _), _| *id != execution.id);
            state.approved.retain(|(id, _)| *id != execution.id);
            state.gates_passed.retain(|(id, _)| *id != execution.id);
            state.gate_results.retain(|(id, _), _| *id != execution.id);
            state.joins.remove(&execution.id);
        }
        self.events.emit(SystemEvent::ExecutionFinished {
            execution_id: execution.id,
            status: execution.status.as_str().to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::registry::AgentRegistry;
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    struct Harness {
        controller: PhaseController,
        store: Arc<StateStore>,
        bus: MessageBus,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        harness_with_approval(ApprovalConfig::default())
    }

    fn harness_with_approval(approval: ApprovalConfig) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let registry = Arc::new(RwLock::new(AgentRegistry::with_default_catalog()));
        let events = EventBus::default();
        // Workers never started: published messages stay queued, which
        // keeps these tests purely about controller logic.
        let bus = MessageBus::new(registry, events.clone(), BusConfig::default());
        let controller = PhaseController::new(
            WorkflowDefinition::standard(),
            store.clone(),
            bus.clone(),
            events,
            approval,
        );
        Harness {
            controller,
            store,
            bus,
            _dir: dir,
        }
    }

    async fn approve(h: &Harness, id: Uuid, phase: usize) -> Option<TransitionOutcome> {
        h.controller
            .complete_phase(id, phase)
            .await
            .unwrap();
        h.controller
            .submit_approval(id, phase, ApprovalDecision::Approve, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn start_enters_phase_zero_with_token_and_checkpoint() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 0);
        assert_eq!(execution.status, ExecutionStatus::Running);
        assert_eq!(
            execution.phase(0).unwrap().status,
            PhaseStatus::InProgress
        );
        assert!(h.controller.pending_approval(id, 0).await.is_some());

        let checkpoints = h.store.list_checkpoints(id).unwrap();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].reason, CheckpointReason::WorkflowStart);
    }

    #[tokio::test]
    async fn approvals_walk_the_early_phases() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();

        assert_eq!(approve(&h, id, 0).await, Some(TransitionOutcome::Advanced(1)));
        assert_eq!(approve(&h, id, 1).await, Some(TransitionOutcome::Advanced(2)));
        assert_eq!(approve(&h, id, 2).await, Some(TransitionOutcome::Advanced(3)));
        assert_eq!(approve(&h, id, 3).await, Some(TransitionOutcome::Advanced(4)));

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 4);
        for i in 0..4 {
            assert_eq!(execution.phase(i).unwrap().status, PhaseStatus::Completed);
        }
    }

    #[tokio::test]
    async fn cost_overrun_reruns_phase_two() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        approve(&h, id, 0).await;
        approve(&h, id, 1).await;
        h.controller.complete_phase(id, 2).await.unwrap();

        let outcome = h
            .controller
            .evaluate_transition(id, TransitionReason::CostTooHigh)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Advanced(2));

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 2);
        assert_eq!(execution.phase(2).unwrap().status, PhaseStatus::InProgress);
    }

    #[tokio::test]
    async fn major_changes_fall_back_to_phase_one() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        approve(&h, id, 0).await;
        approve(&h, id, 1).await;
        h.controller.complete_phase(id, 2).await.unwrap();

        let outcome = h
            .controller
            .evaluate_transition(id, TransitionReason::MajorChanges)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Advanced(1));

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 1);
        // Both re-run phases are reset.
        assert_eq!(execution.phase(1).unwrap().status, PhaseStatus::InProgress);
        assert_eq!(execution.phase(2).unwrap().status, PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn undeclared_transition_is_an_error() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        assert!(matches!(
            h.controller
                .evaluate_transition(id, TransitionReason::DeploymentSucceeded)
                .await,
            Err(OrchestratorError::InvalidTransition { phase: 0, .. })
        ));
    }

    async fn advance_to_phase_four(h: &Harness) -> Uuid {
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        for phase in 0..4 {
            approve(h, id, phase).await;
        }
        id
    }

    #[tokio::test]
    async fn phase_four_needs_approval_and_all_gates() {
        let h = harness();
        let id = advance_to_phase_four(&h).await;
        h.controller.complete_phase(id, 4).await.unwrap();

        // Approval first: no advance until the gates report.
        let outcome = h
            .controller
            .submit_approval(id, 4, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(outcome, None);

        let gates: Vec<String> = h.controller.workflow().validation_gates(4).to_vec();
        assert_eq!(gates.len(), 5);
        let mut last = None;
        for gate in &gates {
            last = h
                .controller
                .record_gate_result(id, gate, true)
                .await
                .unwrap();
        }
        assert_eq!(last, Some(TransitionOutcome::Advanced(5)));
    }

    #[tokio::test]
    async fn failed_gate_loops_phase_four_then_second_attempt_passes() {
        let h = harness();
        let id = advance_to_phase_four(&h).await;
        h.controller.complete_phase(id, 4).await.unwrap();
        h.controller
            .submit_approval(id, 4, ApprovalDecision::Approve, None)
            .await
            .unwrap();

        let gates: Vec<String> = h.controller.workflow().validation_gates(4).to_vec();
        // First attempt: one gate fails.
        let mut outcome = None;
        for (i, gate) in gates.iter().enumerate() {
            outcome = h
                .controller
                .record_gate_result(id, gate, i != 2)
                .await
                .unwrap();
        }
        assert_eq!(outcome, Some(TransitionOutcome::Advanced(4)));
        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.phase(4).unwrap().status, PhaseStatus::InProgress);

        // Second attempt: regenerate, approve, all gates pass.
        h.controller.complete_phase(id, 4).await.unwrap();
        h.controller
            .submit_approval(id, 4, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        let mut outcome = None;
        for gate in &gates {
            outcome = h
                .controller
                .record_gate_result(id, gate, true)
                .await
                .unwrap();
        }
        // The transition to phase 5 occurs exactly once.
        assert_eq!(outcome, Some(TransitionOutcome::Advanced(5)));
        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 5);
    }

    async fn advance_to_phase_five(h: &Harness) -> Uuid {
        let id = advance_to_phase_four(h).await;
        h.controller.complete_phase(id, 4).await.unwrap();
        h.controller
            .submit_approval(id, 4, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        let gates: Vec<String> = h.controller.workflow().validation_gates(4).to_vec();
        for gate in &gates {
            h.controller.record_gate_result(id, gate, true).await.unwrap();
        }
        id
    }

    #[tokio::test]
    async fn deployment_rejection_rolls_back_and_fails() {
        let h = harness();
        let id = advance_to_phase_five(&h).await;

        h.controller.complete_phase(id, 5).await.unwrap();
        let outcome = h
            .controller
            .submit_approval(id, 5, ApprovalDecision::Reject, Some("too risky".into()))
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransitionOutcome::RolledBack));

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.context.get("rollback_resources"),
            Some(&json!(true))
        );
        // A final checkpoint was written.
        let checkpoints = h.store.list_checkpoints(id).unwrap();
        assert_eq!(checkpoints[0].reason, CheckpointReason::Error);
        // No queued work survives a terminal execution.
        assert!(!h.bus.has_pending_for(id).await);
    }

    #[tokio::test]
    async fn full_run_joins_the_parallel_group_and_completes() {
        let h = harness();
        let id = advance_to_phase_five(&h).await;

        h.controller.complete_phase(id, 5).await.unwrap();
        let outcome = h
            .controller
            .submit_approval(id, 5, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(outcome, Some(TransitionOutcome::Advanced(6)));

        assert_eq!(
            h.controller.complete_phase(id, 6).await.unwrap(),
            Some(TransitionOutcome::Advanced(7))
        );
        assert_eq!(
            h.controller.complete_phase(id, 7).await.unwrap(),
            Some(TransitionOutcome::Advanced(8))
        );
        assert_eq!(
            h.controller.complete_phase(id, 8).await.unwrap(),
            Some(TransitionOutcome::FannedOut(9, 10))
        );

        // First sibling done: no join yet.
        assert_eq!(h.controller.complete_phase(id, 9).await.unwrap(), None);
        // Second sibling joins into 11, exactly once.
        assert_eq!(
            h.controller.complete_phase(id, 10).await.unwrap(),
            Some(TransitionOutcome::Advanced(11))
        );

        let outcome = approve(&h, id, 11).await;
        assert_eq!(outcome, Some(TransitionOutcome::Completed));

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.current_phase, 11);
        assert!(execution.duration_ms.is_some());
    }

    #[tokio::test]
    async fn failed_parallel_sibling_fails_the_execution_after_join() {
        let h = harness();
        let id = advance_to_phase_five(&h).await;
        h.controller.complete_phase(id, 5).await.unwrap();
        h.controller
            .submit_approval(id, 5, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        h.controller.complete_phase(id, 6).await.unwrap();
        h.controller.complete_phase(id, 7).await.unwrap();
        h.controller.complete_phase(id, 8).await.unwrap();

        // Phase 9 fails while 10 still runs: execution survives.
        h.controller.fail_phase(id, 9, "integration suite crashed").await.unwrap();
        let execution = h.store.load_execution(id).unwrap();
        assert!(execution.status.is_active());

        // Sibling reaches terminal: the execution fails.
        h.controller.complete_phase(id, 10).await.unwrap();
        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.phase(9).unwrap().status, PhaseStatus::Failed);
        assert_eq!(execution.phase(10).unwrap().status, PhaseStatus::Completed);
    }

    #[tokio::test]
    async fn record_agent_output_registers_versioned_artifacts() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();

        h.controller
            .record_agent_output(
                id,
                "req-discover",
                json!({"summary": "requirements gathered"}),
                vec![ArtifactDraft {
                    name: "requirements-brief".to_string(),
                    content: b"v1 brief".to_vec(),
                }],
            )
            .await
            .unwrap();
        h.controller
            .record_agent_output(
                id,
                "req-discover",
                json!({"summary": "revised"}),
                vec![ArtifactDraft {
                    name: "requirements-brief".to_string(),
                    content: b"v2 brief".to_vec(),
                }],
            )
            .await
            .unwrap();

        let artifacts = h.store.list_artifacts(id).unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].version, 1);
        assert_eq!(artifacts[1].version, 2);

        let execution = h.store.load_execution(id).unwrap();
        assert!(execution.phase(0).unwrap().outputs.contains_key("req-discover"));
    }

    #[tokio::test]
    async fn cancel_reaches_a_quiet_terminal_state() {
        let h = harness();
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        h.controller.cancel(id).await.unwrap();

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert!(!h.bus.has_pending_for(id).await);
        assert!(h.controller.pending_approval(id, 0).await.is_none());

        // Terminal executions refuse further work.
        assert!(h.controller.cancel(id).await.is_err());
        assert!(h.controller.complete_phase(id, 0).await.is_err());
    }

    #[tokio::test]
    async fn expired_approval_defaults_to_rejection() {
        let h = harness_with_approval(ApprovalConfig {
            expiry_ms: 0,
            expiry_resolution: ExpiryResolution::Reject,
        });
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();

        let touched = h.controller.check_expired_approvals().await.unwrap();
        assert_eq!(touched, vec![id]);

        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn expired_approval_can_auto_approve_when_configured() {
        let h = harness_with_approval(ApprovalConfig {
            expiry_ms: 0,
            expiry_resolution: ExpiryResolution::Approve,
        });
        let id = h.controller.start("proj-A", HashMap::new()).await.unwrap();
        h.controller.complete_phase(id, 0).await.unwrap();

        h.controller.check_expired_approvals().await.unwrap();
        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.current_phase, 1);
        assert_eq!(execution.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn resume_latest_reenters_the_next_phase() {
        let h = harness();
        let id = advance_to_phase_five(&h).await;
        h.controller.complete_phase(id, 5).await.unwrap();
        h.controller
            .submit_approval(id, 5, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        h.controller.complete_phase(id, 6).await.unwrap();
        // Simulate a crash: phase 7 was in progress, process dies here.

        let (resumed_id, resume_phase) = h.controller.resume_latest().await.unwrap();
        assert_eq!(resumed_id, id);
        // Phases 0..=6 completed, so work restarts at 7.
        assert_eq!(resume_phase, 7);
        let execution = h.store.load_execution(id).unwrap();
        assert_eq!(execution.phase(7).unwrap().status, PhaseStatus::InProgress);
    }
}
