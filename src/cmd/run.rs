//! Execution command surface: run, status, resume, approve, cancel.

use crate::bus::MessageBus;
use crate::cmd::CommandResult;
use crate::config::ConductorConfig;
use crate::controller::{ApprovalDecision, PhaseController};
use crate::events::EventBus;
use crate::registry::AgentRegistry;
use crate::state::StateStore;
use crate::workflow::WorkflowDefinition;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Runtime {
    controller: PhaseController,
    store: Arc<StateStore>,
}

/// Assemble the controller stack over the project's state directory.
/// Agent handlers attach in the embedding runtime; the CLI manages
/// execution lifecycle and approvals.
fn build_runtime(project_dir: &Path) -> Result<Runtime> {
    let config = ConductorConfig::load_or_default(project_dir)?;
    let state_root = config.resolve_state_root(project_dir);
    let store = Arc::new(StateStore::open(&state_root).context("Failed to open state store")?);
    let events = EventBus::default();
    let registry = Arc::new(RwLock::new(AgentRegistry::with_default_catalog()));
    let bus = MessageBus::new(registry, events.clone(), config.bus.clone());
    let controller = PhaseController::new(
        WorkflowDefinition::standard(),
        store.clone(),
        bus,
        events,
        config.approval.clone(),
    );
    Ok(Runtime { controller, store })
}

/// `run <project>` — create an execution and enter phase 0.
pub async fn cmd_run(project_dir: &Path, project: &str) -> CommandResult {
    let started = Instant::now();
    let command = "run";
    let runtime = match build_runtime(project_dir) {
        Ok(r) => r,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match runtime
        .controller
        .start(project, Default::default())
        .await
    {
        Ok(id) => CommandResult::ok(
            command,
            format!("execution {} started for project '{}'", id, project),
            Some(serde_json::json!({"execution_id": id, "phase": 0})),
            started,
        ),
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `status` — list executions, most recent first.
pub async fn cmd_status(project_dir: &Path) -> CommandResult {
    let started = Instant::now();
    let command = "status";
    let runtime = match build_runtime(project_dir) {
        Ok(r) => r,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match runtime.store.list_executions() {
        Ok(executions) => {
            let rows: Vec<serde_json::Value> = executions
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "execution_id": e.id,
                        "project": e.project,
                        "status": e.status.as_str(),
                        "current_phase": e.current_phase,
                        "updated_at": e.updated_at,
                    })
                })
                .collect();
            CommandResult::ok(
                command,
                format!("{} executions", rows.len()),
                Some(serde_json::json!({"executions": rows})),
                started,
            )
        }
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `resume` — re-enter the most recently updated resumable execution.
pub async fn cmd_resume(project_dir: &Path) -> CommandResult {
    let started = Instant::now();
    let command = "resume";
    let runtime = match build_runtime(project_dir) {
        Ok(r) => r,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match runtime.controller.resume_latest().await {
        Ok((id, phase)) => CommandResult::ok(
            command,
            format!("execution {} resumed at phase {}", id, phase),
            Some(serde_json::json!({"execution_id": id, "resume_phase": phase})),
            started,
        ),
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `approve <execution> <phase> <decision>` — resolve an approval gate.
pub async fn cmd_approve(
    project_dir: &Path,
    execution_id: Uuid,
    phase: usize,
    decision: ApprovalDecision,
    feedback: Option<String>,
) -> CommandResult {
    let started = Instant::now();
    let command = "approve";
    let runtime = match build_runtime(project_dir) {
        Ok(r) => r,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match runtime
        .controller
        .submit_approval(execution_id, phase, decision, feedback)
        .await
    {
        Ok(outcome) => CommandResult::ok(
            command,
            match outcome {
                Some(o) => format!("decision recorded: {:?}", o),
                None => "decision recorded; phase still waiting on other gates".to_string(),
            },
            None,
            started,
        ),
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `cancel <execution>` — cancel an active execution.
pub async fn cmd_cancel(project_dir: &Path, execution_id: Uuid) -> CommandResult {
    let started = Instant::now();
    let command = "cancel";
    let runtime = match build_runtime(project_dir) {
        Ok(r) => r,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match runtime.controller.cancel(execution_id).await {
        Ok(()) => CommandResult::ok(
            command,
            format!("execution {} cancelled", execution_id),
            None,
            started,
        ),
        Err(e) => CommandResult::err(command, e, started),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn run_then_status_round_trips_through_the_store() {
        let dir = tempdir().unwrap();

        let run = cmd_run(dir.path(), "proj-A").await;
        assert!(run.success, "{:?}", run.error);

        let status = cmd_status(dir.path()).await;
        assert!(status.success);
        let executions = &status.data.as_ref().unwrap()["executions"];
        assert_eq!(executions.as_array().unwrap().len(), 1);
        assert_eq!(executions[0]["project"], "proj-A");
        assert_eq!(executions[0]["status"], "running");
    }

    #[tokio::test]
    async fn resume_without_executions_reports_the_error() {
        let dir = tempdir().unwrap();
        let result = cmd_resume(dir.path()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("No resumable execution"));
    }

    #[tokio::test]
    async fn cancel_unknown_execution_fails_cleanly() {
        let dir = tempdir().unwrap();
        let result = cmd_cancel(dir.path(), Uuid::new_v4()).await;
        assert!(!result.success);
    }
}
