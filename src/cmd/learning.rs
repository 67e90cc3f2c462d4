//! Learning command surface: apply, revert, log, stats, status.

use crate::cmd::CommandResult;
use crate::config::ConductorConfig;
use crate::events::EventBus;
use crate::learning::audit::AuditExecutionStatus;
use crate::learning::{AuditFilter, LearningPipeline, PipelineOutcome, RollbackTrigger};
use crate::monitor::Monitor;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Build a pipeline rooted at the project's state directory.
fn build_pipeline(project_dir: &Path) -> Result<LearningPipeline> {
    let config = ConductorConfig::load_or_default(project_dir)?;
    let state_root = config.resolve_state_root(project_dir);
    let events = EventBus::default();
    let monitor = Arc::new(Mutex::new(Monitor::new(
        config.retention.metrics_retention_hours,
        events.clone(),
    )));
    LearningPipeline::new(config, &state_root, monitor, events)
        .context("Failed to open the learning pipeline state")
}

fn parse_status(status: &str) -> Option<AuditExecutionStatus> {
    match status {
        "pending" => Some(AuditExecutionStatus::Pending),
        "success" => Some(AuditExecutionStatus::Success),
        "failed" => Some(AuditExecutionStatus::Failed),
        "rolled_back" => Some(AuditExecutionStatus::RolledBack),
        "rejected" => Some(AuditExecutionStatus::Rejected),
        "blocked" => Some(AuditExecutionStatus::Blocked),
        _ => None,
    }
}

/// `apply-learning [changeId=<id>] [dryRun=true]`
pub async fn cmd_apply_learning(
    project_dir: &Path,
    change_id: Option<&str>,
    dry_run: bool,
) -> CommandResult {
    let started = Instant::now();
    let command = "apply-learning";
    let mut pipeline = match build_pipeline(project_dir) {
        Ok(p) => p,
        Err(e) => return CommandResult::err(command, e, started),
    };

    let Some(change_id) = change_id else {
        let pending = pipeline.status().pending_approvals;
        return CommandResult::ok(
            command,
            if pending.is_empty() {
                "no pending proposals awaiting approval".to_string()
            } else {
                format!("{} proposals awaiting approval", pending.len())
            },
            Some(serde_json::json!({"pending": pending})),
            started,
        );
    };

    match pipeline.apply_pending(change_id, dry_run).await {
        Ok(PipelineOutcome::Applied { change_id, confidence }) => CommandResult::ok(
            command,
            format!("change {} applied (confidence {:.2})", change_id, confidence),
            None,
            started,
        ),
        Ok(PipelineOutcome::AwaitingApproval { change_id, confidence }) => CommandResult::ok(
            command,
            format!(
                "dry run: change {} would apply (confidence {:.2})",
                change_id, confidence
            ),
            None,
            started,
        ),
        Ok(PipelineOutcome::Blocked { change_id, reason }) => CommandResult::ok(
            command,
            format!("change {} blocked by safety: {}", change_id, reason),
            None,
            started,
        ),
        Ok(other) => CommandResult::ok(command, format!("{:?}", other), None, started),
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `revert-learning <changeId> [reason=...]`
pub async fn cmd_revert_learning(
    project_dir: &Path,
    change_id: &str,
    reason: Option<&str>,
) -> CommandResult {
    let started = Instant::now();
    let command = "revert-learning";
    let mut pipeline = match build_pipeline(project_dir) {
        Ok(p) => p,
        Err(e) => return CommandResult::err(command, e, started),
    };

    match pipeline
        .request_rollback(
            change_id,
            RollbackTrigger::ManualRequest,
            reason.unwrap_or("manual revert"),
        )
        .await
    {
        Ok(()) => CommandResult::ok(
            command,
            format!("change {} rolled back", change_id),
            None,
            started,
        ),
        Err(e) => CommandResult::err(command, e, started),
    }
}

/// `view-learning-log [limit=N] [status=...]`
pub async fn cmd_view_learning_log(
    project_dir: &Path,
    limit: Option<usize>,
    status: Option<&str>,
) -> CommandResult {
    let started = Instant::now();
    let command = "view-learning-log";
    let pipeline = match build_pipeline(project_dir) {
        Ok(p) => p,
        Err(e) => return CommandResult::err(command, e, started),
    };

    let status_filter = match status {
        Some(s) => match parse_status(s) {
            Some(parsed) => Some(parsed),
            None => {
                return CommandResult::err(
                    command,
                    format!(
                        "invalid status '{}'; expected pending, success, failed, rolled_back, rejected or blocked",
                        s
                    ),
                    started,
                );
            }
        },
        None => None,
    };

    let filter = AuditFilter {
        change_id: None,
        status: status_filter,
        limit,
    };
    let records: Vec<serde_json::Value> = pipeline
        .history(&filter)
        .into_iter()
        .map(|r| {
            serde_json::json!({
                "auditId": r.audit_id,
                "changeId": r.change_id,
                "timestamp": r.timestamp,
                "status": r.execution.status.as_str(),
                "confidence": r.decision.confidence,
                "action": r.decision.recommended_action,
            })
        })
        .collect();

    CommandResult::ok(
        command,
        format!("{} audit records", records.len()),
        Some(serde_json::json!({"records": records})),
        started,
    )
}

/// `view-learning-stats`
pub async fn cmd_view_learning_stats(project_dir: &Path) -> CommandResult {
    let started = Instant::now();
    let command = "view-learning-stats";
    let pipeline = match build_pipeline(project_dir) {
        Ok(p) => p,
        Err(e) => return CommandResult::err(command, e, started),
    };

    let stats = pipeline.stats().await;
    let integrity = pipeline.trail().verify_integrity();
    let now = chrono::Utc::now();
    let report = pipeline
        .trail()
        .generate_report(now - chrono::Duration::days(7), now);

    CommandResult::ok(
        command,
        format!(
            "{} audit records, integrity {}/{} valid",
            stats.audit_records, integrity.valid, integrity.total
        ),
        Some(serde_json::json!({
            "stats": stats,
            "integrity": integrity,
            "weekly_report": report,
        })),
        started,
    )
}

/// `learning-status`
pub async fn cmd_learning_status(project_dir: &Path) -> CommandResult {
    let started = Instant::now();
    let command = "learning-status";
    let pipeline = match build_pipeline(project_dir) {
        Ok(p) => p,
        Err(e) => return CommandResult::err(command, e, started),
    };

    let status = pipeline.status();
    CommandResult::ok(
        command,
        if status.halted {
            "learning pipeline HALTED (audit integrity violation)".to_string()
        } else {
            "learning pipeline ready".to_string()
        },
        Some(serde_json::to_value(&status).unwrap_or_default()),
        started,
    )
}
