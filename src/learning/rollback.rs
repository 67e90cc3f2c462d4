//! Rollback manager: manual and automatic unwinding of applied changes.
//!
//! The rollback procedure validates the request, locates the backup,
//! verifies its checksums, restores it, then writes both the superseding
//! audit record and a distinct rollback record. The auto-rollback
//! monitor watches the metric baseline for a configurable window after
//! each apply and requests a rollback when the error rate, error set,
//! response time or memory regress past their thresholds.

use crate::config::RollbackConfig;
use crate::errors::LearningError;
use crate::learning::applier::ApplyEngine;
use crate::learning::audit::{AuditExecutionStatus, AuditTrail, RollbackInfo};
use crate::monitor::{MetricsBaseline, Monitor};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// What initiated a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    ManualRequest,
    VerificationFailure,
    ErrorRateIncreased,
    NewErrorsDetected,
    PerformanceDegradation,
    ResourceExhaustion,
    Timeout,
}

impl RollbackTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackTrigger::ManualRequest => "manual_request",
            RollbackTrigger::VerificationFailure => "verification_failure",
            RollbackTrigger::ErrorRateIncreased => "error_rate_increased",
            RollbackTrigger::NewErrorsDetected => "new_errors_detected",
            RollbackTrigger::PerformanceDegradation => "performance_degradation",
            RollbackTrigger::ResourceExhaustion => "resource_exhaustion",
            RollbackTrigger::Timeout => "timeout",
        }
    }
}

/// A rollback request, queued toward the pipeline.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub change_id: String,
    pub trigger: RollbackTrigger,
    pub reason: String,
    pub high_priority: bool,
}

/// Executes rollback procedures against the apply engine and audit
/// trail.
pub struct RollbackManager {
    verify_restoration: bool,
}

impl Default for RollbackManager {
    fn default() -> Self {
        Self {
            verify_restoration: true,
        }
    }
}

impl RollbackManager {
    pub fn new(verify_restoration: bool) -> Self {
        Self { verify_restoration }
    }

    /// Run the full rollback procedure for a change.
    pub fn rollback(
        &self,
        engine: &mut ApplyEngine,
        trail: &mut AuditTrail,
        change_id: &str,
        trigger: RollbackTrigger,
        reason: &str,
    ) -> Result<RollbackInfo, LearningError> {
        // Validate: the change must exist and not be rolled back already.
        let latest = trail
            .latest_for_change(change_id)
            .ok_or_else(|| LearningError::ChangeNotFound(change_id.to_string()))?;
        if latest.execution.status == AuditExecutionStatus::RolledBack {
            return Err(LearningError::AlreadyRolledBack(change_id.to_string()));
        }

        // Locate the backup; its checksums gate the restore.
        let backup = engine
            .backups()
            .find_by_change(change_id)?
            .ok_or_else(|| LearningError::BackupNotFound(change_id.to_string()))?;

        engine.restore_from_backup(&backup)?;

        if self.verify_restoration {
            let restored = engine.snapshot().to_value();
            if crate::util::canonical_json(&restored) != crate::util::canonical_json(&backup.state)
            {
                return Err(LearningError::ValidationRejected(
                    "restored state does not match the backup".to_string(),
                ));
            }
        }

        let info = RollbackInfo {
            rolled_back_at: Utc::now(),
            trigger: trigger.as_str().to_string(),
            backup_id: backup.backup_id.clone(),
            restored: true,
            reason: reason.to_string(),
        };
        trail.record_rollback(change_id, info.clone())?;
        tracing::info!(change_id, trigger = trigger.as_str(), "rollback complete");
        Ok(info)
    }
}

/// Watches post-apply metrics against a baseline and requests a rollback
/// when they regress.
pub struct AutoRollbackMonitor;

impl AutoRollbackMonitor {
    /// Compare current metrics against the baseline; the first breached
    /// threshold wins.
    pub fn detect_regression(
        config: &RollbackConfig,
        baseline: &MetricsBaseline,
        monitor: &Monitor,
    ) -> Option<(RollbackTrigger, String)> {
        let error_rate = monitor.gauge("error_rate");
        let mut threshold = config.error_rate_threshold;
        if config.scale_with_baseline {
            threshold *= (baseline.error_rate / 0.05).max(1.0);
        }
        let delta = error_rate - baseline.error_rate;
        if delta > threshold {
            return Some((
                RollbackTrigger::ErrorRateIncreased,
                format!(
                    "error rate rose {:.0}pp (baseline {:.2}, now {:.2})",
                    delta * 100.0,
                    baseline.error_rate,
                    error_rate
                ),
            ));
        }

        let new_kinds: Vec<String> = monitor
            .error_kinds()
            .difference(&baseline.error_kinds)
            .cloned()
            .collect();
        if !new_kinds.is_empty() {
            return Some((
                RollbackTrigger::NewErrorsDetected,
                format!("new error kinds: {}", new_kinds.join(", ")),
            ));
        }

        let response = monitor.gauge("response_time_ms");
        if baseline.response_time_ms > 0.0
            && response > baseline.response_time_ms * (1.0 + config.performance_threshold)
        {
            return Some((
                RollbackTrigger::PerformanceDegradation,
                format!(
                    "response time {:.0}ms exceeds baseline {:.0}ms by more than {:.0}%",
                    response,
                    baseline.response_time_ms,
                    config.performance_threshold * 100.0
                ),
            ));
        }

        let memory = monitor.gauge("memory_mib");
        if memory - baseline.memory_mib > config.memory_threshold_mib {
            return Some((
                RollbackTrigger::ResourceExhaustion,
                format!(
                    "memory grew {:.0} MiB past the baseline",
                    memory - baseline.memory_mib
                ),
            ));
        }

        None
    }

    /// Arm the monitor for one applied change. The task checks every
    /// `check_interval` for `monitor_duration`, then disarms.
    pub fn arm(
        change_id: String,
        config: RollbackConfig,
        baseline: MetricsBaseline,
        monitor: Arc<Mutex<Monitor>>,
        requests: mpsc::UnboundedSender<RollbackRequest>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let checks = (config.monitor_duration_secs / config.check_interval_secs.max(1)).max(1);
            let interval = Duration::from_secs(config.check_interval_secs.max(1));
            for _ in 0..checks {
                tokio::time::sleep(interval).await;
                let detected = {
                    let guard = monitor.lock().await;
                    Self::detect_regression(&config, &baseline, &guard)
                };
                if let Some((trigger, reason)) = detected {
                    tracing::warn!(change_id = %change_id, trigger = trigger.as_str(), "regression detected");
                    let _ = requests.send(RollbackRequest {
                        change_id,
                        trigger,
                        reason,
                        high_priority: true,
                    });
                    return;
                }
            }
            tracing::debug!(change_id = %change_id, "auto-rollback window closed without regression");
        })
    }
}
