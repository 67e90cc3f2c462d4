//! The closed learning loop: error capture → analysis → fix generation →
//! validation → safety → transactional apply → audit → auto-rollback.
//!
//! Stages short-circuit: a failure or rejection at any stage records its
//! outcome in the audit trail and stops. Apply/rollback outcomes feed
//! the pattern registry's known-fix list, the single feedback path that
//! boosts confidence for recurring errors. An audit integrity violation
//! halts automated apply until an operator intervenes.

use crate::config::ConductorConfig;
use crate::errors::LearningError;
use crate::events::{EventBus, SystemEvent};
use crate::learning::analyzer::AnalysisEngine;
use crate::learning::applier::ApplyEngine;
use crate::learning::audit::{
    AuditExecutionStatus, AuditFilter, AuditMetadata, AuditRecord, AuditTrail, DecisionBlock,
    ExecutionBlock, ImpactBlock,
};
use crate::learning::backup::BackupStore;
use crate::learning::generator::{FixProposal, GeneratorRegistry, ProposalStatus};
use crate::learning::logger::{ErrorLogger, RawError};
use crate::learning::rollback::{
    AutoRollbackMonitor, RollbackManager, RollbackRequest, RollbackTrigger,
};
use crate::learning::validator::{FixValidator, ValidationContext, ValidationResult};
use crate::monitor::{AlertSeverity, Monitor, counters};
use crate::safety::{SafetyCheckResult, SafetyContext, SafetyController};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};

/// Where one error ended up after a pipeline pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// The fix was applied (and the auto-rollback monitor armed).
    Applied { change_id: String, confidence: f64 },
    /// Validated and safe, parked until `apply-learning` confirms.
    AwaitingApproval { change_id: String, confidence: f64 },
    /// Validation rejected the best proposal.
    Rejected { change_id: String, reasons: Vec<String> },
    /// The safety controller refused the apply.
    Blocked { change_id: String, reason: String },
    /// No generator produced a proposal above the confidence floor.
    NoProposal,
    /// The error category is not learnable.
    NotLearnable,
    /// Automated apply is halted (audit integrity violation).
    Halted,
}

/// Aggregate statistics for `view-learning-stats`.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStats {
    pub errors_captured: u64,
    pub errors_resolved: u64,
    pub fixes_proposed: u64,
    pub fixes_applied: u64,
    pub fixes_rejected: u64,
    pub rollbacks_performed: u64,
    pub validation_passes: u64,
    pub validation_failures: u64,
    pub distinct_patterns: usize,
    pub pending_approvals: usize,
    pub audit_records: usize,
}

/// Current pipeline posture for `learning-status`.
#[derive(Debug, Clone, Serialize)]
pub struct LearningStatus {
    pub auto_apply: bool,
    pub auto_rollback: bool,
    pub confidence_threshold: f64,
    pub require_all_gates: bool,
    pub halted: bool,
    pub pending_approvals: Vec<String>,
}

/// The wired pipeline. Callers share it behind `Arc<Mutex<_>>`.
pub struct LearningPipeline {
    config: ConductorConfig,
    logger: ErrorLogger,
    analyzer: AnalysisEngine,
    generators: GeneratorRegistry,
    validator: FixValidator,
    safety: SafetyController,
    applier: ApplyEngine,
    rollback: RollbackManager,
    trail: AuditTrail,
    monitor: Arc<Mutex<Monitor>>,
    events: EventBus,
    /// Proposals validated but awaiting `apply-learning`.
    pending: HashMap<String, (FixProposal, ValidationResult)>,
    /// Applied proposals, for rollback bookkeeping and feedback.
    applied: HashMap<String, FixProposal>,
    rollback_tx: mpsc::UnboundedSender<RollbackRequest>,
    rollback_rx: Option<mpsc::UnboundedReceiver<RollbackRequest>>,
    /// Set when an integrity violation halts automated apply.
    halted: bool,
}

impl LearningPipeline {
    pub fn new(
        config: ConductorConfig,
        state_root: &Path,
        monitor: Arc<Mutex<Monitor>>,
        events: EventBus,
    ) -> Result<Self, LearningError> {
        let backups = BackupStore::new(
            state_root.join("backups"),
            config.retention.backup_retention_days,
        )?;
        let trail = AuditTrail::new(Some(state_root.join("audit")))?;
        let (rollback_tx, rollback_rx) = mpsc::unbounded_channel();

        Ok(Self {
            validator: FixValidator::new(
                config.learning.confidence_threshold,
                config.learning.require_all_gates,
            ),
            safety: SafetyController::new(config.safety.clone()),
            applier: ApplyEngine::new(
                backups,
                config.learning.verify_after_apply,
                config.learning.auto_rollback_on_failure,
            )
            .with_persistence(state_root.join("cache/system_state.json")),
            rollback: RollbackManager::default(),
            logger: ErrorLogger::new(),
            analyzer: AnalysisEngine::new(),
            generators: GeneratorRegistry::with_builtin_generators(),
            trail,
            monitor,
            events,
            pending: HashMap::new(),
            applied: HashMap::new(),
            rollback_tx,
            rollback_rx: Some(rollback_rx),
            halted: false,
            config,
        })
    }

    /// Take the auto-rollback request receiver (once) so the platform
    /// can drive queued requests back into [`Self::request_rollback`].
    pub fn take_rollback_rx(&mut self) -> Option<mpsc::UnboundedReceiver<RollbackRequest>> {
        self.rollback_rx.take()
    }

    pub fn safety_mut(&mut self) -> &mut SafetyController {
        &mut self.safety
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    pub fn logger(&self) -> &ErrorLogger {
        &self.logger
    }

    /// Run one error through the full loop.
    pub async fn process_error(&mut self, raw: RawError) -> Result<PipelineOutcome, LearningError> {
        // Stage 1: capture.
        let entry = self.logger.capture(raw);
        {
            let mut monitor = self.monitor.lock().await;
            monitor.incr(counters::ERRORS_CAPTURED);
            monitor.record_error_kind(entry.category.as_str());
        }
        self.events.emit(SystemEvent::ErrorCaptured {
            error_id: entry.id.clone(),
            category: entry.category.as_str().to_string(),
            severity: entry.severity.as_str().to_string(),
        });

        if !entry.learnable {
            return Ok(PipelineOutcome::NotLearnable);
        }

        // Stage 2: analysis.
        let started = Instant::now();
        let analysis = self.analyzer.analyze(&entry);
        self.monitor
            .lock()
            .await
            .observe("analysis_duration_ms", started.elapsed().as_millis() as f64);

        // Stage 3: generation.
        let started = Instant::now();
        let proposals = self.generators.generate(
            &entry,
            &analysis,
            self.config.learning.min_proposal_confidence,
        );
        {
            let mut monitor = self.monitor.lock().await;
            monitor.incr_by(counters::FIXES_PROPOSED, proposals.len() as u64);
            monitor.observe("fix_duration_ms", started.elapsed().as_millis() as f64);
        }
        let Some(mut proposal) = proposals.into_iter().next() else {
            return Ok(PipelineOutcome::NoProposal);
        };

        // Stage 4: validation (five gates).
        let validation = self.validator.validate(&proposal, &ValidationContext::default());
        {
            let mut monitor = self.monitor.lock().await;
            if validation.all_gates_passed {
                monitor.incr(counters::VALIDATION_PASSES);
            } else {
                monitor.incr(counters::VALIDATION_FAILURES);
            }
        }
        if !validation.approved {
            proposal.status = ProposalStatus::Rejected;
            self.audit_rejection(&proposal, &validation, AuditExecutionStatus::Rejected)?;
            self.monitor.lock().await.incr(counters::FIXES_REJECTED);
            self.events.emit(SystemEvent::FixRejected {
                change_id: proposal.change_id.clone(),
                reason: "validation".to_string(),
            });
            return Ok(PipelineOutcome::Rejected {
                change_id: proposal.change_id,
                reasons: validation.recommendations,
            });
        }
        proposal.status = ProposalStatus::Validated;
        self.events.emit(SystemEvent::FixValidated {
            change_id: proposal.change_id.clone(),
            confidence: validation.overall_confidence,
        });

        // Stage 5: safety.
        let safety_result = self.safety.check(&SafetyContext {
            change_id: proposal.change_id.clone(),
            confidence: validation.overall_confidence,
            risk: proposal.risk,
            production: false,
        });
        if !safety_result.allowed {
            let reason = safety_result
                .reason
                .clone()
                .unwrap_or_else(|| "blocked".to_string());
            self.audit_rejection(&proposal, &validation, AuditExecutionStatus::Blocked)?;
            self.events.emit(SystemEvent::FixRejected {
                change_id: proposal.change_id.clone(),
                reason: reason.clone(),
            });
            return Ok(PipelineOutcome::Blocked {
                change_id: proposal.change_id,
                reason,
            });
        }

        // Stage 6: apply, or park for manual confirmation.
        if !self.config.learning.auto_apply {
            let change_id = proposal.change_id.clone();
            let confidence = validation.overall_confidence;
            self.pending.insert(change_id.clone(), (proposal, validation));
            return Ok(PipelineOutcome::AwaitingApproval {
                change_id,
                confidence,
            });
        }

        self.apply_validated(proposal, validation, safety_result).await
    }

    /// Apply a proposal that already passed validation and safety.
    async fn apply_validated(
        &mut self,
        mut proposal: FixProposal,
        validation: ValidationResult,
        _safety: SafetyCheckResult,
    ) -> Result<PipelineOutcome, LearningError> {
        if self.halted {
            return Ok(PipelineOutcome::Halted);
        }

        // Integrity check gates every automated apply.
        let integrity = self.trail.verify_integrity();
        if !integrity.all_valid() {
            self.halt_on_integrity_violation(&integrity.invalid).await;
            return Ok(PipelineOutcome::Halted);
        }

        self.trail.record_decision(
            &proposal.change_id,
            DecisionBlock {
                proposed_by: "fix-generator".to_string(),
                approved_by: if self.config.learning.auto_apply {
                    "auto-apply".to_string()
                } else {
                    "operator".to_string()
                },
                reasoning: proposal.change.rationale.clone(),
                confidence: validation.overall_confidence,
                recommended_action: "apply".to_string(),
            },
            AuditMetadata::default(),
        )?;

        let started = Instant::now();
        let outcome = self.applier.apply(&proposal)?;
        self.monitor
            .lock()
            .await
            .observe("apply_duration_ms", started.elapsed().as_millis() as f64);

        let success = outcome.applied && !outcome.rolled_back;
        self.trail.record_execution(
            &proposal.change_id,
            ExecutionBlock {
                applied_at: Some(Utc::now()),
                status: if success {
                    AuditExecutionStatus::Success
                } else {
                    AuditExecutionStatus::RolledBack
                },
                duration: Some(outcome.duration_ms),
                error: outcome.error.clone(),
            },
            ImpactBlock {
                errors_resolved: u32::from(success),
                ..Default::default()
            },
        )?;

        // Feedback: the single authoritative path into known fixes.
        self.analyzer.registry_mut().record_fix_outcome(
            &proposal.pattern_hash,
            &proposal.change_id,
            proposal.strategy.as_str(),
            success,
        );

        if !success {
            self.safety.record_failure(&proposal.change_id);
            self.events.emit(SystemEvent::FixRejected {
                change_id: proposal.change_id.clone(),
                reason: "post-apply verification failed".to_string(),
            });
            return Ok(PipelineOutcome::Rejected {
                change_id: proposal.change_id,
                reasons: vec![outcome.error.unwrap_or_default()],
            });
        }

        proposal.status = ProposalStatus::Applied;
        self.safety.record_apply();
        self.logger
            .mark_resolved(&proposal.source_error_id, &proposal.change_id);
        {
            let mut monitor = self.monitor.lock().await;
            monitor.incr(counters::FIXES_APPLIED);
            monitor.incr(counters::ERRORS_RESOLVED);
        }
        self.events.emit(SystemEvent::FixApplied {
            change_id: proposal.change_id.clone(),
        });

        // Arm the auto-rollback monitor for the watch window.
        if self.config.learning.auto_rollback {
            let baseline = self.monitor.lock().await.capture_baseline();
            AutoRollbackMonitor::arm(
                proposal.change_id.clone(),
                self.config.rollback.clone(),
                baseline,
                self.monitor.clone(),
                self.rollback_tx.clone(),
            );
        }

        let change_id = proposal.change_id.clone();
        let confidence = validation.overall_confidence;
        self.applied.insert(change_id.clone(), proposal);
        Ok(PipelineOutcome::Applied {
            change_id,
            confidence,
        })
    }

    /// Confirm a parked proposal (the `apply-learning` command). With
    /// `dry_run`, report what would happen without mutating anything.
    pub async fn apply_pending(
        &mut self,
        change_id: &str,
        dry_run: bool,
    ) -> Result<PipelineOutcome, LearningError> {
        let (proposal, validation) = self
            .pending
            .get(change_id)
            .cloned()
            .ok_or_else(|| LearningError::ChangeNotFound(change_id.to_string()))?;

        let safety_result = self.safety.check(&SafetyContext {
            change_id: proposal.change_id.clone(),
            confidence: validation.overall_confidence,
            risk: proposal.risk,
            production: false,
        });
        if !safety_result.allowed {
            return Ok(PipelineOutcome::Blocked {
                change_id: proposal.change_id,
                reason: safety_result.reason.unwrap_or_else(|| "blocked".to_string()),
            });
        }
        if dry_run {
            return Ok(PipelineOutcome::AwaitingApproval {
                change_id: proposal.change_id,
                confidence: validation.overall_confidence,
            });
        }

        self.pending.remove(change_id);
        self.apply_validated(proposal, validation, safety_result).await
    }

    /// Roll an applied change back (manual or auto-triggered).
    pub async fn request_rollback(
        &mut self,
        change_id: &str,
        trigger: RollbackTrigger,
        reason: &str,
    ) -> Result<(), LearningError> {
        let info = self.rollback.rollback(
            &mut self.applier,
            &mut self.trail,
            change_id,
            trigger,
            reason,
        )?;

        if let Some(proposal) = self.applied.remove(change_id) {
            self.analyzer.registry_mut().record_fix_outcome(
                &proposal.pattern_hash,
                change_id,
                proposal.strategy.as_str(),
                false,
            );
        }
        self.monitor
            .lock()
            .await
            .incr(counters::ROLLBACKS_PERFORMED);
        self.events.emit(SystemEvent::RollbackComplete {
            change_id: change_id.to_string(),
            trigger: info.trigger.clone(),
        });
        Ok(())
    }

    /// Drive one queued auto-rollback request, if any.
    pub async fn drain_rollback_request(
        &mut self,
        request: RollbackRequest,
    ) -> Result<(), LearningError> {
        match self
            .request_rollback(&request.change_id, request.trigger, &request.reason)
            .await
        {
            // A second trigger for the same change can race the first.
            Err(LearningError::AlreadyRolledBack(_)) => Ok(()),
            other => other,
        }
    }

    async fn halt_on_integrity_violation(&mut self, invalid: &[String]) {
        self.halted = true;
        let mut monitor = self.monitor.lock().await;
        monitor.raise_alert("audit-integrity-violation", "audit", AlertSeverity::Critical);
        for audit_id in invalid {
            self.events.emit(SystemEvent::IntegrityViolation {
                audit_id: audit_id.clone(),
            });
        }
        tracing::error!(invalid = invalid.len(), "audit integrity violation; automated apply halted");
    }

    fn audit_rejection(
        &mut self,
        proposal: &FixProposal,
        validation: &ValidationResult,
        status: AuditExecutionStatus,
    ) -> Result<(), LearningError> {
        self.trail.record_decision(
            &proposal.change_id,
            DecisionBlock {
                proposed_by: "fix-generator".to_string(),
                approved_by: "validator".to_string(),
                reasoning: validation.recommendations.join("; "),
                confidence: validation.overall_confidence,
                recommended_action: "reject".to_string(),
            },
            AuditMetadata::default(),
        )?;
        self.trail.record_execution(
            &proposal.change_id,
            ExecutionBlock {
                applied_at: None,
                status,
                duration: None,
                error: Some(validation.recommendations.join("; ")),
            },
            ImpactBlock::default(),
        )?;
        Ok(())
    }

    /// Audit history for `view-learning-log`.
    pub fn history(&self, filter: &AuditFilter) -> Vec<&AuditRecord> {
        self.trail.history(filter)
    }

    /// Aggregate statistics for `view-learning-stats`.
    pub async fn stats(&self) -> LearningStats {
        let monitor = self.monitor.lock().await;
        LearningStats {
            errors_captured: monitor.counter(counters::ERRORS_CAPTURED),
            errors_resolved: monitor.counter(counters::ERRORS_RESOLVED),
            fixes_proposed: monitor.counter(counters::FIXES_PROPOSED),
            fixes_applied: monitor.counter(counters::FIXES_APPLIED),
            fixes_rejected: monitor.counter(counters::FIXES_REJECTED),
            rollbacks_performed: monitor.counter(counters::ROLLBACKS_PERFORMED),
            validation_passes: monitor.counter(counters::VALIDATION_PASSES),
            validation_failures: monitor.counter(counters::VALIDATION_FAILURES),
            distinct_patterns: self.analyzer.registry().len(),
            pending_approvals: self.pending.len(),
            audit_records: self.trail.history(&AuditFilter::default()).len(),
        }
    }

    /// Posture summary for `learning-status`.
    pub fn status(&self) -> LearningStatus {
        LearningStatus {
            auto_apply: self.config.learning.auto_apply,
            auto_rollback: self.config.learning.auto_rollback,
            confidence_threshold: self.config.learning.confidence_threshold,
            require_all_gates: self.config.learning.require_all_gates,
            halted: self.halted,
            pending_approvals: self.pending.keys().cloned().collect(),
        }
    }
}
