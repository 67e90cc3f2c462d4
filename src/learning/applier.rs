//! Apply engine: the sole owner of mutable system state.
//!
//! Every apply runs as a transaction: snapshot the state into a backup
//! record, mutate a working copy per the change type, commit by swapping
//! the copy in, then verify and (optionally) auto-restore the backup on
//! verification failure. Readers only ever observe the pre- or
//! post-transaction state. The audit record for the apply is written by
//! the pipeline immediately after the outcome is known.

use crate::errors::LearningError;
use crate::learning::backup::{BackupRecord, BackupStore};
use crate::learning::generator::{ChangeType, FixProposal};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

/// The mutable system state guarded by the apply engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SystemState {
    pub agent_definitions: BTreeMap<String, Value>,
    pub skill_configurations: BTreeMap<String, Value>,
    /// Validation rules keyed by target.
    pub validation_rules: BTreeMap<String, Value>,
    /// Configuration values keyed by target.
    pub system_config: BTreeMap<String, Value>,
    /// Recorded fix intents keyed by change id.
    pub fix_intents: BTreeMap<String, Value>,
}

impl SystemState {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("system state serializes")
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Outcome of one transactional apply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub change_id: String,
    pub applied: bool,
    /// True when verification failed and the backup was auto-restored.
    pub rolled_back: bool,
    pub backup_id: String,
    pub duration_ms: u64,
    pub error: Option<String>,
    /// Ordered log of the transaction's sub-operations.
    pub operations: Vec<String>,
}

/// The apply engine: system state plus its backup store.
pub struct ApplyEngine {
    state: SystemState,
    backups: BackupStore,
    verify_after_apply: bool,
    auto_rollback_on_failure: bool,
    /// When set, committed state is mirrored to this file and reloaded
    /// on startup, so applies survive restarts.
    state_path: Option<std::path::PathBuf>,
}

impl ApplyEngine {
    pub fn new(
        backups: BackupStore,
        verify_after_apply: bool,
        auto_rollback_on_failure: bool,
    ) -> Self {
        Self {
            state: SystemState::default(),
            backups,
            verify_after_apply,
            auto_rollback_on_failure,
            state_path: None,
        }
    }

    /// Mirror committed state to `path`, loading it first when present.
    pub fn with_persistence(mut self, path: std::path::PathBuf) -> Self {
        if let Ok(content) = std::fs::read_to_string(&path)
            && let Ok(state) = serde_json::from_str(&content)
        {
            self.state = state;
        }
        self.state_path = Some(path);
        self
    }

    fn persist_state(&self) {
        let Some(ref path) = self.state_path else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&self.state) {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, json).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
    }

    /// Read-only snapshot of the current state. This is the only way
    /// other components observe system state.
    pub fn snapshot(&self) -> SystemState {
        self.state.clone()
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Apply a proposal transactionally.
    pub fn apply(&mut self, proposal: &FixProposal) -> Result<ApplyOutcome, LearningError> {
        self.apply_with_verifier(proposal, verify_applied)
    }

    /// Apply with an injectable post-apply verifier (the seam the tests
    /// use to exercise the auto-restore path).
    fn apply_with_verifier(
        &mut self,
        proposal: &FixProposal,
        verifier: fn(&SystemState, &FixProposal) -> bool,
    ) -> Result<ApplyOutcome, LearningError> {
        let started = Instant::now();

        // Step 1: backup before anything mutates.
        let backup = self
            .backups
            .create(&proposal.change_id, self.state.to_value())?;

        // Steps 2–3: transaction over a working copy, operations logged.
        let mut working = self.state.clone();
        let operations = apply_operations(&mut working, proposal);

        // Step 4: commit. Readers now observe the post-transaction state.
        self.state = working;
        self.persist_state();
        tracing::info!(
            change_id = %proposal.change_id,
            change_type = proposal.change.change_type.as_str(),
            target = %proposal.change.target,
            "change applied"
        );

        // Step 5: verify, auto-restoring on failure when configured.
        if self.verify_after_apply && !verifier(&self.state, proposal) {
            if self.auto_rollback_on_failure {
                self.restore_from_backup(&backup)?;
                tracing::warn!(change_id = %proposal.change_id, "verification failed; backup restored");
                return Ok(ApplyOutcome {
                    change_id: proposal.change_id.clone(),
                    applied: false,
                    rolled_back: true,
                    backup_id: backup.backup_id,
                    duration_ms: started.elapsed().as_millis() as u64,
                    error: Some("post-apply verification failed".to_string()),
                    operations,
                });
            }
            return Ok(ApplyOutcome {
                change_id: proposal.change_id.clone(),
                applied: true,
                rolled_back: false,
                backup_id: backup.backup_id,
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some("post-apply verification failed".to_string()),
                operations,
            });
        }

        Ok(ApplyOutcome {
            change_id: proposal.change_id.clone(),
            applied: true,
            rolled_back: false,
            backup_id: backup.backup_id,
            duration_ms: started.elapsed().as_millis() as u64,
            error: None,
            operations,
        })
    }

    /// Restore system state from a backup. The checksums are the source
    /// of truth: a mismatch aborts without touching state.
    pub fn restore_from_backup(&mut self, backup: &BackupRecord) -> Result<(), LearningError> {
        backup.verify()?;
        self.state = SystemState::from_value(&backup.state).map_err(|e| {
            LearningError::ValidationRejected(format!("backup state does not decode: {}", e))
        })?;
        self.persist_state();
        Ok(())
    }
}

/// Mutate the working copy per the change type, returning the op log.
fn apply_operations(state: &mut SystemState, proposal: &FixProposal) -> Vec<String> {
    let change = &proposal.change;
    let mut operations = Vec::new();
    match change.change_type {
        ChangeType::ValidationRule | ChangeType::TypeCheck => {
            state.validation_rules.insert(
                change.target.clone(),
                serde_json::json!({
                    "rule": change.new_value,
                    "change_id": proposal.change_id,
                    "kind": change.change_type.as_str(),
                }),
            );
            operations.push(format!("validation_rules[{}] set", change.target));
        }
        ChangeType::DefaultValue | ChangeType::ConfigUpdate => {
            state.system_config.insert(
                change.target.clone(),
                change.new_value.clone().unwrap_or(Value::Null),
            );
            operations.push(format!("system_config[{}] set", change.target));
        }
        ChangeType::ErrorHandling | ChangeType::ConditionCheck | ChangeType::GenericFix => {
            state.fix_intents.insert(
                proposal.change_id.clone(),
                serde_json::json!({
                    "target": change.target,
                    "rationale": change.rationale,
                    "code_example": change.code_example,
                    "recorded_at": Utc::now(),
                }),
            );
            operations.push(format!("fix_intents[{}] recorded", proposal.change_id));
        }
    }
    operations
}

/// Post-apply check: the expected key exists in the mutated map.
fn verify_applied(state: &SystemState, proposal: &FixProposal) -> bool {
    match proposal.change.change_type {
        ChangeType::ValidationRule | ChangeType::TypeCheck => {
            state.validation_rules.contains_key(&proposal.change.target)
        }
        ChangeType::DefaultValue | ChangeType::ConfigUpdate => {
            state.system_config.contains_key(&proposal.change.target)
        }
        ChangeType::ErrorHandling | ChangeType::ConditionCheck | ChangeType::GenericFix => {
            state.fix_intents.contains_key(&proposal.change_id)
        }
    }
}
