//! Audit trail: append-only, integrity-hashed records of every decision,
//! apply and rollback.
//!
//! The integrity hash is SHA-256 over the canonical JSON of the record
//! with the `integrityHash` field removed. Records are never mutated;
//! the execution, impact and rollback blocks change only by writing a
//! new record that supersedes the old one for the same change id, with
//! its own hash. A hash mismatch during verification is a fatal event
//! for automated apply.

use crate::errors::{LearningError, StoreError};
use crate::util::canonical_json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// Outcome status of the execution block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditExecutionStatus {
    Pending,
    Success,
    Failed,
    RolledBack,
    Rejected,
    Blocked,
}

impl AuditExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditExecutionStatus::Pending => "pending",
            AuditExecutionStatus::Success => "success",
            AuditExecutionStatus::Failed => "failed",
            AuditExecutionStatus::RolledBack => "rolled_back",
            AuditExecutionStatus::Rejected => "rejected",
            AuditExecutionStatus::Blocked => "blocked",
        }
    }
}

/// Who proposed and approved the change, and why.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionBlock {
    pub proposed_by: String,
    pub approved_by: String,
    pub reasoning: String,
    pub confidence: f64,
    pub recommended_action: String,
}

/// What happened when the change was executed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBlock {
    pub applied_at: Option<DateTime<Utc>>,
    pub status: AuditExecutionStatus,
    /// Milliseconds the apply took, when known.
    pub duration: Option<u64>,
    pub error: Option<String>,
}

impl ExecutionBlock {
    pub fn pending() -> Self {
        Self {
            applied_at: None,
            status: AuditExecutionStatus::Pending,
            duration: None,
            error: None,
        }
    }
}

/// Observed impact after the change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImpactBlock {
    pub errors_resolved: u32,
    pub new_errors_introduced: u32,
    /// Signed performance delta; negative is a regression.
    pub performance_impact: f64,
}

/// How and why the change was rolled back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackInfo {
    pub rolled_back_at: DateTime<Utc>,
    pub trigger: String,
    pub backup_id: String,
    pub restored: bool,
    pub reason: String,
}

/// Correlation metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditMetadata {
    pub execution_id: Option<String>,
    pub user_id: String,
    pub system: String,
    pub version: String,
}

impl Default for AuditMetadata {
    fn default() -> Self {
        Self {
            execution_id: None,
            user_id: "system".to_string(),
            system: "learning-pipeline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One audit record. Canonical JSON uses camelCase field names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: String,
    pub change_id: String,
    pub timestamp: DateTime<Utc>,
    pub decision: DecisionBlock,
    pub execution: ExecutionBlock,
    pub impact: ImpactBlock,
    pub rollback_info: Option<RollbackInfo>,
    pub metadata: AuditMetadata,
    pub integrity_hash: String,
}

impl AuditRecord {
    /// Build an unsealed record; [`AuditRecord::seal`] computes the hash.
    pub fn new(change_id: &str, decision: DecisionBlock, metadata: AuditMetadata) -> Self {
        Self {
            audit_id: format!("aud-{}", &Uuid::new_v4().to_string()[..12]),
            change_id: change_id.to_string(),
            timestamp: Utc::now(),
            decision,
            execution: ExecutionBlock::pending(),
            impact: ImpactBlock::default(),
            rollback_info: None,
            metadata,
            integrity_hash: String::new(),
        }
    }

    /// SHA-256 over the canonical JSON with `integrityHash` removed.
    pub fn compute_integrity_hash(&self) -> String {
        let mut value = serde_json::to_value(self).expect("audit record serializes");
        if let Some(map) = value.as_object_mut() {
            map.remove("integrityHash");
        }
        let canonical = canonical_json(&value);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Compute and store the integrity hash.
    pub fn seal(mut self) -> Self {
        self.integrity_hash = self.compute_integrity_hash();
        self
    }

    /// Recompute the hash and compare against the stored one.
    pub fn verify(&self) -> bool {
        self.compute_integrity_hash() == self.integrity_hash
    }
}

/// Result of a full-trail integrity verification.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub total: usize,
    pub valid: usize,
    pub invalid: Vec<String>,
}

impl IntegrityReport {
    pub fn all_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

/// Filter for trail queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub change_id: Option<String>,
    pub status: Option<AuditExecutionStatus>,
    pub limit: Option<usize>,
}

/// Aggregate report over a time range.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_records: usize,
    pub applied: usize,
    pub rolled_back: usize,
    pub rejected: usize,
    pub errors_resolved: u32,
    pub new_errors_introduced: u32,
    /// Confidence histogram: [<0.5, 0.5..0.7, 0.7..0.85, 0.85..=1.0].
    pub confidence_distribution: [usize; 4],
    pub recent_changes: Vec<String>,
}

/// The append-only trail: in-memory index, durable JSON files.
pub struct AuditTrail {
    records: HashMap<String, AuditRecord>,
    /// change id → audit ids, oldest first.
    by_change: HashMap<String, Vec<String>>,
    /// Insertion order of audit ids.
    order: Vec<String>,
    /// Durable directory; `None` keeps the trail memory-only.
    dir: Option<PathBuf>,
}

impl AuditTrail {
    /// Open a trail, loading any durable records found in `dir` (oldest
    /// first, so insertion order survives restarts).
    pub fn new(dir: Option<PathBuf>) -> Result<Self, StoreError> {
        let mut trail = Self {
            records: HashMap::new(),
            by_change: HashMap::new(),
            order: Vec::new(),
            dir,
        };
        if let Some(dir) = trail.dir.clone() {
            fs::create_dir_all(&dir)
                .map_err(|e| StoreError::io("create directory", dir.clone(), e))?;
            let mut loaded: Vec<AuditRecord> = Vec::new();
            let entries = fs::read_dir(&dir)
                .map_err(|e| StoreError::io("read directory", dir.clone(), e))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = fs::read_to_string(&path)
                    .map_err(|e| StoreError::io("read audit record", path.clone(), e))?;
                let record: AuditRecord = serde_json::from_str(&content)
                    .map_err(|e| StoreError::Decode { path, source: e })?;
                loaded.push(record);
            }
            loaded.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            for record in loaded {
                trail
                    .by_change
                    .entry(record.change_id.clone())
                    .or_default()
                    .push(record.audit_id.clone());
                trail.order.push(record.audit_id.clone());
                trail.records.insert(record.audit_id.clone(), record);
            }
        }
        Ok(trail)
    }

    fn persist(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let Some(ref dir) = self.dir else {
            return Ok(());
        };
        let path = dir.join(format!("{}.json", record.audit_id));
        let json = serde_json::to_string_pretty(record).map_err(|e| StoreError::Encode {
            what: "audit record",
            source: e,
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| StoreError::io("write temp file", tmp.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io("rename into place", path, e))
    }

    fn append(&mut self, record: AuditRecord) -> Result<AuditRecord, StoreError> {
        self.persist(&record)?;
        self.by_change
            .entry(record.change_id.clone())
            .or_default()
            .push(record.audit_id.clone());
        self.order.push(record.audit_id.clone());
        self.records.insert(record.audit_id.clone(), record.clone());
        Ok(record)
    }

    /// Record a decision about a change (execution still pending).
    pub fn record_decision(
        &mut self,
        change_id: &str,
        decision: DecisionBlock,
        metadata: AuditMetadata,
    ) -> Result<AuditRecord, StoreError> {
        let record = AuditRecord::new(change_id, decision, metadata).seal();
        self.append(record)
    }

    /// Record the execution outcome by superseding the latest record for
    /// the change with a new sealed record.
    pub fn record_execution(
        &mut self,
        change_id: &str,
        execution: ExecutionBlock,
        impact: ImpactBlock,
    ) -> Result<AuditRecord, LearningError> {
        let base = self
            .latest_for_change(change_id)
            .cloned()
            .ok_or_else(|| LearningError::ChangeNotFound(change_id.to_string()))?;
        let mut record = base;
        record.audit_id = format!("aud-{}", &Uuid::new_v4().to_string()[..12]);
        record.timestamp = Utc::now();
        record.execution = execution;
        record.impact = impact;
        let record = record.seal();
        Ok(self.append(record)?)
    }

    /// Record a rollback: supersede the original with its rollback block
    /// set, and append a distinct rollback record.
    pub fn record_rollback(
        &mut self,
        change_id: &str,
        rollback: RollbackInfo,
    ) -> Result<AuditRecord, LearningError> {
        let base = self
            .latest_for_change(change_id)
            .cloned()
            .ok_or_else(|| LearningError::ChangeNotFound(change_id.to_string()))?;

        // Superseding copy of the original, now carrying rollback info.
        let mut superseding = base.clone();
        superseding.audit_id = format!("aud-{}", &Uuid::new_v4().to_string()[..12]);
        superseding.timestamp = Utc::now();
        superseding.execution.status = AuditExecutionStatus::RolledBack;
        superseding.rollback_info = Some(rollback.clone());
        let superseding = superseding.seal();
        self.append(superseding)?;

        // The rollback event as its own record.
        let decision = DecisionBlock {
            proposed_by: "rollback-manager".to_string(),
            approved_by: "system".to_string(),
            reasoning: rollback.reason.clone(),
            confidence: 1.0,
            recommended_action: "rollback".to_string(),
        };
        let mut record = AuditRecord::new(change_id, decision, base.metadata.clone());
        record.execution = ExecutionBlock {
            applied_at: Some(rollback.rolled_back_at),
            status: AuditExecutionStatus::RolledBack,
            duration: None,
            error: None,
        };
        record.rollback_info = Some(rollback);
        let record = record.seal();
        Ok(self.append(record)?)
    }

    pub fn get(&self, audit_id: &str) -> Option<&AuditRecord> {
        self.records.get(audit_id)
    }

    /// The newest record for a change id.
    pub fn latest_for_change(&self, change_id: &str) -> Option<&AuditRecord> {
        self.by_change
            .get(change_id)?
            .last()
            .and_then(|id| self.records.get(id))
    }

    /// Query the trail, newest first.
    pub fn history(&self, filter: &AuditFilter) -> Vec<&AuditRecord> {
        let mut result: Vec<&AuditRecord> = self
            .order
            .iter()
            .rev()
            .filter_map(|id| self.records.get(id))
            .filter(|r| {
                filter
                    .change_id
                    .as_ref()
                    .is_none_or(|c| &r.change_id == c)
                    && filter.status.is_none_or(|s| r.execution.status == s)
            })
            .collect();
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        result
    }

    /// Recompute every record's hash and report mismatches.
    pub fn verify_integrity(&self) -> IntegrityReport {
        let mut invalid = Vec::new();
        for record in self.records.values() {
            if !record.verify() {
                invalid.push(record.audit_id.clone());
            }
        }
        invalid.sort();
        IntegrityReport {
            total: self.records.len(),
            valid: self.records.len() - invalid.len(),
            invalid,
        }
    }

    /// Aggregate report over `[from, to]`.
    pub fn generate_report(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> AuditReport {
        let in_range: Vec<&AuditRecord> = self
            .order
            .iter()
            .filter_map(|id| self.records.get(id))
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect();

        let mut distribution = [0usize; 4];
        for record in &in_range {
            let c = record.decision.confidence;
            let bucket = if c < 0.5 {
                0
            } else if c < 0.7 {
                1
            } else if c < 0.85 {
                2
            } else {
                3
            };
            distribution[bucket] += 1;
        }

        AuditReport {
            from,
            to,
            total_records: in_range.len(),
            applied: in_range
                .iter()
                .filter(|r| r.execution.status == AuditExecutionStatus::Success)
                .count(),
            rolled_back: in_range
                .iter()
                .filter(|r| r.execution.status == AuditExecutionStatus::RolledBack)
                .count(),
            rejected: in_range
                .iter()
                .filter(|r| {
                    matches!(
                        r.execution.status,
                        AuditExecutionStatus::Rejected | AuditExecutionStatus::Blocked
                    )
                })
                .count(),
            errors_resolved: in_range.iter().map(|r| r.impact.errors_resolved).sum(),
            new_errors_introduced: in_range
                .iter()
                .map(|r| r.impact.new_errors_introduced)
                .sum(),
            confidence_distribution: distribution,
            recent_changes: in_range
                .iter()
                .rev()
                .take(10)
                .map(|r| r.change_id.clone())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn decision(confidence: f64) -> DecisionBlock {
        DecisionBlock {
            proposed_by: "fix-generator".to_string(),
            approved_by: "validator".to_string(),
            reasoning: "add_validation for userId".to_string(),
            confidence,
            recommended_action: "apply".to_string(),
        }
    }

    #[test]
    fn sealed_record_verifies() {
        let record = AuditRecord::new("chg-1", decision(0.82), AuditMetadata::default()).seal();
        assert!(record.verify());
        assert_eq!(record.integrity_hash.len(), 64);
    }

    #[test]
    fn tampering_breaks_verification() {
        let mut record = AuditRecord::new("chg-1", decision(0.82), AuditMetadata::default()).seal();
        record.decision.confidence = 0.99;
        assert!(!record.verify());
    }

    #[test]
    fn canonical_json_excludes_the_hash_field() {
        let record = AuditRecord::new("chg-1", decision(0.82), AuditMetadata::default());
        let unsealed_hash = record.compute_integrity_hash();
        let sealed = record.seal();
        // Hash over the same content is independent of the stored hash.
        assert_eq!(sealed.compute_integrity_hash(), unsealed_hash);
    }

    #[test]
    fn execution_outcome_supersedes_with_new_record() {
        let mut trail = AuditTrail::new(None).unwrap();
        let first = trail
            .record_decision("chg-1", decision(0.82), AuditMetadata::default())
            .unwrap();

        let updated = trail
            .record_execution(
                "chg-1",
                ExecutionBlock {
                    applied_at: Some(Utc::now()),
                    status: AuditExecutionStatus::Success,
                    duration: Some(12),
                    error: None,
                },
                ImpactBlock {
                    errors_resolved: 1,
                    ..Default::default()
                },
            )
            .unwrap();

        assert_ne!(first.audit_id, updated.audit_id);
        // The original is untouched.
        assert_eq!(
            trail.get(&first.audit_id).unwrap().execution.status,
            AuditExecutionStatus::Pending
        );
        assert_eq!(
            trail.latest_for_change("chg-1").unwrap().execution.status,
            AuditExecutionStatus::Success
        );
        assert!(trail.verify_integrity().all_valid());
    }

    #[test]
    fn rollback_writes_superseding_and_rollback_records() {
        let mut trail = AuditTrail::new(None).unwrap();
        trail
            .record_decision("chg-1", decision(0.82), AuditMetadata::default())
            .unwrap();
        trail
            .record_execution(
                "chg-1",
                ExecutionBlock {
                    applied_at: Some(Utc::now()),
                    status: AuditExecutionStatus::Success,
                    duration: Some(8),
                    error: None,
                },
                ImpactBlock::default(),
            )
            .unwrap();

        let rollback_record = trail
            .record_rollback(
                "chg-1",
                RollbackInfo {
                    rolled_back_at: Utc::now(),
                    trigger: "error_rate_increased".to_string(),
                    backup_id: "bak-1".to_string(),
                    restored: true,
                    reason: "error rate rose 13pp".to_string(),
                },
            )
            .unwrap();

        assert_eq!(rollback_record.decision.recommended_action, "rollback");
        // decision + execution + superseding + rollback = 4 records.
        let history = trail.history(&AuditFilter {
            change_id: Some("chg-1".to_string()),
            ..Default::default()
        });
        assert_eq!(history.len(), 4);
        assert!(trail.verify_integrity().all_valid());
    }

    #[test]
    fn history_filters_by_status_and_limit() {
        let mut trail = AuditTrail::new(None).unwrap();
        for i in 0..3 {
            trail
                .record_decision(&format!("chg-{}", i), decision(0.8), AuditMetadata::default())
                .unwrap();
        }
        trail
            .record_execution(
                "chg-0",
                ExecutionBlock {
                    applied_at: Some(Utc::now()),
                    status: AuditExecutionStatus::Success,
                    duration: None,
                    error: None,
                },
                ImpactBlock::default(),
            )
            .unwrap();

        let successes = trail.history(&AuditFilter {
            status: Some(AuditExecutionStatus::Success),
            ..Default::default()
        });
        assert_eq!(successes.len(), 1);

        let limited = trail.history(&AuditFilter {
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(limited.len(), 2);
        // Newest first.
        assert_eq!(limited[0].change_id, "chg-0");
    }

    #[test]
    fn verify_integrity_flags_tampered_records() {
        let mut trail = AuditTrail::new(None).unwrap();
        let record = trail
            .record_decision("chg-1", decision(0.8), AuditMetadata::default())
            .unwrap();
        trail
            .record_decision("chg-2", decision(0.9), AuditMetadata::default())
            .unwrap();

        // Tamper behind the API.
        trail
            .records
            .get_mut(&record.audit_id)
            .unwrap()
            .decision
            .confidence = 0.1;

        let report = trail.verify_integrity();
        assert_eq!(report.total, 2);
        assert_eq!(report.valid, 1);
        assert_eq!(report.invalid, vec![record.audit_id]);
    }

    #[test]
    fn records_are_durable_on_disk() {
        let dir = tempdir().unwrap();
        let audit_dir = dir.path().join("audit");
        let mut trail = AuditTrail::new(Some(audit_dir.clone())).unwrap();
        let record = trail
            .record_decision("chg-1", decision(0.8), AuditMetadata::default())
            .unwrap();

        let path = audit_dir.join(format!("{}.json", record.audit_id));
        let content = std::fs::read_to_string(path).unwrap();
        let loaded: AuditRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.verify());
        // Canonical field names are camelCase.
        assert!(content.contains("\"integrityHash\""));
        assert!(content.contains("\"changeId\""));
    }

    #[test]
    fn reopened_trail_recovers_durable_records() {
        let dir = tempdir().unwrap();
        let audit_dir = dir.path().join("audit");
        {
            let mut trail = AuditTrail::new(Some(audit_dir.clone())).unwrap();
            trail
                .record_decision("chg-1", decision(0.8), AuditMetadata::default())
                .unwrap();
            trail
                .record_decision("chg-2", decision(0.9), AuditMetadata::default())
                .unwrap();
        }

        let reopened = AuditTrail::new(Some(audit_dir)).unwrap();
        assert_eq!(reopened.history(&AuditFilter::default()).len(), 2);
        assert!(reopened.latest_for_change("chg-1").is_some());
        assert!(reopened.verify_integrity().all_valid());
    }

    #[test]
    fn report_aggregates_by_time_range() {
        let mut trail = AuditTrail::new(None).unwrap();
        trail
            .record_decision("chg-1", decision(0.82), AuditMetadata::default())
            .unwrap();
        trail
            .record_execution(
                "chg-1",
                ExecutionBlock {
                    applied_at: Some(Utc::now()),
                    status: AuditExecutionStatus::Success,
                    duration: Some(5),
                    error: None,
                },
                ImpactBlock {
                    errors_resolved: 2,
                    ..Default::default()
                },
            )
            .unwrap();
        trail
            .record_decision("chg-2", decision(0.4), AuditMetadata::default())
            .unwrap();

        let now = Utc::now();
        let report = trail.generate_report(now - Duration::hours(1), now + Duration::hours(1));
        assert_eq!(report.total_records, 3);
        assert_eq!(report.applied, 1);
        assert_eq!(report.errors_resolved, 2);
        assert_eq!(report.confidence_distribution[0], 1); // chg-2 at 0.4
        assert_eq!(report.confidence_distribution[2], 2); // 0.82 twice
        assert!(report.recent_changes.contains(&"chg-1".to_string()));

        // Out-of-range window is empty.
        let empty = trail.generate_report(now - Duration::hours(3), now - Duration::hours(2));
        assert_eq!(empty.total_records, 0);
    }
}
