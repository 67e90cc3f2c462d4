//! Backup records: snapshots of mutable system state taken before every
//! apply.
//!
//! A backup carries MD5 and SHA-256 checksums over the canonical JSON of
//! the captured state. The checksums are the source of truth on restore;
//! a mismatch aborts the rollback and escalates. Backups expire after a
//! configurable retention window and are purged.

use crate::errors::{LearningError, StoreError};
use crate::util::canonical_json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

/// An immutable snapshot of mutable system state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    pub backup_id: String,
    pub change_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The captured state, canonicalised on checksum computation.
    pub state: Value,
    pub md5_checksum: String,
    pub sha256_checksum: String,
}

impl BackupRecord {
    /// Snapshot `state` for `change_id`, valid for `retention_days`.
    pub fn capture(change_id: &str, state: Value, retention_days: i64) -> Self {
        let (md5_checksum, sha256_checksum) = checksums(&state);
        let now = Utc::now();
        Self {
            backup_id: format!("bak-{}", &Uuid::new_v4().to_string()[..12]),
            change_id: change_id.to_string(),
            created_at: now,
            expires_at: now + Duration::days(retention_days),
            state,
            md5_checksum,
            sha256_checksum,
        }
    }

    /// Recompute both checksums and compare against the stored ones.
    pub fn verify(&self) -> Result<(), LearningError> {
        let (md5_actual, sha256_actual) = checksums(&self.state);
        if md5_actual != self.md5_checksum {
            return Err(LearningError::ChecksumMismatch {
                id: self.backup_id.clone(),
                algorithm: "md5",
            });
        }
        if sha256_actual != self.sha256_checksum {
            return Err(LearningError::ChecksumMismatch {
                id: self.backup_id.clone(),
                algorithm: "sha256",
            });
        }
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// MD5 and SHA-256 over the canonical JSON encoding of a state value.
pub fn checksums(state: &Value) -> (String, String) {
    let canonical = canonical_json(state);
    let md5_hex = format!("{:x}", md5::compute(canonical.as_bytes()));
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let sha256_hex = hex::encode(hasher.finalize());
    (md5_hex, sha256_hex)
}

/// Filesystem-backed backup store under `<state root>/backups/`.
pub struct BackupStore {
    dir: PathBuf,
    retention_days: i64,
}

impl BackupStore {
    pub fn new(dir: PathBuf, retention_days: i64) -> Result<Self, StoreError> {
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create directory", dir.clone(), e))?;
        Ok(Self {
            dir,
            retention_days,
        })
    }

    fn path_for(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", backup_id))
    }

    /// Capture and persist a backup for a change.
    pub fn create(&self, change_id: &str, state: Value) -> Result<BackupRecord, StoreError> {
        let record = BackupRecord::capture(change_id, state, self.retention_days);
        let path = self.path_for(&record.backup_id);
        let json = serde_json::to_string_pretty(&record).map_err(|e| StoreError::Encode {
            what: "backup record",
            source: e,
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| StoreError::io("write temp file", tmp.clone(), e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io("rename into place", path, e))?;
        Ok(record)
    }

    pub fn load(&self, backup_id: &str) -> Result<BackupRecord, StoreError> {
        let path = self.path_for(backup_id);
        let content = fs::read_to_string(&path)
            .map_err(|e| StoreError::io("read backup", path.clone(), e))?;
        serde_json::from_str(&content).map_err(|e| StoreError::Decode { path, source: e })
    }

    /// Most recent backup taken for a change id.
    pub fn find_by_change(&self, change_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        let mut newest: Option<BackupRecord> = None;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io("read directory", self.dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .map_err(|e| StoreError::io("read backup", path.clone(), e))?;
            let record: BackupRecord = serde_json::from_str(&content)
                .map_err(|e| StoreError::Decode { path, source: e })?;
            if record.change_id == change_id
                && newest
                    .as_ref()
                    .is_none_or(|n| record.created_at > n.created_at)
            {
                newest = Some(record);
            }
        }
        Ok(newest)
    }

    /// Remove expired backups; returns the number purged.
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let mut purged = 0;
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io("read directory", self.dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(content) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<BackupRecord>(&content) else {
                continue;
            };
            if record.is_expired() {
                fs::remove_file(&path).map_err(|e| StoreError::io("remove backup", path, e))?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
