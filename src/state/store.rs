//! Crash-safe persistence for executions, checkpoints and artifacts.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/
//!   state/
//!     executions/<executionId>.json
//!     checkpoints/<executionId>/chk-<ts>-<rand>.json
//!   artifacts/
//!     <artifactId>.meta.json
//!     <artifactId>.content
//!   backups/<backupId>.json
//!   audit/<auditId>.json
//!   cache/
//! ```
//!
//! Every write goes to a temp file first and is renamed into place, so a
//! crash mid-write leaves the prior valid file standing. Artifact content
//! and its metadata sidecar are only considered registered when both are
//! readable.

use crate::errors::StoreError;
use crate::state::artifact::{Artifact, ArtifactMeta};
use crate::state::execution::{Execution, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckpointReason {
    WorkflowStart,
    PhaseComplete,
    Error,
    Manual,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointReason::WorkflowStart => "workflow-start",
            CheckpointReason::PhaseComplete => "phase-complete",
            CheckpointReason::Error => "error",
            CheckpointReason::Manual => "manual",
        }
    }
}

/// An immutable snapshot of an execution at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub execution_id: Uuid,
    pub phase: usize,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
    /// Deep copy of the execution at snapshot time.
    pub execution_state: Execution,
    /// Caller-supplied extra state carried with the snapshot.
    #[serde(default)]
    pub additional_state: Value,
}

/// Result of [`StateStore::resume_latest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeInfo {
    pub execution_id: Uuid,
    /// Phase to re-enter: last completed + 1, or 0 when nothing completed.
    pub resume_phase: usize,
    pub context: std::collections::HashMap<String, Value>,
}

/// Filesystem-backed state store.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open (creating directories as needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        for sub in [
            "state/executions",
            "state/checkpoints",
            "artifacts",
            "backups",
            "audit",
            "cache",
        ] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io("create directory", dir, e))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// The store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for audit records (used by the audit trail).
    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    /// Directory for backup records (used by the backup store).
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    fn execution_path(&self, id: Uuid) -> PathBuf {
        self.root
            .join("state/executions")
            .join(format!("{}.json", id))
    }

    fn checkpoints_dir(&self, execution_id: Uuid) -> PathBuf {
        self.root
            .join("state/checkpoints")
            .join(execution_id.to_string())
    }

    /// Persist an execution atomically (write-to-temp, rename).
    pub fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let path = self.execution_path(execution.id);
        write_json_atomic(&path, execution)
    }

    /// Load an execution by id.
    pub fn load_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let path = self.execution_path(id);
        if !path.exists() {
            return Err(StoreError::ExecutionNotFound(id));
        }
        read_json(&path)
    }

    /// All persisted executions, most recently updated first.
    pub fn list_executions(&self) -> Result<Vec<Execution>, StoreError> {
        let dir = self.root.join("state/executions");
        let mut executions = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| StoreError::io("read directory", dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let execution: Execution = read_json(&path)?;
            executions.push(execution);
        }
        executions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(executions)
    }

    /// Snapshot an execution. `additional_state` travels with the
    /// checkpoint and is handed back on resume.
    pub fn create_checkpoint(
        &self,
        execution: &Execution,
        reason: CheckpointReason,
        additional_state: Value,
    ) -> Result<Checkpoint, StoreError> {
        let now = Utc::now();
        let checkpoint = Checkpoint {
            checkpoint_id: format!(
                "chk-{}-{}",
                now.timestamp_millis(),
                &Uuid::new_v4().to_string()[..8]
            ),
            execution_id: execution.id,
            phase: execution.current_phase,
            reason,
            created_at: now,
            execution_state: execution.clone(),
            additional_state,
        };

        let dir = self.checkpoints_dir(execution.id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create directory", dir.clone(), e))?;
        let path = dir.join(format!("{}.json", checkpoint.checkpoint_id));
        write_json_atomic(&path, &checkpoint)?;
        Ok(checkpoint)
    }

    /// Checkpoints for an execution, newest first.
    pub fn list_checkpoints(&self, execution_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let dir = self.checkpoints_dir(execution_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut checkpoints = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| StoreError::io("read directory", dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let checkpoint: Checkpoint = read_json(&path)?;
            checkpoints.push(checkpoint);
        }
        checkpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(checkpoints)
    }

    /// Prune an execution's checkpoints down to `keep`, oldest first.
    pub fn prune_checkpoints(&self, execution_id: Uuid, keep: usize) -> Result<usize, StoreError> {
        let checkpoints = self.list_checkpoints(execution_id)?;
        if checkpoints.len() <= keep {
            return Ok(0);
        }
        let dir = self.checkpoints_dir(execution_id);
        let mut removed = 0;
        for checkpoint in &checkpoints[keep..] {
            let path = dir.join(format!("{}.json", checkpoint.checkpoint_id));
            fs::remove_file(&path).map_err(|e| StoreError::io("remove checkpoint", path, e))?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Register an artifact: content blob first, metadata sidecar second,
    /// both atomically. A crash between the two leaves an unreferenced
    /// content file that [`StateStore::load_artifact`] will never expose.
    pub fn register_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let content_path = self.root.join("artifacts").join(format!("{}.content", artifact.meta.id));
        write_bytes_atomic(&content_path, &artifact.content)?;

        let meta_path = self.root.join("artifacts").join(format!("{}.meta.json", artifact.meta.id));
        write_json_atomic(&meta_path, &artifact.meta)
    }

    /// Load an artifact, requiring both metadata and content to be
    /// present, and verifying the stored content hash.
    pub fn load_artifact(&self, id: Uuid) -> Result<Artifact, StoreError> {
        let meta_path = self.root.join("artifacts").join(format!("{}.meta.json", id));
        let content_path = self.root.join("artifacts").join(format!("{}.content", id));
        if !meta_path.exists() || !content_path.exists() {
            return Err(StoreError::ArtifactNotFound(id));
        }
        let meta: ArtifactMeta = read_json(&meta_path)?;
        let content = fs::read(&content_path)
            .map_err(|e| StoreError::io("read artifact content", content_path, e))?;

        let artifact = Artifact { meta, content };
        if !artifact.verify() {
            let actual = crate::state::artifact::hash_content(&artifact.content);
            return Err(StoreError::ArtifactHashMismatch {
                id,
                expected: artifact.meta.content_hash.clone(),
                actual,
            });
        }
        Ok(artifact)
    }

    /// Artifact metadata for one execution, ordered by creation time.
    pub fn list_artifacts(&self, execution_id: Uuid) -> Result<Vec<ArtifactMeta>, StoreError> {
        let dir = self.root.join("artifacts");
        let mut metas = Vec::new();
        let entries =
            fs::read_dir(&dir).map_err(|e| StoreError::io("read directory", dir.clone(), e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".meta.json") {
                continue;
            }
            let meta: ArtifactMeta = read_json(&path)?;
            if meta.execution_id == execution_id {
                metas.push(meta);
            }
        }
        metas.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(metas)
    }

    /// Next version number for a named artifact within an execution.
    pub fn next_artifact_version(
        &self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<u32, StoreError> {
        let metas = self.list_artifacts(execution_id)?;
        Ok(metas
            .iter()
            .filter(|m| m.name == name)
            .map(|m| m.version)
            .max()
            .map(|v| v + 1)
            .unwrap_or(1))
    }

    /// Select the most recently updated resumable execution. Resumable
    /// means status ∈ {running, paused, failed}.
    pub fn resume_latest(&self) -> Result<ResumeInfo, StoreError> {
        let executions = self.list_executions()?;
        let candidate = executions
            .into_iter()
            .find(|e| {
                matches!(
                    e.status,
                    ExecutionStatus::Running | ExecutionStatus::Paused | ExecutionStatus::Failed
                )
            })
            .ok_or(StoreError::NothingToResume)?;

        let resume_phase = candidate.last_completed_phase().map(|p| p + 1).unwrap_or(0);
        Ok(ResumeInfo {
            execution_id: candidate.id,
            resume_phase,
            context: candidate.context,
        })
    }
}

/// Serialize to JSON and write atomically: temp file in the target
/// directory, then rename over the destination.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_string_pretty(value).map_err(|e| StoreError::Encode {
        what: "state record",
        source: e,
    })?;
    write_bytes_atomic(path, json.as_bytes())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StoreError::io("write temp file", tmp.clone(), e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io("rename into place", path.to_path_buf(), e))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let content =
        fs::read_to_string(path).map_err(|e| StoreError::io("read file", path.to_path_buf(), e))?;
    serde_json::from_str(&content).map_err(|e| StoreError::Decode {
        path: path.to_path_buf(),
        source: e,
    })
}
