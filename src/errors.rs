//! Typed error hierarchy for the Conductor runtime.
//!
//! Five top-level enums cover the five subsystems:
//! - `RegistryError` — agent registry lookups
//! - `BusError` — message bus publish and dispatch failures
//! - `StoreError` — state-store persistence failures
//! - `OrchestratorError` — phase controller and transition failures
//! - `LearningError` — self-learning pipeline and audit failures

use thiserror::Error;

/// Errors from the agent registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown phase index {0} (valid: 0..=11)")]
    UnknownPhase(usize),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Registry reload rejected: {0}")]
    ReloadRejected(String),
}

/// Errors from the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Duplicate message id {0}: already published")]
    DuplicateMessage(uuid::Uuid),

    #[error("Message {0} not found in dead-letter queue")]
    NotInDeadLetter(uuid::Uuid),

    #[error("Execution {0} is cancelled; message dropped")]
    ExecutionCancelled(uuid::Uuid),

    #[error("Bus is shut down")]
    ShutDown,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Errors from the persistent state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Execution {0} not found")]
    ExecutionNotFound(uuid::Uuid),

    #[error("Artifact {0} not found")]
    ArtifactNotFound(uuid::Uuid),

    #[error("Artifact {id} content hash mismatch: expected {expected}, got {actual}")]
    ArtifactHashMismatch {
        id: uuid::Uuid,
        expected: String,
        actual: String,
    },

    #[error("No resumable execution found")]
    NothingToResume,

    #[error("Failed to {action} at {path}: {source}")]
    Io {
        action: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode {path}: {source}")]
    Decode {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Helper for wrapping I/O failures with the path they occurred at.
    pub fn io(action: &'static str, path: impl Into<std::path::PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Errors from the phase controller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No transition from phase {phase} on reason '{reason}'")]
    InvalidTransition { phase: usize, reason: String },

    #[error("Execution {0} is not running")]
    NotRunning(uuid::Uuid),

    #[error("Phase {phase} is not awaiting approval")]
    NoPendingApproval { phase: usize },

    #[error("Approval token for phase {phase} expired")]
    ApprovalExpired { phase: usize },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Errors from the self-learning pipeline.
#[derive(Debug, Error)]
pub enum LearningError {
    #[error("Change {0} not found")]
    ChangeNotFound(String),

    #[error("Change {0} already rolled back")]
    AlreadyRolledBack(String),

    #[error("No backup found for change {0}")]
    BackupNotFound(String),

    #[error("Backup {id} checksum mismatch ({algorithm}): restore aborted")]
    ChecksumMismatch { id: String, algorithm: &'static str },

    #[error("Audit record {0} failed integrity verification")]
    IntegrityViolation(String),

    #[error("Apply blocked by safety controller: {0}")]
    SafetyBlocked(String),

    #[error("Fix proposal rejected by validation: {0}")]
    ValidationRejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
