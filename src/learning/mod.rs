//! The self-learning pipeline: capture, analysis, fix generation,
//! validation, transactional apply, audit and rollback.

pub mod analyzer;
pub mod applier;
pub mod audit;
pub mod backup;
pub mod generator;
pub mod logger;
pub mod pipeline;
pub mod rollback;
pub mod validator;

pub use analyzer::{AnalysisEngine, AnalysisResult, PatternRegistry, RootCause, RootCauseKind};
pub use applier::{ApplyEngine, ApplyOutcome, SystemState};
pub use audit::{AuditExecutionStatus, AuditFilter, AuditRecord, AuditTrail, IntegrityReport};
pub use backup::{BackupRecord, BackupStore};
pub use generator::{
    ChangeType, FixProposal, FixStrategy, GeneratorRegistry, ProposalStatus, ProposedChange,
};
pub use logger::{CategoryGroup, ErrorCategory, ErrorLogEntry, ErrorLogger, ErrorSeverity, RawError};
pub use pipeline::{LearningPipeline, LearningStats, LearningStatus, PipelineOutcome};
pub use rollback::{AutoRollbackMonitor, RollbackManager, RollbackRequest, RollbackTrigger};
pub use validator::{FixValidator, GateResult, GateSeverity, ValidationContext, ValidationResult};
