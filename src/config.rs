//! Runtime configuration for the Conductor platform.
//!
//! Loaded from `conductor.toml` when present, otherwise every knob falls
//! back to its documented default. Sections map one-to-one onto the
//! subsystems that consume them:
//! - `[bus]` — retry/backoff policy and worker bound
//! - `[approval]` — approval token expiry
//! - `[safety]` — rate limits and confidence thresholds
//! - `[learning]` — apply/validation behaviour
//! - `[rollback]` — auto-rollback monitor tuning
//! - `[retention]` — backup, checkpoint and metric purge windows

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ConductorConfig {
    /// Root directory for persisted state (`state/`, `artifacts/`,
    /// `backups/`, `audit/`, `cache/`). Defaults to `.conductor`.
    pub state_root: Option<PathBuf>,
    pub bus: BusConfig,
    pub approval: ApprovalConfig,
    pub safety: SafetyConfig,
    pub learning: LearningConfig,
    pub rollback: RollbackConfig,
    pub retention: RetentionConfig,
}

/// Message bus retry policy and concurrency bound.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Retries before a message is dead-lettered.
    pub max_retries: u32,
    /// Initial backoff in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_backoff_ms: u64,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Maximum concurrent worker tasks draining the queues.
    pub max_workers: usize,
    /// Per-invocation agent timeout in milliseconds.
    pub invocation_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            max_workers: 4,
            invocation_timeout_ms: 30 * 60 * 1_000,
        }
    }
}

impl BusConfig {
    /// Compute the backoff delay for a given retry attempt:
    /// `min(initial * multiplier^retry, max_backoff)`.
    pub fn backoff_for_retry(&self, retry: u32) -> std::time::Duration {
        let raw = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        std::time::Duration::from_millis(raw.min(self.max_backoff_ms as f64) as u64)
    }
}

/// How expired approval tokens resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExpiryResolution {
    /// Expiry counts as a rejection (default).
    #[default]
    Reject,
    /// Expiry counts as an approval.
    Approve,
}

/// Approval gate behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Approval token lifetime in milliseconds.
    pub expiry_ms: u64,
    /// What an expired token resolves to.
    pub expiry_resolution: ExpiryResolution,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 3_600_000,
            expiry_resolution: ExpiryResolution::Reject,
        }
    }
}

/// Safety controller rate caps and confidence thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Max applies per rolling minute.
    pub max_per_minute: u32,
    /// Max applies per rolling hour.
    pub max_per_hour: u32,
    /// Max applies per rolling day.
    pub max_per_day: u32,
    /// Cooldown after any recorded failure, in seconds.
    pub failure_cooldown_secs: u64,
    /// Failures within the window that block a change id.
    pub max_consecutive_failures: u32,
    /// Consecutive-failure window in seconds.
    pub failure_window_secs: u64,
    /// Required confidence for normal-risk changes.
    pub required_confidence: f64,
    /// Required confidence for high-risk changes.
    pub high_risk_confidence: f64,
    /// Maximum concurrent isolation environments.
    pub max_concurrent_isolated: usize,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 10,
            max_per_hour: 100,
            max_per_day: 500,
            failure_cooldown_secs: 30,
            max_consecutive_failures: 3,
            failure_window_secs: 600,
            required_confidence: 0.7,
            high_risk_confidence: 0.9,
            max_concurrent_isolated: 2,
        }
    }
}

/// Self-learning pipeline behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    /// Apply validated fixes without further prompting.
    pub auto_apply: bool,
    /// Arm the auto-rollback monitor after each apply.
    pub auto_rollback: bool,
    /// Required overall confidence for validator approval.
    pub confidence_threshold: f64,
    /// Strict mode: require every gate to pass.
    pub require_all_gates: bool,
    /// Proposals below this confidence are discarded by the generator.
    pub min_proposal_confidence: f64,
    /// Re-check system state after apply.
    pub verify_after_apply: bool,
    /// Restore the backup automatically when post-apply verification fails.
    pub auto_rollback_on_failure: bool,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            auto_apply: false,
            auto_rollback: true,
            confidence_threshold: 0.8,
            require_all_gates: true,
            min_proposal_confidence: 0.3,
            verify_after_apply: true,
            auto_rollback_on_failure: true,
        }
    }
}

/// Auto-rollback monitor tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RollbackConfig {
    /// How long to watch after an apply, in seconds.
    pub monitor_duration_secs: u64,
    /// Interval between metric comparisons, in seconds.
    pub check_interval_secs: u64,
    /// Error-rate increase (percentage points, 0..1) that triggers rollback.
    pub error_rate_threshold: f64,
    /// Response-time degradation ratio that triggers rollback.
    pub performance_threshold: f64,
    /// Memory growth in MiB that triggers rollback.
    pub memory_threshold_mib: f64,
    /// Scale the error-rate threshold with the baseline volume.
    pub scale_with_baseline: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            monitor_duration_secs: 300,
            check_interval_secs: 10,
            error_rate_threshold: 0.10,
            performance_threshold: 0.20,
            memory_threshold_mib: 100.0,
            scale_with_baseline: false,
        }
    }
}

/// Purge windows for backups, checkpoints and metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Days a backup record is kept before purge.
    pub backup_retention_days: i64,
    /// Hours of metric samples kept in memory.
    pub metrics_retention_hours: i64,
    /// Optional cap on checkpoints per execution (oldest pruned first).
    pub max_checkpoints_per_execution: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            backup_retention_days: 7,
            metrics_retention_hours: 24,
            max_checkpoints_per_execution: None,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ConductorConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `<dir>/conductor.toml` when present, defaults otherwise.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join("conductor.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Resolve the state root directory relative to a project directory.
    pub fn resolve_state_root(&self, project_dir: &Path) -> PathBuf {
        match &self.state_root {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => project_dir.join(root),
            None => project_dir.join(".conductor"),
        }
    }

    /// Sanity-check threshold ranges, returning warnings for odd values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(0.0..=1.0).contains(&self.learning.confidence_threshold) {
            warnings.push(format!(
                "learning.confidence_threshold {} outside 0..1",
                self.learning.confidence_threshold
            ));
        }
        if self.safety.required_confidence > self.safety.high_risk_confidence {
            warnings.push(
                "safety.required_confidence exceeds safety.high_risk_confidence".to_string(),
            );
        }
        if self.bus.backoff_multiplier < 1.0 {
            warnings.push(format!(
                "bus.backoff_multiplier {} shrinks backoff between retries",
                self.bus.backoff_multiplier
            ));
        }
        if self.rollback.check_interval_secs == 0 {
            warnings.push("rollback.check_interval_secs must be non-zero".to_string());
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConductorConfig::default();
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.bus.initial_backoff_ms, 1_000);
        assert_eq!(config.bus.max_backoff_ms, 30_000);
        assert_eq!(config.approval.expiry_ms, 3_600_000);
        assert_eq!(config.safety.max_per_minute, 10);
        assert_eq!(config.safety.max_per_hour, 100);
        assert_eq!(config.safety.max_per_day, 500);
        assert_eq!(config.learning.confidence_threshold, 0.8);
        assert_eq!(config.rollback.monitor_duration_secs, 300);
        assert_eq!(config.retention.backup_retention_days, 7);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let bus = BusConfig::default();
        assert_eq!(bus.backoff_for_retry(0), Duration::from_millis(1_000));
        assert_eq!(bus.backoff_for_retry(1), Duration::from_millis(2_000));
        assert_eq!(bus.backoff_for_retry(2), Duration::from_millis(4_000));
        // 1s * 2^10 = 1024s, capped at 30s
        assert_eq!(bus.backoff_for_retry(10), Duration::from_millis(30_000));
    }

    #[test]
    fn load_or_default_without_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = ConductorConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config, ConductorConfig::default());
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(
            &path,
            r#"
[learning]
auto_apply = true
confidence_threshold = 0.9

[safety]
max_per_minute = 5
"#,
        )
        .unwrap();

        let config = ConductorConfig::load(&path).unwrap();
        assert!(config.learning.auto_apply);
        assert_eq!(config.learning.confidence_threshold, 0.9);
        assert_eq!(config.safety.max_per_minute, 5);
        // Untouched sections keep defaults
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.safety.max_per_hour, 100);
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conductor.toml");
        fs::write(&path, "not [valid toml").unwrap();
        assert!(ConductorConfig::load(&path).is_err());
    }

    #[test]
    fn resolve_state_root_defaults_to_hidden_dir() {
        let config = ConductorConfig::default();
        let root = config.resolve_state_root(Path::new("/proj"));
        assert_eq!(root, PathBuf::from("/proj/.conductor"));
    }

    #[test]
    fn validate_flags_inverted_confidence_thresholds() {
        let mut config = ConductorConfig::default();
        config.safety.required_confidence = 0.95;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("high_risk_confidence")));
    }
}
