//! Error capture: categorisation, message normalisation and frequency
//! tracking.
//!
//! Every agent failure is recorded as a structured [`ErrorLogEntry`].
//! Categorisation is deterministic and side-effect free; frequency
//! tracking groups entries by an MD5 pattern key over (type, normalised
//! message, category) and elevates severity as occurrences grow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use uuid::Uuid;

/// Closed error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // Parameter
    MissingParameter,
    InvalidParameter,
    TypeMismatch,
    FormatInvalid,
    // Logic
    LogicFailure,
    ConditionFailed,
    StateInvalid,
    SequenceError,
    // Skill
    SkillNotFound,
    SkillTimeout,
    SkillFailure,
    SkillOutputInvalid,
    // Dependency
    DependencyNotFound,
    DependencyTimeout,
    DependencyError,
    // Configuration
    ConfigMissing,
    ConfigInvalid,
    ConfigConflict,
    // System
    MemoryError,
    Timeout,
    ResourceExhausted,
    Unknown,
}

/// Category families, used to dispatch fix generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryGroup {
    Parameter,
    Logic,
    Skill,
    Dependency,
    Configuration,
    System,
    Unknown,
}

impl ErrorCategory {
    pub fn group(&self) -> CategoryGroup {
        use ErrorCategory::*;
        match self {
            MissingParameter | InvalidParameter | TypeMismatch | FormatInvalid => {
                CategoryGroup::Parameter
            }
            LogicFailure | ConditionFailed | StateInvalid | SequenceError => CategoryGroup::Logic,
            SkillNotFound | SkillTimeout | SkillFailure | SkillOutputInvalid => CategoryGroup::Skill,
            DependencyNotFound | DependencyTimeout | DependencyError => CategoryGroup::Dependency,
            ConfigMissing | ConfigInvalid | ConfigConflict => CategoryGroup::Configuration,
            MemoryError | Timeout | ResourceExhausted => CategoryGroup::System,
            Unknown => CategoryGroup::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        use ErrorCategory::*;
        match self {
            MissingParameter => "missing_parameter",
            InvalidParameter => "invalid_parameter",
            TypeMismatch => "type_mismatch",
            FormatInvalid => "format_invalid",
            LogicFailure => "logic_failure",
            ConditionFailed => "condition_failed",
            StateInvalid => "state_invalid",
            SequenceError => "sequence_error",
            SkillNotFound => "skill_not_found",
            SkillTimeout => "skill_timeout",
            SkillFailure => "skill_failure",
            SkillOutputInvalid => "skill_output_invalid",
            DependencyNotFound => "dependency_not_found",
            DependencyTimeout => "dependency_timeout",
            DependencyError => "dependency_error",
            ConfigMissing => "config_missing",
            ConfigInvalid => "config_invalid",
            ConfigConflict => "config_conflict",
            MemoryError => "memory_error",
            Timeout => "timeout",
            ResourceExhausted => "resource_exhausted",
            Unknown => "unknown",
        }
    }
}

/// Error severity, elevated by recurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Captured context around a failure. All fields opaque.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ErrorContext {
    pub input: Option<Value>,
    pub expected_output: Option<Value>,
    pub actual_output: Option<Value>,
    pub state: Option<Value>,
    pub config: Option<Value>,
    pub environment: Option<Value>,
}

/// A raw failure handed to the logger by the bus or a caller.
#[derive(Debug, Clone)]
pub struct RawError {
    pub phase: usize,
    pub agent: String,
    pub skill: Option<String>,
    pub error_type: String,
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
    pub line: Option<u32>,
    pub context: ErrorContext,
}

/// Structured capture of one agent failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorLogEntry {
    pub id: String,
    pub batch_id: String,
    pub phase: usize,
    pub agent: String,
    pub skill: Option<String>,
    pub error_type: String,
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
    pub line: Option<u32>,
    pub context: ErrorContext,
    /// Occurrences of this pattern at capture time, this entry included.
    pub occurrences: u32,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub learnable: bool,
    pub auto_fix: bool,
    pub resolved: bool,
    pub resolution_change_id: Option<String>,
    /// MD5 over (type ∥ normalised message ∥ category).
    pub pattern_key: String,
    pub captured_at: DateTime<Utc>,
}

static RE_HEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static RE_DQUOTE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r#""[^"]*""#).unwrap());
static RE_SQUOTE: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"'[^']*'").unwrap());
static RE_DIGITS: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\d+").unwrap());

/// Normalise an error message for pattern grouping: hex literals become
/// `0xHEX`, quoted strings become `'X'`/`"X"`, digit runs become `N`,
/// and the result is truncated to 150 characters.
pub fn normalize_message(message: &str) -> String {
    let s = RE_HEX.replace_all(message, "0xHEX");
    let s = RE_DQUOTE.replace_all(&s, "\"X\"");
    let s = RE_SQUOTE.replace_all(&s, "'X'");
    let s = RE_DIGITS.replace_all(&s, "N");
    crate::util::truncate_str(&s, 150)
}

/// Deterministically categorise an error by its type and message.
pub fn categorize(error_type: &str, message: &str) -> ErrorCategory {
    let text = format!("{} {}", error_type, message).to_lowercase();

    // Skill family first: "skill timed out" must not fall through to the
    // generic timeout bucket.
    if text.contains("skill") {
        if text.contains("not found") || text.contains("unknown skill") {
            return ErrorCategory::SkillNotFound;
        }
        if text.contains("timeout") || text.contains("timed out") {
            return ErrorCategory::SkillTimeout;
        }
        if text.contains("output") {
            return ErrorCategory::SkillOutputInvalid;
        }
        return ErrorCategory::SkillFailure;
    }
    if text.contains("dependency") {
        if text.contains("not found") {
            return ErrorCategory::DependencyNotFound;
        }
        if text.contains("timeout") || text.contains("timed out") {
            return ErrorCategory::DependencyTimeout;
        }
        return ErrorCategory::DependencyError;
    }
    if text.contains("config") {
        if text.contains("missing") || text.contains("not set") {
            return ErrorCategory::ConfigMissing;
        }
        if text.contains("conflict") {
            return ErrorCategory::ConfigConflict;
        }
        return ErrorCategory::ConfigInvalid;
    }
    if text.contains("is required") || text.contains("missing parameter") || text.contains("missing argument") {
        return ErrorCategory::MissingParameter;
    }
    if text.contains("invalid parameter") || text.contains("invalid argument") {
        return ErrorCategory::InvalidParameter;
    }
    if text.contains("type mismatch") || text.contains("typeerror") || text.contains("expected type") {
        return ErrorCategory::TypeMismatch;
    }
    if text.contains("format") || text.contains("malformed") {
        return ErrorCategory::FormatInvalid;
    }
    if text.contains("out of memory") || text.contains("memory") {
        return ErrorCategory::MemoryError;
    }
    if text.contains("resource") && text.contains("exhaust") {
        return ErrorCategory::ResourceExhausted;
    }
    if text.contains("timeout") || text.contains("timed out") {
        return ErrorCategory::Timeout;
    }
    if text.contains("condition") {
        return ErrorCategory::ConditionFailed;
    }
    if text.contains("invalid state") || (text.contains("state") && text.contains("invalid")) {
        return ErrorCategory::StateInvalid;
    }
    if text.contains("sequence") || text.contains("out of order") {
        return ErrorCategory::SequenceError;
    }
    if text.contains("logic") || text.contains("assertion") {
        return ErrorCategory::LogicFailure;
    }
    ErrorCategory::Unknown
}

/// MD5 pattern key over (type ∥ normalised message ∥ category).
pub fn pattern_key(error_type: &str, message: &str, category: ErrorCategory) -> String {
    let normalized = normalize_message(message);
    let digest = md5::compute(format!("{}|{}|{}", error_type, normalized, category.as_str()));
    format!("{:x}", digest)
}

fn base_severity(category: ErrorCategory) -> ErrorSeverity {
    match category.group() {
        CategoryGroup::System => ErrorSeverity::High,
        CategoryGroup::Dependency | CategoryGroup::Skill | CategoryGroup::Logic => {
            ErrorSeverity::Medium
        }
        CategoryGroup::Parameter | CategoryGroup::Configuration => ErrorSeverity::Low,
        CategoryGroup::Unknown => ErrorSeverity::Low,
    }
}

/// Elevate severity with recurrence: >2 at least medium, >5 at least
/// high, >10 critical.
fn elevate_severity(base: ErrorSeverity, occurrences: u32) -> ErrorSeverity {
    let floor = if occurrences > 10 {
        ErrorSeverity::Critical
    } else if occurrences > 5 {
        ErrorSeverity::High
    } else if occurrences > 2 {
        ErrorSeverity::Medium
    } else {
        ErrorSeverity::Low
    };
    base.max(floor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrequencyInfo {
    occurrences: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Per-pattern occurrence counters.
#[derive(Debug, Default)]
pub struct FrequencyTracker {
    patterns: HashMap<String, FrequencyInfo>,
}

impl FrequencyTracker {
    /// Record one occurrence; returns the updated count.
    pub fn record(&mut self, key: &str) -> u32 {
        let now = Utc::now();
        let info = self.patterns.entry(key.to_string()).or_insert(FrequencyInfo {
            occurrences: 0,
            first_seen: now,
            last_seen: now,
        });
        info.occurrences += 1;
        info.last_seen = now;
        info.occurrences
    }

    pub fn occurrences(&self, key: &str) -> u32 {
        self.patterns.get(key).map(|i| i.occurrences).unwrap_or(0)
    }

    /// Number of distinct patterns seen.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// The error logger: append-only entries plus the frequency tracker.
pub struct ErrorLogger {
    batch_id: String,
    entries: Vec<ErrorLogEntry>,
    frequency: FrequencyTracker,
}

impl Default for ErrorLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorLogger {
    pub fn new() -> Self {
        Self {
            batch_id: format!("batch-{}", &Uuid::new_v4().to_string()[..8]),
            entries: Vec::new(),
            frequency: FrequencyTracker::default(),
        }
    }

    /// Capture a raw failure as a structured entry.
    pub fn capture(&mut self, raw: RawError) -> ErrorLogEntry {
        let category = categorize(&raw.error_type, &raw.message);
        let key = pattern_key(&raw.error_type, &raw.message, category);
        let occurrences = self.frequency.record(&key);
        let severity = elevate_severity(base_severity(category), occurrences);
        let group = category.group();

        let entry = ErrorLogEntry {
            id: format!("err-{}", &Uuid::new_v4().to_string()[..12]),
            batch_id: self.batch_id.clone(),
            phase: raw.phase,
            agent: raw.agent,
            skill: raw.skill,
            error_type: raw.error_type,
            message: raw.message,
            code: raw.code,
            stack: raw.stack,
            line: raw.line,
            context: raw.context,
            occurrences,
            category,
            severity,
            learnable: category != ErrorCategory::Unknown,
            auto_fix: matches!(
                group,
                CategoryGroup::Parameter | CategoryGroup::Configuration | CategoryGroup::Skill
            ),
            resolved: false,
            resolution_change_id: None,
            pattern_key: key,
            captured_at: Utc::now(),
        };
        tracing::debug!(
            error_id = %entry.id,
            category = entry.category.as_str(),
            severity = entry.severity.as_str(),
            occurrences = entry.occurrences,
            "error captured"
        );
        self.entries.push(entry.clone());
        entry
    }

    /// Mark an entry resolved by a change id.
    pub fn mark_resolved(&mut self, error_id: &str, change_id: &str) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == error_id) {
            entry.resolved = true;
            entry.resolution_change_id = Some(change_id.to_string());
            true
        } else {
            false
        }
    }

    pub fn get(&self, error_id: &str) -> Option<&ErrorLogEntry> {
        self.entries.iter().find(|e| e.id == error_id)
    }

    pub fn entries(&self) -> &[ErrorLogEntry] {
        &self.entries
    }

    pub fn unresolved(&self) -> Vec<&ErrorLogEntry> {
        self.entries.iter().filter(|e| !e.resolved).collect()
    }

    pub fn frequency(&self) -> &FrequencyTracker {
        &self.frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(error_type: &str, message: &str) -> RawError {
        RawError {
            phase: 4,
            agent: "infra-generate".to_string(),
            skill: None,
            error_type: error_type.to_string(),
            message: message.to_string(),
            code: None,
            stack: None,
            line: None,
            context: ErrorContext::default(),
        }
    }

    #[test]
    fn normalisation_replaces_volatile_fragments() {
        assert_eq!(
            normalize_message("retry 17 failed at 0x7fa3 for \"west\" and 'east'"),
            "retry N failed at 0xHEX for \"X\" and 'X'"
        );
    }

    #[test]
    fn normalisation_truncates_to_150_chars() {
        let long = "x".repeat(400);
        assert_eq!(normalize_message(&long).chars().count(), 150);
    }

    #[test]
    fn categorisation_is_deterministic_and_matches_taxonomy() {
        assert_eq!(
            categorize("Error", "Parameter 'userId' is required"),
            ErrorCategory::MissingParameter
        );
        assert_eq!(
            categorize("TypeError", "expected type string, got number"),
            ErrorCategory::TypeMismatch
        );
        assert_eq!(
            categorize("Error", "skill 'deploy-check' not found"),
            ErrorCategory::SkillNotFound
        );
        assert_eq!(
            categorize("Error", "skill invocation timed out"),
            ErrorCategory::SkillTimeout
        );
        assert_eq!(
            categorize("Error", "dependency service timed out"),
            ErrorCategory::DependencyTimeout
        );
        assert_eq!(
            categorize("Error", "config key 'region' missing"),
            ErrorCategory::ConfigMissing
        );
        assert_eq!(categorize("Error", "operation timed out"), ErrorCategory::Timeout);
        assert_eq!(
            categorize("Error", "something inexplicable"),
            ErrorCategory::Unknown
        );
        // Deterministic: same input, same output.
        assert_eq!(
            categorize("Error", "Parameter 'x' is required"),
            categorize("Error", "Parameter 'x' is required")
        );
    }

    #[test]
    fn pattern_key_groups_messages_differing_only_in_values() {
        let cat = ErrorCategory::MissingParameter;
        let a = pattern_key("Error", "Parameter 'userId' is required", cat);
        let b = pattern_key("Error", "Parameter 'orderId' is required", cat);
        assert_eq!(a, b);

        let c = pattern_key("TypeError", "Parameter 'userId' is required", cat);
        assert_ne!(a, c);
        // MD5 hex digest.
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn same_error_twice_yields_two_entries_one_pattern() {
        let mut logger = ErrorLogger::new();
        let first = logger.capture(raw("Error", "Parameter 'userId' is required"));
        let second = logger.capture(raw("Error", "Parameter 'userId' is required"));

        assert_ne!(first.id, second.id);
        assert_eq!(logger.entries().len(), 2);
        assert_eq!(logger.frequency().pattern_count(), 1);
        assert_eq!(second.occurrences, 2);
    }

    #[test]
    fn severity_elevates_with_occurrences() {
        let mut logger = ErrorLogger::new();
        let mut last = None;
        for _ in 0..11 {
            last = Some(logger.capture(raw("Error", "Parameter 'userId' is required")));
        }
        let entry = last.unwrap();
        assert_eq!(entry.occurrences, 11);
        assert_eq!(entry.severity, ErrorSeverity::Critical);

        // 3rd occurrence of a fresh pattern reaches medium.
        let mut logger = ErrorLogger::new();
        logger.capture(raw("Error", "Parameter 'a' is required"));
        logger.capture(raw("Error", "Parameter 'a' is required"));
        let third = logger.capture(raw("Error", "Parameter 'a' is required"));
        assert_eq!(third.severity, ErrorSeverity::Medium);
    }

    #[test]
    fn system_errors_start_high() {
        let mut logger = ErrorLogger::new();
        let entry = logger.capture(raw("Error", "process ran out of memory"));
        assert_eq!(entry.category, ErrorCategory::MemoryError);
        assert_eq!(entry.severity, ErrorSeverity::High);
    }

    #[test]
    fn unknown_errors_are_not_learnable() {
        let mut logger = ErrorLogger::new();
        let entry = logger.capture(raw("Error", "something inexplicable"));
        assert!(!entry.learnable);
        assert!(!entry.auto_fix);
    }

    #[test]
    fn mark_resolved_links_the_change() {
        let mut logger = ErrorLogger::new();
        let entry = logger.capture(raw("Error", "Parameter 'userId' is required"));
        assert!(logger.mark_resolved(&entry.id, "chg-42"));

        let stored = logger.get(&entry.id).unwrap();
        assert!(stored.resolved);
        assert_eq!(stored.resolution_change_id.as_deref(), Some("chg-42"));
        assert!(logger.unresolved().is_empty());
        assert!(!logger.mark_resolved("err-missing", "chg-42"));
    }
}
