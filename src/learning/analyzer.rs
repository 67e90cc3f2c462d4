//! Analysis engine: root-cause detection and pattern recognition.
//!
//! The root-cause detector walks an ordered catalogue of matchers over a
//! captured error; among the matchers that fire, the highest evidence
//! score wins and becomes the base confidence (0.8–0.95 typical, 0.3 for
//! the fallback). The pattern recogniser keys errors by a 16-character
//! hash of (type, normalised message, agent), counts recurrences, links
//! related patterns by weighted similarity, and remembers which fixes
//! worked; a proven fix boosts confidence by 0.1 on recurrence.

use crate::learning::logger::{ErrorCategory, ErrorLogEntry, normalize_message};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Inferred underlying cause classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseKind {
    UndefinedAccess,
    MissingParameter,
    TypeError,
    SkillNotFound,
    Timeout,
    ConfigMissing,
    ValidationFailed,
    DependencyError,
    Undetermined,
}

/// A detected root cause with its evidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCause {
    pub kind: RootCauseKind,
    /// Evidence score in 0..1; doubles as the base confidence.
    pub evidence: f64,
    pub description: String,
}

struct Matcher {
    kind: RootCauseKind,
    evidence: f64,
    predicate: fn(&ErrorLogEntry) -> bool,
    description: &'static str,
}

/// The ordered matcher catalogue. Order breaks evidence ties.
fn matchers() -> Vec<Matcher> {
    vec![
        Matcher {
            kind: RootCauseKind::UndefinedAccess,
            evidence: 0.95,
            predicate: |e| {
                let m = e.message.to_lowercase();
                m.contains("undefined") || m.contains("null reference") || m.contains("cannot read")
            },
            description: "access to an undefined or null value",
        },
        Matcher {
            kind: RootCauseKind::MissingParameter,
            evidence: 0.9,
            predicate: |e| e.category == ErrorCategory::MissingParameter,
            description: "a required parameter was not supplied",
        },
        Matcher {
            kind: RootCauseKind::TypeError,
            evidence: 0.88,
            predicate: |e| e.category == ErrorCategory::TypeMismatch,
            description: "a value had an incompatible type",
        },
        Matcher {
            kind: RootCauseKind::SkillNotFound,
            evidence: 0.92,
            predicate: |e| e.category == ErrorCategory::SkillNotFound,
            description: "a referenced skill does not exist",
        },
        Matcher {
            kind: RootCauseKind::Timeout,
            evidence: 0.85,
            predicate: |e| {
                matches!(
                    e.category,
                    ErrorCategory::Timeout
                        | ErrorCategory::SkillTimeout
                        | ErrorCategory::DependencyTimeout
                )
            },
            description: "an operation exceeded its time budget",
        },
        Matcher {
            kind: RootCauseKind::ConfigMissing,
            evidence: 0.9,
            predicate: |e| e.category == ErrorCategory::ConfigMissing,
            description: "a configuration key is absent",
        },
        Matcher {
            kind: RootCauseKind::ValidationFailed,
            evidence: 0.8,
            predicate: |e| {
                let m = e.message.to_lowercase();
                m.contains("validation") || e.category == ErrorCategory::ConditionFailed
            },
            description: "a validation rule or condition rejected the input",
        },
        Matcher {
            kind: RootCauseKind::DependencyError,
            evidence: 0.82,
            predicate: |e| {
                matches!(
                    e.category,
                    ErrorCategory::DependencyNotFound | ErrorCategory::DependencyError
                )
            },
            description: "a dependency failed or is unavailable",
        },
    ]
}

/// A fix known to have been applied against a pattern.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnownFix {
    pub change_id: String,
    pub strategy: String,
    /// Rolling success ratio in 0..1.
    pub effectiveness: f64,
    pub applications: u32,
}

/// One recognised error pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    /// 16-char hash of (type, normalised message, agent).
    pub pattern_hash: String,
    pub error_type: String,
    pub normalized_message: String,
    pub agent: String,
    pub skill: Option<String>,
    pub category: ErrorCategory,
    pub total_occurrences: u32,
    /// Occurrences within the last hour.
    pub recent_occurrences: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub known_fixes: Vec<KnownFix>,
    /// Related pattern hashes, refreshed on analysis.
    pub related: Vec<String>,
}

impl PatternRecord {
    /// Best proven fix: highest effectiveness above 0.5.
    pub fn best_known_fix(&self) -> Option<&KnownFix> {
        self.known_fixes
            .iter()
            .filter(|f| f.effectiveness > 0.5)
            .max_by(|a, b| a.effectiveness.total_cmp(&b.effectiveness))
    }
}

/// 16-character pattern hash over (type, normalised message, agent).
pub fn pattern_hash(error_type: &str, message: &str, agent: &str) -> String {
    let normalized = normalize_message(message);
    let digest = md5::compute(format!("{}|{}|{}", error_type, normalized, agent));
    format!("{:x}", digest)[..16].to_string()
}

/// Registry of recognised patterns.
#[derive(Debug, Default)]
pub struct PatternRegistry {
    patterns: HashMap<String, PatternRecord>,
    recent_window: Vec<(DateTime<Utc>, String)>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error against its pattern, inserting on first sight.
    /// Returns the pattern hash and whether it was newly created.
    pub fn record(&mut self, entry: &ErrorLogEntry) -> (String, bool) {
        let hash = pattern_hash(&entry.error_type, &entry.message, &entry.agent);
        let now = Utc::now();
        self.recent_window.push((now, hash.clone()));
        let horizon = now - Duration::hours(1);
        self.recent_window.retain(|(t, _)| *t > horizon);
        let recent = self
            .recent_window
            .iter()
            .filter(|(_, h)| *h == hash)
            .count() as u32;

        match self.patterns.get_mut(&hash) {
            Some(record) => {
                record.total_occurrences += 1;
                record.recent_occurrences = recent;
                record.last_seen = now;
                (hash, false)
            }
            None => {
                self.patterns.insert(
                    hash.clone(),
                    PatternRecord {
                        pattern_hash: hash.clone(),
                        error_type: entry.error_type.clone(),
                        normalized_message: normalize_message(&entry.message),
                        agent: entry.agent.clone(),
                        skill: entry.skill.clone(),
                        category: entry.category,
                        total_occurrences: 1,
                        recent_occurrences: recent,
                        first_seen: now,
                        last_seen: now,
                        known_fixes: Vec::new(),
                        related: Vec::new(),
                    },
                );
                (hash, true)
            }
        }
    }

    pub fn get(&self, hash: &str) -> Option<&PatternRecord> {
        self.patterns.get(hash)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &PatternRecord> {
        self.patterns.values()
    }

    /// Up to five related patterns by weighted similarity over
    /// (error type 0.3, category 0.3, agent 0.2, skill 0.2).
    pub fn find_related(&self, hash: &str) -> Vec<String> {
        let Some(subject) = self.patterns.get(hash) else {
            return Vec::new();
        };
        let mut scored: Vec<(f64, &str)> = self
            .patterns
            .values()
            .filter(|p| p.pattern_hash != subject.pattern_hash)
            .filter_map(|candidate| {
                let mut score = 0.0;
                if candidate.error_type == subject.error_type {
                    score += 0.3;
                }
                if candidate.category == subject.category {
                    score += 0.3;
                }
                if candidate.agent == subject.agent {
                    score += 0.2;
                }
                if candidate.skill.is_some() && candidate.skill == subject.skill {
                    score += 0.2;
                }
                (score >= 0.5).then_some((score, candidate.pattern_hash.as_str()))
            })
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().take(5).map(|(_, h)| h.to_string()).collect()
    }

    /// Record the outcome of applying `change_id` against a pattern.
    /// Success pulls effectiveness toward 1, failure toward 0.
    pub fn record_fix_outcome(
        &mut self,
        hash: &str,
        change_id: &str,
        strategy: &str,
        success: bool,
    ) {
        let Some(record) = self.patterns.get_mut(hash) else {
            return;
        };
        let outcome = if success { 1.0 } else { 0.0 };
        match record
            .known_fixes
            .iter_mut()
            .find(|f| f.change_id == change_id)
        {
            Some(fix) => {
                let n = fix.applications as f64;
                fix.effectiveness = (fix.effectiveness * n + outcome) / (n + 1.0);
                fix.applications += 1;
            }
            None => record.known_fixes.push(KnownFix {
                change_id: change_id.to_string(),
                strategy: strategy.to_string(),
                effectiveness: outcome,
                applications: 1,
            }),
        }
    }
}

/// Result of analysing one error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub error_id: String,
    pub root_cause: RootCause,
    /// Base confidence (evidence), boosted by a proven known fix.
    pub confidence: f64,
    pub pattern_hash: String,
    pub is_recurring: bool,
    pub related_patterns: Vec<String>,
    /// The best proven fix for this pattern, when one exists.
    pub known_fix: Option<KnownFix>,
}

/// The analysis engine: matcher catalogue plus pattern registry.
pub struct AnalysisEngine {
    registry: PatternRegistry,
}

impl Default for AnalysisEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisEngine {
    pub fn new() -> Self {
        Self {
            registry: PatternRegistry::new(),
        }
    }

    pub fn registry(&self) -> &PatternRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PatternRegistry {
        &mut self.registry
    }

    /// Detect the root cause: among matchers that fire, highest evidence
    /// wins; the fallback carries 0.3.
    pub fn detect_root_cause(&self, entry: &ErrorLogEntry) -> RootCause {
        let best = matchers()
            .into_iter()
            .filter(|m| (m.predicate)(entry))
            .max_by(|a, b| a.evidence.total_cmp(&b.evidence));
        match best {
            Some(m) => RootCause {
                kind: m.kind,
                evidence: m.evidence,
                description: m.description.to_string(),
            },
            None => RootCause {
                kind: RootCauseKind::Undetermined,
                evidence: 0.3,
                description: "no matcher fired; cause undetermined".to_string(),
            },
        }
    }

    /// Full analysis: root cause, pattern bookkeeping, related patterns
    /// and the known-fix confidence boost.
    pub fn analyze(&mut self, entry: &ErrorLogEntry) -> AnalysisResult {
        let root_cause = self.detect_root_cause(entry);
        let (hash, is_new) = self.registry.record(entry);
        let related = self.registry.find_related(&hash);
        if let Some(record) = self.registry.patterns.get_mut(&hash) {
            record.related = related.clone();
        }

        let known_fix = self.registry.get(&hash).and_then(|r| r.best_known_fix()).cloned();
        let mut confidence = root_cause.evidence;
        if known_fix.is_some() {
            confidence = (confidence + 0.1).min(1.0);
        }

        AnalysisResult {
            error_id: entry.id.clone(),
            root_cause,
            confidence,
            pattern_hash: hash,
            is_recurring: !is_new,
            related_patterns: related,
            known_fix,
        }
    }
}
