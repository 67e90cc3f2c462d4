//! Safety controller: the gate every automated apply must pass.
//!
//! Five sub-gates evaluated in order, any block short-circuiting:
//! 1. manual block set (explicit deny-list of change ids)
//! 2. human override (valid, non-expired grant bypasses the rest)
//! 3. rolling-window rate limiter (minute/hour/day caps, post-failure
//!    cooldown)
//! 4. consecutive-failure tracker per change id
//! 5. confidence gate with isolation requirements
//!
//! The controller never mutates on `check`; applies and failures are
//! recorded by the apply engine after the fact.

use crate::config::SafetyConfig;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// Risk classification of a proposed change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Isolation an apply must run under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    None,
    Sandbox,
    Full,
}

impl IsolationLevel {
    /// Isolation required for a risk level. Production context always
    /// escalates to full isolation.
    pub fn required_for(risk: RiskLevel, production: bool) -> Self {
        if production {
            return IsolationLevel::Full;
        }
        match risk {
            RiskLevel::Low => IsolationLevel::None,
            RiskLevel::Medium => IsolationLevel::Sandbox,
            RiskLevel::High => IsolationLevel::Full,
        }
    }
}

/// Verdict classes of a safety check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyStatus {
    Safe,
    Warning,
    Blocked,
    OverrideRequired,
}

/// The full result handed back to the apply engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCheckResult {
    pub allowed: bool,
    pub status: SafetyStatus,
    /// Machine-readable reason when not SAFE.
    pub reason: Option<String>,
    pub details: Vec<String>,
    pub recommendations: Vec<String>,
    /// Isolation the apply must run under when allowed.
    pub isolation: IsolationLevel,
}

impl SafetyCheckResult {
    fn safe(isolation: IsolationLevel) -> Self {
        Self {
            allowed: true,
            status: SafetyStatus::Safe,
            reason: None,
            details: Vec::new(),
            recommendations: Vec::new(),
            isolation,
        }
    }

    fn blocked(reason: &str, detail: String, isolation: IsolationLevel) -> Self {
        Self {
            allowed: false,
            status: SafetyStatus::Blocked,
            reason: Some(reason.to_string()),
            details: vec![detail],
            recommendations: Vec::new(),
            isolation,
        }
    }
}

/// A human override grant for one change id.
#[derive(Debug, Clone)]
struct OverrideGrant {
    granted_by: String,
    expires_at: DateTime<Utc>,
}

/// The context a check runs against.
#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub change_id: String,
    pub confidence: f64,
    pub risk: RiskLevel,
    /// True when the change targets a production environment.
    pub production: bool,
}

/// The safety controller. Guard with a lock when shared; its operations
/// are synchronous and cheap.
pub struct SafetyController {
    config: SafetyConfig,
    manual_blocks: HashSet<String>,
    overrides: HashMap<String, OverrideGrant>,
    /// Timestamps of recorded applies, oldest first.
    applies: VecDeque<DateTime<Utc>>,
    /// Timestamps of recorded failures per change id.
    failures: HashMap<String, VecDeque<DateTime<Utc>>>,
    last_failure: Option<DateTime<Utc>>,
    /// Isolation environments currently leased.
    isolated_in_use: usize,
}

impl SafetyController {
    pub fn new(config: SafetyConfig) -> Self {
        Self {
            config,
            manual_blocks: HashSet::new(),
            overrides: HashMap::new(),
            applies: VecDeque::new(),
            failures: HashMap::new(),
            last_failure: None,
            isolated_in_use: 0,
        }
    }

    /// Add a change id to the manual deny-list.
    pub fn block_change(&mut self, change_id: &str) {
        self.manual_blocks.insert(change_id.to_string());
    }

    /// Remove a change id from the manual deny-list.
    pub fn unblock_change(&mut self, change_id: &str) {
        self.manual_blocks.remove(change_id);
    }

    /// Grant a human override for a change id, valid for `ttl`.
    pub fn grant_override(&mut self, change_id: &str, granted_by: &str, ttl: Duration) {
        self.overrides.insert(
            change_id.to_string(),
            OverrideGrant {
                granted_by: granted_by.to_string(),
                expires_at: Utc::now() + ttl,
            },
        );
    }

    /// Record a successful apply for rate accounting.
    pub fn record_apply(&mut self) {
        self.record_apply_at(Utc::now());
    }

    fn record_apply_at(&mut self, now: DateTime<Utc>) {
        self.applies.push_back(now);
        // Drop entries older than the widest window.
        let horizon = now - Duration::days(1);
        while self.applies.front().is_some_and(|t| *t < horizon) {
            self.applies.pop_front();
        }
    }

    /// Record a failed apply for cooldown and consecutive-failure
    /// accounting.
    pub fn record_failure(&mut self, change_id: &str) {
        self.record_failure_at(change_id, Utc::now());
    }

    fn record_failure_at(&mut self, change_id: &str, now: DateTime<Utc>) {
        self.last_failure = Some(now);
        let window = Duration::seconds(self.config.failure_window_secs as i64);
        let entry = self.failures.entry(change_id.to_string()).or_default();
        entry.push_back(now);
        while entry.front().is_some_and(|t| *t < now - window) {
            entry.pop_front();
        }
    }

    /// Lease an isolation environment. Returns false at the cap.
    pub fn acquire_isolation(&mut self) -> bool {
        if self.isolated_in_use >= self.config.max_concurrent_isolated {
            return false;
        }
        self.isolated_in_use += 1;
        true
    }

    /// Release a leased isolation environment.
    pub fn release_isolation(&mut self) {
        self.isolated_in_use = self.isolated_in_use.saturating_sub(1);
    }

    /// Run the five sub-gates in order.
    pub fn check(&self, ctx: &SafetyContext) -> SafetyCheckResult {
        self.check_at(ctx, Utc::now())
    }

    fn check_at(&self, ctx: &SafetyContext, now: DateTime<Utc>) -> SafetyCheckResult {
        let isolation = IsolationLevel::required_for(ctx.risk, ctx.production);

        // Gate 1: manual block set.
        if self.manual_blocks.contains(&ctx.change_id) {
            return SafetyCheckResult::blocked(
                "manual_block",
                format!("change {} is on the manual deny-list", ctx.change_id),
                isolation,
            );
        }

        // Gate 2: human override bypasses everything below.
        if let Some(grant) = self.overrides.get(&ctx.change_id)
            && grant.expires_at > now
        {
            let mut result = SafetyCheckResult::safe(isolation);
            result
                .details
                .push(format!("override granted by {}", grant.granted_by));
            return result;
        }

        // Gate 3: rate limiter with post-failure cooldown.
        if let Some(last) = self.last_failure {
            let cooldown = Duration::seconds(self.config.failure_cooldown_secs as i64);
            if now - last < cooldown {
                return SafetyCheckResult::blocked(
                    "rate_limit_exceeded",
                    format!(
                        "cooling down for {}s after a recorded failure",
                        self.config.failure_cooldown_secs
                    ),
                    isolation,
                );
            }
        }
        for (window, max) in [
            (Duration::minutes(1), self.config.max_per_minute),
            (Duration::hours(1), self.config.max_per_hour),
            (Duration::days(1), self.config.max_per_day),
        ] {
            let count = self.applies.iter().filter(|t| **t > now - window).count() as u32;
            if count >= max {
                return SafetyCheckResult::blocked(
                    "rate_limit_exceeded",
                    format!("{} applies in the last {} (max {})", count, humanize(window), max),
                    isolation,
                );
            }
        }

        // Gate 4: consecutive failures per change id.
        if let Some(entries) = self.failures.get(&ctx.change_id) {
            let window = Duration::seconds(self.config.failure_window_secs as i64);
            let recent = entries.iter().filter(|t| **t > now - window).count() as u32;
            if recent >= self.config.max_consecutive_failures {
                return SafetyCheckResult::blocked(
                    "consecutive_failures",
                    format!(
                        "{} failures for {} within {}s",
                        recent, ctx.change_id, self.config.failure_window_secs
                    ),
                    isolation,
                );
            }
        }

        // Gate 5: confidence gate.
        let required = match ctx.risk {
            RiskLevel::High => self.config.high_risk_confidence,
            _ => self.config.required_confidence,
        };
        if ctx.confidence < 0.5 {
            return SafetyCheckResult {
                allowed: false,
                status: SafetyStatus::OverrideRequired,
                reason: Some("confidence_override_required".to_string()),
                details: vec![format!("confidence {:.2} is below 0.5", ctx.confidence)],
                recommendations: vec![
                    "request a human override or discard the proposal".to_string(),
                ],
                isolation,
            };
        }
        if ctx.confidence < required {
            return SafetyCheckResult::blocked(
                "confidence_below_threshold",
                format!(
                    "confidence {:.2} below required {:.2} for {} risk",
                    ctx.confidence,
                    required,
                    ctx.risk.as_str()
                ),
                isolation,
            );
        }
        if ctx.confidence < 0.85 {
            return SafetyCheckResult {
                allowed: true,
                status: SafetyStatus::Warning,
                reason: None,
                details: vec![format!(
                    "confidence {:.2} is in the warning band (0.5..0.85)",
                    ctx.confidence
                )],
                recommendations: vec!["monitor closely after apply".to_string()],
                isolation,
            };
        }

        SafetyCheckResult::safe(isolation)
    }
}

fn humanize(window: Duration) -> &'static str {
    if window <= Duration::minutes(1) {
        "minute"
    } else if window <= Duration::hours(1) {
        "hour"
    } else {
        "day"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(change_id: &str, confidence: f64, risk: RiskLevel) -> SafetyContext {
        SafetyContext {
            change_id: change_id.to_string(),
            confidence,
            risk,
            production: false,
        }
    }

    fn controller() -> SafetyController {
        SafetyController::new(SafetyConfig::default())
    }

    #[test]
    fn high_confidence_low_risk_is_safe() {
        let safety = controller();
        let result = safety.check(&ctx("chg-1", 0.95, RiskLevel::Low));
        assert!(result.allowed);
        assert_eq!(result.status, SafetyStatus::Safe);
        assert_eq!(result.isolation, IsolationLevel::None);
    }

    #[test]
    fn manual_block_short_circuits() {
        let mut safety = controller();
        safety.block_change("chg-1");
        let result = safety.check(&ctx("chg-1", 0.99, RiskLevel::Low));
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("manual_block"));

        safety.unblock_change("chg-1");
        assert!(safety.check(&ctx("chg-1", 0.99, RiskLevel::Low)).allowed);
    }

    #[test]
    fn override_bypasses_remaining_gates() {
        let mut safety = controller();
        // Would otherwise be OVERRIDE_REQUIRED at 0.2 confidence.
        safety.grant_override("chg-1", "operator@example", Duration::hours(1));
        let result = safety.check(&ctx("chg-1", 0.2, RiskLevel::High));
        assert!(result.allowed);
        assert_eq!(result.status, SafetyStatus::Safe);
    }

    #[test]
    fn expired_override_does_not_bypass() {
        let mut safety = controller();
        safety.grant_override("chg-1", "operator@example", Duration::seconds(-1));
        let result = safety.check(&ctx("chg-1", 0.2, RiskLevel::Low));
        assert_eq!(result.status, SafetyStatus::OverrideRequired);
    }

    #[test]
    fn rate_limit_allows_nth_and_blocks_n_plus_first() {
        let mut safety = controller();
        let max = safety.config.max_per_minute;
        for _ in 0..(max - 1) {
            safety.record_apply();
        }
        // N-1 recorded: the Nth apply's check passes.
        assert!(safety.check(&ctx("chg-1", 0.9, RiskLevel::Low)).allowed);
        safety.record_apply();
        // N recorded: the (N+1)th is blocked.
        let result = safety.check(&ctx("chg-1", 0.9, RiskLevel::Low));
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("rate_limit_exceeded"));
    }

    #[test]
    fn failure_cooldown_blocks_until_elapsed() {
        let mut safety = controller();
        let now = Utc::now();
        safety.record_failure_at("chg-1", now);

        let during = safety.check_at(&ctx("chg-2", 0.9, RiskLevel::Low), now + Duration::seconds(10));
        assert_eq!(during.reason.as_deref(), Some("rate_limit_exceeded"));

        let after = safety.check_at(&ctx("chg-2", 0.9, RiskLevel::Low), now + Duration::seconds(31));
        assert!(after.allowed);
    }

    #[test]
    fn three_failures_in_window_block_the_change() {
        let mut safety = controller();
        let now = Utc::now();
        for i in 0..3 {
            safety.record_failure_at("chg-1", now + Duration::seconds(i));
        }
        // Past the cooldown but inside the 10-minute failure window.
        let at = now + Duration::seconds(120);
        let result = safety.check_at(&ctx("chg-1", 0.9, RiskLevel::Low), at);
        assert_eq!(result.reason.as_deref(), Some("consecutive_failures"));

        // A different change id is unaffected.
        assert!(safety.check_at(&ctx("chg-2", 0.9, RiskLevel::Low), at).allowed);
    }

    #[test]
    fn confidence_exactly_at_threshold_passes() {
        let safety = controller();
        let at_threshold = safety.check(&ctx("chg-1", 0.7, RiskLevel::Low));
        assert!(at_threshold.allowed);

        let below = safety.check(&ctx("chg-1", 0.7 - 1e-9, RiskLevel::Low));
        assert!(!below.allowed);
    }

    #[test]
    fn high_risk_requires_higher_confidence() {
        let safety = controller();
        assert!(!safety.check(&ctx("chg-1", 0.85, RiskLevel::High)).allowed);
        assert!(safety.check(&ctx("chg-1", 0.9, RiskLevel::High)).allowed);
    }

    #[test]
    fn warning_band_allows_with_warning_status() {
        let safety = controller();
        let result = safety.check(&ctx("chg-1", 0.8, RiskLevel::Low));
        assert!(result.allowed);
        assert_eq!(result.status, SafetyStatus::Warning);
    }

    #[test]
    fn very_low_confidence_requires_override() {
        let safety = controller();
        let result = safety.check(&ctx("chg-1", 0.4, RiskLevel::Low));
        assert!(!result.allowed);
        assert_eq!(result.status, SafetyStatus::OverrideRequired);
    }

    #[test]
    fn isolation_mapping_follows_risk_and_production() {
        assert_eq!(
            IsolationLevel::required_for(RiskLevel::Low, false),
            IsolationLevel::None
        );
        assert_eq!(
            IsolationLevel::required_for(RiskLevel::Medium, false),
            IsolationLevel::Sandbox
        );
        assert_eq!(
            IsolationLevel::required_for(RiskLevel::High, false),
            IsolationLevel::Full
        );
        assert_eq!(
            IsolationLevel::required_for(RiskLevel::Low, true),
            IsolationLevel::Full
        );
    }

    #[test]
    fn isolation_slots_respect_the_cap() {
        let mut safety = controller();
        let cap = safety.config.max_concurrent_isolated;
        for _ in 0..cap {
            assert!(safety.acquire_isolation());
        }
        assert!(!safety.acquire_isolation());
        safety.release_isolation();
        assert!(safety.acquire_isolation());
    }
}
