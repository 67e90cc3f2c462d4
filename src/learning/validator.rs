//! Fix validation: five gates and the aggregate verdict.
//!
//! Each gate is a capability with one `validate` method, registered by
//! name and run in declared order: type, logic, sandbox, regression,
//! impact. The aggregate confidence is
//! `proposal.confidence × (0.5 + 0.5·passed/5)`, multiplied by 0.5 for
//! every error-severity failure and 0.8 for every warning-severity
//! failure. Strict mode approves only when every gate passed and the
//! confidence threshold is met; relaxed mode tolerates non-error
//! failures.

use crate::learning::generator::{ChangeType, FixProposal};
use crate::safety::RiskLevel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

/// Gate outcome severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateSeverity {
    Info,
    Warning,
    Error,
}

/// Result of one gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub severity: GateSeverity,
    pub message: String,
    pub details: Option<Value>,
    pub duration_ms: u64,
}

impl GateResult {
    fn pass(gate: &str, message: &str) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            severity: GateSeverity::Info,
            message: message.to_string(),
            details: None,
            duration_ms: 0,
        }
    }

    fn fail(gate: &str, severity: GateSeverity, message: String) -> Self {
        Self {
            gate: gate.to_string(),
            passed: false,
            severity,
            message,
            details: None,
            duration_ms: 0,
        }
    }
}

/// Result of an isolated sandbox trial of the change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxReport {
    pub runtime_errors: u32,
    pub failed_tests: u32,
    /// False when the trial exceeded its resource limits.
    pub resource_limit_exceeded: bool,
}

/// Result of re-running previously passing tests for affected agents
/// and skills.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegressionReport {
    pub newly_failing_tests: Vec<String>,
}

/// Everything the gates evaluate besides the proposal itself.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    pub sandbox: SandboxReport,
    pub regression: RegressionReport,
}

/// A validation gate: one capability, one method.
pub trait ValidationGate: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, proposal: &FixProposal, ctx: &ValidationContext) -> GateResult;
}

/// JSON kind label for type-compatibility checks.
fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Detect a `$ref` back to the change target inside the new value.
fn has_circular_ref(value: &Value, target: &str) -> bool {
    match value {
        Value::Object(map) => map.iter().any(|(k, v)| {
            (k == "$ref" && v.as_str() == Some(target)) || has_circular_ref(v, target)
        }),
        Value::Array(items) => items.iter().any(|v| has_circular_ref(v, target)),
        _ => false,
    }
}

struct TypeGate;

impl ValidationGate for TypeGate {
    fn name(&self) -> &'static str {
        "type"
    }

    fn validate(&self, proposal: &FixProposal, _ctx: &ValidationContext) -> GateResult {
        let change = &proposal.change;

        // Kind compatibility: replacing null is always allowed; otherwise
        // old and new must share a JSON kind.
        if let (Some(old), Some(new)) = (&change.old_value, &change.new_value)
            && !old.is_null()
            && !new.is_null()
            && json_kind(old) != json_kind(new)
        {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!(
                    "new value kind {} incompatible with old kind {}",
                    json_kind(new),
                    json_kind(old)
                ),
            );
        }

        // Schema shape per change type.
        let shape_ok = match change.change_type {
            ChangeType::ValidationRule | ChangeType::TypeCheck => {
                change.new_value.as_ref().is_some_and(|v| v.is_object())
            }
            ChangeType::DefaultValue | ChangeType::ConfigUpdate => change.new_value.is_some(),
            ChangeType::ErrorHandling | ChangeType::ConditionCheck | ChangeType::GenericFix => true,
        };
        if !shape_ok {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!(
                    "new value shape invalid for change type {}",
                    change.change_type.as_str()
                ),
            );
        }

        if let Some(new) = &change.new_value
            && has_circular_ref(new, &change.target)
        {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!("new value contains a circular $ref to '{}'", change.target),
            );
        }

        GateResult::pass(self.name(), "types compatible, schema valid")
    }
}

/// Cheap structural parse of a code example: non-empty with balanced
/// bracket pairs.
fn code_parses(example: &str) -> bool {
    if example.trim().is_empty() {
        return false;
    }
    let mut stack = Vec::new();
    for c in example.chars() {
        match c {
            '(' | '[' | '{' => stack.push(c),
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

struct LogicGate;

impl ValidationGate for LogicGate {
    fn name(&self) -> &'static str {
        "logic"
    }

    fn validate(&self, proposal: &FixProposal, _ctx: &ValidationContext) -> GateResult {
        if let Some(example) = &proposal.change.code_example {
            if !code_parses(example) {
                return GateResult::fail(
                    self.name(),
                    GateSeverity::Error,
                    "code example does not parse".to_string(),
                );
            }
            let guards_errors = example.contains("Err(")
                || example.contains("return")
                || example.to_lowercase().contains("error");
            if matches!(
                proposal.change.change_type,
                ChangeType::ValidationRule | ChangeType::TypeCheck
            ) && !guards_errors
            {
                return GateResult::fail(
                    self.name(),
                    GateSeverity::Error,
                    "validation change lacks error handling in its example".to_string(),
                );
            }
        }

        if proposal
            .rollback_plan
            .dependencies
            .contains(&proposal.change_id)
        {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                "rollback plan depends on the change itself".to_string(),
            );
        }

        GateResult::pass(self.name(), "logic checks passed")
    }
}

struct SandboxGate;

impl ValidationGate for SandboxGate {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn validate(&self, _proposal: &FixProposal, ctx: &ValidationContext) -> GateResult {
        let report = &ctx.sandbox;
        if report.runtime_errors > 0 {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!("{} runtime errors in isolated trial", report.runtime_errors),
            );
        }
        if report.failed_tests > 0 {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!("{} tests failed in isolated trial", report.failed_tests),
            );
        }
        if report.resource_limit_exceeded {
            return GateResult::fail(
                self.name(),
                GateSeverity::Warning,
                "isolated trial exceeded resource limits".to_string(),
            );
        }
        GateResult::pass(self.name(), "isolated trial clean")
    }
}

struct RegressionGate;

impl ValidationGate for RegressionGate {
    fn name(&self) -> &'static str {
        "regression"
    }

    fn validate(&self, _proposal: &FixProposal, ctx: &ValidationContext) -> GateResult {
        if ctx.regression.newly_failing_tests.is_empty() {
            GateResult::pass(self.name(), "no previously passing tests broke")
        } else {
            GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!(
                    "{} previously passing tests now fail: {}",
                    ctx.regression.newly_failing_tests.len(),
                    ctx.regression.newly_failing_tests.join(", ")
                ),
            )
        }
    }
}

struct ImpactGate;

/// Weighted risk score, capped at 1.0.
pub fn impact_risk_score(proposal: &FixProposal) -> f64 {
    let impact = &proposal.impact;
    let strategy_risk = match proposal.strategy.risk() {
        RiskLevel::Low => 0.0,
        RiskLevel::Medium => 0.15,
        RiskLevel::High => 0.3,
    };
    let score = 0.1 * impact.affected_agents.len() as f64
        + 0.05 * impact.affected_skills.len() as f64
        + 0.15 * impact.side_effects.len() as f64
        + 0.25 * impact.potential_breakages.len() as f64
        + strategy_risk;
    score.min(1.0)
}

impl ValidationGate for ImpactGate {
    fn name(&self) -> &'static str {
        "impact"
    }

    fn validate(&self, proposal: &FixProposal, _ctx: &ValidationContext) -> GateResult {
        let breakages = proposal.impact.potential_breakages.len();
        let dependency_issues = proposal.impact.dependency_issues.len();
        if breakages > 0 || dependency_issues > 0 {
            return GateResult::fail(
                self.name(),
                GateSeverity::Error,
                format!(
                    "{} potential breakages, {} dependency issues",
                    breakages, dependency_issues
                ),
            );
        }
        let score = impact_risk_score(proposal);
        if score >= 0.7 {
            return GateResult::fail(
                self.name(),
                GateSeverity::Warning,
                format!("risk score {:.2} at or above 0.7", score),
            );
        }
        let mut result = GateResult::pass(self.name(), "impact within bounds");
        result.details = Some(serde_json::json!({"risk_score": score}));
        result
    }
}

/// Aggregate validation verdict for one proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub change_id: String,
    pub gates: Vec<GateResult>,
    pub all_gates_passed: bool,
    pub overall_confidence: f64,
    pub approved: bool,
    pub recommendations: Vec<String>,
}

/// The validator: ordered gates plus approval policy.
pub struct FixValidator {
    gates: Vec<Box<dyn ValidationGate>>,
    confidence_threshold: f64,
    require_all_gates: bool,
}

impl FixValidator {
    pub fn new(confidence_threshold: f64, require_all_gates: bool) -> Self {
        Self {
            gates: vec![
                Box::new(TypeGate),
                Box::new(LogicGate),
                Box::new(SandboxGate),
                Box::new(RegressionGate),
                Box::new(ImpactGate),
            ],
            confidence_threshold,
            require_all_gates,
        }
    }

    /// Run all five gates and compute the aggregate verdict.
    pub fn validate(&self, proposal: &FixProposal, ctx: &ValidationContext) -> ValidationResult {
        let mut gates = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            let started = Instant::now();
            let mut result = gate.validate(proposal, ctx);
            result.duration_ms = started.elapsed().as_millis() as u64;
            gates.push(result);
        }

        let passed = gates.iter().filter(|g| g.passed).count();
        let all_gates_passed = passed == gates.len();

        let mut confidence = proposal.confidence * (0.5 + 0.5 * passed as f64 / gates.len() as f64);
        for gate in gates.iter().filter(|g| !g.passed) {
            confidence *= match gate.severity {
                GateSeverity::Error => 0.5,
                GateSeverity::Warning => 0.8,
                GateSeverity::Info => 1.0,
            };
        }

        let threshold_met = confidence >= self.confidence_threshold;
        let approved = if self.require_all_gates {
            all_gates_passed && threshold_met
        } else {
            let no_error_failures = gates
                .iter()
                .all(|g| g.passed || g.severity != GateSeverity::Error);
            no_error_failures && threshold_met
        };

        let mut recommendations = Vec::new();
        for gate in gates.iter().filter(|g| !g.passed) {
            recommendations.push(format!("resolve {} gate: {}", gate.gate, gate.message));
        }
        if !threshold_met {
            recommendations.push(format!(
                "confidence {:.2} below the {:.2} threshold",
                confidence, self.confidence_threshold
            ));
        }

        ValidationResult {
            change_id: proposal.change_id.clone(),
            gates,
            all_gates_passed,
            overall_confidence: confidence,
            approved,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::generator::{
        FixStrategy, ImpactAssessment, ProposalStatus, ProposedChange, RollbackPlan,
    };
    use chrono::Utc;

    fn proposal(confidence: f64) -> FixProposal {
        FixProposal {
            change_id: "chg-test1".to_string(),
            source_error_id: "err-1".to_string(),
            pattern_hash: "abcd1234abcd1234".to_string(),
            change: ProposedChange {
                change_type: ChangeType::ValidationRule,
                target: "userId".to_string(),
                old_value: None,
                new_value: Some(serde_json::json!({"required": true})),
                rationale: "validate userId".to_string(),
                code_example: Some(
                    "if input.get(\"userId\").is_none() { return Err(missing(\"userId\")); }"
                        .to_string(),
                ),
            },
            strategy: FixStrategy::AddValidation,
            alternatives: vec![],
            confidence,
            risk: FixStrategy::AddValidation.risk(),
            impact: ImpactAssessment {
                affected_agents: vec!["app-implement".to_string()],
                ..Default::default()
            },
            rollback_plan: RollbackPlan::default(),
            status: ProposalStatus::Proposed,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn clean_proposal_passes_all_five_gates() {
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&proposal(0.9), &ValidationContext::default());
        assert_eq!(result.gates.len(), 5);
        assert!(result.all_gates_passed);
        // 0.9 × (0.5 + 0.5·5/5) = 0.9
        assert!((result.overall_confidence - 0.9).abs() < 1e-9);
        assert!(result.approved);
        assert!(result.recommendations.is_empty());
    }

    #[test]
    fn confidence_exactly_at_threshold_approves() {
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&proposal(0.8), &ValidationContext::default());
        assert!(result.approved);

        let result = validator.validate(&proposal(0.8 - 1e-9), &ValidationContext::default());
        assert!(!result.approved);
    }

    #[test]
    fn type_gate_rejects_kind_change() {
        let mut p = proposal(0.95);
        p.change.old_value = Some(serde_json::json!("five"));
        p.change.new_value = Some(serde_json::json!(5));
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        let type_gate = result.gates.iter().find(|g| g.gate == "type").unwrap();
        assert!(!type_gate.passed);
        assert_eq!(type_gate.severity, GateSeverity::Error);
        assert!(!result.approved);
    }

    #[test]
    fn type_gate_allows_replacing_null() {
        let mut p = proposal(0.95);
        p.change.change_type = ChangeType::DefaultValue;
        p.change.old_value = Some(serde_json::Value::Null);
        p.change.new_value = Some(serde_json::json!(42));
        p.change.code_example = None;
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        assert!(result.gates.iter().find(|g| g.gate == "type").unwrap().passed);
    }

    #[test]
    fn type_gate_detects_circular_ref() {
        let mut p = proposal(0.95);
        p.change.new_value = Some(serde_json::json!({"rule": {"$ref": "userId"}}));
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        assert!(!result.gates.iter().find(|g| g.gate == "type").unwrap().passed);
    }

    #[test]
    fn logic_gate_requires_parsing_example_and_error_handling() {
        let mut p = proposal(0.95);
        p.change.code_example = Some("if (unbalanced {".to_string());
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        assert!(!result.gates.iter().find(|g| g.gate == "logic").unwrap().passed);

        let mut p = proposal(0.95);
        p.change.code_example = Some("let x = compute(input);".to_string());
        let result = validator.validate(&p, &ValidationContext::default());
        let logic = result.gates.iter().find(|g| g.gate == "logic").unwrap();
        assert!(!logic.passed);
        assert!(logic.message.contains("error handling"));
    }

    #[test]
    fn logic_gate_rejects_self_referential_rollback() {
        let mut p = proposal(0.95);
        p.rollback_plan.dependencies = vec![p.change_id.clone()];
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        assert!(!result.gates.iter().find(|g| g.gate == "logic").unwrap().passed);
    }

    #[test]
    fn sandbox_failures_block() {
        let validator = FixValidator::new(0.8, true);
        let ctx = ValidationContext {
            sandbox: SandboxReport {
                runtime_errors: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = validator.validate(&proposal(0.95), &ctx);
        assert!(!result.gates.iter().find(|g| g.gate == "sandbox").unwrap().passed);
        assert!(!result.approved);
    }

    #[test]
    fn regression_failures_block() {
        let validator = FixValidator::new(0.8, true);
        let ctx = ValidationContext {
            regression: RegressionReport {
                newly_failing_tests: vec!["tests::auth::login".to_string()],
            },
            ..Default::default()
        };
        let result = validator.validate(&proposal(0.95), &ctx);
        let gate = result.gates.iter().find(|g| g.gate == "regression").unwrap();
        assert!(!gate.passed);
        assert!(gate.message.contains("tests::auth::login"));
    }

    #[test]
    fn impact_gate_blocks_breakages_outright() {
        let mut p = proposal(0.95);
        p.impact.potential_breakages = vec!["breaks deploy-verify".to_string()];
        let validator = FixValidator::new(0.8, true);
        let result = validator.validate(&p, &ValidationContext::default());
        assert!(!result.gates.iter().find(|g| g.gate == "impact").unwrap().passed);
    }

    #[test]
    fn impact_risk_score_follows_the_formula() {
        let mut p = proposal(0.95);
        p.impact.affected_agents = vec!["a".into(), "b".into()];
        p.impact.affected_skills = vec!["s".into()];
        p.impact.side_effects = vec!["latency".into()];
        // add_validation is low risk: no strategy term.
        let score = impact_risk_score(&p);
        assert!((score - (0.2 + 0.05 + 0.15)).abs() < 1e-9);

        p.strategy = FixStrategy::FixLogic;
        let score = impact_risk_score(&p);
        assert!((score - (0.2 + 0.05 + 0.15 + 0.3)).abs() < 1e-9);
    }

    #[test]
    fn failed_gates_scale_confidence_down() {
        let validator = FixValidator::new(0.8, true);
        let ctx = ValidationContext {
            sandbox: SandboxReport {
                failed_tests: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = validator.validate(&proposal(1.0), &ctx);
        // 4/5 gates passed: 1.0 × (0.5 + 0.5·4/5) = 0.9, then ×0.5 error.
        assert!((result.overall_confidence - 0.45).abs() < 1e-9);
    }

    #[test]
    fn relaxed_mode_tolerates_warning_failures() {
        // Warning-only failure: resource limits exceeded.
        let ctx = ValidationContext {
            sandbox: SandboxReport {
                resource_limit_exceeded: true,
                ..Default::default()
            },
            ..Default::default()
        };

        let strict = FixValidator::new(0.5, true);
        let relaxed = FixValidator::new(0.5, false);
        let strict_result = strict.validate(&proposal(0.9), &ctx);
        let relaxed_result = relaxed.validate(&proposal(0.9), &ctx);

        assert!(!strict_result.approved);
        // 0.9 × 0.9 × 0.8 = 0.648 ≥ 0.5 with no error-severity failure.
        assert!(relaxed_result.approved);
    }
}
