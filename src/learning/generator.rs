//! Fix generation: per-category generators producing typed proposals.
//!
//! Each generator is a capability with a single `generate` method,
//! registered by error-category family. A generator emits up to three
//! proposals, each carrying a primary strategy, alternatives, an impact
//! assessment and a rollback plan. Confidence is the analysis confidence
//! multiplied by the root-cause evidence, then adjusted by risk factors
//! (known fix +0.15, low risk +0.1, high risk −0.2); proposals below the
//! configured minimum are discarded.

use crate::learning::analyzer::AnalysisResult;
use crate::learning::logger::{CategoryGroup, ErrorCategory, ErrorLogEntry};
use crate::safety::RiskLevel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;
use uuid::Uuid;

/// Enumerated fix strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixStrategy {
    UpdateParameter,
    AddValidation,
    SetDefaultValue,
    FixLogic,
    AddCondition,
    RefactorFlow,
    UpdateDependency,
    AddDependency,
    ChangeSkill,
    StrengthenValidation,
    AddErrorHandling,
    ImproveLogging,
    UpdateConfig,
    AddConfigOption,
}

impl FixStrategy {
    pub fn as_str(&self) -> &'static str {
        use FixStrategy::*;
        match self {
            UpdateParameter => "update_parameter",
            AddValidation => "add_validation",
            SetDefaultValue => "set_default_value",
            FixLogic => "fix_logic",
            AddCondition => "add_condition",
            RefactorFlow => "refactor_flow",
            UpdateDependency => "update_dependency",
            AddDependency => "add_dependency",
            ChangeSkill => "change_skill",
            StrengthenValidation => "strengthen_validation",
            AddErrorHandling => "add_error_handling",
            ImproveLogging => "improve_logging",
            UpdateConfig => "update_config",
            AddConfigOption => "add_config_option",
        }
    }

    /// Intrinsic risk of applying this strategy.
    pub fn risk(&self) -> RiskLevel {
        use FixStrategy::*;
        match self {
            AddValidation | SetDefaultValue | StrengthenValidation | AddErrorHandling
            | ImproveLogging | AddConfigOption => RiskLevel::Low,
            UpdateParameter | AddCondition | UpdateDependency | AddDependency | ChangeSkill
            | UpdateConfig => RiskLevel::Medium,
            FixLogic | RefactorFlow => RiskLevel::High,
        }
    }
}

impl std::fmt::Display for FixStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the apply engine mutates system state for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    ValidationRule,
    TypeCheck,
    DefaultValue,
    ConfigUpdate,
    ErrorHandling,
    ConditionCheck,
    GenericFix,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::ValidationRule => "validation_rule",
            ChangeType::TypeCheck => "type_check",
            ChangeType::DefaultValue => "default_value",
            ChangeType::ConfigUpdate => "config_update",
            ChangeType::ErrorHandling => "error_handling",
            ChangeType::ConditionCheck => "condition_check",
            ChangeType::GenericFix => "generic_fix",
        }
    }
}

/// The concrete change a proposal carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProposedChange {
    pub change_type: ChangeType,
    /// The key the change targets (parameter, config key, skill, ...).
    pub target: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub rationale: String,
    pub code_example: Option<String>,
}

/// Predicted blast radius of a change.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ImpactAssessment {
    pub affected_agents: Vec<String>,
    pub affected_skills: Vec<String>,
    pub side_effects: Vec<String>,
    pub potential_breakages: Vec<String>,
    pub dependency_issues: Vec<String>,
}

/// How the change is undone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPlan {
    pub reversible: bool,
    pub estimated_rollback_secs: u64,
    /// Change ids that must be rolled back first.
    pub dependencies: Vec<String>,
}

impl Default for RollbackPlan {
    fn default() -> Self {
        Self {
            reversible: true,
            estimated_rollback_secs: 5,
            dependencies: Vec::new(),
        }
    }
}

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Proposed,
    Validated,
    Approved,
    Applied,
    RolledBack,
    Rejected,
}

/// A candidate fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixProposal {
    pub change_id: String,
    pub source_error_id: String,
    pub pattern_hash: String,
    pub change: ProposedChange,
    pub strategy: FixStrategy,
    pub alternatives: Vec<FixStrategy>,
    pub confidence: f64,
    pub risk: RiskLevel,
    pub impact: ImpactAssessment,
    pub rollback_plan: RollbackPlan,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
}

/// A fix generator: one capability per error-category family.
pub trait FixGenerator: Send + Sync {
    fn group(&self) -> CategoryGroup;
    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal>;
}

static RE_QUOTED: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r#"['"]([A-Za-z0-9_.:/-]+)['"]"#).unwrap());

/// Extract the first quoted token of a message, the usual carrier of the
/// offending parameter, key or skill name.
fn extract_target(error: &ErrorLogEntry) -> String {
    RE_QUOTED
        .captures(&error.message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| error.agent.clone())
}

/// Confidence arithmetic shared by all generators.
fn proposal_confidence(analysis: &AnalysisResult, strategy: FixStrategy) -> f64 {
    let mut confidence = analysis.confidence * analysis.root_cause.evidence;
    if analysis.known_fix.is_some() {
        confidence += 0.15;
    }
    match strategy.risk() {
        RiskLevel::Low => confidence += 0.1,
        RiskLevel::Medium => {}
        RiskLevel::High => confidence -= 0.2,
    }
    confidence.clamp(0.0, 1.0)
}

fn build_proposal(
    error: &ErrorLogEntry,
    analysis: &AnalysisResult,
    strategy: FixStrategy,
    alternatives: Vec<FixStrategy>,
    change: ProposedChange,
    impact: ImpactAssessment,
) -> FixProposal {
    FixProposal {
        change_id: format!("chg-{}", &Uuid::new_v4().to_string()[..8]),
        source_error_id: error.id.clone(),
        pattern_hash: analysis.pattern_hash.clone(),
        change,
        strategy,
        alternatives,
        confidence: proposal_confidence(analysis, strategy),
        risk: strategy.risk(),
        impact,
        rollback_plan: RollbackPlan::default(),
        status: ProposalStatus::Proposed,
        created_at: Utc::now(),
    }
}

fn impact_for(error: &ErrorLogEntry) -> ImpactAssessment {
    ImpactAssessment {
        affected_agents: vec![error.agent.clone()],
        affected_skills: error.skill.iter().cloned().collect(),
        ..Default::default()
    }
}

struct ParameterFixGenerator;

impl FixGenerator for ParameterFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::Parameter
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        let target = extract_target(error);
        let change_type = if error.category == ErrorCategory::TypeMismatch {
            ChangeType::TypeCheck
        } else {
            ChangeType::ValidationRule
        };
        let mut proposals = vec![build_proposal(
            error,
            analysis,
            FixStrategy::AddValidation,
            vec![FixStrategy::UpdateParameter, FixStrategy::SetDefaultValue],
            ProposedChange {
                change_type,
                target: target.clone(),
                old_value: None,
                new_value: Some(serde_json::json!({"required": true, "validated": true})),
                rationale: format!("validate '{}' before the agent runs", target),
                code_example: Some(format!(
                    "if input.get(\"{}\").is_none() {{ return Err(missing(\"{}\")); }}",
                    target, target
                )),
            },
            impact_for(error),
        )];
        if error.category == ErrorCategory::MissingParameter {
            proposals.push(build_proposal(
                error,
                analysis,
                FixStrategy::SetDefaultValue,
                vec![FixStrategy::AddValidation],
                ProposedChange {
                    change_type: ChangeType::DefaultValue,
                    target: target.clone(),
                    old_value: None,
                    new_value: Some(Value::Null),
                    rationale: format!("supply a default for '{}' when absent", target),
                    code_example: None,
                },
                impact_for(error),
            ));
        }
        proposals
    }
}

struct LogicFixGenerator;

impl FixGenerator for LogicFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::Logic
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        let target = extract_target(error);
        vec![
            build_proposal(
                error,
                analysis,
                FixStrategy::AddCondition,
                vec![FixStrategy::FixLogic, FixStrategy::RefactorFlow],
                ProposedChange {
                    change_type: ChangeType::ConditionCheck,
                    target: target.clone(),
                    old_value: None,
                    new_value: Some(serde_json::json!({"guard": true})),
                    rationale: format!("guard '{}' against the failing precondition", target),
                    code_example: None,
                },
                impact_for(error),
            ),
            build_proposal(
                error,
                analysis,
                FixStrategy::FixLogic,
                vec![FixStrategy::RefactorFlow],
                ProposedChange {
                    change_type: ChangeType::GenericFix,
                    target,
                    old_value: None,
                    new_value: None,
                    rationale: "correct the failing branch".to_string(),
                    code_example: None,
                },
                impact_for(error),
            ),
        ]
    }
}

struct SkillFixGenerator;

impl FixGenerator for SkillFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::Skill
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        let target = error
            .skill
            .clone()
            .unwrap_or_else(|| extract_target(error));
        let mut proposals = vec![build_proposal(
            error,
            analysis,
            FixStrategy::AddErrorHandling,
            vec![FixStrategy::ChangeSkill, FixStrategy::ImproveLogging],
            ProposedChange {
                change_type: ChangeType::ErrorHandling,
                target: target.clone(),
                old_value: None,
                new_value: Some(serde_json::json!({"retry_on_failure": true})),
                rationale: format!("handle failures of skill '{}' gracefully", target),
                code_example: None,
            },
            impact_for(error),
        )];
        if error.category == ErrorCategory::SkillNotFound {
            proposals.push(build_proposal(
                error,
                analysis,
                FixStrategy::ChangeSkill,
                vec![],
                ProposedChange {
                    change_type: ChangeType::GenericFix,
                    target,
                    old_value: None,
                    new_value: None,
                    rationale: "map the reference to an existing skill".to_string(),
                    code_example: None,
                },
                impact_for(error),
            ));
        }
        proposals
    }
}

struct DependencyFixGenerator;

impl FixGenerator for DependencyFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::Dependency
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        let target = extract_target(error);
        vec![build_proposal(
            error,
            analysis,
            FixStrategy::UpdateDependency,
            vec![FixStrategy::AddDependency, FixStrategy::AddErrorHandling],
            ProposedChange {
                change_type: ChangeType::GenericFix,
                target: target.clone(),
                old_value: None,
                new_value: None,
                rationale: format!("repin or repair dependency '{}'", target),
                code_example: None,
            },
            ImpactAssessment {
                affected_agents: vec![error.agent.clone()],
                dependency_issues: vec![target],
                ..Default::default()
            },
        )]
    }
}

struct ConfigFixGenerator;

impl FixGenerator for ConfigFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::Configuration
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        let target = extract_target(error);
        let strategy = if error.category == ErrorCategory::ConfigMissing {
            FixStrategy::AddConfigOption
        } else {
            FixStrategy::UpdateConfig
        };
        vec![build_proposal(
            error,
            analysis,
            strategy,
            vec![FixStrategy::SetDefaultValue],
            ProposedChange {
                change_type: ChangeType::ConfigUpdate,
                target: target.clone(),
                old_value: None,
                new_value: Some(Value::Null),
                rationale: format!("make configuration key '{}' explicit", target),
                code_example: None,
            },
            impact_for(error),
        )]
    }
}

struct SystemFixGenerator;

impl FixGenerator for SystemFixGenerator {
    fn group(&self) -> CategoryGroup {
        CategoryGroup::System
    }

    fn generate(&self, error: &ErrorLogEntry, analysis: &AnalysisResult) -> Vec<FixProposal> {
        vec![build_proposal(
            error,
            analysis,
            FixStrategy::AddErrorHandling,
            vec![FixStrategy::ImproveLogging, FixStrategy::UpdateConfig],
            ProposedChange {
                change_type: ChangeType::ErrorHandling,
                target: error.agent.clone(),
                old_value: None,
                new_value: Some(serde_json::json!({"backoff_and_retry": true})),
                rationale: "absorb transient resource failures with retries".to_string(),
                code_example: None,
            },
            impact_for(error),
        )]
    }
}

/// The generator registry, keyed by category family.
pub struct GeneratorRegistry {
    generators: HashMap<CategoryGroup, Box<dyn FixGenerator>>,
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        Self::with_builtin_generators()
    }
}

impl GeneratorRegistry {
    pub fn with_builtin_generators() -> Self {
        let mut generators: HashMap<CategoryGroup, Box<dyn FixGenerator>> = HashMap::new();
        for generator in [
            Box::new(ParameterFixGenerator) as Box<dyn FixGenerator>,
            Box::new(LogicFixGenerator),
            Box::new(SkillFixGenerator),
            Box::new(DependencyFixGenerator),
            Box::new(ConfigFixGenerator),
            Box::new(SystemFixGenerator),
        ] {
            generators.insert(generator.group(), generator);
        }
        Self { generators }
    }

    /// Replace or add a generator for a family.
    pub fn register(&mut self, generator: Box<dyn FixGenerator>) {
        self.generators.insert(generator.group(), generator);
    }

    /// Generate up to three proposals for an error, dropping any below
    /// `min_confidence`, best first.
    pub fn generate(
        &self,
        error: &ErrorLogEntry,
        analysis: &AnalysisResult,
        min_confidence: f64,
    ) -> Vec<FixProposal> {
        let Some(generator) = self.generators.get(&error.category.group()) else {
            return Vec::new();
        };
        let mut proposals: Vec<FixProposal> = generator
            .generate(error, analysis)
            .into_iter()
            .filter(|p| p.confidence >= min_confidence)
            .collect();
        proposals.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        proposals.truncate(3);
        proposals
    }
}
