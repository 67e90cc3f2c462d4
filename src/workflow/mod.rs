//! The fixed twelve-phase delivery workflow.
//!
//! Phases are indexed 0..=11 and run discovery, infrastructure,
//! deployment, application, documentation. The transition table is an
//! adjacency map keyed by `(phase, reason)`: the workflow has real
//! back-edges (2→2 on cost overrun, 2→1 on major changes, 4→4 on failed
//! validation) and a fan-out/join pair (8 → 9∥10 → 11), so it is a graph,
//! not a list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Number of phases in the workflow.
pub const PHASE_COUNT: usize = 12;

/// How a phase is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    UserDriven,
    Automated,
    Coordination,
    Finalization,
}

/// Static definition of one workflow phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDef {
    /// Phase index, 0..=11.
    pub index: usize,
    /// Human-readable name.
    pub name: String,
    /// What the phase accomplishes.
    pub purpose: String,
    /// How the phase is driven.
    pub kind: PhaseKind,
    /// Participating agent ids.
    pub agents: Vec<String>,
    /// Logical names of artifacts the phase is expected to produce.
    pub expected_artifacts: Vec<String>,
    /// Whether a human approval gates the phase exit.
    pub approval_required: bool,
    /// Named auto-validation gates that must pass before advancing.
    pub validation_gates: Vec<String>,
    /// Parallel-group id shared by phases that run concurrently.
    pub parallel_group: Option<String>,
}

/// Closed set of reasons a transition can be taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    Approved,
    Rejected,
    Revised,
    ValidationPassed,
    ValidationFailed,
    DeploymentSucceeded,
    DeploymentRejected,
    DeploymentFailed,
    CostTooHigh,
    MajorChanges,
    Passed,
    Complete,
    Escalate,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionReason::Approved => "approved",
            TransitionReason::Rejected => "rejected",
            TransitionReason::Revised => "revised",
            TransitionReason::ValidationPassed => "validation_passed",
            TransitionReason::ValidationFailed => "validation_failed",
            TransitionReason::DeploymentSucceeded => "deployment_succeeded",
            TransitionReason::DeploymentRejected => "deployment_rejected",
            TransitionReason::DeploymentFailed => "deployment_failed",
            TransitionReason::CostTooHigh => "cost_too_high",
            TransitionReason::MajorChanges => "major_changes",
            TransitionReason::Passed => "passed",
            TransitionReason::Complete => "complete",
            TransitionReason::Escalate => "escalate",
        }
    }
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransitionReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" | "approve" => Ok(TransitionReason::Approved),
            "rejected" | "reject" => Ok(TransitionReason::Rejected),
            "revised" | "revise" => Ok(TransitionReason::Revised),
            "validation_passed" => Ok(TransitionReason::ValidationPassed),
            "validation_failed" => Ok(TransitionReason::ValidationFailed),
            "deployment_succeeded" => Ok(TransitionReason::DeploymentSucceeded),
            "deployment_rejected" => Ok(TransitionReason::DeploymentRejected),
            "deployment_failed" => Ok(TransitionReason::DeploymentFailed),
            "cost_too_high" => Ok(TransitionReason::CostTooHigh),
            "major_changes" => Ok(TransitionReason::MajorChanges),
            "passed" => Ok(TransitionReason::Passed),
            "complete" => Ok(TransitionReason::Complete),
            "escalate" => Ok(TransitionReason::Escalate),
            _ => anyhow::bail!("Invalid transition reason '{}'", s),
        }
    }
}

/// Where a transition lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionTarget {
    /// Enter the given phase (possibly the same one, for re-runs).
    Phase { index: usize },
    /// Fan out to two phases that run in parallel.
    FanOut { first: usize, second: usize },
    /// Unwind deployed resources and fail the execution.
    Rollback,
    /// Halt pending human action with a CRITICAL escalation.
    Escalation,
    /// The workflow is complete.
    End,
}

/// The static workflow: phase definitions plus the transition map.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    phases: Vec<PhaseDef>,
    transitions: HashMap<(usize, TransitionReason), TransitionTarget>,
}

impl WorkflowDefinition {
    /// The standard twelve-phase delivery workflow.
    pub fn standard() -> Self {
        let phases = standard_phases();
        let mut t = HashMap::new();
        t.insert((0, TransitionReason::Approved), TransitionTarget::Phase { index: 1 });
        t.insert((1, TransitionReason::Approved), TransitionTarget::Phase { index: 2 });
        t.insert((2, TransitionReason::Approved), TransitionTarget::Phase { index: 3 });
        t.insert((2, TransitionReason::CostTooHigh), TransitionTarget::Phase { index: 2 });
        t.insert((2, TransitionReason::MajorChanges), TransitionTarget::Phase { index: 1 });
        t.insert((3, TransitionReason::Approved), TransitionTarget::Phase { index: 4 });
        t.insert((4, TransitionReason::ValidationPassed), TransitionTarget::Phase { index: 5 });
        t.insert((4, TransitionReason::ValidationFailed), TransitionTarget::Phase { index: 4 });
        t.insert((5, TransitionReason::DeploymentSucceeded), TransitionTarget::Phase { index: 6 });
        t.insert((5, TransitionReason::DeploymentRejected), TransitionTarget::Rollback);
        t.insert((5, TransitionReason::DeploymentFailed), TransitionTarget::Escalation);
        t.insert((6, TransitionReason::Passed), TransitionTarget::Phase { index: 7 });
        t.insert((7, TransitionReason::Complete), TransitionTarget::Phase { index: 8 });
        t.insert((8, TransitionReason::Complete), TransitionTarget::FanOut { first: 9, second: 10 });
        t.insert((11, TransitionReason::Complete), TransitionTarget::End);

        Self {
            phases,
            transitions: t,
        }
    }

    /// All phase definitions, ordered by index.
    pub fn phases(&self) -> &[PhaseDef] {
        &self.phases
    }

    /// Definition of one phase.
    pub fn phase(&self, index: usize) -> Option<&PhaseDef> {
        self.phases.get(index)
    }

    /// Resolve a transition. `None` means the edge does not exist.
    pub fn next(&self, phase: usize, reason: TransitionReason) -> Option<TransitionTarget> {
        self.transitions.get(&(phase, reason)).copied()
    }

    /// Whether the phase requires human approval to exit.
    pub fn approval_required(&self, index: usize) -> bool {
        self.phase(index).map(|p| p.approval_required).unwrap_or(false)
    }

    /// Named auto-validation gates declared for a phase.
    pub fn validation_gates(&self, index: usize) -> &[String] {
        self.phase(index)
            .map(|p| p.validation_gates.as_slice())
            .unwrap_or(&[])
    }

    /// The other member of a phase's parallel group, if any.
    pub fn parallel_sibling(&self, index: usize) -> Option<usize> {
        let group = self.phase(index)?.parallel_group.as_deref()?;
        self.phases
            .iter()
            .find(|p| p.index != index && p.parallel_group.as_deref() == Some(group))
            .map(|p| p.index)
    }

    /// The phase entered once an entire parallel group completes.
    pub fn join_target(&self, index: usize) -> Option<usize> {
        // The only parallel group in the standard workflow joins into 11.
        self.phase(index)?.parallel_group.as_ref()?;
        Some(11)
    }
}

fn phase_def(
    index: usize,
    name: &str,
    purpose: &str,
    kind: PhaseKind,
    agents: &[&str],
    artifacts: &[&str],
    approval_required: bool,
    gates: &[&str],
    parallel_group: Option<&str>,
) -> PhaseDef {
    PhaseDef {
        index,
        name: name.to_string(),
        purpose: purpose.to_string(),
        kind,
        agents: agents.iter().map(|s| s.to_string()).collect(),
        expected_artifacts: artifacts.iter().map(|s| s.to_string()).collect(),
        approval_required,
        validation_gates: gates.iter().map(|s| s.to_string()).collect(),
        parallel_group: parallel_group.map(String::from),
    }
}

fn standard_phases() -> Vec<PhaseDef> {
    vec![
        phase_def(
            0,
            "Requirements Discovery",
            "Capture project goals, constraints and acceptance criteria",
            PhaseKind::UserDriven,
            &["req-discover"],
            &["requirements-brief"],
            true,
            &[],
            None,
        ),
        phase_def(
            1,
            "Architecture Design",
            "Produce the target architecture and component breakdown",
            PhaseKind::Coordination,
            &["arch-design"],
            &["architecture-doc"],
            true,
            &[],
            None,
        ),
        phase_def(
            2,
            "Cost Optimization",
            "Estimate and optimise the projected run cost",
            PhaseKind::Automated,
            &["cost-optimize", "arch-design"],
            &["cost-report"],
            true,
            &[],
            None,
        ),
        phase_def(
            3,
            "Security Review",
            "Review the design against the security baseline",
            PhaseKind::Coordination,
            &["sec-review"],
            &["security-assessment"],
            true,
            &[],
            None,
        ),
        phase_def(
            4,
            "Infrastructure Generation",
            "Generate infrastructure templates and validate them",
            PhaseKind::Automated,
            &["infra-generate", "sec-review"],
            &["infra-templates"],
            true,
            &[
                "template-lint",
                "policy-check",
                "cost-estimate",
                "drift-check",
                "security-scan",
            ],
            None,
        ),
        phase_def(
            5,
            "Deployment Execution",
            "Apply the generated infrastructure to the target environment",
            PhaseKind::Automated,
            &["deploy-execute"],
            &["deployment-manifest"],
            true,
            &[],
            None,
        ),
        phase_def(
            6,
            "Deployment Verification",
            "Verify the deployed environment is healthy",
            PhaseKind::Automated,
            &["deploy-verify"],
            &["verification-report"],
            false,
            &[],
            None,
        ),
        phase_def(
            7,
            "Application Scaffolding",
            "Scaffold the application skeleton against the environment",
            PhaseKind::Automated,
            &["app-scaffold"],
            &["app-skeleton"],
            false,
            &[],
            None,
        ),
        phase_def(
            8,
            "Application Implementation",
            "Implement application features over the scaffold",
            PhaseKind::Automated,
            &["app-implement"],
            &["app-source"],
            false,
            &[],
            None,
        ),
        phase_def(
            9,
            "Integration Testing",
            "Run end-to-end integration suites against the deployment",
            PhaseKind::Automated,
            &["integration-test"],
            &["integration-results"],
            false,
            &[],
            Some("post-implementation"),
        ),
        phase_def(
            10,
            "Quality Assurance",
            "Static review and quality gates over the implementation",
            PhaseKind::Automated,
            &["qa-review"],
            &["qa-report"],
            false,
            &[],
            Some("post-implementation"),
        ),
        phase_def(
            11,
            "Documentation & Handoff",
            "Produce operator documentation and hand the system over",
            PhaseKind::Finalization,
            &["doc-writer"],
            &["handbook"],
            true,
            &[],
            None,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_workflow_has_twelve_phases() {
        let wf = WorkflowDefinition::standard();
        assert_eq!(wf.phases().len(), PHASE_COUNT);
        for (i, phase) in wf.phases().iter().enumerate() {
            assert_eq!(phase.index, i);
        }
    }

    #[test]
    fn approval_phases_match_the_declared_set() {
        let wf = WorkflowDefinition::standard();
        let approving: Vec<usize> = (0..PHASE_COUNT)
            .filter(|&i| wf.approval_required(i))
            .collect();
        assert_eq!(approving, vec![0, 1, 2, 3, 4, 5, 11]);
    }

    #[test]
    fn phase_four_declares_five_validation_gates() {
        let wf = WorkflowDefinition::standard();
        assert_eq!(wf.validation_gates(4).len(), 5);
        assert!(wf.validation_gates(5).is_empty());
    }

    #[test]
    fn transition_table_matches_the_declared_edges() {
        let wf = WorkflowDefinition::standard();
        assert_eq!(
            wf.next(0, TransitionReason::Approved),
            Some(TransitionTarget::Phase { index: 1 })
        );
        assert_eq!(
            wf.next(2, TransitionReason::CostTooHigh),
            Some(TransitionTarget::Phase { index: 2 })
        );
        assert_eq!(
            wf.next(2, TransitionReason::MajorChanges),
            Some(TransitionTarget::Phase { index: 1 })
        );
        assert_eq!(
            wf.next(4, TransitionReason::ValidationFailed),
            Some(TransitionTarget::Phase { index: 4 })
        );
        assert_eq!(
            wf.next(5, TransitionReason::DeploymentRejected),
            Some(TransitionTarget::Rollback)
        );
        assert_eq!(
            wf.next(5, TransitionReason::DeploymentFailed),
            Some(TransitionTarget::Escalation)
        );
        assert_eq!(
            wf.next(8, TransitionReason::Complete),
            Some(TransitionTarget::FanOut { first: 9, second: 10 })
        );
        assert_eq!(
            wf.next(11, TransitionReason::Complete),
            Some(TransitionTarget::End)
        );
    }

    #[test]
    fn undeclared_edges_do_not_exist() {
        let wf = WorkflowDefinition::standard();
        assert_eq!(wf.next(0, TransitionReason::Complete), None);
        assert_eq!(wf.next(6, TransitionReason::Approved), None);
        assert_eq!(wf.next(9, TransitionReason::Complete), None);
    }

    #[test]
    fn parallel_group_links_nine_and_ten_into_eleven() {
        let wf = WorkflowDefinition::standard();
        assert_eq!(wf.parallel_sibling(9), Some(10));
        assert_eq!(wf.parallel_sibling(10), Some(9));
        assert_eq!(wf.parallel_sibling(8), None);
        assert_eq!(wf.join_target(9), Some(11));
        assert_eq!(wf.join_target(10), Some(11));
        assert_eq!(wf.join_target(7), None);
    }

    #[test]
    fn reason_round_trips_through_from_str() {
        for reason in [
            TransitionReason::Approved,
            TransitionReason::ValidationFailed,
            TransitionReason::DeploymentRejected,
            TransitionReason::CostTooHigh,
            TransitionReason::Escalate,
        ] {
            let parsed: TransitionReason = reason.as_str().parse().unwrap();
            assert_eq!(parsed, reason);
        }
        assert!("nonsense".parse::<TransitionReason>().is_err());
    }
}
