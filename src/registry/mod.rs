//! Agent registry and discovery.
//!
//! Maps each workflow phase to the ordered set of agents capable of
//! serving it, and each agent id to its declared role, tier, neighbours
//! and schema identifiers. The registry is immutable while an execution
//! runs; reloads are versioned and the phase controller only applies them
//! between executions.
//!
//! Agents themselves are opaque callables behind the [`Agent`] trait: the
//! core hands them an input envelope and takes back an output envelope
//! plus artifact drafts, never interpreting the payload.

use crate::errors::RegistryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// The role an agent declares. Discovery by capability filters on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentRole {
    RequirementsAnalyst,
    SolutionArchitect,
    CostOptimizer,
    SecurityAuditor,
    InfrastructureEngineer,
    DeploymentManager,
    VerificationEngineer,
    ApplicationScaffolder,
    ApplicationDeveloper,
    IntegrationTester,
    QaReviewer,
    TechnicalWriter,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::RequirementsAnalyst => "requirements-analyst",
            AgentRole::SolutionArchitect => "solution-architect",
            AgentRole::CostOptimizer => "cost-optimizer",
            AgentRole::SecurityAuditor => "security-auditor",
            AgentRole::InfrastructureEngineer => "infrastructure-engineer",
            AgentRole::DeploymentManager => "deployment-manager",
            AgentRole::VerificationEngineer => "verification-engineer",
            AgentRole::ApplicationScaffolder => "application-scaffolder",
            AgentRole::ApplicationDeveloper => "application-developer",
            AgentRole::IntegrationTester => "integration-tester",
            AgentRole::QaReviewer => "qa-reviewer",
            AgentRole::TechnicalWriter => "technical-writer",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static description of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSpec {
    /// Stable agent id, e.g. `"arch-design"`.
    pub id: String,
    /// Declared role.
    pub role: AgentRole,
    /// Tier (1 = core, 2 = specialist, 3 = support).
    pub tier: u8,
    /// Agent ids expected to run before this one.
    #[serde(default)]
    pub predecessors: Vec<String>,
    /// Agent ids expected to run after this one.
    #[serde(default)]
    pub successors: Vec<String>,
    /// Identifier of the input envelope schema.
    pub input_schema: String,
    /// Identifier of the output envelope schema.
    pub output_schema: String,
}

/// Input handed to an agent for one phase of one execution. The payload
/// is opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEnvelope {
    pub execution_id: Uuid,
    pub phase: usize,
    pub message_id: Uuid,
    pub message_type: String,
    pub payload: Value,
}

/// A named output an agent wants registered as an artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactDraft {
    pub name: String,
    pub content: Vec<u8>,
}

/// What an agent returns from one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentOutput {
    /// Opaque output envelope.
    pub output: Value,
    /// Artifacts to register for the execution's current phase.
    #[serde(default)]
    pub artifacts: Vec<ArtifactDraft>,
}

/// The opaque agent callable. Implementations live outside the core.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, envelope: AgentEnvelope) -> anyhow::Result<AgentOutput>;
}

/// A versioned snapshot of all agent specs and the phase assignment map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCatalog {
    /// Monotonic version, bumped on every reload.
    pub version: u32,
    /// Agent id → spec.
    pub specs: HashMap<String, AgentSpec>,
    /// Phase index → agent ids, ordered by declared role priority.
    pub phase_agents: BTreeMap<usize, Vec<String>>,
}

impl AgentCatalog {
    /// Build a catalog from specs and phase assignments, preserving the
    /// declared per-phase order.
    pub fn new(version: u32, specs: Vec<AgentSpec>, phase_agents: BTreeMap<usize, Vec<String>>) -> Self {
        Self {
            version,
            specs: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
            phase_agents,
        }
    }
}

/// The registry: catalog plus the live handler table.
pub struct AgentRegistry {
    catalog: AgentCatalog,
    handlers: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new(catalog: AgentCatalog) -> Self {
        Self {
            catalog,
            handlers: HashMap::new(),
        }
    }

    /// Registry with the default twelve-phase delivery roster.
    pub fn with_default_catalog() -> Self {
        Self::new(default_catalog())
    }

    /// Current catalog version.
    pub fn version(&self) -> u32 {
        self.catalog.version
    }

    /// Attach the callable for an agent id. The id must exist in the
    /// catalog.
    pub fn register_handler(
        &mut self,
        agent_id: &str,
        handler: Arc<dyn Agent>,
    ) -> Result<(), RegistryError> {
        if !self.catalog.specs.contains_key(agent_id) {
            return Err(RegistryError::UnknownAgent(agent_id.to_string()));
        }
        self.handlers.insert(agent_id.to_string(), handler);
        Ok(())
    }

    /// Look up the callable for an agent id.
    pub fn handler(&self, agent_id: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.handlers
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
    }

    /// Spec for an agent id.
    pub fn spec(&self, agent_id: &str) -> Result<&AgentSpec, RegistryError> {
        self.catalog
            .specs
            .get(agent_id)
            .ok_or_else(|| RegistryError::UnknownAgent(agent_id.to_string()))
    }

    /// Agents assigned to a phase, in declared role-priority order.
    pub fn agents_for_phase(&self, phase: usize) -> Result<Vec<String>, RegistryError> {
        self.catalog
            .phase_agents
            .get(&phase)
            .cloned()
            .ok_or(RegistryError::UnknownPhase(phase))
    }

    /// Agents for a phase filtered by required role.
    pub fn agents_by_capability(
        &self,
        phase: usize,
        capability: AgentRole,
    ) -> Result<Vec<String>, RegistryError> {
        let ids = self.agents_for_phase(phase)?;
        Ok(ids
            .into_iter()
            .filter(|id| {
                self.catalog
                    .specs
                    .get(id)
                    .map(|s| s.role == capability)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// All agents of a given tier, ordered by id for determinism.
    pub fn agents_by_tier(&self, tier: u8) -> Vec<String> {
        let mut ids: Vec<String> = self
            .catalog
            .specs
            .values()
            .filter(|s| s.tier == tier)
            .map(|s| s.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Replace the catalog with a new version. The caller (phase
    /// controller) guarantees no execution is active. A reload that does
    /// not advance the version is rejected.
    pub fn reload(&mut self, catalog: AgentCatalog) -> Result<(), RegistryError> {
        if catalog.version <= self.catalog.version {
            return Err(RegistryError::ReloadRejected(format!(
                "version {} does not advance current version {}",
                catalog.version, self.catalog.version
            )));
        }
        // Drop handlers for agents that no longer exist.
        self.handlers
            .retain(|id, _| catalog.specs.contains_key(id));
        self.catalog = catalog;
        Ok(())
    }
}

fn spec(id: &str, role: AgentRole, tier: u8) -> AgentSpec {
    AgentSpec {
        id: id.to_string(),
        role,
        tier,
        predecessors: Vec::new(),
        successors: Vec::new(),
        input_schema: format!("{}.input.v1", id),
        output_schema: format!("{}.output.v1", id),
    }
}

/// The default roster: one lead agent per phase plus the specialists that
/// join it. Per-phase order is role priority.
pub fn default_catalog() -> AgentCatalog {
    let specs = vec![
        spec("req-discover", AgentRole::RequirementsAnalyst, 1),
        spec("arch-design", AgentRole::SolutionArchitect, 1),
        spec("cost-optimize", AgentRole::CostOptimizer, 2),
        spec("sec-review", AgentRole::SecurityAuditor, 2),
        spec("infra-generate", AgentRole::InfrastructureEngineer, 1),
        spec("deploy-execute", AgentRole::DeploymentManager, 1),
        spec("deploy-verify", AgentRole::VerificationEngineer, 2),
        spec("app-scaffold", AgentRole::ApplicationScaffolder, 1),
        spec("app-implement", AgentRole::ApplicationDeveloper, 1),
        spec("integration-test", AgentRole::IntegrationTester, 2),
        spec("qa-review", AgentRole::QaReviewer, 2),
        spec("doc-writer", AgentRole::TechnicalWriter, 3),
    ];

    let mut phase_agents = BTreeMap::new();
    phase_agents.insert(0, vec!["req-discover".to_string()]);
    phase_agents.insert(1, vec!["arch-design".to_string()]);
    phase_agents.insert(2, vec!["cost-optimize".to_string(), "arch-design".to_string()]);
    phase_agents.insert(3, vec!["sec-review".to_string()]);
    phase_agents.insert(4, vec!["infra-generate".to_string(), "sec-review".to_string()]);
    phase_agents.insert(5, vec!["deploy-execute".to_string()]);
    phase_agents.insert(6, vec!["deploy-verify".to_string()]);
    phase_agents.insert(7, vec!["app-scaffold".to_string()]);
    phase_agents.insert(8, vec!["app-implement".to_string()]);
    phase_agents.insert(9, vec!["integration-test".to_string()]);
    phase_agents.insert(10, vec!["qa-review".to_string()]);
    phase_agents.insert(11, vec!["doc-writer".to_string()]);

    AgentCatalog::new(1, specs, phase_agents)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAgent;

    #[async_trait]
    impl Agent for NoopAgent {
        async fn invoke(&self, _envelope: AgentEnvelope) -> anyhow::Result<AgentOutput> {
            Ok(AgentOutput::default())
        }
    }

    #[test]
    fn default_catalog_covers_all_twelve_phases() {
        let registry = AgentRegistry::with_default_catalog();
        for phase in 0..=11 {
            let agents = registry.agents_for_phase(phase).unwrap();
            assert!(!agents.is_empty(), "phase {} has no agents", phase);
        }
    }

    #[test]
    fn unknown_phase_is_an_error() {
        let registry = AgentRegistry::with_default_catalog();
        assert!(matches!(
            registry.agents_for_phase(12),
            Err(RegistryError::UnknownPhase(12))
        ));
    }

    #[test]
    fn agents_for_phase_preserves_declared_order() {
        let registry = AgentRegistry::with_default_catalog();
        let agents = registry.agents_for_phase(2).unwrap();
        assert_eq!(agents, vec!["cost-optimize", "arch-design"]);
    }

    #[test]
    fn capability_filter_narrows_by_role() {
        let registry = AgentRegistry::with_default_catalog();
        let auditors = registry
            .agents_by_capability(4, AgentRole::SecurityAuditor)
            .unwrap();
        assert_eq!(auditors, vec!["sec-review"]);

        let none = registry
            .agents_by_capability(4, AgentRole::TechnicalWriter)
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn tier_lookup_is_sorted() {
        let registry = AgentRegistry::with_default_catalog();
        let tier2 = registry.agents_by_tier(2);
        assert_eq!(
            tier2,
            vec!["cost-optimize", "deploy-verify", "integration-test", "qa-review", "sec-review"]
        );
    }

    #[test]
    fn handler_registration_requires_known_agent() {
        let mut registry = AgentRegistry::with_default_catalog();
        assert!(registry
            .register_handler("no-such-agent", Arc::new(NoopAgent))
            .is_err());
        registry
            .register_handler("arch-design", Arc::new(NoopAgent))
            .unwrap();
        assert!(registry.handler("arch-design").is_ok());
    }

    #[test]
    fn reload_must_advance_version() {
        let mut registry = AgentRegistry::with_default_catalog();
        let stale = default_catalog(); // version 1 == current
        assert!(matches!(
            registry.reload(stale),
            Err(RegistryError::ReloadRejected(_))
        ));

        let mut next = default_catalog();
        next.version = 2;
        registry.reload(next).unwrap();
        assert_eq!(registry.version(), 2);
    }

    #[test]
    fn reload_drops_handlers_for_removed_agents() {
        let mut registry = AgentRegistry::with_default_catalog();
        registry
            .register_handler("doc-writer", Arc::new(NoopAgent))
            .unwrap();

        let mut next = default_catalog();
        next.version = 2;
        next.specs.remove("doc-writer");
        registry.reload(next).unwrap();

        assert!(registry.handler("doc-writer").is_err());
    }
}
