//! Artifact entity: a named, hashed output produced by an agent.
//!
//! Artifacts are immutable once registered; a new version supersedes an
//! old one rather than mutating it. The kind is inferred from the logical
//! name when the producer does not declare one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Inferred artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Infrastructure,
    SourceCode,
    Config,
    Documentation,
    #[default]
    Other,
}

impl ArtifactKind {
    /// Infer a kind from a logical artifact name.
    pub fn infer(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("infra")
            || lower.contains("template")
            || lower.contains("deploy")
            || lower.ends_with(".bicep")
            || lower.ends_with(".tf")
        {
            return ArtifactKind::Infrastructure;
        }
        if lower.contains("source")
            || lower.contains("app")
            || lower.contains("code")
            || lower.ends_with(".rs")
            || lower.ends_with(".ts")
            || lower.ends_with(".py")
        {
            return ArtifactKind::SourceCode;
        }
        if lower.contains("config")
            || lower.contains("settings")
            || lower.ends_with(".toml")
            || lower.ends_with(".yaml")
            || lower.ends_with(".json")
        {
            return ArtifactKind::Config;
        }
        if lower.contains("doc")
            || lower.contains("handbook")
            || lower.contains("report")
            || lower.contains("brief")
            || lower.ends_with(".md")
        {
            return ArtifactKind::Documentation;
        }
        ArtifactKind::Other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Infrastructure => "infrastructure",
            ArtifactKind::SourceCode => "source-code",
            ArtifactKind::Config => "config",
            ArtifactKind::Documentation => "documentation",
            ArtifactKind::Other => "other",
        }
    }
}

/// Metadata sidecar persisted next to the artifact content blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactMeta {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub phase: usize,
    pub agent: String,
    pub name: String,
    pub kind: ArtifactKind,
    /// Hex-encoded SHA-256 of the content.
    pub content_hash: String,
    pub size: usize,
    pub version: u32,
    pub created_at: DateTime<Utc>,
}

/// A fully materialised artifact: metadata plus content.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub meta: ArtifactMeta,
    pub content: Vec<u8>,
}

impl Artifact {
    /// Build an artifact from a draft, hashing the content. `version`
    /// starts at 1 and increments when a same-named artifact supersedes
    /// an earlier one.
    pub fn new(
        execution_id: Uuid,
        phase: usize,
        agent: &str,
        name: &str,
        content: Vec<u8>,
        version: u32,
    ) -> Self {
        let content_hash = hash_content(&content);
        Self {
            meta: ArtifactMeta {
                id: Uuid::new_v4(),
                execution_id,
                phase,
                agent: agent.to_string(),
                name: name.to_string(),
                kind: ArtifactKind::infer(name),
                content_hash,
                size: content.len(),
                version,
                created_at: Utc::now(),
            },
            content,
        }
    }

    /// Recompute the content hash and compare against the stored one.
    pub fn verify(&self) -> bool {
        hash_content(&self.content) == self.meta.content_hash
    }
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
