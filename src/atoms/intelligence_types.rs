// ── Canopy Atoms: Content Intelligence Types ───────────────────────────────
//
// Structured results produced by the LLM-backed content analyzer and
// conflict resolver, plus the pending-change record handed to the external
// review queue. Pure data; the prompting and parsing live in
// engine/intelligence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Content analysis
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    Procedural,
    Factual,
    Relational,
    Temporal,
    Social,
    #[default]
    Contextual,
    Policy,
    Meta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeTypeResult {
    pub knowledge_type: KnowledgeType,
    pub confidence: f32,
    pub reasoning: String,
}

impl Default for KnowledgeTypeResult {
    fn default() -> Self {
        Self {
            knowledge_type: KnowledgeType::Contextual,
            confidence: 0.3,
            reasoning: "defaulted after analysis failure".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    /// Lowercased, kebab-cased dedup key.
    pub canonical_name: String,
    pub entity_type: crate::atoms::graph_types::EntityType,
    pub confidence: f32,
    /// The span of text the entity was seen in.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    /// Canonical name of the source entity.
    pub source: String,
    /// Canonical name of the target entity.
    pub target: String,
    pub relationship_type: crate::atoms::graph_types::RelationshipType,
    pub confidence: f32,
    /// Snippet supporting the relationship.
    #[serde(default)]
    pub evidence: String,
}

/// Multi-factor importance scores, each in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceAssessment {
    pub authority: f32,
    pub criticality: f32,
    pub uniqueness: f32,
    pub actionability: f32,
    pub freshness: f32,
    pub overall_importance: f32,
}

impl Default for ImportanceAssessment {
    fn default() -> Self {
        Self {
            authority: 0.3,
            criticality: 0.3,
            uniqueness: 0.3,
            actionability: 0.3,
            freshness: 0.5,
            overall_importance: 0.3,
        }
    }
}

/// Full structured analysis of one content chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentAnalysisResult {
    pub chunk_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub knowledge_type: KnowledgeTypeResult,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
    pub importance: ImportanceAssessment,
    /// Short abstract, roughly ≤150 chars.
    pub summary: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Conflict resolution
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRelationship {
    Duplicate,
    Supersedes,
    Contradicts,
    Complements,
    Unrelated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRecommendation {
    Skip,
    Replace,
    Merge,
    AddAsNew,
    FlagReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceAdjustment {
    /// Multiplier applied to the existing node's importance.
    pub existing_multiplier: f32,
    /// Importance assigned to the new content.
    pub new_importance: f32,
}

impl Default for ImportanceAdjustment {
    fn default() -> Self {
        Self { existing_multiplier: 1.0, new_importance: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictResolutionResult {
    pub relationship: ConflictRelationship,
    pub recommendation: ConflictRecommendation,
    pub confidence: f32,
    #[serde(default)]
    pub importance_adjustment: ImportanceAdjustment,
    pub reasoning: String,
    /// Set when `recommendation == Merge`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_content: Option<String>,
}

/// An existing similar node offered to the resolver for comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExistingMatch {
    pub node_id: u64,
    pub content: String,
    pub source: String,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub similarity_score: f32,
}

/// What the resolver ended up doing with a piece of new content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_change_id: Option<String>,
    pub conflicts_resolved: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Pending changes (human review queue)
// ═══════════════════════════════════════════════════════════════════════════

/// One piece of supporting evidence attached to a pending change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvidence {
    pub kind: String,
    pub value: serde_json::Value,
    pub description: String,
}

/// A proposed knowledge edit awaiting human review. Owned by the external
/// review service after emission; the engine only produces it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingKnowledgeChange {
    /// Stable id; survives retries and the local fallback store.
    pub id: String,
    pub change_type: String,
    pub status: String,
    pub title: String,
    pub description: String,
    pub new_content: String,
    pub existing_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_node_id: Option<u64>,
    pub conflict_relationship: ConflictRelationship,
    pub reasoning: String,
    pub confidence: f32,
    #[serde(default)]
    pub evidence: Vec<ChangeEvidence>,
    pub source: String,
    pub proposed_by: String,
    pub proposed_at: chrono::DateTime<chrono::Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knowledge_type_round_trips_snake_case() {
        let json = serde_json::to_string(&KnowledgeType::Procedural).unwrap();
        assert_eq!(json, "\"procedural\"");
        let back: KnowledgeType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KnowledgeType::Procedural);
    }

    #[test]
    fn conflict_result_parses_from_llm_shape() {
        let raw = r#"{
            "relationship": "supersedes",
            "recommendation": "replace",
            "confidence": 0.91,
            "importance_adjustment": {"existing_multiplier": 0.8, "new_importance": 0.9},
            "reasoning": "version bump"
        }"#;
        let parsed: ConflictResolutionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.recommendation, ConflictRecommendation::Replace);
        assert!(parsed.merged_content.is_none());
    }
}
