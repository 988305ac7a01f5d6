// ── Canopy Atoms: Knowledge Graph Types ────────────────────────────────────
//
// Entities are the nouns of operational knowledge (services, people, teams,
// runbooks, incidents); relationships are the verbs (DEPENDS_ON, OWNS,
// DOCUMENTED_BY). Entities cross-reference tree nodes via `node_ids`, which
// is what makes hybrid graph+tree retrieval possible.
//
// Pure data types; the indexed store lives in engine/graph.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Entities
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Service,
    Person,
    Team,
    Runbook,
    Incident,
    Document,
    Technology,
    AlertRule,
    Metric,
    Environment,
    Namespace,
    Custom,
}

/// An entity in the knowledge graph.
///
/// Identity is `(entity_id, entity_type)`. Type-specific attributes
/// (service tier, runbook symptoms, incident status…) live in `properties`
/// rather than in per-type structs — the graph treats them uniformly and
/// callers read the keys they know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tree-node cross-references.
    #[serde(default)]
    pub node_ids: Vec<u64>,
    /// Which trees contain this entity's nodes.
    #[serde(default)]
    pub tree_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Alternate names for case-insensitive lookup.
    #[serde(default)]
    pub aliases: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Entity {
    pub fn new(entity_type: EntityType, name: impl Into<String>) -> Self {
        let ts = chrono::Utc::now();
        Self {
            entity_id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            name: name.into(),
            display_name: None,
            description: None,
            node_ids: Vec::new(),
            tree_ids: Vec::new(),
            tags: Vec::new(),
            properties: BTreeMap::new(),
            aliases: Vec::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    /// Link this entity to a tree node.
    pub fn add_node_reference(&mut self, node_id: u64, tree_id: &str) {
        if !self.node_ids.contains(&node_id) {
            self.node_ids.push(node_id);
        }
        if !self.tree_ids.iter().any(|t| t == tree_id) {
            self.tree_ids.push(tree_id.to_string());
        }
        self.updated_at = chrono::Utc::now();
    }

    pub fn add_alias(&mut self, alias: &str) {
        if !alias.is_empty()
            && !self
                .aliases
                .iter()
                .any(|a| a.eq_ignore_ascii_case(alias))
        {
            self.aliases.push(alias.to_string());
        }
    }

    /// True when `query` appears in the name, display name, or an alias
    /// (case-insensitive substring).
    pub fn matches_name(&self, query: &str) -> bool {
        let q = query.to_lowercase();
        if self.name.to_lowercase().contains(&q) {
            return true;
        }
        if let Some(dn) = &self.display_name {
            if dn.to_lowercase().contains(&q) {
                return true;
            }
        }
        self.aliases.iter().any(|a| a.to_lowercase().contains(&q))
    }

    /// String property helper for typed reads out of `properties`.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Relationships
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    // Service topology
    DependsOn,
    Calls,
    SharesDataWith,
    // Ownership
    Owns,
    Maintains,
    Authored,
    // Expertise
    ExpertIn,
    OnCallFor,
    // Team structure
    MemberOf,
    Leads,
    EscalatesTo,
    // Documentation
    Documents,
    References,
    Supersedes,
    Contradicts,
    // Operations
    ResolvesIssuesFor,
    UsedIn,
    Triggers,
    AlertsFor,
    // Incidents
    Affected,
    CausedBy,
    SimilarTo,
    // Technology
    Uses,
    HostedOn,
    DeployedIn,
    // Generic
    RelatedTo,
}

/// A directed relationship: source → target.
///
/// Duplicate `(source, target, type)` tuples are disallowed at the store
/// level; re-adding updates the existing edge in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: String,
    pub relationship_type: RelationshipType,
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
    /// Confidence in [0, 1].
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_system: Option<String>,
    /// True when the edge was inferred rather than observed.
    #[serde(default)]
    pub inferred: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<chrono::DateTime<chrono::Utc>>,
}

impl Relationship {
    pub fn create(
        relationship_type: RelationshipType,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
    ) -> Self {
        let ts = chrono::Utc::now();
        Self {
            relationship_id: uuid::Uuid::new_v4().to_string(),
            relationship_type,
            source_id: source_id.into(),
            target_id: target_id.into(),
            properties: BTreeMap::new(),
            confidence: 1.0,
            source_system: None,
            inferred: false,
            created_at: ts,
            updated_at: ts,
            valid_from: None,
            valid_until: None,
        }
    }

    /// A relationship is active iff now falls inside its validity window.
    pub fn is_active(&self) -> bool {
        let now = chrono::Utc::now();
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now > until {
                return false;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Traversal results
// ═══════════════════════════════════════════════════════════════════════════

/// One entity reached by a traversal, with its hop distance and the
/// relationship path that led there.
#[derive(Debug, Clone)]
pub struct TraversalHit {
    pub entity: Entity,
    pub distance: usize,
    pub path: Vec<Relationship>,
}

/// A simple path through the graph between two entities.
#[derive(Debug, Clone)]
pub struct GraphPath {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl GraphPath {
    pub fn hops(&self) -> usize {
        self.relationships.len()
    }

    /// Tree-node ids referenced anywhere along this path.
    pub fn node_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entities
            .iter()
            .flat_map(|e| e.node_ids.iter().copied())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// Traversal direction relative to the start entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// A subgraph: entities plus the relationships internal to them.
#[derive(Debug, Clone)]
pub struct Neighborhood {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_alias_dedup_is_case_insensitive() {
        let mut e = Entity::new(EntityType::Service, "payments");
        e.add_alias("Payment-Service");
        e.add_alias("payment-service");
        assert_eq!(e.aliases.len(), 1);
    }

    #[test]
    fn entity_matches_name_and_alias() {
        let mut e = Entity::new(EntityType::Service, "payments");
        e.add_alias("payment-service");
        assert!(e.matches_name("PAYMENTS"));
        assert!(e.matches_name("payment-service"));
        assert!(!e.matches_name("billing"));
    }

    #[test]
    fn relationship_active_window() {
        let mut r = Relationship::create(RelationshipType::DependsOn, "a", "b");
        assert!(r.is_active());
        r.valid_until = Some(chrono::Utc::now() - chrono::Duration::days(1));
        assert!(!r.is_active());
        r.valid_until = None;
        r.valid_from = Some(chrono::Utc::now() + chrono::Duration::days(1));
        assert!(!r.is_active());
    }

    #[test]
    fn graph_path_collects_node_ids() {
        let mut a = Entity::new(EntityType::Service, "a");
        a.node_ids = vec![3, 1];
        let mut b = Entity::new(EntityType::Service, "b");
        b.node_ids = vec![1, 2];
        let path = GraphPath { entities: vec![a, b], relationships: vec![] };
        assert_eq!(path.node_ids(), vec![1, 2, 3]);
    }
}
