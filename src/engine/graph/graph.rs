// ── Canopy Graph: Entity/Relationship Store ────────────────────────────────
//
// In-memory arena + index sets: entities and relationships live in maps
// keyed by stable ids; adjacency is maintained in auxiliary index maps, not
// by storing references inside entities. Indexed by type, lowercase name,
// and alias; adding an entity updates all indices atomically (single &mut).
//
// Graph ops are cheap relative to tree ops, so callers wrap the whole store
// in one coarse RwLock (`SharedGraph`).
//
// Traversal invariants: a traversal never revisits an entity on the same
// path; BFS results are ordered by ascending distance, then insertion.

use log::info;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::atoms::constants::GRAPH_TRAVERSAL_LIMIT;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::graph_types::{
    Direction, Entity, EntityType, GraphPath, Neighborhood, Relationship, RelationshipType,
    TraversalHit,
};

pub type SharedGraph = std::sync::Arc<parking_lot::RwLock<KnowledgeGraph>>;

/// Traversal constraints. Default: 2 hops outgoing, any type, no confidence
/// floor, capped result count.
#[derive(Debug, Clone)]
pub struct TraversalSpec {
    pub max_hops: usize,
    pub relationship_types: Option<Vec<RelationshipType>>,
    pub direction: Direction,
    pub target_types: Option<Vec<EntityType>>,
    pub min_confidence: f32,
    pub limit: usize,
}

impl Default for TraversalSpec {
    fn default() -> Self {
        Self {
            max_hops: 2,
            relationship_types: None,
            direction: Direction::Outgoing,
            target_types: None,
            min_confidence: 0.0,
            limit: GRAPH_TRAVERSAL_LIMIT,
        }
    }
}

#[derive(Default)]
pub struct KnowledgeGraph {
    entities: BTreeMap<String, Entity>,
    relationships: BTreeMap<String, Relationship>,

    // Indices
    by_type: BTreeMap<EntityType, BTreeSet<String>>,
    by_name: BTreeMap<String, BTreeSet<String>>, // lowercase name/alias → ids
    outgoing: BTreeMap<String, BTreeSet<String>>, // entity id → relationship ids
    incoming: BTreeMap<String, BTreeSet<String>>,
    rels_by_type: BTreeMap<RelationshipType, BTreeSet<String>>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Entities
    // ═══════════════════════════════════════════════════════════════════════

    pub fn add_entity(&mut self, entity: Entity) {
        let id = entity.entity_id.clone();

        // Re-adding: clear stale name/alias index entries first.
        if let Some(old) = self.entities.get(&id).cloned() {
            self.unindex_names(&old);
            self.by_type.entry(old.entity_type).or_default().remove(&id);
        }

        self.by_type.entry(entity.entity_type).or_default().insert(id.clone());
        self.by_name.entry(entity.name.to_lowercase()).or_default().insert(id.clone());
        for alias in &entity.aliases {
            self.by_name.entry(alias.to_lowercase()).or_default().insert(id.clone());
        }
        self.outgoing.entry(id.clone()).or_default();
        self.incoming.entry(id.clone()).or_default();
        self.entities.insert(id, entity);
    }

    fn unindex_names(&mut self, entity: &Entity) {
        if let Some(set) = self.by_name.get_mut(&entity.name.to_lowercase()) {
            set.remove(&entity.entity_id);
        }
        for alias in &entity.aliases {
            if let Some(set) = self.by_name.get_mut(&alias.to_lowercase()) {
                set.remove(&entity.entity_id);
            }
        }
    }

    pub fn get_entity(&self, entity_id: &str) -> Option<&Entity> {
        self.entities.get(entity_id)
    }

    pub fn get_entity_mut(&mut self, entity_id: &str) -> Option<&mut Entity> {
        self.entities.get_mut(entity_id)
    }

    /// Case-insensitive exact name or alias lookup.
    pub fn find_entity(&self, name: &str) -> Option<&Entity> {
        let ids = self.by_name.get(&name.to_lowercase())?;
        ids.iter().next().and_then(|id| self.entities.get(id))
    }

    /// Substring name match, optional type filter, tag subset filter.
    pub fn find_entities(
        &self,
        name: Option<&str>,
        entity_type: Option<EntityType>,
        tags: Option<&[String]>,
    ) -> Vec<&Entity> {
        let mut out: Vec<&Entity> = self
            .entities
            .values()
            .filter(|e| entity_type.map(|t| e.entity_type == t).unwrap_or(true))
            .filter(|e| name.map(|n| e.matches_name(n)).unwrap_or(true))
            .filter(|e| {
                tags.map(|wanted| {
                    let have: BTreeSet<String> =
                        e.tags.iter().map(|t| t.to_lowercase()).collect();
                    wanted.iter().all(|t| have.contains(&t.to_lowercase()))
                })
                .unwrap_or(true)
            })
            .collect();
        out.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        out
    }

    pub fn entities_by_type(&self, entity_type: EntityType) -> Vec<&Entity> {
        self.by_type
            .get(&entity_type)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn remove_entity(&mut self, entity_id: &str) -> bool {
        let Some(entity) = self.entities.get(entity_id).cloned() else {
            return false;
        };
        self.unindex_names(&entity);
        self.by_type.entry(entity.entity_type).or_default().remove(entity_id);

        let rel_ids: Vec<String> = self
            .outgoing
            .get(entity_id)
            .into_iter()
            .flatten()
            .chain(self.incoming.get(entity_id).into_iter().flatten())
            .cloned()
            .collect();
        for rel_id in rel_ids {
            self.remove_relationship(&rel_id);
        }

        self.entities.remove(entity_id);
        self.outgoing.remove(entity_id);
        self.incoming.remove(entity_id);
        true
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Relationships
    // ═══════════════════════════════════════════════════════════════════════

    /// Add a relationship. Both endpoints must exist; a duplicate
    /// (source, target, type) tuple updates the existing edge in place.
    pub fn add_relationship(&mut self, rel: Relationship) -> EngineResult<()> {
        if !self.entities.contains_key(&rel.source_id) {
            return Err(EngineError::graph(format!(
                "relationship source '{}' does not exist",
                rel.source_id
            )));
        }
        if !self.entities.contains_key(&rel.target_id) {
            return Err(EngineError::graph(format!(
                "relationship target '{}' does not exist",
                rel.target_id
            )));
        }
        if !(0.0..=1.0).contains(&rel.confidence) {
            return Err(EngineError::graph(format!(
                "confidence {} outside [0, 1]",
                rel.confidence
            )));
        }

        if let Some(existing_id) = self.find_relationship_id(
            &rel.source_id,
            &rel.target_id,
            rel.relationship_type,
        ) {
            let existing = self.relationships.get_mut(&existing_id).expect("indexed");
            existing.properties = rel.properties;
            existing.confidence = rel.confidence;
            existing.inferred = rel.inferred;
            existing.valid_from = rel.valid_from;
            existing.valid_until = rel.valid_until;
            existing.updated_at = chrono::Utc::now();
            info!("[graph] updated relationship {} in place", existing_id);
            return Ok(());
        }

        let id = rel.relationship_id.clone();
        self.outgoing.entry(rel.source_id.clone()).or_default().insert(id.clone());
        self.incoming.entry(rel.target_id.clone()).or_default().insert(id.clone());
        self.rels_by_type.entry(rel.relationship_type).or_default().insert(id.clone());
        self.relationships.insert(id, rel);
        Ok(())
    }

    fn find_relationship_id(
        &self,
        source_id: &str,
        target_id: &str,
        rel_type: RelationshipType,
    ) -> Option<String> {
        self.outgoing.get(source_id)?.iter().find_map(|rid| {
            let rel = self.relationships.get(rid)?;
            (rel.target_id == target_id && rel.relationship_type == rel_type)
                .then(|| rid.clone())
        })
    }

    pub fn remove_relationship(&mut self, rel_id: &str) -> bool {
        let Some(rel) = self.relationships.remove(rel_id) else {
            return false;
        };
        if let Some(set) = self.outgoing.get_mut(&rel.source_id) {
            set.remove(rel_id);
        }
        if let Some(set) = self.incoming.get_mut(&rel.target_id) {
            set.remove(rel_id);
        }
        if let Some(set) = self.rels_by_type.get_mut(&rel.relationship_type) {
            set.remove(rel_id);
        }
        true
    }

    /// Active relationships only, filtered by direction and optional types.
    pub fn get_relationships(
        &self,
        entity_id: &str,
        direction: Direction,
        rel_types: Option<&[RelationshipType]>,
    ) -> Vec<&Relationship> {
        let mut ids: BTreeSet<&String> = BTreeSet::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            if let Some(set) = self.outgoing.get(entity_id) {
                ids.extend(set.iter());
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            if let Some(set) = self.incoming.get(entity_id) {
                ids.extend(set.iter());
            }
        }

        ids.into_iter()
            .filter_map(|id| self.relationships.get(id))
            .filter(|r| r.is_active())
            .filter(|r| {
                rel_types
                    .map(|types| types.contains(&r.relationship_type))
                    .unwrap_or(true)
            })
            .collect()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Traversal
    // ═══════════════════════════════════════════════════════════════════════

    /// BFS from a start entity. `max_hops = 0` returns nothing beyond the
    /// start (which is not itself included in the hit list).
    pub fn traverse(&self, start_id: &str, spec: &TraversalSpec) -> Vec<TraversalHit> {
        if !self.entities.contains_key(start_id) {
            return Vec::new();
        }

        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(start_id.to_string());
        let mut results: Vec<TraversalHit> = Vec::new();
        let mut queue: VecDeque<(String, usize, Vec<Relationship>)> = VecDeque::new();
        queue.push_back((start_id.to_string(), 0, Vec::new()));

        while let Some((current_id, distance, path)) = queue.pop_front() {
            if distance > 0 {
                if let Some(entity) = self.entities.get(&current_id) {
                    let type_ok = spec
                        .target_types
                        .as_ref()
                        .map(|types| types.contains(&entity.entity_type))
                        .unwrap_or(true);
                    if type_ok {
                        results.push(TraversalHit {
                            entity: entity.clone(),
                            distance,
                            path: path.clone(),
                        });
                        if results.len() >= spec.limit {
                            break;
                        }
                    }
                }
            }

            if distance >= spec.max_hops {
                continue;
            }

            for rel in self.get_relationships(
                &current_id,
                spec.direction,
                spec.relationship_types.as_deref(),
            ) {
                if rel.confidence < spec.min_confidence {
                    continue;
                }
                let next_id =
                    if rel.source_id == current_id { &rel.target_id } else { &rel.source_id };
                if visited.insert(next_id.clone()) {
                    let mut next_path = path.clone();
                    next_path.push(rel.clone());
                    queue.push_back((next_id.clone(), distance + 1, next_path));
                }
            }
        }

        results
    }

    /// DFS enumeration of all simple paths between two entities within the
    /// hop budget. Both directions are followed.
    pub fn find_paths(
        &self,
        start_id: &str,
        end_id: &str,
        max_hops: usize,
        rel_types: Option<&[RelationshipType]>,
    ) -> Vec<GraphPath> {
        let (Some(start), Some(_)) = (self.entities.get(start_id), self.entities.get(end_id))
        else {
            return Vec::new();
        };

        let mut paths = Vec::new();
        let mut visited: BTreeSet<String> = BTreeSet::new();
        visited.insert(start_id.to_string());
        let mut entity_path = vec![start.clone()];
        let mut rel_path: Vec<Relationship> = Vec::new();

        self.dfs_paths(
            start_id,
            end_id,
            max_hops,
            rel_types,
            &mut visited,
            &mut entity_path,
            &mut rel_path,
            &mut paths,
        );
        paths
    }

    #[allow(clippy::too_many_arguments)]
    fn dfs_paths(
        &self,
        current: &str,
        target: &str,
        budget: usize,
        rel_types: Option<&[RelationshipType]>,
        visited: &mut BTreeSet<String>,
        entity_path: &mut Vec<Entity>,
        rel_path: &mut Vec<Relationship>,
        paths: &mut Vec<GraphPath>,
    ) {
        if current == target {
            paths.push(GraphPath {
                entities: entity_path.clone(),
                relationships: rel_path.clone(),
            });
            return;
        }
        if rel_path.len() >= budget {
            return;
        }

        let rels: Vec<Relationship> = self
            .get_relationships(current, Direction::Both, rel_types)
            .into_iter()
            .cloned()
            .collect();
        for rel in rels {
            let next_id =
                if rel.source_id == current { rel.target_id.clone() } else { rel.source_id.clone() };
            if visited.contains(&next_id) {
                continue;
            }
            let Some(next_entity) = self.entities.get(&next_id) else { continue };

            visited.insert(next_id.clone());
            entity_path.push(next_entity.clone());
            rel_path.push(rel);

            self.dfs_paths(
                &next_id, target, budget, rel_types, visited, entity_path, rel_path, paths,
            );

            rel_path.pop();
            entity_path.pop();
            visited.remove(&next_id);
        }
    }

    /// Subgraph around an entity: the entity, everything within `hops`, and
    /// the relationships internal to that set.
    pub fn get_neighborhood(&self, entity_id: &str, hops: usize) -> Neighborhood {
        let Some(center) = self.entities.get(entity_id) else {
            return Neighborhood { entities: Vec::new(), relationships: Vec::new() };
        };

        let hits = self.traverse(
            entity_id,
            &TraversalSpec {
                max_hops: hops,
                direction: Direction::Both,
                ..Default::default()
            },
        );

        let mut entities = vec![center.clone()];
        entities.extend(hits.into_iter().map(|h| h.entity));
        let member_ids: BTreeSet<&str> =
            entities.iter().map(|e| e.entity_id.as_str()).collect();

        let mut relationships: Vec<Relationship> = Vec::new();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for id in &member_ids {
            for rel in self.get_relationships(id, Direction::Outgoing, None) {
                if member_ids.contains(rel.target_id.as_str())
                    && seen.insert(rel.relationship_id.as_str())
                {
                    relationships.push(rel.clone());
                }
            }
        }

        Neighborhood { entities, relationships }
    }

    /// Union of tree-node ids reachable from an entity within `max_hops`,
    /// including the start entity's own references.
    pub fn expand_to_node_ids(
        &self,
        start_id: &str,
        max_hops: usize,
        rel_types: Option<&[RelationshipType]>,
    ) -> Vec<u64> {
        let mut node_ids: BTreeSet<u64> = BTreeSet::new();
        if let Some(start) = self.entities.get(start_id) {
            node_ids.extend(start.node_ids.iter().copied());
        }
        for hit in self.traverse(
            start_id,
            &TraversalSpec {
                max_hops,
                relationship_types: rel_types.map(|r| r.to_vec()),
                direction: Direction::Both,
                ..Default::default()
            },
        ) {
            node_ids.extend(hit.entity.node_ids.iter().copied());
        }
        node_ids.into_iter().collect()
    }

    /// Entities whose `node_ids` reference the given tree node.
    pub fn entities_for_node(&self, node_id: u64) -> Vec<&Entity> {
        self.entities.values().filter(|e| e.node_ids.contains(&node_id)).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> Entity {
        let mut e = Entity::new(EntityType::Service, name);
        e.entity_id = name.to_string();
        e
    }

    /// api → auth → db dependency chain.
    fn chain() -> KnowledgeGraph {
        let mut g = KnowledgeGraph::new();
        g.add_entity(service("api"));
        g.add_entity(service("auth"));
        g.add_entity(service("db"));
        g.add_relationship(Relationship::create(RelationshipType::DependsOn, "api", "auth"))
            .unwrap();
        g.add_relationship(Relationship::create(RelationshipType::DependsOn, "auth", "db"))
            .unwrap();
        g
    }

    #[test]
    fn find_entity_is_case_insensitive() {
        let mut g = KnowledgeGraph::new();
        let mut e = service("Payment-Service");
        e.add_alias("payments");
        g.add_entity(e);
        let a = g.find_entity("Payment-Service").map(|e| e.entity_id.clone());
        let b = g.find_entity("payment-service").map(|e| e.entity_id.clone());
        let c = g.find_entity("PAYMENTS").map(|e| e.entity_id.clone());
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn find_entities_filters_by_type_and_tags() {
        let mut g = chain();
        let mut tagged = service("billing");
        tagged.tags = vec!["Payments".to_string(), "critical".to_string()];
        g.add_entity(tagged);
        let mut person = Entity::new(EntityType::Person, "api oncall");
        person.entity_id = "p1".into();
        g.add_entity(person);

        let services = g.find_entities(Some("api"), Some(EntityType::Service), None);
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].entity_id, "api");

        let by_tags = g.find_entities(None, None, Some(&["payments".to_string()]));
        assert_eq!(by_tags.len(), 1);
        assert_eq!(by_tags[0].entity_id, "billing");
    }

    #[test]
    fn relationship_requires_existing_endpoints() {
        let mut g = KnowledgeGraph::new();
        g.add_entity(service("api"));
        let err = g
            .add_relationship(Relationship::create(RelationshipType::DependsOn, "api", "ghost"))
            .unwrap_err();
        assert!(matches!(err, EngineError::Graph(_)));
    }

    #[test]
    fn duplicate_relationship_updates_in_place() {
        let mut g = chain();
        assert_eq!(g.relationship_count(), 2);
        let mut dup = Relationship::create(RelationshipType::DependsOn, "api", "auth");
        dup.confidence = 0.4;
        g.add_relationship(dup).unwrap();
        assert_eq!(g.relationship_count(), 2, "duplicate tuple must not add an edge");
        let rels = g.get_relationships("api", Direction::Outgoing, None);
        assert!((rels[0].confidence - 0.4).abs() < 1e-6);
    }

    #[test]
    fn inactive_relationships_are_invisible() {
        let mut g = chain();
        let mut expired = Relationship::create(RelationshipType::Calls, "api", "db");
        expired.valid_until = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        g.add_relationship(expired).unwrap();
        let rels = g.get_relationships("api", Direction::Outgoing, None);
        assert_eq!(rels.len(), 1, "expired edge should be filtered");
    }

    #[test]
    fn traverse_one_and_two_hops() {
        let g = chain();
        let one = g.traverse("api", &TraversalSpec { max_hops: 1, ..Default::default() });
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].entity.entity_id, "auth");
        assert_eq!(one[0].distance, 1);

        let two = g.traverse("api", &TraversalSpec { max_hops: 2, ..Default::default() });
        let ids: Vec<(&str, usize)> =
            two.iter().map(|h| (h.entity.entity_id.as_str(), h.distance)).collect();
        assert_eq!(ids, vec![("auth", 1), ("db", 2)]);
    }

    #[test]
    fn traverse_zero_hops_returns_nothing() {
        let g = chain();
        assert!(g.traverse("api", &TraversalSpec { max_hops: 0, ..Default::default() }).is_empty());
    }

    #[test]
    fn traverse_respects_confidence_floor() {
        let mut g = chain();
        let mut weak = Relationship::create(RelationshipType::Calls, "api", "db");
        weak.confidence = 0.2;
        g.add_relationship(weak).unwrap();
        let hits = g.traverse(
            "api",
            &TraversalSpec { max_hops: 1, min_confidence: 0.5, ..Default::default() },
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.entity_id, "auth");
    }

    #[test]
    fn find_paths_enumerates_the_single_chain() {
        let g = chain();
        let paths = g.find_paths("api", "db", 3, None);
        assert_eq!(paths.len(), 1);
        let names: Vec<&str> =
            paths[0].entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(names, vec!["api", "auth", "db"]);
        assert_eq!(paths[0].hops(), 2);
    }

    #[test]
    fn find_paths_respects_hop_budget() {
        let g = chain();
        assert!(g.find_paths("api", "db", 1, None).is_empty());
    }

    #[test]
    fn neighborhood_is_internally_closed() {
        let g = chain();
        let hood = g.get_neighborhood("auth", 1);
        let ids: BTreeSet<&str> =
            hood.entities.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, BTreeSet::from(["api", "auth", "db"]));
        assert_eq!(hood.relationships.len(), 2);
    }

    #[test]
    fn expand_to_node_ids_unions_references() {
        let mut g = chain();
        g.get_entity_mut("api").unwrap().node_ids = vec![1, 2];
        g.get_entity_mut("auth").unwrap().node_ids = vec![2, 3];
        g.get_entity_mut("db").unwrap().node_ids = vec![9];
        assert_eq!(g.expand_to_node_ids("api", 1, None), vec![1, 2, 3]);
        assert_eq!(g.expand_to_node_ids("api", 2, None), vec![1, 2, 3, 9]);
    }

    #[test]
    fn remove_entity_cascades_relationships() {
        let mut g = chain();
        assert!(g.remove_entity("auth"));
        assert_eq!(g.entity_count(), 2);
        assert_eq!(g.relationship_count(), 0);
        assert!(g.traverse("api", &TraversalSpec::default()).is_empty());
    }
}
