// ── Canopy Atoms: Tree & Configuration Types ───────────────────────────────
//
// Type definitions for the hierarchical knowledge tree.
// These are pure data types (no DB access, no I/O, no provider calls).
//
// Follows the project pattern: structs in atoms/, impls with side effects in
// engine/. The structural helpers on `Tree` (layer lookup, validation) are
// pure and therefore live here.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Nodes
// ═══════════════════════════════════════════════════════════════════════════

/// One aggregated provenance entry on a parent node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Source reference (usually a URL).
    pub source: String,
    /// How many child references pointed at this source.
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

/// Typed node metadata. Reserved fields are explicit; anything open-ended
/// goes into `extensions`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rel_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// Top unique sources aggregated from children (parents only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    /// Total child references considered during aggregation.
    #[serde(default)]
    pub citation_total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_type: Option<String>,
    /// Multi-signal importance in [0, 1]. Adjusted over time by the
    /// observation-driven updater.
    #[serde(default = "default_importance")]
    pub importance: f32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Open fields (ingestion adapters, experiments). Not interpreted by the
    /// core.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_importance() -> f32 {
    0.5
}

impl NodeMetadata {
    pub fn now() -> Self {
        let ts = chrono::Utc::now();
        Self {
            importance: 0.5,
            created_at: ts,
            updated_at: ts,
            ..Default::default()
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// One piece of knowledge at some tree layer.
///
/// Leaves hold original chunk text; interior nodes hold generated summaries.
/// Children are stored as indices, never as references — the tree is an
/// arena keyed by `index`. Multi-parent membership (soft clustering, merges)
/// is recorded in `parent_ids`; the structure is a DAG, not a strict tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable id, unique within a tree, never reused.
    pub index: u64,
    /// Canonical stored content (leaves) or generated summary (interior).
    pub text: String,
    /// Child node indices. Empty iff leaf.
    #[serde(default)]
    pub children: BTreeSet<u64>,
    /// Indices of parents referencing this node. Maintained by the builder
    /// and incremental engine.
    #[serde(default)]
    pub parent_ids: Vec<u64>,
    /// embedding-model-id → dense vector. All vectors for one model id share
    /// one dimensionality per tree.
    #[serde(default)]
    pub embeddings: BTreeMap<String, Vec<f32>>,
    /// Normalized keyphrases, at most `MAX_KEYWORDS_PER_NODE`.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "NodeMetadata::now")]
    pub metadata: NodeMetadata,
    /// Upstream source identity for leaves (e.g. ingest URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content_ref: Option<String>,
}

impl Node {
    pub fn leaf(index: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            children: BTreeSet::new(),
            parent_ids: Vec::new(),
            embeddings: BTreeMap::new(),
            keywords: Vec::new(),
            metadata: NodeMetadata::now(),
            original_content_ref: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The node's importance score, defaulting to neutral when unset.
    pub fn importance(&self) -> f32 {
        self.metadata.importance.clamp(0.0, 1.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Tree
// ═══════════════════════════════════════════════════════════════════════════

/// A named collection of nodes arranged in layers.
///
/// Layer 0 holds leaves; layer k > 0 holds summaries whose children live in
/// lower layers. `num_layers == 0` means only leaves exist.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Tree {
    pub all_nodes: BTreeMap<u64, Node>,
    /// layer number → node indices at that layer, in creation order.
    pub layer_to_nodes: BTreeMap<u32, Vec<u64>>,
    pub num_layers: u32,
}

impl Tree {
    /// Build a leaves-only tree from pre-made leaf nodes.
    pub fn from_leaves(leaves: Vec<Node>) -> Self {
        let mut all_nodes = BTreeMap::new();
        let mut layer0 = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            layer0.push(leaf.index);
            all_nodes.insert(leaf.index, leaf);
        }
        let mut layer_to_nodes = BTreeMap::new();
        layer_to_nodes.insert(0, layer0);
        Self { all_nodes, layer_to_nodes, num_layers: 0 }
    }

    /// Next free node index. Indices are never reused.
    pub fn next_index(&self) -> u64 {
        self.all_nodes.keys().next_back().map(|i| i + 1).unwrap_or(0)
    }

    pub fn leaf_indices(&self) -> Vec<u64> {
        self.layer_to_nodes.get(&0).cloned().unwrap_or_default()
    }

    /// Nodes at the top layer.
    pub fn root_indices(&self) -> Vec<u64> {
        self.layer_to_nodes
            .get(&self.num_layers)
            .cloned()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.layer_to_nodes.get(&0).map(|v| v.len()).unwrap_or(0)
    }

    /// Layer of a node, if it is registered in a layer list.
    pub fn layer_of(&self, index: u64) -> Option<u32> {
        for (layer, ids) in &self.layer_to_nodes {
            if ids.contains(&index) {
                return Some(*layer);
            }
        }
        None
    }

    /// Node indices at a layer, ascending-index order (stable regardless of
    /// insertion order).
    pub fn sorted_layer(&self, layer: u32) -> Vec<u64> {
        let mut ids = self.layer_to_nodes.get(&layer).cloned().unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Rebuild every node's `parent_ids` from the child sets. Used after
    /// load and after structural edits.
    pub fn rebuild_parent_ids(&mut self) {
        let edges: Vec<(u64, u64)> = self
            .all_nodes
            .values()
            .flat_map(|n| n.children.iter().map(move |c| (*c, n.index)))
            .collect();
        for node in self.all_nodes.values_mut() {
            node.parent_ids.clear();
        }
        for (child, parent) in edges {
            if let Some(node) = self.all_nodes.get_mut(&child) {
                if !node.parent_ids.contains(&parent) {
                    node.parent_ids.push(parent);
                }
            }
        }
        for node in self.all_nodes.values_mut() {
            node.parent_ids.sort_unstable();
        }
    }

    /// Validate structural invariants. Fatal on violation — an invalid tree
    /// must never be returned as usable.
    ///
    /// Checks:
    ///   • every child index exists
    ///   • the parent→child graph is acyclic
    ///   • every node appears in exactly one layer
    ///   • children of a layer-k node live strictly below layer k
    ///   • per model id, all embedding vectors share one dimensionality
    pub fn validate(&self) -> EngineResult<()> {
        // Dangling children
        for node in self.all_nodes.values() {
            for child in &node.children {
                if !self.all_nodes.contains_key(child) {
                    return Err(EngineError::invalid_tree(format!(
                        "node {} references missing child {}",
                        node.index, child
                    )));
                }
            }
        }

        // Exactly one layer per node
        let mut seen: BTreeMap<u64, u32> = BTreeMap::new();
        for (layer, ids) in &self.layer_to_nodes {
            for id in ids {
                if !self.all_nodes.contains_key(id) {
                    return Err(EngineError::invalid_tree(format!(
                        "layer {} lists unknown node {}",
                        layer, id
                    )));
                }
                if let Some(prev) = seen.insert(*id, *layer) {
                    return Err(EngineError::invalid_tree(format!(
                        "node {} appears in layers {} and {}",
                        id, prev, layer
                    )));
                }
            }
        }
        for id in self.all_nodes.keys() {
            if !seen.contains_key(id) {
                return Err(EngineError::invalid_tree(format!(
                    "node {} is not assigned to any layer",
                    id
                )));
            }
        }

        // Children strictly below their parent's layer
        for node in self.all_nodes.values() {
            let layer = seen[&node.index];
            for child in &node.children {
                let child_layer = seen[child];
                if child_layer >= layer {
                    return Err(EngineError::invalid_tree(format!(
                        "node {} (layer {}) has child {} at layer {}",
                        node.index, layer, child, child_layer
                    )));
                }
            }
        }

        // Acyclic (guaranteed by the layering check above, but a defensive
        // walk also catches self-references in malformed blobs)
        for node in self.all_nodes.values() {
            if node.children.contains(&node.index) {
                return Err(EngineError::invalid_tree(format!(
                    "node {} references itself",
                    node.index
                )));
            }
        }

        // Uniform embedding dimension per model id
        let mut dims: BTreeMap<&str, usize> = BTreeMap::new();
        for node in self.all_nodes.values() {
            for (model, vec) in &node.embeddings {
                match dims.get(model.as_str()) {
                    Some(d) if *d != vec.len() => {
                        return Err(EngineError::invalid_tree(format!(
                            "embedding dim mismatch for model {}: {} vs {}",
                            model,
                            d,
                            vec.len()
                        )));
                    }
                    Some(_) => {}
                    None => {
                        dims.insert(model.as_str(), vec.len());
                    }
                }
            }
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Cancellation
// ═══════════════════════════════════════════════════════════════════════════

/// Cooperative cancellation signal. Workers check it between cluster tasks
/// and between retrieval strategies; in-flight provider calls run to
/// completion and their results are discarded.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Convenience guard: error out at a checkpoint if cancellation fired.
    pub fn check(&self) -> EngineResult<()> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Configuration
// ═══════════════════════════════════════════════════════════════════════════

/// Which splitting strategy an ingestion call uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// Token-bounded sentence packing (default).
    #[default]
    Fixed,
    /// ATX-heading aware, fenced code blocks kept atomic.
    Markdown,
    /// Embedding-similarity boundary detection.
    Embedding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    pub max_tokens: usize,
    /// Token overlap carried between adjacent chunks.
    pub overlap: usize,
    pub mode: SplitMode,
    /// Cosine cutoff for the embedding mode (adaptive: `min(threshold,
    /// μ − 0.5σ)` over adjacent-unit similarities).
    pub semantic_threshold: f32,
    /// Embedding mode only cuts once this many tokens accumulated.
    pub min_chunk_tokens: usize,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            overlap: 40,
            mode: SplitMode::Fixed,
            semantic_threshold: 0.78,
            min_chunk_tokens: 120,
        }
    }
}

/// Per-layer summary length selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryLength {
    Uniform(usize),
    PerLayer(BTreeMap<u32, usize>),
}

impl SummaryLength {
    pub fn for_layer(&self, layer: u32, default: usize) -> usize {
        match self {
            SummaryLength::Uniform(n) => *n,
            SummaryLength::PerLayer(map) => map.get(&layer).copied().unwrap_or(default),
        }
    }
}

impl Default for SummaryLength {
    fn default() -> Self {
        SummaryLength::Uniform(120)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderConfig {
    /// Target dimensionality for the clusterer's reduction step. Layer
    /// construction stops when a layer has ≤ reduction_dimension + 1 nodes.
    pub reduction_dimension: usize,
    /// Fixed number of layers to build. Ignored when `auto_depth` is set.
    pub num_layers: u32,
    /// Keep building until the top layer is small enough.
    pub auto_depth: bool,
    /// Auto-depth stop: top layer size at or below this ends the build
    /// (never before layer 1 exists).
    pub target_top_nodes: usize,
    /// Hard ceiling on layers in auto-depth mode.
    pub max_layers: u32,
    pub summarization_length: SummaryLength,
    /// Bounded worker pool for per-cluster summarization.
    pub summary_max_workers: usize,
    /// When set, a tree snapshot is written after each completed layer.
    pub checkpoint_dir: Option<PathBuf>,
    /// Embedding model id the clusterer reads vectors from.
    pub cluster_embedding_model: String,
    /// Seed for the reducer/clusterer; fixed seed + fixed vectors + cache
    /// hits ⇒ identical builds.
    pub clustering_seed: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            reduction_dimension: 10,
            num_layers: 5,
            auto_depth: false,
            target_top_nodes: 75,
            max_layers: 5,
            summarization_length: SummaryLength::default(),
            summary_max_workers: 4,
            checkpoint_dir: None,
            cluster_embedding_model: "default".to_string(),
            clustering_seed: 224,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    /// Minimum cosine similarity for a new leaf to join an existing layer-1
    /// parent; below it a fresh parent is created.
    pub similarity_threshold: f32,
    /// Parents with more children than this get summarized from a sample.
    pub max_children_for_summary: usize,
    /// Token cap on any regenerated summary context.
    pub max_summary_context_tokens: usize,
    /// Propagate re-summarization upward through all existing layers
    /// (the safe default) instead of touching only layer 1.
    pub use_safe_propagation: bool,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.25,
            max_children_for_summary: 50,
            max_summary_context_tokens: 12_000,
            use_safe_propagation: true,
        }
    }
}

/// Observability knobs shared by the usage tracker and summarizer debug log.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    pub usage_log_path: Option<PathBuf>,
    pub budget_usd: Option<f64>,
    pub enforce_budget: bool,
    pub summary_debug_log_path: Option<PathBuf>,
    /// Which summarizer debug events to record (`guard`, `truncation`, `all`).
    pub debug_events: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_tree() -> Tree {
        let mut a = Node::leaf(0, "alpha");
        let mut b = Node::leaf(1, "beta");
        let mut parent = Node::leaf(2, "summary of alpha and beta");
        parent.children.insert(0);
        parent.children.insert(1);
        a.parent_ids.push(2);
        b.parent_ids.push(2);
        let mut tree = Tree::from_leaves(vec![a, b]);
        tree.all_nodes.insert(2, parent);
        tree.layer_to_nodes.insert(1, vec![2]);
        tree.num_layers = 1;
        tree
    }

    #[test]
    fn validate_accepts_well_formed_tree() {
        assert!(tiny_tree().validate().is_ok());
    }

    #[test]
    fn validate_rejects_dangling_child() {
        let mut tree = tiny_tree();
        tree.all_nodes.get_mut(&2).unwrap().children.insert(99);
        assert!(matches!(tree.validate(), Err(EngineError::InvalidTree(_))));
    }

    #[test]
    fn validate_rejects_child_at_same_layer() {
        let mut tree = tiny_tree();
        // Move the parent down into layer 0 alongside its children.
        tree.layer_to_nodes.get_mut(&1).unwrap().clear();
        tree.layer_to_nodes.get_mut(&0).unwrap().push(2);
        assert!(tree.validate().is_err());
    }

    #[test]
    fn validate_rejects_dim_mismatch() {
        let mut tree = tiny_tree();
        tree.all_nodes
            .get_mut(&0)
            .unwrap()
            .embeddings
            .insert("m".into(), vec![0.0; 4]);
        tree.all_nodes
            .get_mut(&1)
            .unwrap()
            .embeddings
            .insert("m".into(), vec![0.0; 8]);
        assert!(tree.validate().is_err());
    }

    #[test]
    fn next_index_never_reuses() {
        let tree = tiny_tree();
        assert_eq!(tree.next_index(), 3);
    }

    #[test]
    fn rebuild_parent_ids_from_children() {
        let mut tree = tiny_tree();
        tree.all_nodes.get_mut(&0).unwrap().parent_ids.clear();
        tree.rebuild_parent_ids();
        assert_eq!(tree.all_nodes[&0].parent_ids, vec![2]);
        assert!(tree.all_nodes[&2].parent_ids.is_empty());
    }

    #[test]
    fn cancel_token_checks() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(EngineError::Cancelled)));
    }

    #[test]
    fn summary_length_per_layer() {
        let mut map = BTreeMap::new();
        map.insert(2u32, 60usize);
        let len = SummaryLength::PerLayer(map);
        assert_eq!(len.for_layer(2, 120), 60);
        assert_eq!(len.for_layer(1, 120), 120);
    }
}
