// ── Canopy Engine: Retrieval ───────────────────────────────────────────────
// Query analysis, the strategy ensemble, rerankers, the orchestrating
// retriever, and the observation sink feeding the importance updater.

pub mod observations;
pub mod query;
pub mod reranker;
pub mod retriever;
pub mod strategies;

pub use observations::{ewma_importance, ObservationSink};
pub use query::analyze_query;
pub use reranker::{
    ContextualReranker, CrossEncoderReranker, EnsembleReranker, ImportanceReranker,
    RecencyBoostReranker, Reranker,
};
pub use retriever::Retriever;
pub use strategies::{
    AdaptiveDepthStrategy, HybridGraphTreeStrategy, HydeStrategy, IncidentAwareStrategy,
    MultiQueryStrategy, RetrievalStrategy,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::atoms::retrieval_types::RetrievedChunk;
use crate::engine::graph::SharedGraph;
use crate::engine::models::embedding::{cosine_similarity, Embedder};
use crate::engine::models::llm::StructuredLlm;
use crate::engine::tree::forest::TreeForest;

/// Everything a strategy needs to search: the forest, the optional graph,
/// the query embedder, and an optional LLM for expansions.
pub struct RetrievalContext {
    pub forest: Arc<TreeForest>,
    pub graph: Option<SharedGraph>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Option<Arc<dyn StructuredLlm>>,
}

/// Which tree layers a similarity search touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerFilter {
    Any,
    Exact(u32),
    AtMost(u32),
}

impl LayerFilter {
    fn accepts(&self, layer: u32) -> bool {
        match self {
            LayerFilter::Any => true,
            LayerFilter::Exact(l) => layer == *l,
            LayerFilter::AtMost(l) => layer <= *l,
        }
    }
}

/// Cosine similarity search across every tree in the forest, using the
/// context embedder's model id as the vector key. Returns the global top-k
/// by raw similarity; an empty forest yields an empty result.
pub(crate) fn search_with_embedding(
    ctx: &RetrievalContext,
    query_embedding: &[f32],
    filter: LayerFilter,
    top_k: usize,
    strategy: &str,
) -> Vec<RetrievedChunk> {
    let model_id = ctx.embedder.model_id().to_string();
    let mut chunks: Vec<RetrievedChunk> = Vec::new();

    ctx.forest.for_each_tree(|tree_id, tree| {
        // layer lookup for the filter
        let mut layer_of: BTreeMap<u64, u32> = BTreeMap::new();
        for (layer, ids) in &tree.layer_to_nodes {
            for id in ids {
                layer_of.insert(*id, *layer);
            }
        }

        for node in tree.all_nodes.values() {
            let layer = layer_of.get(&node.index).copied().unwrap_or(0);
            if !filter.accepts(layer) {
                continue;
            }
            let Some(vec) = node.embeddings.get(&model_id) else { continue };
            let score = cosine_similarity(query_embedding, vec);
            chunks.push(RetrievedChunk {
                node_id: node.index,
                tree_id: tree_id.to_string(),
                text: node.text.clone(),
                score,
                importance: node.importance(),
                strategy: strategy.to_string(),
                tree_level: layer,
                metadata: source_metadata(node),
            });
        }
    });

    chunks.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
    });
    chunks.truncate(top_k);
    chunks
}

/// Chunks for an explicit node-id set (graph expansion results).
pub(crate) fn chunks_for_node_ids(
    ctx: &RetrievalContext,
    node_ids: &[u64],
    base_score: f32,
    strategy: &str,
) -> Vec<RetrievedChunk> {
    let mut chunks = Vec::new();
    ctx.forest.for_each_tree(|tree_id, tree| {
        let mut layer_of: BTreeMap<u64, u32> = BTreeMap::new();
        for (layer, ids) in &tree.layer_to_nodes {
            for id in ids {
                layer_of.insert(*id, *layer);
            }
        }
        for id in node_ids {
            if let Some(node) = tree.all_nodes.get(id) {
                chunks.push(RetrievedChunk {
                    node_id: node.index,
                    tree_id: tree_id.to_string(),
                    text: node.text.clone(),
                    score: base_score,
                    importance: node.importance(),
                    strategy: strategy.to_string(),
                    tree_level: layer_of.get(id).copied().unwrap_or(0),
                    metadata: source_metadata(node),
                });
            }
        }
    });
    chunks
}

fn source_metadata(
    node: &crate::atoms::types::Node,
) -> BTreeMap<String, serde_json::Value> {
    let mut meta = BTreeMap::new();
    if let Some(source) = &node.metadata.source_url {
        meta.insert("source".to_string(), serde_json::json!(source));
    }
    meta.insert(
        "updated_at".to_string(),
        serde_json::json!(node.metadata.updated_at.to_rfc3339()),
    );
    meta
}

/// Keep-max-per-node fusion: commutative, so strategy completion order
/// cannot change the result.
pub(crate) fn fuse_keep_max(into: &mut BTreeMap<(String, u64), RetrievedChunk>, chunks: Vec<RetrievedChunk>) {
    for chunk in chunks {
        let key = (chunk.tree_id.clone(), chunk.node_id);
        match into.get_mut(&key) {
            Some(existing) if existing.score >= chunk.score => {}
            Some(existing) => *existing = chunk,
            None => {
                into.insert(key, chunk);
            }
        }
    }
}
