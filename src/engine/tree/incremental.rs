// ── Canopy Tree: Incremental Update & Merge ────────────────────────────────
//
// Inserts new leaves into an existing tree and propagates summary changes
// upward without a rebuild. Both paths preserve existing structure: nodes
// are never deleted, indices never renumbered.
//
//   layer-1 insert — route each new leaf to the most cosine-similar layer-1
//     parent (≥ similarity_threshold) or open a fresh parent for it
//   safe propagation — walk upward from every touched parent, regenerating
//     summary, embeddings, and keywords layer by layer; never creates new
//     upper layers
//   merge — bring a source tree's leaves in under fresh indices and
//     propagate them into the target hierarchy (source interiors are
//     discarded; the target hierarchy is authoritative)
//   compact — the scheduled remedy for drift: full rebuild of layers 1..N
//     from the union of leaves
//
// Incremental updates are approximations; they drift from a fresh rebuild
// over time. Compaction is exposed here but never scheduled by the engine.

use log::info;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::atoms::constants::MAX_KEYWORDS_PER_NODE;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CancelToken, IncrementalConfig, Node, Tree};
use crate::engine::models::embedding::{cosine_similarity, Embedder};
use crate::engine::models::summarizer::Summarizer;
use crate::engine::models::tokenizer::Tokenizer;
use crate::engine::tree::builder::{summary_context, ChunkInput, TreeBuilder};
use crate::engine::tree::keywords::KeywordExtractor;

#[derive(Debug, Default, Clone)]
pub struct InsertReport {
    pub new_leaves: Vec<u64>,
    /// Existing nodes whose summary/embedding/keywords were regenerated.
    pub updated: Vec<u64>,
    /// Fresh layer-1 parents created for unroutable leaves.
    pub created: Vec<u64>,
}

pub struct IncrementalEngine {
    config: IncrementalConfig,
    tokenizer: Tokenizer,
    embedders: BTreeMap<String, Arc<dyn Embedder>>,
    summarizer: Arc<dyn Summarizer>,
    keywords: Arc<KeywordExtractor>,
    cluster_embedding_model: String,
    summarization_length: usize,
}

impl IncrementalEngine {
    pub fn new(
        config: IncrementalConfig,
        tokenizer: Tokenizer,
        embedders: BTreeMap<String, Arc<dyn Embedder>>,
        summarizer: Arc<dyn Summarizer>,
        keywords: Arc<KeywordExtractor>,
        cluster_embedding_model: impl Into<String>,
        summarization_length: usize,
    ) -> EngineResult<Self> {
        let cluster_embedding_model = cluster_embedding_model.into();
        if !embedders.contains_key(&cluster_embedding_model) {
            return Err(EngineError::Config(format!(
                "cluster_embedding_model '{}' is not among the configured embedders",
                cluster_embedding_model
            )));
        }
        Ok(Self {
            config,
            tokenizer,
            embedders,
            summarizer,
            keywords,
            cluster_embedding_model,
            summarization_length,
        })
    }

    pub fn config(&self) -> &IncrementalConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Public entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Create leaves from chunks and insert them.
    pub async fn add_chunks(
        &self,
        tree: &mut Tree,
        chunks: Vec<ChunkInput>,
        cancel: &CancelToken,
    ) -> EngineResult<InsertReport> {
        let mut leaves = Vec::with_capacity(chunks.len());
        let mut next = tree.next_index();
        for chunk in chunks {
            cancel.check()?;
            leaves.push(self.create_leaf(next, chunk).await?);
            next += 1;
        }
        self.insert_leaves(tree, leaves, cancel).await
    }

    /// Insert pre-built leaf nodes (indices must be fresh for this tree).
    pub async fn insert_leaves(
        &self,
        tree: &mut Tree,
        new_leaves: Vec<Node>,
        cancel: &CancelToken,
    ) -> EngineResult<InsertReport> {
        if new_leaves.is_empty() {
            return Ok(InsertReport::default());
        }
        if !tree.layer_to_nodes.contains_key(&1) {
            return Err(EngineError::invalid_tree(
                "tree has no layer-1 nodes; incremental insert needs at least one built layer",
            ));
        }

        let mut report = InsertReport::default();
        let mut touched_parents: BTreeSet<u64> = BTreeSet::new();

        for leaf in new_leaves {
            cancel.check()?;
            let leaf_index = leaf.index;
            if tree.all_nodes.contains_key(&leaf_index) {
                return Err(EngineError::invalid_tree(format!(
                    "leaf index {} already exists in tree",
                    leaf_index
                )));
            }

            let routed = self.route_to_layer1(tree, &leaf)?;
            tree.all_nodes.insert(leaf_index, leaf);
            tree.layer_to_nodes.entry(0).or_default().push(leaf_index);
            report.new_leaves.push(leaf_index);

            match routed {
                Some((parent_id, similarity)) => {
                    info!(
                        "[canopy:incremental] leaf {} → parent {} (cos {:.3})",
                        leaf_index, parent_id, similarity
                    );
                    self.attach_child(tree, parent_id, leaf_index);
                    touched_parents.insert(parent_id);
                }
                None => {
                    let parent_id = self.create_layer1_parent(tree, leaf_index).await?;
                    info!(
                        "[canopy:incremental] leaf {} → new layer-1 parent {}",
                        leaf_index, parent_id
                    );
                    report.created.push(parent_id);
                    touched_parents.insert(parent_id);
                }
            }
        }

        // Regenerate the touched parents, then walk upward through every
        // existing layer. New upper layers are never created here.
        if self.config.use_safe_propagation {
            let updated = self.propagate_upward(tree, &touched_parents, cancel).await?;
            report.updated = updated;
        } else {
            let mut updated = Vec::new();
            for parent_id in &touched_parents {
                if !report.created.contains(parent_id) {
                    self.refresh_node(tree, *parent_id, 1).await?;
                    updated.push(*parent_id);
                }
            }
            report.updated = updated;
        }

        tree.rebuild_parent_ids();
        info!(
            "[canopy:incremental] ✓ inserted {} leaves, updated {}, created {}",
            report.new_leaves.len(),
            report.updated.len(),
            report.created.len()
        );
        Ok(report)
    }

    /// Online merge: bring every leaf of `source` into `target` under fresh
    /// indices and propagate. Source interior nodes are discarded.
    pub async fn merge(
        &self,
        target: &mut Tree,
        source: &Tree,
        cancel: &CancelToken,
    ) -> EngineResult<InsertReport> {
        let mut next = target.next_index();
        let mut leaves = Vec::new();
        for id in source.sorted_layer(0) {
            let Some(node) = source.all_nodes.get(&id) else { continue };
            let mut clone = node.clone();
            clone.index = next;
            clone.children.clear();
            clone.parent_ids.clear();
            next += 1;
            leaves.push(clone);
        }
        info!(
            "[canopy:incremental] merging {} source leaves into target ({} existing)",
            leaves.len(),
            target.leaf_count()
        );
        self.insert_leaves(target, leaves, cancel).await
    }

    /// Bulk compaction: rebuild layers 1..N from the union of all leaves of
    /// the given trees. Offered as a scheduled operation distinct from the
    /// online merge; the caller decides when drift warrants it.
    pub async fn compact(
        &self,
        builder: &TreeBuilder,
        trees: &[&Tree],
        cancel: &CancelToken,
    ) -> EngineResult<Tree> {
        let mut leaves = Vec::new();
        let mut next = 0u64;
        for tree in trees {
            for id in tree.sorted_layer(0) {
                let Some(node) = tree.all_nodes.get(&id) else { continue };
                let mut clone = node.clone();
                clone.index = next;
                clone.children.clear();
                clone.parent_ids.clear();
                next += 1;
                leaves.push(clone);
            }
        }
        info!("[canopy:incremental] compaction over {} leaves", leaves.len());

        let mut rebuilt = Tree::from_leaves(leaves);
        builder.construct_layers(&mut rebuilt, cancel).await?;
        rebuilt.rebuild_parent_ids();
        rebuilt.validate()?;
        Ok(rebuilt)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Routing
    // ═══════════════════════════════════════════════════════════════════════

    fn route_to_layer1(&self, tree: &Tree, leaf: &Node) -> EngineResult<Option<(u64, f32)>> {
        let key = &self.cluster_embedding_model;
        let leaf_vec = leaf.embeddings.get(key).ok_or_else(|| {
            EngineError::invalid_tree(format!("new leaf {} missing '{}' embedding", leaf.index, key))
        })?;

        let mut best: Option<(u64, f32)> = None;
        for id in tree.sorted_layer(1) {
            let Some(candidate) = tree.all_nodes.get(&id) else { continue };
            let Some(vec) = candidate.embeddings.get(key) else { continue };
            let sim = cosine_similarity(leaf_vec, vec);
            if best.map(|(_, b)| sim > b).unwrap_or(true) {
                best = Some((id, sim));
            }
        }

        Ok(best.filter(|(_, sim)| *sim >= self.config.similarity_threshold))
    }

    /// Attach and give the parent a cheap embedding refresh (token-weighted
    /// mean over children). The full refresh happens during propagation.
    fn attach_child(&self, tree: &mut Tree, parent_id: u64, child_id: u64) {
        let child_vectors: Vec<(Vec<f32>, f32)> = {
            let Some(parent) = tree.all_nodes.get(&parent_id) else { return };
            let mut members: Vec<u64> = parent.children.iter().copied().collect();
            members.push(child_id);
            members
                .iter()
                .filter_map(|id| tree.all_nodes.get(id))
                .filter_map(|n| {
                    n.embeddings
                        .get(&self.cluster_embedding_model)
                        .map(|v| (v.clone(), self.tokenizer.count_tokens(&n.text).max(1) as f32))
                })
                .collect()
        };

        if let Some(parent) = tree.all_nodes.get_mut(&parent_id) {
            parent.children.insert(child_id);
            if let Some(mean) = weighted_mean(&child_vectors) {
                parent.embeddings.insert(self.cluster_embedding_model.clone(), mean);
            }
            parent.metadata.touch();
        }
        if let Some(child) = tree.all_nodes.get_mut(&child_id) {
            if !child.parent_ids.contains(&parent_id) {
                child.parent_ids.push(parent_id);
            }
        }
    }

    async fn create_layer1_parent(&self, tree: &mut Tree, leaf_id: u64) -> EngineResult<u64> {
        let leaf_text = tree
            .all_nodes
            .get(&leaf_id)
            .map(|n| n.text.clone())
            .ok_or_else(|| EngineError::invalid_tree(format!("missing leaf {}", leaf_id)))?;

        // Initial summary is the abstracted leaf; it gets richer as siblings
        // arrive.
        let summary =
            self.summarizer.summarize_layer(&leaf_text, 1, self.summarization_length).await?;

        let index = tree.next_index();
        let mut parent = Node::leaf(index, summary);
        parent.children.insert(leaf_id);
        for (model_id, embedder) in &self.embedders {
            parent.embeddings.insert(model_id.clone(), embedder.embed(&parent.text).await?);
        }
        let leaf_keywords =
            tree.all_nodes.get(&leaf_id).map(|n| n.keywords.clone()).unwrap_or_default();
        parent.keywords =
            self.keywords.synthesize(&parent.text, &leaf_keywords, MAX_KEYWORDS_PER_NODE).await;

        tree.all_nodes.insert(index, parent);
        tree.layer_to_nodes.entry(1).or_default().push(index);
        if let Some(child) = tree.all_nodes.get_mut(&leaf_id) {
            child.parent_ids.push(index);
        }
        Ok(index)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Propagation
    // ═══════════════════════════════════════════════════════════════════════

    /// Refresh the touched layer-1 parents, then their ancestors layer by
    /// layer. Returns the refreshed node ids in processing order.
    async fn propagate_upward(
        &self,
        tree: &mut Tree,
        touched: &BTreeSet<u64>,
        cancel: &CancelToken,
    ) -> EngineResult<Vec<u64>> {
        let mut updated = Vec::new();
        let mut frontier: BTreeSet<u64> = touched.clone();

        for layer in 1..=tree.num_layers {
            if frontier.is_empty() {
                break;
            }
            let at_layer: Vec<u64> = tree
                .sorted_layer(layer)
                .into_iter()
                .filter(|id| frontier.contains(id))
                .collect();

            let mut next_frontier: BTreeSet<u64> = BTreeSet::new();
            for id in at_layer {
                cancel.check()?;
                self.refresh_node(tree, id, layer).await?;
                updated.push(id);
                if let Some(node) = tree.all_nodes.get(&id) {
                    next_frontier.extend(node.parent_ids.iter().copied());
                }
            }
            frontier = next_frontier;
        }

        Ok(updated)
    }

    /// Regenerate one interior node: bounded summary context, fresh summary,
    /// fresh embeddings, keywords synthesized from children.
    async fn refresh_node(&self, tree: &mut Tree, id: u64, layer: u32) -> EngineResult<()> {
        let (context, child_keywords) = {
            let Some(node) = tree.all_nodes.get(&id) else {
                return Err(EngineError::invalid_tree(format!("missing node {}", id)));
            };
            let children = self.sample_children(tree, node);
            let refs: Vec<&Node> = children.iter().map(|id| &tree.all_nodes[id]).collect();
            let context = summary_context(&refs);
            let (bounded, _) = self
                .tokenizer
                .truncate_to_budget(&context, self.config.max_summary_context_tokens);
            let keywords: Vec<String> =
                refs.iter().flat_map(|c| c.keywords.iter().cloned()).collect();
            (bounded.to_string(), keywords)
        };

        let summary = self
            .summarizer
            .summarize_layer(&context, layer as i32, self.summarization_length)
            .await?;

        let mut embeddings = BTreeMap::new();
        for (model_id, embedder) in &self.embedders {
            embeddings.insert(model_id.clone(), embedder.embed(&summary).await?);
        }
        let keywords =
            self.keywords.synthesize(&summary, &child_keywords, MAX_KEYWORDS_PER_NODE).await;

        if let Some(node) = tree.all_nodes.get_mut(&id) {
            node.text = summary;
            node.embeddings = embeddings;
            node.keywords = keywords;
            node.metadata.touch();
        }
        Ok(())
    }

    /// Bound cost on wide parents: prefer recently updated, then most
    /// important children, capped at max_children_for_summary.
    fn sample_children(&self, tree: &Tree, node: &Node) -> Vec<u64> {
        let mut children: Vec<&Node> =
            node.children.iter().filter_map(|id| tree.all_nodes.get(id)).collect();
        if children.len() <= self.config.max_children_for_summary {
            let mut ids: Vec<u64> = children.iter().map(|n| n.index).collect();
            ids.sort_unstable();
            return ids;
        }
        children.sort_by(|a, b| {
            b.metadata
                .updated_at
                .cmp(&a.metadata.updated_at)
                .then(
                    b.importance()
                        .partial_cmp(&a.importance())
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.index.cmp(&b.index))
        });
        let mut ids: Vec<u64> = children
            .into_iter()
            .take(self.config.max_children_for_summary)
            .map(|n| n.index)
            .collect();
        ids.sort_unstable();
        ids
    }

    async fn create_leaf(&self, index: u64, chunk: ChunkInput) -> EngineResult<Node> {
        let mut node = Node::leaf(index, chunk.text);
        for (model_id, embedder) in &self.embedders {
            node.embeddings.insert(model_id.clone(), embedder.embed(&node.text).await?);
        }
        node.keywords =
            self.keywords.extract(&node.text, MAX_KEYWORDS_PER_NODE, None, None).await;
        node.metadata.source_url = chunk.source_url;
        node.metadata.rel_path = chunk.rel_path;
        node.metadata.doc_id = chunk.doc_id;
        node.original_content_ref = chunk.original_content_ref;
        Ok(node)
    }
}

fn weighted_mean(vectors: &[(Vec<f32>, f32)]) -> Option<Vec<f32>> {
    let dim = vectors.first()?.0.len();
    let mut out = vec![0.0f32; dim];
    let mut total = 0.0f32;
    for (vec, weight) in vectors {
        if vec.len() != dim {
            continue;
        }
        for (o, v) in out.iter_mut().zip(vec.iter()) {
            *o += v * weight;
        }
        total += weight;
    }
    if total <= 0.0 {
        return None;
    }
    for o in out.iter_mut() {
        *o /= total;
    }
    Some(out)
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
