// ── Canopy Tree: Cluster Tree Builder ──────────────────────────────────────
//
// Transforms a flat set of chunks into a multi-layer tree: leaves carry the
// original text, every non-leaf node is an abstractive summary of its
// children.
//
// Layer loop: cluster the current layer, summarize each cluster into a
// parent node (bounded worker pool), install the new layer, repeat until a
// stop condition:
//   • auto-depth: top layer ≤ target_top_nodes (never before layer 1)
//   • structural: layer has ≤ reduction_dimension + 1 nodes
//   • configured num_layers / max_layers reached
//
// Summary context is built from children AFTER stripping provenance headers
// and templating shortcodes — otherwise parents degrade into excerpts of one
// child's header.
//
// Failure semantics: per-call retries happen inside the providers;
// persistent failure of one cluster fails the whole build. Per-layer
// checkpoints stay on disk so an operator can recover the last completed
// layer.

use futures::StreamExt;
use log::{info, warn};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::atoms::constants::{CITATION_TOP_N, MAX_KEYWORDS_PER_NODE};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{BuilderConfig, CancelToken, Citation, Node, Tree};
use crate::engine::models::embedding::Embedder;
use crate::engine::models::summarizer::Summarizer;
use crate::engine::tree::clustering::{perform_clustering, ClusteringParams};
use crate::engine::tree::keywords::KeywordExtractor;
use crate::engine::tree::persistence::save_tree;
use crate::engine::tree::splitter::TextSplitter;

// ═══════════════════════════════════════════════════════════════════════════
// Inputs
// ═══════════════════════════════════════════════════════════════════════════

/// A pre-chunked leaf input: text plus provenance.
#[derive(Debug, Clone, Default)]
pub struct ChunkInput {
    pub text: String,
    pub source_url: Option<String>,
    pub rel_path: Option<String>,
    pub doc_id: Option<String>,
    pub original_content_ref: Option<String>,
}

impl ChunkInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Default::default() }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

pub struct TreeBuilder {
    config: BuilderConfig,
    splitter: TextSplitter,
    embedders: BTreeMap<String, Arc<dyn Embedder>>,
    summarizer: Arc<dyn Summarizer>,
    keywords: Arc<KeywordExtractor>,
}

impl TreeBuilder {
    pub fn new(
        config: BuilderConfig,
        splitter: TextSplitter,
        embedders: BTreeMap<String, Arc<dyn Embedder>>,
        summarizer: Arc<dyn Summarizer>,
        keywords: Arc<KeywordExtractor>,
    ) -> EngineResult<Self> {
        if embedders.is_empty() {
            return Err(EngineError::Config("at least one embedder is required".into()));
        }
        if !embedders.contains_key(&config.cluster_embedding_model) {
            return Err(EngineError::Config(format!(
                "cluster_embedding_model '{}' is not among the configured embedders",
                config.cluster_embedding_model
            )));
        }
        Ok(Self { config, splitter, embedders, summarizer, keywords })
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn splitter(&self) -> &TextSplitter {
        &self.splitter
    }

    pub fn embedders(&self) -> &BTreeMap<String, Arc<dyn Embedder>> {
        &self.embedders
    }

    pub fn summarizer(&self) -> &Arc<dyn Summarizer> {
        &self.summarizer
    }

    pub fn keywords(&self) -> &Arc<KeywordExtractor> {
        &self.keywords
    }

    fn cluster_embedder(&self) -> &Arc<dyn Embedder> {
        self.embedders
            .get(&self.config.cluster_embedding_model)
            .expect("validated in constructor")
    }

    /// Split raw text and build a full tree from the resulting chunks.
    pub async fn build_from_text(&self, text: &str, cancel: &CancelToken) -> EngineResult<Tree> {
        let cluster_embedder = self.cluster_embedder().clone();
        let chunks = self
            .splitter
            .split(text, Some(&cluster_embedder))
            .await?
            .into_iter()
            .map(ChunkInput::text)
            .collect();
        self.build_from_chunks(chunks, cancel).await
    }

    /// Build a full tree from pre-chunked leaves (bypasses the splitter).
    pub async fn build_from_chunks(
        &self,
        chunks: Vec<ChunkInput>,
        cancel: &CancelToken,
    ) -> EngineResult<Tree> {
        if chunks.is_empty() {
            return Ok(Tree::default());
        }

        info!("[canopy:builder] creating {} leaf nodes", chunks.len());
        let mut leaves = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.into_iter().enumerate() {
            cancel.check()?;
            leaves.push(self.create_leaf(i as u64, chunk).await?);
        }

        let mut tree = Tree::from_leaves(leaves);
        self.construct_layers(&mut tree, cancel).await?;
        tree.rebuild_parent_ids();
        tree.validate()?;
        Ok(tree)
    }

    /// Create one leaf: embeddings for every configured model, keywords,
    /// provenance metadata.
    pub async fn create_leaf(&self, index: u64, chunk: ChunkInput) -> EngineResult<Node> {
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

    /// The layer loop. Appends layers to an existing leaves-only (or deeper)
    /// tree in place; also used by merge compaction.
    pub async fn construct_layers(
        &self,
        tree: &mut Tree,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let embed_key = &self.config.cluster_embedding_model;
        let max_layers =
            if self.config.auto_depth { self.config.max_layers } else { self.config.num_layers };

        let mut layer = tree.num_layers;
        while layer < max_layers {
            cancel.check()?;

            let current_ids = tree.sorted_layer(layer);
            info!(
                "[canopy:builder] constructing layer {} from {} nodes",
                layer + 1,
                current_ids.len()
            );

            if self.config.auto_depth
                && layer > 0
                && current_ids.len() <= self.config.target_top_nodes
            {
                info!(
                    "[canopy:builder] auto-depth stop: top layer size {} <= target {}",
                    current_ids.len(),
                    self.config.target_top_nodes
                );
                break;
            }

            if current_ids.len() <= self.config.reduction_dimension + 1 {
                info!(
                    "[canopy:builder] stop: {} nodes cannot support another layer",
                    current_ids.len()
                );
                break;
            }

            let vectors: Vec<(u64, Vec<f32>)> = current_ids
                .iter()
                .filter_map(|id| {
                    tree.all_nodes
                        .get(id)
                        .and_then(|n| n.embeddings.get(embed_key))
                        .map(|v| (*id, v.clone()))
                })
                .collect();
            if vectors.len() != current_ids.len() {
                return Err(EngineError::invalid_tree(format!(
                    "layer {} has nodes missing '{}' embeddings",
                    layer, embed_key
                )));
            }

            let clusters = perform_clustering(
                &vectors,
                self.config.reduction_dimension,
                &ClusteringParams { seed: self.config.clustering_seed, ..Default::default() },
            );
            let target_layer = layer + 1;
            let summarization_length = self
                .config
                .summarization_length
                .for_layer(target_layer, 120);
            info!(
                "[canopy:builder] layer {}: {} clusters, summary length {}",
                layer,
                clusters.len(),
                summarization_length
            );

            // Pre-assign indices in cluster order so concurrent completion
            // cannot perturb the resulting ids.
            let next_index = tree.next_index();
            let jobs: Vec<(u64, Vec<u64>)> = clusters
                .into_iter()
                .enumerate()
                .map(|(i, cluster)| (next_index + i as u64, cluster))
                .collect();

            let snapshot: &Tree = &*tree;
            let new_nodes: Vec<EngineResult<Node>> = futures::stream::iter(
                jobs.iter().map(|(index, cluster)| {
                    self.build_parent(
                        snapshot,
                        *index,
                        cluster,
                        target_layer,
                        summarization_length,
                        cancel,
                    )
                }),
            )
            .buffer_unordered(self.config.summary_max_workers.max(1))
            .collect()
            .await;

            cancel.check()?;

            let mut installed: BTreeMap<u64, Node> = BTreeMap::new();
            for result in new_nodes {
                let node = result?;
                installed.insert(node.index, node);
            }

            // Publication point: the layer becomes visible to readers when
            // it lands in layer_to_nodes.
            let ordered_ids: Vec<u64> = installed.keys().copied().collect();
            for (id, node) in installed {
                for child in node.children.iter() {
                    if let Some(c) = tree.all_nodes.get_mut(child) {
                        if !c.parent_ids.contains(&id) {
                            c.parent_ids.push(id);
                        }
                    }
                }
                tree.all_nodes.insert(id, node);
            }
            tree.layer_to_nodes.insert(target_layer, ordered_ids);
            tree.num_layers = target_layer;

            if let Some(dir) = &self.config.checkpoint_dir {
                let path = dir.join(format!("tree_layer_{}.bin", target_layer));
                match save_tree(tree, &path) {
                    Ok(()) => info!("[canopy:builder] checkpoint written: {}", path.display()),
                    Err(e) => warn!("[canopy:builder] checkpoint write failed: {}", e),
                }
            }

            layer = target_layer;
        }

        Ok(())
    }

    /// Summarize one cluster into a parent node.
    async fn build_parent(
        &self,
        tree: &Tree,
        index: u64,
        cluster: &[u64],
        target_layer: u32,
        summarization_length: usize,
        cancel: &CancelToken,
    ) -> EngineResult<Node> {
        cancel.check()?;

        let children: Vec<&Node> =
            cluster.iter().filter_map(|id| tree.all_nodes.get(id)).collect();
        let context = summary_context(&children);

        let summary = self
            .summarizer
            .summarize_layer(&context, target_layer as i32, summarization_length)
            .await?;

        let mut node = Node::leaf(index, summary);
        node.children = cluster.iter().copied().collect::<BTreeSet<u64>>();
        for (model_id, embedder) in &self.embedders {
            node.embeddings.insert(model_id.clone(), embedder.embed(&node.text).await?);
        }

        let child_keywords: Vec<String> =
            children.iter().flat_map(|c| c.keywords.iter().cloned()).collect();
        node.keywords =
            self.keywords.synthesize(&node.text, &child_keywords, MAX_KEYWORDS_PER_NODE).await;

        let (citations, total) = aggregate_provenance(&children);
        node.metadata.citations = citations;
        node.metadata.citation_total = total;

        Ok(node)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Summary context
// ═══════════════════════════════════════════════════════════════════════════

/// Remove repetitive provenance headers (added by ingest adapters) and noisy
/// templating shortcodes from text used for summarization context.
///
/// Stored node text is never mutated — this only shapes what the summarizer
/// sees, so higher-layer summaries aren't dominated by headers like
/// `# concepts/…\nSource: https://…`.
pub fn strip_provenance_and_shortcodes(text: &str) -> String {
    let s = text.trim();
    if s.is_empty() {
        return String::new();
    }
    let header_re =
        Regex::new(r"(?m)^\s*#\s+\S+\s*\n\s*Source:\s*\S+\s*\n+").expect("static regex");
    let shortcode_re =
        Regex::new(r"\{\{<[^>]*>\}\}|\{\{%[^%]*%\}\}").expect("static regex");
    let comment_re = Regex::new(r"(?s)<!--.*?-->").expect("static regex");
    let blank_re = Regex::new(r"\n{3,}").expect("static regex");

    let s = header_re.replace(s, "");
    let s = shortcode_re.replace_all(&s, "");
    let s = comment_re.replace_all(&s, "");
    blank_re.replace_all(&s, "\n\n").trim().to_string()
}

/// Concatenate child texts for summarization, one cleaned single-line block
/// per child.
pub fn summary_context(children: &[&Node]) -> String {
    let mut parts = Vec::with_capacity(children.len());
    for child in children {
        let cleaned = strip_provenance_and_shortcodes(&child.text);
        if !cleaned.is_empty() {
            parts.push(cleaned.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }
    parts.join("\n\n")
}

/// Aggregate child provenance into top-N citations plus a total count.
pub fn aggregate_provenance(children: &[&Node]) -> (Vec<Citation>, u64) {
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();
    let mut details: BTreeMap<String, (Option<String>, Option<String>)> = BTreeMap::new();
    let mut total = 0u64;

    for child in children {
        let source = child
            .original_content_ref
            .clone()
            .or_else(|| child.metadata.source_url.clone());
        let Some(source) = source else { continue };
        *counts.entry(source.clone()).or_insert(0) += 1;
        total += 1;
        details.entry(source).or_insert_with(|| {
            (child.metadata.rel_path.clone(), child.metadata.doc_id.clone())
        });
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    let citations = ranked
        .into_iter()
        .take(CITATION_TOP_N)
        .map(|(source, count)| {
            let (rel_path, doc_id) = details.remove(&source).unwrap_or((None, None));
            Citation { source, count, rel_path, doc_id }
        })
        .collect();

    (citations, total)
}

/// Citation-labelled context assembly: each unique source gets an `[N]`
/// label ahead of its chunk, plus a structured citation list for answers.
pub fn context_with_citations(nodes: &[&Node]) -> (String, Vec<(usize, String, Vec<u64>)>) {
    let mut source_to_index: BTreeMap<String, usize> = BTreeMap::new();
    let mut citations: Vec<(usize, String, Vec<u64>)> = Vec::new();
    let mut parts: Vec<String> = Vec::new();

    for node in nodes {
        let source = node
            .metadata
            .source_url
            .clone()
            .or_else(|| node.original_content_ref.clone());
        let text = node.text.split_whitespace().collect::<Vec<_>>().join(" ");

        match source {
            Some(source) => {
                let idx = match source_to_index.get(&source) {
                    Some(i) => {
                        citations[*i - 1].2.push(node.index);
                        *i
                    }
                    None => {
                        let idx = citations.len() + 1;
                        source_to_index.insert(source.clone(), idx);
                        citations.push((idx, source.clone(), vec![node.index]));
                        idx
                    }
                };
                let short = if source.len() > 80 {
                    format!("{}...", &source[..77])
                } else {
                    source
                };
                parts.push(format!("[{}] {}\n{}", idx, short, text));
            }
            None => parts.push(text),
        }
    }

    (parts.join("\n\n"), citations)
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::NodeMetadata;

    fn leaf_with_source(index: u64, text: &str, source: &str) -> Node {
        let mut node = Node::leaf(index, text);
        node.metadata = NodeMetadata::now();
        node.metadata.source_url = Some(source.to_string());
        node
    }

    #[test]
    fn strip_removes_provenance_header() {
        let text = "# concepts/scheduling\nSource: https://wiki/scheduling\n\nPods are scheduled by the kube-scheduler.";
        let cleaned = strip_provenance_and_shortcodes(text);
        assert!(!cleaned.contains("Source:"));
        assert!(cleaned.contains("kube-scheduler"));
    }

    #[test]
    fn strip_removes_shortcodes_and_comments() {
        let text = "Before {{< note >}} middle {{% warning %}} after <!-- hidden --> end";
        let cleaned = strip_provenance_and_shortcodes(text);
        assert!(!cleaned.contains("{{<"));
        assert!(!cleaned.contains("{{%"));
        assert!(!cleaned.contains("hidden"));
        assert!(cleaned.contains("Before"));
        assert!(cleaned.contains("end"));
    }

    #[test]
    fn strip_is_noop_on_clean_text() {
        assert_eq!(strip_provenance_and_shortcodes("plain text"), "plain text");
        assert_eq!(strip_provenance_and_shortcodes("  "), "");
    }

    #[test]
    fn summary_context_joins_cleaned_children() {
        let a = leaf_with_source(0, "first\nchild text", "https://a");
        let b = leaf_with_source(1, "second child", "https://b");
        let ctx = summary_context(&[&a, &b]);
        assert_eq!(ctx, "first child text\n\nsecond child");
    }

    #[test]
    fn provenance_aggregation_counts_and_ranks() {
        let a = leaf_with_source(0, "x", "https://runbooks/kafka");
        let b = leaf_with_source(1, "y", "https://runbooks/kafka");
        let c = leaf_with_source(2, "z", "https://wiki/redis");
        let d = Node::leaf(3, "no source");

        let (citations, total) = aggregate_provenance(&[&a, &b, &c, &d]);
        assert_eq!(total, 3);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].source, "https://runbooks/kafka");
        assert_eq!(citations[0].count, 2);
    }

    #[test]
    fn citation_context_labels_unique_sources() {
        let a = leaf_with_source(0, "alpha text", "https://a");
        let b = leaf_with_source(1, "beta text", "https://a");
        let c = leaf_with_source(2, "gamma text", "https://c");
        let (ctx, citations) = context_with_citations(&[&a, &b, &c]);
        assert!(ctx.contains("[1] https://a"));
        assert!(ctx.contains("[2] https://c"));
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].2, vec![0, 1]);
    }
}
