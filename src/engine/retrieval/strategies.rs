// ── Canopy Retrieval: Strategy Ensemble ────────────────────────────────────
//
// Five ways of finding relevant chunks, combined by the retriever:
//
//   multi_query       — expand into variations, union keep-max
//   hyde              — embed a hypothetical answer document
//   adaptive_depth    — pick a start layer by intent, move up on poor
//                       quality and down on medium quality
//   hybrid_graph_tree — graph expansion + direct tree search, weighted
//   incident_aware    — runbook symptoms + resolved incidents + tree search
//
// Strategies never error the whole query: a strategy that cannot run
// (missing graph, missing LLM) degrades to whatever signal it has.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;

use crate::atoms::error::EngineResult;
use crate::atoms::graph_types::EntityType;
use crate::atoms::retrieval_types::{QueryAnalysis, QueryIntent, RetrievedChunk};
use crate::engine::retrieval::{
    chunks_for_node_ids, fuse_keep_max, search_with_embedding, LayerFilter, RetrievalContext,
};

#[async_trait]
pub trait RetrievalStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>>;
}

fn sort_and_truncate(mut chunks: Vec<RetrievedChunk>, top_k: usize) -> Vec<RetrievedChunk> {
    chunks.sort_by(|a, b| {
        b.combined_score()
            .partial_cmp(&a.combined_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    chunks.truncate(top_k);
    chunks
}

// ═══════════════════════════════════════════════════════════════════════════
// Multi-query
// ═══════════════════════════════════════════════════════════════════════════

pub struct MultiQueryStrategy {
    pub num_variations: usize,
}

impl Default for MultiQueryStrategy {
    fn default() -> Self {
        Self { num_variations: 3 }
    }
}

impl MultiQueryStrategy {
    /// LLM expansion when available, heuristic reformulations otherwise.
    async fn expand(&self, analysis: &QueryAnalysis, ctx: &RetrievalContext) -> Vec<String> {
        let mut variations = vec![analysis.original_query.clone()];

        if let Some(llm) = &ctx.llm {
            let asked = llm
                .complete_structured(
                    "You rephrase search queries to widen recall.",
                    &format!(
                        "Generate {} different ways to ask: {}",
                        self.num_variations, analysis.original_query
                    ),
                    "[\"variation\", ...]",
                    256,
                )
                .await;
            if let Ok(value) = asked {
                if let Some(arr) = value.as_array() {
                    variations.extend(
                        arr.iter().filter_map(|v| v.as_str().map(str::to_string)),
                    );
                }
            }
        }

        if variations.len() == 1 {
            let joined = analysis.keywords.join(" ");
            if !joined.is_empty() {
                variations.push(joined.clone());
            }
            match analysis.intent {
                QueryIntent::Procedural => {
                    variations.push(format!("steps procedure guide {joined}"))
                }
                QueryIntent::Troubleshooting => {
                    variations.push(format!("error fix solution {joined}"))
                }
                QueryIntent::Relational => {
                    variations.push(format!("owner team responsible {joined}"))
                }
                _ => {}
            }
        }

        variations.truncate(self.num_variations + 1);
        variations
    }
}

#[async_trait]
impl RetrievalStrategy for MultiQueryStrategy {
    fn name(&self) -> &'static str {
        "multi_query"
    }

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let variations = self.expand(analysis, ctx).await;
        debug!("[retrieval:multi_query] {} variations", variations.len());

        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();
        for variation in variations {
            let embedding = ctx.embedder.embed(&variation).await?;
            let chunks =
                search_with_embedding(ctx, &embedding, LayerFilter::Any, top_k, self.name());
            fuse_keep_max(&mut fused, chunks);
        }

        Ok(sort_and_truncate(fused.into_values().collect(), top_k))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// HyDE
// ═══════════════════════════════════════════════════════════════════════════

pub struct HydeStrategy;

impl HydeStrategy {
    /// The hypothesis should read like an ideal document answering the
    /// query — that bridges question-space and document-space embeddings.
    async fn hypothesis(&self, analysis: &QueryAnalysis, ctx: &RetrievalContext) -> String {
        if let Some(llm) = &ctx.llm {
            let asked = llm
                .complete_structured(
                    "You draft short hypothetical documents for retrieval.",
                    &format!(
                        "Write a short document that would answer: {}",
                        analysis.original_query
                    ),
                    r#"{"document": "..."}"#,
                    512,
                )
                .await;
            if let Ok(value) = asked {
                if let Some(doc) = value.get("document").and_then(|v| v.as_str()) {
                    if !doc.trim().is_empty() {
                        return doc.trim().to_string();
                    }
                }
            }
        }

        let topic = analysis.keywords.join(" ");
        match analysis.intent {
            QueryIntent::Procedural => format!(
                "Procedure for {topic}: first prepare the environment, then perform each \
                 step in order, finally verify the outcome."
            ),
            QueryIntent::Troubleshooting => format!(
                "Troubleshooting {topic}: common causes include configuration drift and \
                 resource exhaustion. Check the logs, verify configuration, restart the \
                 affected service."
            ),
            _ => format!(
                "Information about {topic}: key concepts, constraints, and how the parts \
                 relate to each other."
            ),
        }
    }
}

#[async_trait]
impl RetrievalStrategy for HydeStrategy {
    fn name(&self) -> &'static str {
        "hyde"
    }

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let hypothesis = self.hypothesis(analysis, ctx).await;
        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();

        let hyde_embedding = ctx.embedder.embed(&hypothesis).await?;
        fuse_keep_max(
            &mut fused,
            search_with_embedding(ctx, &hyde_embedding, LayerFilter::Any, top_k, self.name()),
        );

        // The original query still runs; union keeps the best of both.
        let query_embedding = ctx.embedder.embed(&analysis.original_query).await?;
        fuse_keep_max(
            &mut fused,
            search_with_embedding(ctx, &query_embedding, LayerFilter::Any, top_k, self.name()),
        );

        Ok(sort_and_truncate(fused.into_values().collect(), top_k))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Adaptive depth
// ═══════════════════════════════════════════════════════════════════════════

pub struct AdaptiveDepthStrategy {
    pub min_depth: u32,
    pub max_depth: u32,
    pub quality_threshold: f32,
}

impl Default for AdaptiveDepthStrategy {
    fn default() -> Self {
        Self { min_depth: 0, max_depth: 5, quality_threshold: 0.7 }
    }
}

impl AdaptiveDepthStrategy {
    fn start_depth(&self, intent: QueryIntent) -> u32 {
        match intent {
            // Specific queries start at the leaves.
            QueryIntent::Factual | QueryIntent::Troubleshooting => 0,
            // Broad queries start at summaries.
            QueryIntent::Exploratory => 2,
            // Comparative needs both specific and summary views.
            QueryIntent::Comparative => 1,
            _ => 1,
        }
    }
}

#[async_trait]
impl RetrievalStrategy for AdaptiveDepthStrategy {
    fn name(&self) -> &'static str {
        "adaptive_depth"
    }

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let embedding = ctx.embedder.embed(&analysis.original_query).await?;

        let mut collected: Vec<RetrievedChunk> = Vec::new();
        let mut depth = self.start_depth(analysis.intent).min(self.max_depth);
        let mut visited_depths = std::collections::BTreeSet::new();

        loop {
            if !visited_depths.insert(depth) {
                break;
            }
            let chunks = search_with_embedding(
                ctx,
                &embedding,
                LayerFilter::Exact(depth),
                top_k,
                self.name(),
            );
            let avg_score = if chunks.is_empty() {
                0.0
            } else {
                chunks.iter().map(|c| c.score).sum::<f32>() / chunks.len() as f32
            };
            debug!(
                "[retrieval:adaptive] depth {} avg score {:.3} ({} chunks)",
                depth,
                avg_score,
                chunks.len()
            );

            if avg_score >= self.quality_threshold {
                collected.extend(chunks);
                break;
            } else if avg_score < 0.3 {
                // Poor quality: go higher, more abstract.
                if depth >= self.max_depth {
                    break;
                }
                depth += 1;
            } else {
                // Medium quality: keep these and go more specific.
                collected.extend(chunks);
                if depth == self.min_depth {
                    break;
                }
                depth -= 1;
            }
        }

        // Dedup across depths, keep best score per node.
        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();
        fuse_keep_max(&mut fused, collected);
        Ok(sort_and_truncate(fused.into_values().collect(), top_k))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Hybrid graph + tree
// ═══════════════════════════════════════════════════════════════════════════

pub struct HybridGraphTreeStrategy {
    pub graph_weight: f32,
    pub tree_weight: f32,
    pub expansion_hops: usize,
}

impl Default for HybridGraphTreeStrategy {
    fn default() -> Self {
        Self { graph_weight: 0.4, tree_weight: 0.6, expansion_hops: 2 }
    }
}

#[async_trait]
impl RetrievalStrategy for HybridGraphTreeStrategy {
    fn name(&self) -> &'static str {
        "hybrid_graph_tree"
    }

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();

        // Graph side: expand from recognized entities to their node ids.
        if let Some(graph) = &ctx.graph {
            let node_ids: Vec<u64> = {
                let guard = graph.read();
                let mut ids = std::collections::BTreeSet::new();
                for entity_id in &analysis.entities_mentioned {
                    ids.extend(guard.expand_to_node_ids(entity_id, self.expansion_hops, None));
                }
                ids.into_iter().collect()
            };
            if !node_ids.is_empty() {
                // Graph-derived chunks get a high base score, then the
                // graph weight.
                let mut chunks =
                    chunks_for_node_ids(ctx, &node_ids, 0.8, self.name());
                for chunk in chunks.iter_mut() {
                    chunk.score *= self.graph_weight;
                }
                fuse_keep_max(&mut fused, chunks);
            }
        }

        // Tree side: direct similarity, weighted; overlapping nodes combine.
        let embedding = ctx.embedder.embed(&analysis.original_query).await?;
        let tree_chunks =
            search_with_embedding(ctx, &embedding, LayerFilter::Any, top_k * 2, self.name());
        for mut chunk in tree_chunks {
            let key = (chunk.tree_id.clone(), chunk.node_id);
            match fused.get_mut(&key) {
                Some(existing) => existing.score += chunk.score * self.tree_weight,
                None => {
                    chunk.score *= self.tree_weight;
                    fused.insert(key, chunk);
                }
            }
        }

        Ok(sort_and_truncate(fused.into_values().collect(), top_k))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Incident-aware
// ═══════════════════════════════════════════════════════════════════════════

pub struct IncidentAwareStrategy {
    pub symptom_weight: f32,
    pub recency_weight: f32,
    pub success_weight: f32,
}

impl Default for IncidentAwareStrategy {
    fn default() -> Self {
        Self { symptom_weight: 0.4, recency_weight: 0.3, success_weight: 0.3 }
    }
}

impl IncidentAwareStrategy {
    /// Match query words against `Runbook.symptoms` properties.
    fn runbook_node_scores(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
    ) -> Vec<(u64, f32)> {
        let Some(graph) = &ctx.graph else { return Vec::new() };
        let guard = graph.read();
        let query = analysis.original_query.to_lowercase();

        let mut out = Vec::new();
        for runbook in guard.entities_by_type(EntityType::Runbook) {
            let symptoms: Vec<String> = runbook
                .properties
                .get("symptoms")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter().filter_map(|s| s.as_str().map(str::to_lowercase)).collect()
                })
                .unwrap_or_default();

            let mut matches = 0usize;
            for symptom in &symptoms {
                if symptom.split_whitespace().any(|w| query.contains(w)) {
                    matches += 1;
                }
            }
            if matches > 0 {
                let score = (matches as f32 * 0.3).min(1.0) * self.symptom_weight;
                for node_id in &runbook.node_ids {
                    out.push((*node_id, score));
                }
            }
        }
        out
    }

    /// Resolved incidents with word overlap against the query.
    fn incident_node_scores(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
    ) -> Vec<(u64, f32)> {
        let Some(graph) = &ctx.graph else { return Vec::new() };
        let guard = graph.read();
        let query_words: std::collections::BTreeSet<String> = analysis
            .original_query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let mut out = Vec::new();
        for incident in guard.entities_by_type(EntityType::Incident) {
            if incident.prop_str("status") != Some("resolved") {
                continue;
            }
            let text = format!(
                "{} {}",
                incident.name,
                incident.description.as_deref().unwrap_or_default()
            )
            .to_lowercase();
            let incident_words: std::collections::BTreeSet<String> =
                text.split_whitespace().map(str::to_string).collect();
            let overlap = query_words.intersection(&incident_words).count();
            if overlap >= 2 {
                let recency = self.recency_weight;
                let success = self.success_weight;
                let score = ((overlap as f32 * 0.2).min(1.0)) * (recency + success);
                for node_id in &incident.node_ids {
                    out.push((*node_id, score));
                }
            }
        }
        out
    }
}

#[async_trait]
impl RetrievalStrategy for IncidentAwareStrategy {
    fn name(&self) -> &'static str {
        "incident_aware"
    }

    async fn retrieve(
        &self,
        analysis: &QueryAnalysis,
        ctx: &RetrievalContext,
        top_k: usize,
    ) -> EngineResult<Vec<RetrievedChunk>> {
        // Outside incident context this behaves like the hybrid strategy.
        if analysis.intent != QueryIntent::Troubleshooting {
            return HybridGraphTreeStrategy::default().retrieve(analysis, ctx, top_k).await;
        }

        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();

        let mut scored: Vec<(u64, f32)> = self.runbook_node_scores(analysis, ctx);
        scored.extend(self.incident_node_scores(analysis, ctx));
        for (node_id, score) in scored {
            let chunks = chunks_for_node_ids(ctx, &[node_id], score, self.name());
            fuse_keep_max(&mut fused, chunks);
        }

        // Supplement with direct tree search.
        let embedding = ctx.embedder.embed(&analysis.original_query).await?;
        fuse_keep_max(
            &mut fused,
            search_with_embedding(ctx, &embedding, LayerFilter::Any, top_k, self.name()),
        );

        Ok(sort_and_truncate(fused.into_values().collect(), top_k))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
