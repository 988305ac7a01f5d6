// ── Canopy Retrieval: Rerankers ────────────────────────────────────────────
//
// Second-stage scoring over fused strategy results:
//
//   importance  — w_sim·sim + w_imp·importance + w_fresh·freshness, then
//                 min_score filter and diversity constraints (per-source
//                 cap, pairwise content distance)
//   contextual  — boosts chunks overlapping recent conversation turns
//   recency     — boosts recently updated content inside incident windows
//   ensemble    — rank-position voting across member rerankers
//
// Freshness decays from 1.0 (validated/accessed within a week) down to 0.3
// past the configured decay window.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::atoms::retrieval_types::{RerankConfig, RetrievedChunk};
use crate::engine::tree::forest::TreeForest;

#[async_trait]
pub trait Reranker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rerank(
        &self,
        chunks: Vec<RetrievedChunk>,
        query: &str,
        top_k: usize,
        forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk>;
}

fn sort_by_score(chunks: &mut [RetrievedChunk]) {
    chunks.sort_by(|a, b| {
        b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Word-level Jaccard similarity, the cheap proxy for content distance.
fn word_jaccard(a: &str, b: &str) -> f32 {
    let wa: std::collections::BTreeSet<&str> = a.split_whitespace().collect();
    let wb: std::collections::BTreeSet<&str> = b.split_whitespace().collect();
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let inter = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    if union == 0 {
        0.0
    } else {
        inter as f32 / union as f32
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Importance reranker
// ═══════════════════════════════════════════════════════════════════════════

pub struct ImportanceReranker {
    config: RerankConfig,
}

impl ImportanceReranker {
    pub fn new(config: RerankConfig) -> Self {
        Self { config }
    }

    fn freshness_of(&self, chunk: &RetrievedChunk, forest: Option<&TreeForest>) -> f32 {
        let last = forest
            .and_then(|f| f.get_tree(&chunk.tree_id))
            .and_then(|tree| {
                let guard = tree.read();
                guard.all_nodes.get(&chunk.node_id).map(|n| {
                    n.metadata
                        .validated_at
                        .unwrap_or(n.metadata.updated_at)
                })
            })
            .or_else(|| {
                chunk
                    .metadata
                    .get("updated_at")
                    .and_then(|v| v.as_str())
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&chrono::Utc))
            });

        let Some(last) = last else { return 0.5 };
        let age_days = (chrono::Utc::now() - last).num_days();
        let decay_days = self.config.freshness_decay_days.max(31);
        if age_days <= 7 {
            1.0
        } else if age_days <= 30 {
            0.9
        } else if age_days <= decay_days {
            let progress = (age_days - 30) as f32 / (decay_days - 30) as f32;
            0.8 - 0.5 * progress
        } else {
            0.3
        }
    }

    fn apply_diversity(&self, chunks: Vec<RetrievedChunk>, top_k: usize) -> Vec<RetrievedChunk> {
        let mut selected: Vec<RetrievedChunk> = Vec::new();
        let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();

        for chunk in chunks {
            if selected.len() >= top_k {
                break;
            }

            let source = chunk
                .metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            if source_counts.get(&source).copied().unwrap_or(0) >= self.config.max_same_source {
                continue;
            }

            if self.config.min_diversity_distance > 0.0 {
                let too_close = selected.iter().any(|s| {
                    1.0 - word_jaccard(&s.text, &chunk.text) < self.config.min_diversity_distance
                });
                if too_close {
                    continue;
                }
            }

            *source_counts.entry(source).or_insert(0) += 1;
            selected.push(chunk);
        }

        selected
    }
}

#[async_trait]
impl Reranker for ImportanceReranker {
    fn name(&self) -> &'static str {
        "importance"
    }

    async fn rerank(
        &self,
        chunks: Vec<RetrievedChunk>,
        _query: &str,
        top_k: usize,
        forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk> {
        let mut scored: Vec<RetrievedChunk> = chunks
            .into_iter()
            .map(|mut chunk| {
                let freshness = self.freshness_of(&chunk, forest);
                chunk.score = self.config.similarity_weight * chunk.score
                    + self.config.importance_weight * chunk.importance
                    + self.config.freshness_weight * freshness;
                chunk
            })
            .filter(|c| c.score >= self.config.min_score)
            .collect();

        sort_by_score(&mut scored);
        self.apply_diversity(scored, top_k)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Contextual reranker
// ═══════════════════════════════════════════════════════════════════════════

/// Considers recent conversation turns; useful for follow-up questions.
pub struct ContextualReranker {
    context_weight: f32,
    max_context_turns: usize,
    turns: Mutex<Vec<String>>,
}

impl ContextualReranker {
    pub fn new(context_weight: f32, max_context_turns: usize) -> Self {
        Self { context_weight, max_context_turns, turns: Mutex::new(Vec::new()) }
    }

    pub fn add_context(&self, turn: impl Into<String>) {
        let mut turns = self.turns.lock();
        turns.push(turn.into());
        if turns.len() > self.max_context_turns {
            turns.remove(0);
        }
    }

    pub fn clear_context(&self) {
        self.turns.lock().clear();
    }
}

#[async_trait]
impl Reranker for ContextualReranker {
    fn name(&self) -> &'static str {
        "contextual"
    }

    async fn rerank(
        &self,
        mut chunks: Vec<RetrievedChunk>,
        _query: &str,
        top_k: usize,
        _forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk> {
        let context = self.turns.lock().join(" ").to_lowercase();
        if !context.is_empty() {
            let context_words: std::collections::BTreeSet<&str> =
                context.split_whitespace().collect();
            for chunk in chunks.iter_mut() {
                let text = chunk.text.to_lowercase();
                let overlap = text
                    .split_whitespace()
                    .filter(|w| context_words.contains(w))
                    .count();
                if overlap > 0 {
                    chunk.score += (overlap as f32 * 0.05).min(0.2) * self.context_weight;
                }
            }
        }
        sort_by_score(&mut chunks);
        chunks.truncate(top_k);
        chunks
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Recency-boost reranker
// ═══════════════════════════════════════════════════════════════════════════

/// Boosts content updated inside the boost window. Freshness is critical
/// during incidents.
pub struct RecencyBoostReranker {
    pub boost_window_hours: i64,
    pub max_boost: f32,
}

impl Default for RecencyBoostReranker {
    fn default() -> Self {
        Self { boost_window_hours: 24, max_boost: 0.3 }
    }
}

#[async_trait]
impl Reranker for RecencyBoostReranker {
    fn name(&self) -> &'static str {
        "recency_boost"
    }

    async fn rerank(
        &self,
        mut chunks: Vec<RetrievedChunk>,
        _query: &str,
        top_k: usize,
        _forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk> {
        let now = chrono::Utc::now();
        for chunk in chunks.iter_mut() {
            let updated = chunk
                .metadata
                .get("updated_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc));
            if let Some(updated) = updated {
                let hours_ago = (now - updated).num_minutes() as f32 / 60.0;
                if hours_ago >= 0.0 && hours_ago < self.boost_window_hours as f32 {
                    chunk.score +=
                        self.max_boost * (1.0 - hours_ago / self.boost_window_hours as f32);
                }
            }
        }
        sort_by_score(&mut chunks);
        chunks.truncate(top_k);
        chunks
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Cross-encoder reranker
// ═══════════════════════════════════════════════════════════════════════════

/// Joint query+document scoring through the structured LLM. More accurate
/// than bi-encoder similarity and much more expensive; use on short
/// candidate lists. Without a model this is a pass-through sort.
pub struct CrossEncoderReranker {
    llm: Option<Arc<dyn crate::engine::models::llm::StructuredLlm>>,
    batch_size: usize,
}

impl CrossEncoderReranker {
    pub fn new(llm: Option<Arc<dyn crate::engine::models::llm::StructuredLlm>>) -> Self {
        Self { llm, batch_size: 16 }
    }

    async fn score_batch(
        &self,
        llm: &Arc<dyn crate::engine::models::llm::StructuredLlm>,
        query: &str,
        batch: &[RetrievedChunk],
    ) -> Option<Vec<f32>> {
        let docs = batch
            .iter()
            .enumerate()
            .map(|(i, c)| format!("[{i}] {}", c.text.chars().take(400).collect::<String>()))
            .collect::<Vec<_>>()
            .join("\n\n");
        let value = llm
            .complete_structured(
                "You score how well each document answers a query.",
                &format!(
                    "Query: {query}\n\nDocuments:\n{docs}\n\nScore each document's \
                     relevance from 0.0 to 1.0, in order."
                ),
                "[0.0, ...]",
                256,
            )
            .await
            .ok()?;
        let arr = value.as_array()?;
        if arr.len() != batch.len() {
            return None;
        }
        Some(
            arr.iter()
                .map(|v| v.as_f64().unwrap_or(0.5) as f32)
                .map(|s| s.clamp(0.0, 1.0))
                .collect(),
        )
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &'static str {
        "cross_encoder"
    }

    async fn rerank(
        &self,
        mut chunks: Vec<RetrievedChunk>,
        query: &str,
        top_k: usize,
        _forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk> {
        if let Some(llm) = &self.llm {
            let mut offset = 0;
            while offset < chunks.len() {
                let end = (offset + self.batch_size).min(chunks.len());
                if let Some(scores) = self.score_batch(llm, query, &chunks[offset..end]).await {
                    for (chunk, model_score) in chunks[offset..end].iter_mut().zip(scores) {
                        chunk.score = 0.7 * model_score + 0.3 * chunk.score;
                    }
                }
                offset = end;
            }
        }
        sort_by_score(&mut chunks);
        chunks.truncate(top_k);
        chunks
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ensemble reranker
// ═══════════════════════════════════════════════════════════════════════════

/// Rank-position voting across member rerankers.
pub struct EnsembleReranker {
    rerankers: Vec<Arc<dyn Reranker>>,
    weights: Vec<f32>,
}

impl EnsembleReranker {
    pub fn new(rerankers: Vec<Arc<dyn Reranker>>, weights: Option<Vec<f32>>) -> Self {
        let weights = weights
            .unwrap_or_else(|| vec![1.0 / rerankers.len().max(1) as f32; rerankers.len()]);
        assert_eq!(weights.len(), rerankers.len(), "one weight per reranker");
        Self { rerankers, weights }
    }

    /// The default stack: the importance reranker alone.
    pub fn standard(config: RerankConfig) -> Self {
        Self::new(vec![Arc::new(ImportanceReranker::new(config))], None)
    }
}

#[async_trait]
impl Reranker for EnsembleReranker {
    fn name(&self) -> &'static str {
        "ensemble"
    }

    async fn rerank(
        &self,
        chunks: Vec<RetrievedChunk>,
        query: &str,
        top_k: usize,
        forest: Option<&TreeForest>,
    ) -> Vec<RetrievedChunk> {
        if self.rerankers.len() == 1 {
            return self.rerankers[0].rerank(chunks, query, top_k, forest).await;
        }

        let mut votes: BTreeMap<(String, u64), f32> = BTreeMap::new();
        for (reranker, weight) in self.rerankers.iter().zip(self.weights.iter()) {
            let ranked =
                reranker.rerank(chunks.clone(), query, chunks.len().max(1), forest).await;
            let n = ranked.len().max(1) as f32;
            for (position, chunk) in ranked.into_iter().enumerate() {
                let rank_score = 1.0 - position as f32 / n;
                *votes.entry((chunk.tree_id, chunk.node_id)).or_insert(0.0) +=
                    rank_score * weight;
            }
        }

        let mut out: Vec<RetrievedChunk> = chunks
            .into_iter()
            .filter_map(|mut chunk| {
                let vote = votes.get(&(chunk.tree_id.clone(), chunk.node_id))?;
                chunk.score = *vote;
                Some(chunk)
            })
            .collect();
        sort_by_score(&mut out);
        out.truncate(top_k);
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
