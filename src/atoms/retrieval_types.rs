// ── Canopy Atoms: Retrieval Types ──────────────────────────────────────────
//
// Query analysis, retrieved chunks, retrieval/rerank configuration, and the
// observation records consumed by the importance updater. Pure data; the
// strategies and orchestration live in engine/retrieval.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Query analysis
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    #[default]
    Factual,
    Procedural,
    Troubleshooting,
    Exploratory,
    Comparative,
    Relational,
    Temporal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub original_query: String,
    pub intent: QueryIntent,
    /// Entity names the graph recognized in the query.
    #[serde(default)]
    pub entities_mentioned: Vec<String>,
    /// Content keywords with stopwords removed.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Scope hints like service or environment names.
    #[serde(default)]
    pub scope_hints: Vec<String>,
    /// 0–1; higher urgency steers mode selection toward incident handling.
    pub urgency: f32,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Retrieved chunks
// ═══════════════════════════════════════════════════════════════════════════

/// A chunk surfaced by one retrieval strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub node_id: u64,
    pub tree_id: String,
    pub text: String,
    /// Base similarity (or strategy-specific) score.
    pub score: f32,
    /// Importance carried from the node.
    pub importance: f32,
    /// Which strategy found this chunk.
    pub strategy: String,
    /// Tree layer the node lives at (0 = leaf).
    pub tree_level: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl RetrievedChunk {
    /// Similarity dominates; importance contributes 30%.
    pub fn combined_score(&self) -> f32 {
        0.7 * self.score + 0.3 * self.importance
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Configuration
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Balanced strategy selection by query intent.
    #[default]
    Standard,
    /// Single cheap strategy, speed over quality.
    Fast,
    /// Every applicable strategy, quality over speed.
    Thorough,
    /// Incident response: runbooks and past incidents first.
    Incident,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankConfig {
    pub similarity_weight: f32,
    pub importance_weight: f32,
    pub freshness_weight: f32,
    pub diversity_weight: f32,
    /// Chunks scoring below this are dropped.
    pub min_score: f32,
    /// Freshness bottoms out at 0.3 past this age.
    pub freshness_decay_days: i64,
    /// At most this many results per source.
    pub max_same_source: usize,
    /// Minimum pairwise content distance (1 − Jaccard) between results;
    /// 0 disables the check.
    pub min_diversity_distance: f32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            similarity_weight: 0.4,
            importance_weight: 0.3,
            freshness_weight: 0.15,
            diversity_weight: 0.15,
            min_score: 0.1,
            freshness_decay_days: 90,
            max_same_source: 3,
            min_diversity_distance: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub default_mode: RetrievalMode,
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub enable_reranking: bool,
    pub rerank: RerankConfig,
    /// Run selected strategies concurrently under one wall-clock budget.
    pub parallel_strategies: bool,
    pub timeout_seconds: f64,
    pub record_observations: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_mode: RetrievalMode::Standard,
            default_top_k: 10,
            max_top_k: 50,
            enable_reranking: true,
            rerank: RerankConfig::default(),
            parallel_strategies: true,
            timeout_seconds: 10.0,
            record_observations: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Results
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub analysis: QueryAnalysis,
    pub chunks: Vec<RetrievedChunk>,
    pub mode: RetrievalMode,
    pub strategies_used: Vec<String>,
    /// Candidate count before reranking.
    pub total_candidates: usize,
    pub retrieval_time_ms: f64,
    /// True when the timeout expired and only partial strategy results were
    /// fused.
    pub degraded: bool,
}

impl RetrievalResult {
    pub fn texts(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }

    pub fn top_text(&self) -> Option<&str> {
        self.chunks.first().map(|c| c.text.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 5: Observations
// ═══════════════════════════════════════════════════════════════════════════

/// Append-only record of retrieval outcomes and teaching events, consumed
/// asynchronously by the importance updater.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    QuerySuccess {
        query: String,
        node_ids: Vec<u64>,
        top_score: f32,
        ts: chrono::DateTime<chrono::Utc>,
    },
    QueryFailure {
        query: String,
        partial_matches: Vec<u64>,
        ts: chrono::DateTime<chrono::Utc>,
    },
    Teach {
        content: String,
        source: String,
        ts: chrono::DateTime<chrono::Utc>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_score_weighting() {
        let chunk = RetrievedChunk {
            node_id: 1,
            tree_id: "t".into(),
            text: "x".into(),
            score: 1.0,
            importance: 0.0,
            strategy: "s".into(),
            tree_level: 0,
            metadata: BTreeMap::new(),
        };
        assert!((chunk.combined_score() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn rerank_defaults_sum_to_one() {
        let cfg = RerankConfig::default();
        let total = cfg.similarity_weight
            + cfg.importance_weight
            + cfg.freshness_weight
            + cfg.diversity_weight;
        assert!((total - 1.0).abs() < 1e-6);
    }
}
