// ── Canopy Retrieval: Orchestrator ─────────────────────────────────────────
//
// The main retrieval entry point:
//   1. analyze the query
//   2. select strategies by mode and intent (troubleshooting with high
//      urgency overrides into incident mode)
//   3. run the strategies — concurrently under one wall-clock budget, or
//      sequentially — and fuse results keep-max-per-node
//   4. rerank, record the observation, return
//
// A timeout never errors: completed strategies contribute their results and
// the response is marked degraded. An empty forest yields an empty result.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

use crate::atoms::error::EngineResult;
use crate::atoms::retrieval_types::{
    QueryAnalysis, QueryIntent, RetrievalConfig, RetrievalMode, RetrievalResult, RetrievedChunk,
};
use crate::atoms::types::CancelToken;
use crate::engine::retrieval::observations::ObservationSink;
use crate::engine::retrieval::query::analyze_query;
use crate::engine::retrieval::reranker::{EnsembleReranker, Reranker};
use crate::engine::retrieval::strategies::{
    AdaptiveDepthStrategy, HybridGraphTreeStrategy, HydeStrategy, IncidentAwareStrategy,
    MultiQueryStrategy, RetrievalStrategy,
};
use crate::engine::retrieval::{fuse_keep_max, RetrievalContext};

#[derive(Debug, Default, Clone)]
pub struct RetrieverStats {
    pub query_count: usize,
    pub total_retrieval_time_ms: f64,
}

impl RetrieverStats {
    pub fn average_retrieval_time_ms(&self) -> f64 {
        if self.query_count == 0 {
            0.0
        } else {
            self.total_retrieval_time_ms / self.query_count as f64
        }
    }
}

pub struct Retriever {
    ctx: Arc<RetrievalContext>,
    config: RetrievalConfig,
    strategies: BTreeMap<&'static str, Arc<dyn RetrievalStrategy>>,
    reranker: Arc<dyn Reranker>,
    observations: Option<Arc<ObservationSink>>,
    stats: Mutex<RetrieverStats>,
}

impl Retriever {
    pub fn new(ctx: RetrievalContext, config: RetrievalConfig) -> Self {
        let mut strategies: BTreeMap<&'static str, Arc<dyn RetrievalStrategy>> = BTreeMap::new();
        strategies.insert("multi_query", Arc::new(MultiQueryStrategy::default()));
        strategies.insert("hyde", Arc::new(HydeStrategy));
        strategies.insert("adaptive_depth", Arc::new(AdaptiveDepthStrategy::default()));
        strategies.insert("hybrid", Arc::new(HybridGraphTreeStrategy::default()));
        strategies.insert("incident", Arc::new(IncidentAwareStrategy::default()));

        let reranker: Arc<dyn Reranker> =
            Arc::new(EnsembleReranker::standard(config.rerank.clone()));

        Self {
            ctx: Arc::new(ctx),
            config,
            strategies,
            reranker,
            observations: None,
            stats: Mutex::new(RetrieverStats::default()),
        }
    }

    pub fn with_observations(mut self, sink: Arc<ObservationSink>) -> Self {
        self.observations = Some(sink);
        self
    }

    pub fn set_reranker(&mut self, reranker: Arc<dyn Reranker>) {
        info!("[retrieval] reranker set: {}", reranker.name());
        self.reranker = reranker;
    }

    pub fn add_strategy(&mut self, name: &'static str, strategy: Arc<dyn RetrievalStrategy>) {
        info!("[retrieval] custom strategy added: {}", name);
        self.strategies.insert(name, strategy);
    }

    pub fn stats(&self) -> RetrieverStats {
        self.stats.lock().clone()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Main entry point
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn retrieve(
        &self,
        query: &str,
        top_k: Option<usize>,
        mode: Option<RetrievalMode>,
        cancel: &CancelToken,
    ) -> EngineResult<RetrievalResult> {
        let started = Instant::now();
        self.stats.lock().query_count += 1;

        let top_k = top_k.unwrap_or(self.config.default_top_k).min(self.config.max_top_k);
        let analysis = analyze_query(query, self.ctx.graph.as_ref());

        // Explicit mode wins; otherwise urgent troubleshooting goes incident.
        let mode = match mode {
            Some(explicit) => explicit,
            None if analysis.intent == QueryIntent::Troubleshooting
                && analysis.urgency > 0.7 =>
            {
                RetrievalMode::Incident
            }
            None => self.config.default_mode,
        };

        let selected = self.select_strategies(mode, &analysis);
        let strategies_used: Vec<String> =
            selected.iter().map(|(name, _)| name.to_string()).collect();

        cancel.check()?;
        let want = top_k * 2;
        let (fused, degraded) = if self.config.parallel_strategies && selected.len() > 1 {
            self.parallel_retrieve(&selected, &analysis, want).await
        } else {
            self.sequential_retrieve(&selected, &analysis, want, cancel).await?
        };

        let candidates: Vec<RetrievedChunk> = fused.into_values().collect();
        let total_candidates = candidates.len();

        let chunks = if self.config.enable_reranking && !candidates.is_empty() {
            self.reranker.rerank(candidates, query, top_k, Some(&self.ctx.forest)).await
        } else {
            let mut sorted = candidates;
            sorted.sort_by(|a, b| {
                b.combined_score()
                    .partial_cmp(&a.combined_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            sorted.truncate(top_k);
            sorted
        };

        let retrieval_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.stats.lock().total_retrieval_time_ms += retrieval_time_ms;

        let result = RetrievalResult {
            query: query.to_string(),
            analysis,
            chunks,
            mode,
            strategies_used,
            total_candidates,
            retrieval_time_ms,
            degraded,
        };

        if self.config.record_observations {
            self.record_observation(&result);
        }

        info!(
            "[retrieval] {} chunks for '{}' in {:.1}ms (mode {:?}{})",
            result.chunks.len(),
            &query.chars().take(50).collect::<String>(),
            retrieval_time_ms,
            mode,
            if degraded { ", degraded" } else { "" }
        );
        Ok(result)
    }

    fn select_strategies(
        &self,
        mode: RetrievalMode,
        analysis: &QueryAnalysis,
    ) -> Vec<(&'static str, Arc<dyn RetrievalStrategy>)> {
        let pick = |names: &[&'static str]| -> Vec<(&'static str, Arc<dyn RetrievalStrategy>)> {
            names
                .iter()
                .filter_map(|n| self.strategies.get(n).map(|s| (*n, s.clone())))
                .collect()
        };

        match mode {
            RetrievalMode::Fast => pick(&["adaptive_depth"]),
            RetrievalMode::Incident => pick(&["incident"]),
            RetrievalMode::Thorough => pick(&["multi_query", "hyde", "hybrid"]),
            RetrievalMode::Standard => match analysis.intent {
                QueryIntent::Procedural => pick(&["hybrid", "adaptive_depth"]),
                QueryIntent::Relational => pick(&["hybrid"]),
                QueryIntent::Troubleshooting => pick(&["incident"]),
                _ => pick(&["multi_query", "hybrid"]),
            },
        }
    }

    /// Run strategies concurrently under one wall-clock budget. On timeout
    /// the unfinished tasks are aborted (their in-flight results are
    /// discarded) and whatever completed is fused.
    async fn parallel_retrieve(
        &self,
        selected: &[(&'static str, Arc<dyn RetrievalStrategy>)],
        analysis: &QueryAnalysis,
        want: usize,
    ) -> (BTreeMap<(String, u64), RetrievedChunk>, bool) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.timeout_seconds);
        let mut set: JoinSet<Vec<RetrievedChunk>> = JoinSet::new();

        for (name, strategy) in selected {
            let name = *name;
            let strategy = strategy.clone();
            let ctx = self.ctx.clone();
            let analysis = analysis.clone();
            set.spawn(async move {
                match strategy.retrieve(&analysis, &ctx, want).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!("[retrieval] strategy {} failed: {}", name, e);
                        Vec::new()
                    }
                }
            });
        }

        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();
        let mut degraded = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, set.join_next()).await {
                Ok(Some(Ok(chunks))) => fuse_keep_max(&mut fused, chunks),
                Ok(Some(Err(e))) => warn!("[retrieval] strategy task panicked: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!("[retrieval] timeout, using partial results");
                    degraded = true;
                    set.abort_all();
                    break;
                }
            }
        }

        (fused, degraded)
    }

    async fn sequential_retrieve(
        &self,
        selected: &[(&'static str, Arc<dyn RetrievalStrategy>)],
        analysis: &QueryAnalysis,
        want: usize,
        cancel: &CancelToken,
    ) -> EngineResult<(BTreeMap<(String, u64), RetrievedChunk>, bool)> {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.timeout_seconds);
        let mut fused: BTreeMap<(String, u64), RetrievedChunk> = BTreeMap::new();
        let mut degraded = false;

        for (name, strategy) in selected {
            cancel.check()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                degraded = true;
                break;
            }
            match tokio::time::timeout(remaining, strategy.retrieve(analysis, &self.ctx, want))
                .await
            {
                Ok(Ok(chunks)) => fuse_keep_max(&mut fused, chunks),
                Ok(Err(e)) => warn!("[retrieval] strategy {} failed: {}", name, e),
                Err(_) => {
                    warn!("[retrieval] strategy {} timed out", name);
                    degraded = true;
                    break;
                }
            }
        }

        Ok((fused, degraded))
    }

    fn record_observation(&self, result: &RetrievalResult) {
        let Some(sink) = &self.observations else { return };
        let success =
            result.chunks.first().map(|c| c.score > 0.5).unwrap_or(false);
        let node_ids: Vec<u64> = result.chunks.iter().map(|c| c.node_id).collect();
        if success {
            let top_score = result.chunks.first().map(|c| c.score).unwrap_or(0.0);
            sink.record_query_success(&result.query, node_ids, top_score);
        } else {
            sink.record_query_failure(&result.query, node_ids);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Specialized entry points
    // ═══════════════════════════════════════════════════════════════════════

    /// Incident response: runbooks matching symptoms, similar past
    /// incidents, service documentation.
    pub async fn retrieve_for_incident(
        &self,
        symptoms: &str,
        affected_services: Option<&[String]>,
        top_k: usize,
    ) -> EngineResult<RetrievalResult> {
        let mut query = symptoms.to_string();
        if let Some(services) = affected_services {
            if !services.is_empty() {
                query.push_str(&format!(" services: {}", services.join(", ")));
            }
        }
        self.retrieve(&query, Some(top_k), Some(RetrievalMode::Incident), &CancelToken::new())
            .await
    }

    /// Procedure lookup; prefers detailed content (leaves and layer-1).
    pub async fn retrieve_procedure(
        &self,
        task_description: &str,
        context: Option<&str>,
        top_k: usize,
    ) -> EngineResult<RetrievalResult> {
        let mut query = format!("procedure how to {task_description}");
        if let Some(context) = context {
            query.push_str(&format!(" context: {context}"));
        }
        let mut result =
            self.retrieve(&query, Some(top_k * 2), None, &CancelToken::new()).await?;
        result.chunks.retain(|c| c.tree_level <= 1);
        result.chunks.truncate(top_k);
        Ok(result)
    }

    /// Everything known about one entity; graph-heavy thorough mode.
    pub async fn retrieve_entity_knowledge(
        &self,
        entity_name: &str,
        knowledge_type: Option<&str>,
        top_k: usize,
    ) -> EngineResult<RetrievalResult> {
        let mut query = format!("information about {entity_name}");
        if let Some(kind) = knowledge_type {
            query.push_str(&format!(" {kind}"));
        }
        self.retrieve(&query, Some(top_k), Some(RetrievalMode::Thorough), &CancelToken::new())
            .await
    }

    /// Follow-up retrieval that folds prior context into the query.
    pub async fn retrieve_with_context(
        &self,
        query: &str,
        context_chunks: &[RetrievedChunk],
        top_k: usize,
    ) -> EngineResult<RetrievalResult> {
        let context_text: String = context_chunks
            .iter()
            .map(|c| c.text.chars().take(100).collect::<String>())
            .collect::<Vec<_>>()
            .join(" ");
        let mut head = context_text;
        head.truncate(200);
        let enhanced = format!("{query} context: {head}");
        self.retrieve(&enhanced, Some(top_k), None, &CancelToken::new()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
