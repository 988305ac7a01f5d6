// ── Canopy Core: Integration Tests ─────────────────────────────────────────
// End-to-end scenarios over the whole engine with deterministic stub
// capabilities: build → query, incremental propagation, conflict
// resolution, graph traversal, retrieval under timeout, persistence.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use canopy_core::engine::models::summary_cache::SummaryCache;
use canopy_core::engine::retrieval::RetrievalContext;
use canopy_core::{
    BuilderConfig, CachedSummarizer, CancelToken, ChunkInput, ConflictResolver, Embedder,
    EngineResult, Entity, EntityType, ExistingMatch, IncrementalConfig, IncrementalEngine,
    KeywordExtractor, KnowledgeGraph, NewContent, PendingChangeSubmitter, Relationship,
    RelationshipType, RetrievalConfig, Retriever, SplitterConfig, StructuredLlm, Summarizer,
    TextSplitter, Tokenizer, TreeBuilder, TreeForest,
};

// ═══════════════════════════════════════════════════════════════════════════
// Deterministic stubs
// ═══════════════════════════════════════════════════════════════════════════

/// Topic-axis embedder: kafka-ness, lag-ness, postgres-ness, and a small
/// text-length jitter so no two texts are bitwise identical.
struct StubEmbedder;

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_id(&self) -> &str {
        "stub"
    }
    fn dimensionality(&self) -> usize {
        4
    }
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let t = text.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| t.contains(w)) as i32 as f32;
        let jitter = (text.len() % 13) as f32 * 0.003;
        Ok(vec![
            has(&["kafka", "broker"]),
            has(&["back-pressure", "lag", "consumer", "throughput"]),
            has(&["postgres", "vacuum", "autovacuum", "tuple"]),
            0.05 + jitter,
        ])
    }
}

/// Deterministic abstractive-looking summarizer: names the topics present
/// in the context instead of copying it.
struct StubSummarizer;

#[async_trait]
impl Summarizer for StubSummarizer {
    fn model_id(&self) -> &str {
        "stub-sum"
    }
    async fn summarize(&self, context: &str, _max_tokens: usize) -> EngineResult<String> {
        let t = context.to_lowercase();
        let mut topics = Vec::new();
        for topic in ["kafka", "back-pressure", "consumer lag", "postgres", "vacuum"] {
            if t.contains(topic) {
                topics.push(topic);
            }
        }
        if topics.is_empty() {
            topics.push("operations");
        }
        Ok(format!("Guidance covering {}.", topics.join(", ")))
    }
}

/// Scripted conflict LLM: version bumps supersede, disagreements get
/// flagged.
struct ConflictLlm;

#[async_trait]
impl StructuredLlm for ConflictLlm {
    fn model_id(&self) -> &str {
        "conflict-llm"
    }
    async fn complete_structured(
        &self,
        _system: &str,
        prompt: &str,
        _schema: &str,
        _max_tokens: usize,
    ) -> EngineResult<Value> {
        if prompt.contains("Redis 7.2") {
            Ok(json!({
                "relationship": "supersedes",
                "recommendation": "replace",
                "confidence": 0.92,
                "importance_adjustment": {"existing_multiplier": 0.8, "new_importance": 0.9},
                "reasoning": "Newer version supersedes the old instruction."
            }))
        } else {
            Ok(json!({
                "relationship": "contradicts",
                "recommendation": "flag_review",
                "confidence": 0.7,
                "reasoning": "Sources disagree; a human should decide."
            }))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Shared fixture
// ═══════════════════════════════════════════════════════════════════════════

struct Fixture {
    builder: TreeBuilder,
    incremental: IncrementalEngine,
    summary_cache: Arc<SummaryCache>,
}

fn fixture() -> Fixture {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder);
    let mut embedders: BTreeMap<String, Arc<dyn Embedder>> = BTreeMap::new();
    embedders.insert("stub".to_string(), embedder);

    let summary_cache = Arc::new(SummaryCache::open_in_memory().unwrap());
    let summarizer: Arc<dyn Summarizer> =
        Arc::new(CachedSummarizer::new(Arc::new(StubSummarizer), summary_cache.clone()));

    let keywords = Arc::new(KeywordExtractor::default());

    let config = BuilderConfig {
        reduction_dimension: 4,
        auto_depth: true,
        target_top_nodes: 2,
        max_layers: 2,
        cluster_embedding_model: "stub".to_string(),
        ..Default::default()
    };
    let splitter = TextSplitter::new(
        SplitterConfig { max_tokens: 200, ..Default::default() },
        Tokenizer::heuristic(),
    );
    let builder = TreeBuilder::new(
        config,
        splitter,
        embedders.clone(),
        summarizer.clone(),
        keywords.clone(),
    )
    .unwrap();

    let incremental = IncrementalEngine::new(
        IncrementalConfig { similarity_threshold: 0.25, ..Default::default() },
        Tokenizer::heuristic(),
        embedders,
        summarizer,
        keywords,
        "stub",
        120,
    )
    .unwrap();

    Fixture { builder, incremental, summary_cache }
}

fn corpus_chunks() -> Vec<ChunkInput> {
    let docs = [
        ("Kafka back-pressure appears when consumers cannot keep up with broker throughput.", "https://runbooks/kafka-bp"),
        ("To relieve kafka back-pressure, scale the consumer group and tune fetch sizes.", "https://runbooks/kafka-bp"),
        ("Kafka consumer groups rebalance when membership changes; expect paused consumption.", "https://wiki/kafka-groups"),
        ("Monitoring kafka consumer throughput helps catch back-pressure before an outage.", "https://wiki/kafka-monitoring"),
        ("Postgres vacuum reclaims dead tuples and prevents transaction id wraparound.", "https://wiki/postgres-vacuum"),
        ("Tune postgres autovacuum thresholds for high-churn tables to keep bloat down.", "https://wiki/postgres-autovacuum"),
    ];
    docs.iter()
        .map(|(text, source)| ChunkInput {
            text: text.to_string(),
            source_url: Some(source.to_string()),
            ..Default::default()
        })
        .collect()
}

fn retrieval_ctx(forest: Arc<TreeForest>) -> RetrievalContext {
    RetrievalContext {
        forest,
        graph: None,
        embedder: Arc::new(StubEmbedder),
        llm: None,
    }
}

fn retrieval_config() -> RetrievalConfig {
    RetrievalConfig {
        rerank: canopy_core::RerankConfig {
            min_score: 0.0,
            min_diversity_distance: 0.0,
            max_same_source: 10,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario 1: build then query
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn build_then_query_ranks_topical_leaves_first() {
    let fx = fixture();
    let tree = fx.builder.build_from_chunks(corpus_chunks(), &CancelToken::new()).await.unwrap();

    // A real hierarchy was built and validated.
    assert!(tree.num_layers >= 1, "expected at least one summary layer");
    assert_eq!(tree.leaf_count(), 6);

    // Some interior node groups the kafka leaves (0..=3) without postgres.
    let kafka_parent = tree
        .all_nodes
        .values()
        .filter(|n| !n.is_leaf())
        .find(|n| {
            let kafka = n.children.iter().filter(|c| **c <= 3).count();
            let postgres = n.children.iter().filter(|c| **c >= 4 && **c <= 5).count();
            kafka >= 2 && postgres == 0
        });
    assert!(kafka_parent.is_some(), "no pure kafka cluster found");
    // Interior text is generated, not copied.
    assert!(kafka_parent.unwrap().text.starts_with("Guidance covering"));

    // Parent provenance aggregated from children.
    let parent = kafka_parent.unwrap();
    assert!(parent.metadata.citation_total > 0);
    assert!(!parent.metadata.citations.is_empty());

    // Query ranks kafka leaves above the postgres leaves.
    let forest = Arc::new(TreeForest::new());
    forest.add_tree("main", tree);
    let retriever = Retriever::new(retrieval_ctx(forest), retrieval_config());
    let result = retriever
        .retrieve("how do we handle kafka back-pressure", Some(2), None, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(result.chunks.len(), 2);
    for chunk in &result.chunks {
        assert!(
            chunk.text.to_lowercase().contains("kafka"),
            "non-kafka chunk ranked in top 2: {}",
            chunk.text
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario 2: incremental propagation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn incremental_insert_attaches_and_propagates() {
    let fx = fixture();
    let mut tree =
        fx.builder.build_from_chunks(corpus_chunks(), &CancelToken::new()).await.unwrap();

    let leaf_count_before = tree.leaf_count();
    let ids_before: Vec<u64> = tree.all_nodes.keys().copied().collect();
    let cache_before = fx.summary_cache.len();

    let report = fx
        .incremental
        .add_chunks(
            &mut tree,
            vec![ChunkInput::text(
                "Kafka consumer lag grows when partitions are assigned unevenly.",
            )],
            &CancelToken::new(),
        )
        .await
        .unwrap();

    // One new leaf, nothing deleted or renumbered.
    assert_eq!(report.new_leaves.len(), 1);
    assert_eq!(tree.leaf_count(), leaf_count_before + 1);
    for id in &ids_before {
        assert!(tree.all_nodes.contains_key(id), "node {} disappeared", id);
    }
    tree.validate().unwrap();

    // The new leaf routed to an existing kafka parent rather than a fresh one.
    assert!(report.created.is_empty(), "leaf should attach above threshold");
    let new_leaf = report.new_leaves[0];
    let parent_id = tree.all_nodes[&new_leaf].parent_ids[0];
    let parent = &tree.all_nodes[&parent_id];
    assert!(parent.children.contains(&new_leaf));
    assert!(parent.text.to_lowercase().contains("kafka"));

    // Propagation regenerated summaries: the cache saw new keys, the parent
    // keywords were re-synthesized.
    assert!(!report.updated.is_empty(), "safe propagation refreshed ancestors");
    assert!(fx.summary_cache.len() > cache_before, "no new summary cache entries");
    assert!(!parent.keywords.is_empty());

    // Still reachable from a root.
    let roots = tree.root_indices();
    assert!(!roots.is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario: merge adds exactly the source leaves
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn merge_preserves_target_and_adds_source_leaves() {
    let fx = fixture();
    let mut target =
        fx.builder.build_from_chunks(corpus_chunks(), &CancelToken::new()).await.unwrap();

    let source_chunks = vec![
        ChunkInput::text("Kafka broker disk pressure triggers throttled producers."),
        ChunkInput::text("Postgres tuple bloat slows sequential scans."),
    ];
    let source =
        fx.builder.build_from_chunks(source_chunks, &CancelToken::new()).await.unwrap();

    let target_leaves_before = target.leaf_count();
    let source_leaves = source.leaf_count();
    let interiors_before = target.all_nodes.values().filter(|n| !n.is_leaf()).count();

    let report = fx.incremental.merge(&mut target, &source, &CancelToken::new()).await.unwrap();

    assert_eq!(target.leaf_count(), target_leaves_before + source_leaves);
    target.validate().unwrap();
    // Source interiors are discarded; the only new interiors are the
    // layer-1 parents the merge had to open for unroutable leaves.
    let interiors_after = target.all_nodes.values().filter(|n| !n.is_leaf()).count();
    assert_eq!(interiors_after, interiors_before + report.created.len());
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenarios 3 & 4: conflict resolution
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn conflict_replace_updates_in_place() {
    let resolver = ConflictResolver::new(Some(Arc::new(ConflictLlm)));
    let submitter = PendingChangeSubmitter::local_only();
    let mut tree = canopy_core::Tree::from_leaves(vec![canopy_core::Node::leaf(
        0,
        "Use Redis 6.0 for the session store",
    )]);

    let analysis = ContentAnalyzerHelper::analysis("Use Redis 7.2 for the session store");
    let outcome = resolver
        .resolve_and_apply(
            NewContent {
                content: "Use Redis 7.2 for the session store".into(),
                source: "runbook_v2".into(),
                analysis,
            },
            vec![ExistingMatch {
                node_id: 0,
                content: "Use Redis 6.0 for the session store".into(),
                source: "runbook_v1".into(),
                updated_at: chrono::Utc::now(),
                similarity_score: 0.92,
            }],
            &mut tree,
            &submitter,
        )
        .await
        .unwrap();

    assert_eq!(outcome.action, "replaced");
    assert_eq!(tree.all_nodes[&0].text, "Use Redis 7.2 for the session store");
    assert_eq!(tree.all_nodes[&0].metadata.source_url.as_deref(), Some("runbook_v2"));
    assert_eq!(tree.all_nodes.len(), 1, "replace must not create nodes");
    assert_eq!(submitter.submitted_count(), 0, "replace must not emit a pending change");
}

#[tokio::test]
async fn conflict_contradiction_flags_for_review() {
    let resolver = ConflictResolver::new(Some(Arc::new(ConflictLlm)));
    let submitter = PendingChangeSubmitter::local_only();
    let mut tree = canopy_core::Tree::from_leaves(vec![canopy_core::Node::leaf(
        0,
        "Sessions expire after 30 minutes",
    )]);

    let analysis = ContentAnalyzerHelper::analysis("Sessions expire after 10 minutes");
    let outcome = resolver
        .resolve_and_apply(
            NewContent {
                content: "Sessions expire after 10 minutes".into(),
                source: "wiki_v2".into(),
                analysis,
            },
            vec![ExistingMatch {
                node_id: 0,
                content: "Sessions expire after 30 minutes".into(),
                source: "wiki_v1".into(),
                updated_at: chrono::Utc::now(),
                similarity_score: 0.85,
            }],
            &mut tree,
            &submitter,
        )
        .await
        .unwrap();

    assert_eq!(outcome.action, "flagged_for_review");
    let change_id = outcome.pending_change_id.unwrap();
    assert!(!change_id.is_empty());
    assert_eq!(tree.all_nodes[&0].text, "Sessions expire after 30 minutes");

    let pending = submitter.local_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, change_id);
    assert_eq!(pending[0].new_content, "Sessions expire after 10 minutes");
    assert_eq!(pending[0].existing_content, "Sessions expire after 30 minutes");
    assert!(pending[0].confidence > 0.0);
    assert_eq!(pending[0].evidence.len(), 3);
}

/// Shorthand for a minimal analysis result in conflict tests.
struct ContentAnalyzerHelper;

impl ContentAnalyzerHelper {
    fn analysis(content: &str) -> canopy_core::ContentAnalysisResult {
        canopy_core::ContentAnalysisResult {
            chunk_id: "it-chunk".into(),
            source_url: None,
            knowledge_type: Default::default(),
            entities: vec![],
            relationships: vec![],
            importance: Default::default(),
            summary: content.chars().take(50).collect(),
            keywords: vec!["redis".into()],
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario 5: graph traversal
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn graph_dependency_chain_traversal() {
    let mut graph = KnowledgeGraph::new();
    for name in ["api", "auth", "db"] {
        let mut e = Entity::new(EntityType::Service, name);
        e.entity_id = name.to_string();
        graph.add_entity(e);
    }
    graph
        .add_relationship(Relationship::create(RelationshipType::DependsOn, "api", "auth"))
        .unwrap();
    graph
        .add_relationship(Relationship::create(RelationshipType::DependsOn, "auth", "db"))
        .unwrap();

    let one_hop = graph.traverse(
        "api",
        &canopy_core::TraversalSpec { max_hops: 1, ..Default::default() },
    );
    assert_eq!(one_hop.len(), 1);
    assert_eq!(one_hop[0].entity.entity_id, "auth");

    let two_hop = graph.traverse(
        "api",
        &canopy_core::TraversalSpec { max_hops: 2, ..Default::default() },
    );
    let hits: Vec<(&str, usize)> =
        two_hop.iter().map(|h| (h.entity.entity_id.as_str(), h.distance)).collect();
    assert_eq!(hits, vec![("auth", 1), ("db", 2)]);

    let paths = graph.find_paths("api", "db", 3, None);
    assert_eq!(paths.len(), 1);
    let names: Vec<&str> = paths[0].entities.iter().map(|e| e.entity_id.as_str()).collect();
    assert_eq!(names, vec!["api", "auth", "db"]);
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenario 6: parallel strategies under timeout
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn parallel_timeout_keeps_fast_results() {
    use canopy_core::{QueryAnalysis, RetrievedChunk};

    struct InstantStrategy;
    #[async_trait]
    impl canopy_core::RetrievalStrategy for InstantStrategy {
        fn name(&self) -> &'static str {
            "instant"
        }
        async fn retrieve(
            &self,
            _analysis: &QueryAnalysis,
            _ctx: &RetrievalContext,
            _top_k: usize,
        ) -> EngineResult<Vec<RetrievedChunk>> {
            Ok(vec![RetrievedChunk {
                node_id: 1,
                tree_id: "main".into(),
                text: "fast".into(),
                score: 0.9,
                importance: 0.5,
                strategy: "instant".into(),
                tree_level: 0,
                metadata: BTreeMap::new(),
            }])
        }
    }

    struct SleepyStrategy;
    #[async_trait]
    impl canopy_core::RetrievalStrategy for SleepyStrategy {
        fn name(&self) -> &'static str {
            "sleepy"
        }
        async fn retrieve(
            &self,
            _analysis: &QueryAnalysis,
            _ctx: &RetrievalContext,
            _top_k: usize,
        ) -> EngineResult<Vec<RetrievedChunk>> {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            Ok(vec![])
        }
    }

    let forest = Arc::new(TreeForest::new());
    forest.add_tree("main", canopy_core::Tree::from_leaves(vec![canopy_core::Node::leaf(0, "x")]));

    let mut config = retrieval_config();
    config.timeout_seconds = 0.05;
    config.parallel_strategies = true;
    let mut retriever = Retriever::new(retrieval_ctx(forest), config);
    retriever.add_strategy("multi_query", Arc::new(InstantStrategy));
    retriever.add_strategy("hybrid", Arc::new(SleepyStrategy));

    // Factual intent selects multi_query + hybrid in standard mode.
    let result = retriever
        .retrieve("what is the session ttl", Some(5), None, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(result.strategies_used.len(), 2);
    assert!(result.degraded);
    assert!(result.total_candidates > 0);
    assert!(result.chunks.iter().any(|c| c.text == "fast"));
}

// ═══════════════════════════════════════════════════════════════════════════
// Persistence round trip over a built tree
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn forest_round_trip_preserves_built_tree() {
    let fx = fixture();
    let tree = fx.builder.build_from_chunks(corpus_chunks(), &CancelToken::new()).await.unwrap();

    let forest = TreeForest::new();
    forest.add_tree("ops", tree);
    let path =
        std::env::temp_dir().join(format!("canopy-it-{}.bin", uuid::Uuid::new_v4()));
    forest.save(&path).unwrap();

    let loaded = TreeForest::load(&path).unwrap();
    assert_eq!(loaded.list_trees(), vec!["ops"]);
    let original = forest.get_tree("ops").unwrap();
    let restored = loaded.get_tree("ops").unwrap();
    let (a, b) = (original.read(), restored.read());
    assert_eq!(a.num_layers, b.num_layers);
    assert_eq!(a.all_nodes.len(), b.all_nodes.len());
    for (id, node) in a.all_nodes.iter() {
        let other = &b.all_nodes[id];
        assert_eq!(node.text, other.text);
        assert_eq!(node.children, other.children);
        assert_eq!(node.embeddings, other.embeddings, "vectors must survive bitwise");
        assert_eq!(node.keywords, other.keywords);
    }
    std::fs::remove_file(path).ok();
}

// ═══════════════════════════════════════════════════════════════════════════
// Deterministic retrieval
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn retrieval_is_deterministic_with_fixed_embedder() {
    let fx = fixture();
    let tree = fx.builder.build_from_chunks(corpus_chunks(), &CancelToken::new()).await.unwrap();
    let forest = Arc::new(TreeForest::new());
    forest.add_tree("main", tree);

    let retriever = Retriever::new(retrieval_ctx(forest.clone()), retrieval_config());
    let first = retriever
        .retrieve("kafka consumer lag", Some(4), None, &CancelToken::new())
        .await
        .unwrap();
    let second = retriever
        .retrieve("kafka consumer lag", Some(4), None, &CancelToken::new())
        .await
        .unwrap();

    let ids = |r: &canopy_core::RetrievalResult| -> Vec<u64> {
        r.chunks.iter().map(|c| c.node_id).collect()
    };
    assert_eq!(ids(&first), ids(&second));
}
