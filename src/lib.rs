// ── Canopy Core ────────────────────────────────────────────────────────────
// Hierarchical retrieval-augmented knowledge engine: ingests operational
// documents (runbooks, transcripts, wikis, incident reports) into
// RAPTOR-style summary trees cross-referenced by a knowledge graph, and
// serves them through a multi-strategy retriever.
//
// Layering:
//   atoms/   — pure data types, constants, the error enum
//   engine/  — model capabilities, tree build/update, graph, intelligence,
//              retrieval
//
// This crate is a library; there is no CLI surface. Hosts wire capability
// implementations (embedder, summarizer, structured LLM) into the
// constructors and drive everything through library calls.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::graph_types::{
    Direction, Entity, EntityType, GraphPath, Neighborhood, Relationship, RelationshipType,
    TraversalHit,
};
pub use atoms::intelligence_types::{
    ConflictRecommendation, ConflictRelationship, ConflictResolutionResult,
    ContentAnalysisResult, ExistingMatch, KnowledgeType, PendingKnowledgeChange,
    ResolutionOutcome,
};
pub use atoms::retrieval_types::{
    Observation, QueryAnalysis, QueryIntent, RerankConfig, RetrievalConfig, RetrievalMode,
    RetrievalResult, RetrievedChunk,
};
pub use atoms::types::{
    BuilderConfig, CancelToken, Citation, IncrementalConfig, Node, NodeMetadata,
    ObservabilityConfig, SplitMode, SplitterConfig, SummaryLength, Tree,
};

pub use engine::graph::{KnowledgeGraph, SharedGraph, TraversalSpec};
pub use engine::intelligence::{ConflictResolver, ContentAnalyzer, NewContent, PendingChangeSubmitter};
pub use engine::models::{
    CachedEmbedder, CachedSummarizer, Embedder, EmbeddingCache, HttpEmbedder,
    HttpStructuredLlm, HttpSummarizer, StructuredLlm, SummaryCache, Summarizer, Tokenizer,
    UsageTracker,
};
pub use engine::retrieval::{
    ObservationSink, RetrievalContext, Retriever, RetrievalStrategy, Reranker,
};
pub use engine::tree::{
    ChunkInput, IncrementalEngine, KeywordExtractor, KeywordIndex, TextSplitter, TreeBuilder,
    TreeForest,
};
pub use engine::KnowledgeEngine;
