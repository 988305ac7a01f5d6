// ── Canopy Engine ──────────────────────────────────────────────────────────
// The engine layer: model capabilities, the hierarchical tree, the knowledge
// graph, content intelligence, and retrieval. `KnowledgeEngine` is the
// convenience facade tying builder + incremental + forest together for
// hosts that don't need to wire the parts individually.

pub mod graph;
pub mod intelligence;
pub mod models;
pub mod retrieval;
pub mod tree;

use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{CancelToken, Tree};
use crate::engine::tree::builder::{ChunkInput, TreeBuilder};
use crate::engine::tree::forest::TreeForest;
use crate::engine::tree::incremental::{IncrementalEngine, InsertReport};

/// Facade over build / incremental-update / merge against a named forest.
///
/// Writer-side copy pattern: mutations run against a private clone of the
/// tree and are swapped in whole once complete, so readers never observe a
/// half-updated hierarchy.
pub struct KnowledgeEngine {
    forest: Arc<TreeForest>,
    builder: TreeBuilder,
    incremental: IncrementalEngine,
}

impl KnowledgeEngine {
    pub fn new(forest: Arc<TreeForest>, builder: TreeBuilder, incremental: IncrementalEngine) -> Self {
        Self { forest, builder, incremental }
    }

    pub fn forest(&self) -> &Arc<TreeForest> {
        &self.forest
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    pub fn incremental(&self) -> &IncrementalEngine {
        &self.incremental
    }

    /// Build a fresh tree from raw text and install it under `tree_id`,
    /// replacing any previous tree with that id.
    pub async fn add_documents(
        &self,
        tree_id: &str,
        text: &str,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let tree = self.builder.build_from_text(text, cancel).await?;
        self.forest.add_tree(tree_id, tree);
        Ok(())
    }

    /// Build a fresh tree from pre-chunked leaves.
    pub async fn add_chunks(
        &self,
        tree_id: &str,
        chunks: Vec<ChunkInput>,
        cancel: &CancelToken,
    ) -> EngineResult<()> {
        let tree = self.builder.build_from_chunks(chunks, cancel).await?;
        self.forest.add_tree(tree_id, tree);
        Ok(())
    }

    /// Incremental update: split the text, insert the leaves, propagate.
    /// Falls back to a full build when the tree doesn't exist yet.
    ///
    /// Incremental updates drift from a fresh rebuild over time; run
    /// `compact` periodically.
    pub async fn add_to_existing(
        &self,
        tree_id: &str,
        text: &str,
        cancel: &CancelToken,
    ) -> EngineResult<InsertReport> {
        let Some(handle) = self.forest.get_tree(tree_id) else {
            self.add_documents(tree_id, text, cancel).await?;
            return Ok(InsertReport::default());
        };

        let cluster_embedder = self
            .builder
            .embedders()
            .get(&self.builder.config().cluster_embedding_model)
            .cloned()
            .ok_or_else(|| EngineError::Config("cluster embedder missing".into()))?;
        let chunks: Vec<ChunkInput> = self
            .builder
            .splitter()
            .split(text, Some(&cluster_embedder))
            .await?
            .into_iter()
            .map(ChunkInput::text)
            .collect();

        let mut working = handle.read().clone();
        let report = self.incremental.add_chunks(&mut working, chunks, cancel).await?;
        working.validate()?;
        *handle.write() = working;
        Ok(report)
    }

    /// Online merge of `source` into the tree at `target_id`.
    pub async fn merge_tree(
        &self,
        target_id: &str,
        source: &Tree,
        cancel: &CancelToken,
    ) -> EngineResult<InsertReport> {
        let handle = self
            .forest
            .get_tree(target_id)
            .ok_or_else(|| EngineError::Config(format!("unknown tree '{}'", target_id)))?;

        let mut working = handle.read().clone();
        let report = self.incremental.merge(&mut working, source, cancel).await?;
        working.validate()?;
        *handle.write() = working;
        Ok(report)
    }

    /// Scheduled compaction: rebuild the tree at `tree_id` from its own
    /// leaves (the remedy for incremental drift).
    pub async fn compact(&self, tree_id: &str, cancel: &CancelToken) -> EngineResult<()> {
        let handle = self
            .forest
            .get_tree(tree_id)
            .ok_or_else(|| EngineError::Config(format!("unknown tree '{}'", tree_id)))?;

        let snapshot = handle.read().clone();
        let rebuilt = self.incremental.compact(&self.builder, &[&snapshot], cancel).await?;
        *handle.write() = rebuilt;
        Ok(())
    }
}
