// ── Canopy Engine: Hierarchical Tree ───────────────────────────────────────
// Chunking, clustering, building, incremental maintenance, and persistence
// of the knowledge tree, plus the forest that holds named trees.

pub mod builder;
pub mod clustering;
pub mod forest;
pub mod incremental;
pub mod keywords;
pub mod persistence;
pub mod splitter;

pub use builder::{ChunkInput, TreeBuilder};
pub use clustering::{perform_clustering, ClusteringParams, DimensionReducer, RandomProjectionReducer};
pub use forest::TreeForest;
pub use incremental::IncrementalEngine;
pub use keywords::{KeywordExtractor, KeywordIndex};
pub use splitter::TextSplitter;
