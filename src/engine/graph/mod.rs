// ── Canopy Engine: Knowledge Graph ─────────────────────────────────────────
// Typed entity/relationship store with traversal primitives for hybrid
// graph+tree retrieval.

pub mod graph;

pub use graph::{KnowledgeGraph, SharedGraph, TraversalSpec};
