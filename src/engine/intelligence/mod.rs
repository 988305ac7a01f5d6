// ── Canopy Engine: Content Intelligence ────────────────────────────────────
// LLM-backed structured extraction (analyzer), conflict resolution between
// new and existing knowledge, and the pending-change path to the external
// human review queue.

pub mod analyzer;
pub mod conflict;
pub mod pending;

pub use analyzer::ContentAnalyzer;
pub use conflict::{BatchConflictItem, ConflictResolver, NewContent};
pub use pending::PendingChangeSubmitter;
