// ── Canopy Atoms Layer ─────────────────────────────────────────────────────
// Pure constants, error types, and data types — zero side effects, no I/O.
// Dependency rule: atoms may only depend on std and external pure crates.
// Nothing here may import from engine/ or lib.rs.

pub mod constants;
pub mod error;
pub mod graph_types;
pub mod intelligence_types;
pub mod retrieval_types;
pub mod types;
