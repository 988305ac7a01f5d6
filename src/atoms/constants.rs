// ── Canopy Atoms: Constants ────────────────────────────────────────────────
// Global tuning knobs that are not per-call configuration.

/// Maximum keywords stored on a single tree node.
pub const MAX_KEYWORDS_PER_NODE: usize = 12;

/// Top-N unique sources kept in a parent node's aggregated citations.
pub const CITATION_TOP_N: usize = 20;

/// N-gram size used by the summarizer anti-copy guard.
pub const GUARD_NGRAM: usize = 5;

/// Overlap ratio at or above which a summary counts as extractive.
pub const GUARD_OVERLAP_THRESHOLD: f32 = 0.75;

/// Guard only fires on outputs at least this long (short outputs overlap
/// trivially).
pub const GUARD_MIN_CHARS: usize = 80;

/// How far into the output the `Source:` leak check looks.
pub const GUARD_HEAD_WINDOW: usize = 400;

/// Default retry budget for provider calls before escalating.
pub const PROVIDER_MAX_RETRIES: usize = 5;

/// Base delay for exponential backoff between provider retries.
pub const PROVIDER_BACKOFF_BASE_MS: u64 = 250;

/// Hard cap on a single backoff sleep.
pub const PROVIDER_BACKOFF_MAX_MS: u64 = 20_000;

/// Result cap for graph traversals unless the caller overrides it.
pub const GRAPH_TRAVERSAL_LIMIT: usize = 100;
