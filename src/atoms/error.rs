// ── Canopy Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Tree…).
//   • The `#[from]` attribute wires std/external error conversions.
//   • No variant carries secret material (API keys, tokens) in its message.
//   • Transient provider failures are retried by callers; only the
//     post-retry escalation surfaces as `Provider`.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary blob encoding failure (tree/forest persistence).
    #[error("Encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Binary blob decoding failure (tree/forest persistence).
    #[error("Decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite cache failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Provider HTTP or API-level failure after retries (non-secret detail only).
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// The configured USD budget for a build was exceeded.
    #[error("Budget exceeded: spent ${spent_usd:.2} of ${budget_usd:.2}")]
    BudgetExceeded { spent_usd: f64, budget_usd: f64 },

    /// A loaded or constructed tree violates structural invariants.
    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    /// Graph integrity violation (missing endpoint, unknown entity).
    #[error("Graph error: {0}")]
    Graph(String),

    /// An operation ran past its wall-clock budget.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller's cancellation signal fired.
    #[error("Cancelled")]
    Cancelled,

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a provider error with name and message.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider { provider: provider.into(), message: message.into() }
    }

    /// Create a graph integrity error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph(message.into())
    }

    /// Create an invalid-tree error.
    pub fn invalid_tree(message: impl Into<String>) -> Self {
        Self::InvalidTree(message.into())
    }

    /// True when a retry may plausibly succeed (rate limits, transient network).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helper functions that format error strings inline.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────
// Lets host-process boundaries call `.map_err(EngineError::into)` directly.

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}
