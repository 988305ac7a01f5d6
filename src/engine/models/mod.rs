// ── Canopy Engine: Model Capabilities ──────────────────────────────────────
// Capability interfaces (embedder, summarizer, structured LLM), their HTTP
// implementations, the persistent caches that wrap them, and the usage/budget
// tracker. Pluggability is by passing trait objects into the builder and
// retriever constructors — no inheritance trees.

pub mod embedding;
pub mod embedding_cache;
pub mod llm;
pub mod summarizer;
pub mod summary_cache;
pub mod tokenizer;
pub mod usage;

pub use embedding::{cosine_similarity, Embedder, HttpEmbedder};
pub use embedding_cache::{CachedEmbedder, EmbeddingCache};
pub use llm::{HttpStructuredLlm, StructuredLlm};
pub use summarizer::{CachedSummarizer, GuardConfig, HttpSummarizer, SummaryMode, Summarizer};
pub use summary_cache::SummaryCache;
pub use tokenizer::Tokenizer;
pub use usage::UsageTracker;

use crate::atoms::constants::{
    PROVIDER_BACKOFF_BASE_MS, PROVIDER_BACKOFF_MAX_MS, PROVIDER_MAX_RETRIES,
};
use crate::atoms::error::{EngineError, EngineResult};
use std::future::Future;

/// Explicit bounded-retry loop with exponential backoff.
///
/// Transient failures (network, timeout) retry; anything else escalates
/// immediately. After the retry budget is spent the last error surfaces —
/// callers never get a silently degraded value.
pub(crate) async fn retry_with_backoff<T, F, Fut>(what: &str, mut call: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut delay_ms = PROVIDER_BACKOFF_BASE_MS;
    let mut last_err: Option<EngineError> = None;

    for attempt in 1..=PROVIDER_MAX_RETRIES {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < PROVIDER_MAX_RETRIES => {
                log::warn!(
                    "[models] {} attempt {}/{} failed ({}), retrying in {}ms",
                    what,
                    attempt,
                    PROVIDER_MAX_RETRIES,
                    e,
                    delay_ms
                );
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(PROVIDER_BACKOFF_MAX_MS);
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| EngineError::provider(what.to_string(), "retries exhausted")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: EngineResult<()> = retry_with_backoff("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(EngineError::Config("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "permanent errors must not retry");
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(EngineError::Timeout("slow".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
