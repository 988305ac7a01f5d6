// ── Canopy Models: Summarization Capability ────────────────────────────────
//
// Layer-aware abstractive summarization with an anti-copy guard.
//
// The failure mode the guard exists for: a parent node whose "summary" is a
// verbatim excerpt of one child. Detection is a 5-gram overlap ratio between
// output and context plus two leak checks (heading prefix, `Source:` marker
// in the head of the output). Offenders get one rewrite call demanding
// abstraction. A second failure is kept — the guard is best-effort, the
// warning is logged.
//
// Modes per layer: `details` (dense), `summary` (concise paragraph),
// `bullets` (browsable outline, format-enforced), `keywords` (index line).

use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::atoms::constants::{
    GUARD_HEAD_WINDOW, GUARD_MIN_CHARS, GUARD_NGRAM, GUARD_OVERLAP_THRESHOLD,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::models::retry_with_backoff;
use crate::engine::models::summary_cache::SummaryCache;
use crate::engine::models::usage::UsageTracker;

// ═══════════════════════════════════════════════════════════════════════════
// Capability
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMode {
    #[default]
    Details,
    Summary,
    Bullets,
    Keywords,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn model_id(&self) -> &str;

    async fn summarize(&self, context: &str, max_tokens: usize) -> EngineResult<String>;

    /// Layer-aware entry point. `layer` -1 means "not layered"; the default
    /// forwards to `summarize`.
    async fn summarize_layer(
        &self,
        context: &str,
        layer: i32,
        max_tokens: usize,
    ) -> EngineResult<String> {
        let _ = layer;
        self.summarize(context, max_tokens).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Anti-copy guard
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub ngram: usize,
    pub overlap_threshold: f32,
    pub min_chars: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            ngram: GUARD_NGRAM,
            overlap_threshold: GUARD_OVERLAP_THRESHOLD,
            min_chars: GUARD_MIN_CHARS,
        }
    }
}

fn words_of(text: &str) -> Vec<String> {
    // [a-z0-9]+ runs, lowercased — punctuation and markup don't count.
    let re = Regex::new(r"[A-Za-z0-9]+").expect("static regex");
    re.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

/// Ratio of `a`'s n-grams that also appear in `b`. 1.0 means `a` is fully
/// contained in `b` at the n-gram level.
pub fn ngram_overlap_ratio(a: &str, b: &str, n: usize) -> f32 {
    let wa = words_of(a);
    let wb = words_of(b);
    if wa.len() < n || wb.len() < n {
        return 0.0;
    }
    let grams = |w: &[String]| -> std::collections::HashSet<String> {
        w.windows(n).map(|win| win.join(" ")).collect()
    };
    let ga = grams(&wa);
    let gb = grams(&wb);
    if ga.is_empty() {
        return 0.0;
    }
    let shared = ga.intersection(&gb).count();
    shared as f32 / ga.len() as f32
}

/// The guard's verdict: does this output look copied from its context?
pub fn looks_extractive(output: &str, context: &str, cfg: &GuardConfig) -> bool {
    let out = output.trim();
    if out.is_empty() {
        return false;
    }
    if out.starts_with('#') {
        return true;
    }
    let head: String = out.chars().take(GUARD_HEAD_WINDOW).collect();
    if head.contains("Source:") {
        return true;
    }
    out.len() >= cfg.min_chars
        && ngram_overlap_ratio(out, context, cfg.ngram) >= cfg.overlap_threshold
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP implementation (chat-completions dialect)
// ═══════════════════════════════════════════════════════════════════════════

pub struct HttpSummarizer {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    default_mode: SummaryMode,
    mode_by_layer: BTreeMap<i32, SummaryMode>,
    guard: GuardConfig,
    usage: Option<Arc<UsageTracker>>,
    debug_log_path: Option<std::path::PathBuf>,
    debug_events: Vec<String>,
}

struct ChatOutcome {
    text: String,
    finish_reason: Option<String>,
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl HttpSummarizer {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            default_mode: SummaryMode::Details,
            mode_by_layer: BTreeMap::new(),
            guard: GuardConfig::default(),
            usage: None,
            debug_log_path: None,
            debug_events: Vec::new(),
        }
    }

    /// Enable the JSONL debug log for the named events (`guard`,
    /// `truncation`, or `all`). Appends are best-effort.
    pub fn with_debug_log(
        mut self,
        path: std::path::PathBuf,
        events: Vec<String>,
    ) -> Self {
        self.debug_log_path = Some(path);
        self.debug_events = events;
        self
    }

    fn debug_log(&self, event: &str, layer: i32, output: &str, detail: serde_json::Value) {
        let Some(path) = &self.debug_log_path else { return };
        let enabled = self
            .debug_events
            .iter()
            .any(|e| e.eq_ignore_ascii_case(event) || e.eq_ignore_ascii_case("all"));
        if !enabled {
            return;
        }
        let rec = json!({
            "ts": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "event": event,
            "model": self.model,
            "layer": layer,
            "output": output,
            "detail": detail,
        });
        let append = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(f, "{}", rec)?;
            Ok(())
        };
        if let Err(e) = append() {
            warn!("[models:summary] debug log append failed: {}", e);
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_default_mode(mut self, mode: SummaryMode) -> Self {
        self.default_mode = mode;
        self
    }

    pub fn with_mode_for_layer(mut self, layer: i32, mode: SummaryMode) -> Self {
        self.mode_by_layer.insert(layer, mode);
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_usage_tracker(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    fn mode_for_layer(&self, layer: i32) -> SummaryMode {
        self.mode_by_layer.get(&layer).copied().unwrap_or(self.default_mode)
    }

    /// Ask for fewer words than the hard token cap so content isn't lost to
    /// truncation-at-cap (~0.7 words per token is the safety band).
    fn target_words(max_tokens: usize) -> usize {
        (((max_tokens as f32) * 0.7) as usize).max(25)
    }

    fn prompt_for(mode: SummaryMode, context: &str, max_tokens: usize) -> (String, String) {
        let target_words = Self::target_words(max_tokens);
        match mode {
            SummaryMode::Bullets => (
                "You create a high-level outline for browsing. Be abstractive: do not \
                 quote or copy sentences verbatim. No code blocks or configuration snippets."
                    .to_string(),
                format!(
                    "Summarize the text as 6-10 bullet points.\n\
                     - Each bullet: 3-7 words.\n\
                     - Focus on main messages and concepts.\n\
                     - Output MUST be a Markdown bullet list where each line starts with '- '.\n\
                     - No preamble, no paragraphs.\n\n\
                     Text:\n{context}"
                ),
            ),
            SummaryMode::Keywords => (
                "You extract keywords/keyphrases for indexing.".to_string(),
                format!(
                    "Extract 10-18 keywords/keyphrases.\n\
                     - Prefer nouns/proper nouns/short phrases.\n\
                     - Output a single comma-separated line.\n\n\
                     Text:\n{context}"
                ),
            ),
            SummaryMode::Summary => (
                "You write concise summaries for browsing. Be abstractive: do not quote \
                 or copy sentences verbatim. No code blocks or YAML."
                    .to_string(),
                format!(
                    "Write a concise summary focusing on the main ideas.\n\
                     - Length: <= {target_words} words.\n\
                     - Prefer abstraction over examples.\n\
                     - Do NOT copy sentences verbatim from the text.\n\
                     - Output plain text (no headings).\n\n\
                     Text:\n{context}"
                ),
            ),
            SummaryMode::Details => (
                "You summarize a bundle of documentation chunks for a hierarchical \
                 retrieval tree. Be mostly abstractive: avoid copying full sentences \
                 verbatim. Do NOT include code blocks or YAML; describe them instead."
                    .to_string(),
                format!(
                    "Write a detailed summary of the following.\n\
                     - Length: <= {target_words} words.\n\
                     - Prefer paraphrase over quoting.\n\
                     - Do NOT include code blocks/YAML (describe what they do).\n\n\
                     Text:\n{context}"
                ),
            ),
        }
    }

    async fn chat(&self, system: &str, user: &str, max_tokens: usize) -> EngineResult<ChatOutcome> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "max_tokens": max_tokens,
        });

        let mut req = self
            .client
            .post(&url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(120));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "summarize",
                format!("{} — {}", status, text),
            ));
        }

        let v: Value = resp.json().await?;
        let text = v["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(EngineError::provider("summarize", "empty completion"));
        }
        Ok(ChatOutcome {
            text,
            finish_reason: v["choices"][0]["finish_reason"].as_str().map(|s| s.to_string()),
            prompt_tokens: v["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: v["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        })
    }

    /// One guarded call: initial generation, then the rewrite ladder
    /// (truncation compression, anti-copy rewrite, bullets enforcement).
    async fn guarded_call(
        &self,
        context: &str,
        layer: i32,
        max_tokens: usize,
    ) -> EngineResult<String> {
        let mode = self.mode_for_layer(layer);
        let (system, user) = Self::prompt_for(mode, context, max_tokens);

        let outcome = self.chat(&system, &user, max_tokens).await?;
        self.record("summarize_layer", layer, &outcome)?;
        let mut out = outcome.text;

        // Length-cap hit: one compression rewrite under the same cap.
        if outcome.finish_reason.as_deref() == Some("length") {
            warn!(
                "[models:summary] truncated at cap: model={} layer={} max_tokens={} out_chars={}",
                self.model,
                layer,
                max_tokens,
                out.len()
            );
            self.debug_log("truncation", layer, &out, json!({ "max_tokens": max_tokens }));
            let target = (Self::target_words(max_tokens) as f32 * 0.85) as usize;
            let compress_user = format!(
                "Rewrite the source text into <= {} words.\n\
                 - Preserve the most important concepts.\n\
                 - Plain text only.\n\n\
                 Source text:\n{}",
                target.max(20),
                context
            );
            if let Ok(c) = self
                .chat(
                    "Compress the content into a shorter abstractive summary. \
                     Do NOT copy sentences verbatim. No code blocks/YAML.",
                    &compress_user,
                    max_tokens,
                )
                .await
            {
                self.record("summarize_truncation_rewrite", layer, &c)?;
                if !c.text.is_empty() {
                    out = c.text;
                }
            }
        }

        // Anti-copy guard (keywords mode is inherently extractive; exempt).
        if mode != SummaryMode::Keywords && looks_extractive(&out, context, &self.guard) {
            let overlap = ngram_overlap_ratio(&out, context, self.guard.ngram);
            warn!(
                "[models:summary] extractive guard: model={} layer={} overlap={:.2} out_chars={}",
                self.model,
                layer,
                overlap,
                out.len()
            );
            self.debug_log("guard", layer, &out, json!({ "overlap": overlap }));
            let rewrite_user = match mode {
                SummaryMode::Bullets => format!(
                    "Rewrite the following source text as 6-10 bullet points.\n\
                     - Each line MUST start with '- '.\n\
                     - Abstractive only (no copied sentences).\n\n\
                     Source text:\n{context}"
                ),
                SummaryMode::Summary => format!(
                    "Rewrite the following source text as a concise, abstractive summary.\n\
                     - 3-6 sentences.\n\
                     - No headings, no code, no YAML.\n\
                     - Do not copy sentences.\n\n\
                     Source text:\n{context}"
                ),
                _ => format!(
                    "Rewrite the following source text as a detailed but abstractive summary.\n\
                     - 1-2 short paragraphs.\n\
                     - No headings, no code, no YAML.\n\
                     - Do not copy sentences.\n\n\
                     Source text:\n{context}"
                ),
            };
            match self
                .chat(
                    "Rewrite the content in your own words. Do NOT copy sentences verbatim \
                     from the source. No code blocks/YAML.",
                    &rewrite_user,
                    max_tokens,
                )
                .await
            {
                Ok(r) => {
                    self.record("summarize_guard_rewrite", layer, &r)?;
                    if !r.text.is_empty() {
                        let after = ngram_overlap_ratio(&r.text, context, self.guard.ngram);
                        info!(
                            "[models:summary] guard rewrite ok: overlap {:.2} → {:.2}",
                            overlap, after
                        );
                        out = r.text;
                    }
                }
                Err(e) => {
                    warn!("[models:summary] guard rewrite failed, keeping original: {}", e);
                }
            }
        }

        // Bullets format enforcement: one re-prompt if no line starts with "- ".
        if mode == SummaryMode::Bullets
            && !out.lines().any(|l| l.trim_start().starts_with("- "))
        {
            let enforce_user = format!(
                "Rewrite the following as 6-10 bullet points.\n\
                 - Each line MUST start with '- '.\n\
                 - No paragraphs.\n\n\
                 Text:\n{context}"
            );
            if let Ok(b) = self
                .chat("Rewrite strictly as a Markdown bullet list.", &enforce_user, max_tokens)
                .await
            {
                self.record("summarize_bullets_enforce", layer, &b)?;
                if !b.text.is_empty() {
                    out = b.text;
                }
            }
        }

        Ok(out)
    }

    fn record(&self, kind: &str, layer: i32, outcome: &ChatOutcome) -> EngineResult<()> {
        if let Some(usage) = &self.usage {
            usage.record(
                kind,
                &self.model,
                outcome.prompt_tokens,
                outcome.completion_tokens,
                json!({ "layer": layer }),
            )?;
        }
        Ok(())
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn summarize(&self, context: &str, max_tokens: usize) -> EngineResult<String> {
        self.summarize_layer(context, -1, max_tokens).await
    }

    async fn summarize_layer(
        &self,
        context: &str,
        layer: i32,
        max_tokens: usize,
    ) -> EngineResult<String> {
        retry_with_backoff("summarize", || self.guarded_call(context, layer, max_tokens)).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Caching wrapper
// ═══════════════════════════════════════════════════════════════════════════

/// Wraps a summarizer with the persistent cache keyed by
/// (model_id, layer, max_tokens, sha256(context)).
///
/// Cached values are re-checked against the anti-copy guard on read: a stale
/// extractive summary from before the guard existed would otherwise
/// reintroduce the "parent == child excerpt" failure. Such hits are
/// recomputed and overwritten.
pub struct CachedSummarizer {
    inner: Arc<dyn Summarizer>,
    cache: Arc<SummaryCache>,
    guard: GuardConfig,
}

impl CachedSummarizer {
    pub fn new(inner: Arc<dyn Summarizer>, cache: Arc<SummaryCache>) -> Self {
        Self { inner, cache, guard: GuardConfig::default() }
    }
}

#[async_trait]
impl Summarizer for CachedSummarizer {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn summarize(&self, context: &str, max_tokens: usize) -> EngineResult<String> {
        self.summarize_layer(context, -1, max_tokens).await
    }

    async fn summarize_layer(
        &self,
        context: &str,
        layer: i32,
        max_tokens: usize,
    ) -> EngineResult<String> {
        if let Some(hit) = self.cache.get(self.inner.model_id(), layer, max_tokens, context) {
            if !looks_extractive(&hit, context, &self.guard) {
                return Ok(hit);
            }
            info!("[models:summary-cache] discarding extractive cached summary");
        }

        let out = self.inner.summarize_layer(context, layer, max_tokens).await?;
        if !out.trim().is_empty() {
            if let Err(e) = self.cache.put(self.inner.model_id(), layer, max_tokens, context, &out)
            {
                log::warn!("[models:summary-cache] write failed: {}", e);
            }
        }
        Ok(out.trim().to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const LOREM: &str = "kafka consumers fall behind when the broker throttles \
        fetch requests and the partition assignment is uneven across the group";

    #[test]
    fn overlap_of_copy_is_high() {
        let ratio = ngram_overlap_ratio(LOREM, LOREM, 5);
        assert!((ratio - 1.0).abs() < 1e-6);
    }

    #[test]
    fn overlap_of_unrelated_text_is_low() {
        let other = "postgres vacuum reclaims dead tuples and prevents transaction id wraparound";
        assert!(ngram_overlap_ratio(other, LOREM, 5) < 0.05);
    }

    #[test]
    fn overlap_handles_short_inputs() {
        assert_eq!(ngram_overlap_ratio("one two", LOREM, 5), 0.0);
    }

    #[test]
    fn guard_fires_on_verbatim_copy() {
        let context = format!("{LOREM} {LOREM} plus additional operator notes");
        let output = format!("{LOREM} {LOREM}");
        assert!(looks_extractive(&output, &context, &GuardConfig::default()));
    }

    #[test]
    fn guard_fires_on_heading_and_source_leak() {
        let cfg = GuardConfig::default();
        assert!(looks_extractive("# concepts/overview", "anything", &cfg));
        assert!(looks_extractive(
            "Summary of things. Source: https://wiki.internal/page",
            "anything",
            &cfg
        ));
    }

    #[test]
    fn guard_passes_short_abstractive_output() {
        let cfg = GuardConfig::default();
        assert!(!looks_extractive(
            "Consumers lag under broker throttling.",
            LOREM,
            &cfg
        ));
    }

    #[test]
    fn target_words_floors_at_25() {
        assert_eq!(HttpSummarizer::target_words(10), 25);
        assert_eq!(HttpSummarizer::target_words(200), 140);
    }
}
