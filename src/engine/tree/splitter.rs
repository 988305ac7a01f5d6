// ── Canopy Tree: Text Splitter ─────────────────────────────────────────────
//
// Partitions raw documents into token-bounded chunks. Three modes:
//
//   fixed     — regex sentence split, greedy packing under the token budget,
//               oversized sentences recurse on `,;:` (the default)
//   markdown  — split at ATX headings, fenced code blocks stay atomic,
//               then token-pack with overlap
//   embedding — unitize into sentences/paragraphs, embed each unit, cut at
//               cosine dips (adaptive cutoff: min(threshold, μ − 0.5σ))
//               once a minimum chunk size has accumulated, then token-pack
//
// Contract: ordered, non-empty chunks; each ≤ max_tokens except when a
// single indivisible unit exceeds the budget by itself (it becomes one
// oversized chunk — the documented exception).

use log::debug;
use regex::Regex;
use std::sync::Arc;

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{SplitMode, SplitterConfig};
use crate::engine::models::embedding::{cosine_similarity, Embedder};
use crate::engine::models::tokenizer::Tokenizer;

/// Cap on embedded units per document in embedding mode. Keeps pathological
/// inputs from issuing tens of thousands of embed calls.
const MAX_SEMANTIC_UNITS: usize = 4000;

pub struct TextSplitter {
    config: SplitterConfig,
    tokenizer: Tokenizer,
}

impl TextSplitter {
    pub fn new(config: SplitterConfig, tokenizer: Tokenizer) -> Self {
        Self { config, tokenizer }
    }

    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// Split according to the configured mode. The embedder is only needed
    /// for `SplitMode::Embedding`; passing None there is a config error.
    pub async fn split(
        &self,
        text: &str,
        embedder: Option<&Arc<dyn Embedder>>,
    ) -> EngineResult<Vec<String>> {
        match self.config.mode {
            SplitMode::Fixed => Ok(self.split_fixed(text)),
            SplitMode::Markdown => Ok(self.split_markdown(text)),
            SplitMode::Embedding => {
                let embedder = embedder.ok_or_else(|| {
                    EngineError::Config("embedding split mode requires an embedder".into())
                })?;
                self.split_semantic(text, embedder).await
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mode: fixed (token-bounded sentence packing)
    // ═══════════════════════════════════════════════════════════════════════

    pub fn split_fixed(&self, text: &str) -> Vec<String> {
        let max_tokens = self.config.max_tokens.max(1);
        let overlap = self.config.overlap;

        let sentence_re = Regex::new(r"[.!?]\s+|\n+").expect("static regex");
        let sentences: Vec<&str> =
            sentence_re.split(text).map(str::trim).filter(|s| !s.is_empty()).collect();

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for sentence in sentences {
            let count = self.tokenizer.count_tokens(sentence);

            if count > max_tokens {
                // Oversized sentence: recurse on clause delimiters.
                if !current.is_empty() {
                    chunks.push(current.join(" "));
                    current.clear();
                    current_tokens = 0;
                }
                self.pack_clauses(sentence, max_tokens, &mut chunks);
                continue;
            }

            if current_tokens + count > max_tokens && !current.is_empty() {
                chunks.push(current.join(" "));
                // Carry a sentence-count overlap into the next chunk.
                let keep = if overlap > 0 && current.len() > overlap {
                    current.split_off(current.len() - overlap)
                } else if overlap > 0 {
                    std::mem::take(&mut current)
                } else {
                    Vec::new()
                };
                current = keep;
                current_tokens =
                    current.iter().map(|s| self.tokenizer.count_tokens(s)).sum();
            }

            current.push(sentence);
            current_tokens += count;
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    fn pack_clauses(&self, sentence: &str, max_tokens: usize, chunks: &mut Vec<String>) {
        let clause_re = Regex::new(r"[,;:]").expect("static regex");
        let clauses: Vec<&str> =
            clause_re.split(sentence).map(str::trim).filter(|s| !s.is_empty()).collect();

        if clauses.len() <= 1 {
            // Indivisible unit over budget: emit as-is (documented exception).
            chunks.push(sentence.trim().to_string());
            return;
        }

        let mut sub: Vec<&str> = Vec::new();
        let mut sub_tokens = 0usize;
        for clause in clauses {
            let count = self.tokenizer.count_tokens(clause);
            if sub_tokens + count > max_tokens && !sub.is_empty() {
                chunks.push(sub.join(" "));
                sub.clear();
                sub_tokens = 0;
            }
            sub.push(clause);
            sub_tokens += count;
        }
        if !sub.is_empty() {
            chunks.push(sub.join(" "));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mode: markdown (structure-aware)
    // ═══════════════════════════════════════════════════════════════════════

    pub fn split_markdown(&self, text: &str) -> Vec<String> {
        let s = text.replace("\r\n", "\n");
        if s.trim().is_empty() {
            return Vec::new();
        }

        let heading_re = Regex::new(r"^\s{0,3}#{1,6}\s+\S").expect("static regex");
        let fence_re = Regex::new(r"^\s*```").expect("static regex");

        let mut parts: Vec<String> = Vec::new();
        let mut buf: Vec<&str> = Vec::new();
        let mut in_fence = false;

        for line in s.split('\n') {
            if fence_re.is_match(line) {
                // Fence markers stay with the code block.
                buf.push(line);
                in_fence = !in_fence;
                continue;
            }
            if !in_fence && heading_re.is_match(line) {
                if !buf.is_empty() {
                    parts.push(buf.join("\n").trim().to_string());
                    buf.clear();
                }
                buf.push(line);
                continue;
            }
            buf.push(line);
        }
        if !buf.is_empty() {
            parts.push(buf.join("\n").trim().to_string());
        }
        parts.retain(|p| !p.is_empty());

        self.pack_parts(&parts)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Mode: embedding (semantic boundaries)
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn split_semantic(
        &self,
        text: &str,
        embedder: &Arc<dyn Embedder>,
    ) -> EngineResult<Vec<String>> {
        let max_tokens = self.config.max_tokens.max(1);
        let mut units = unitize_sentences(text);
        if units.is_empty() {
            return Ok(Vec::new());
        }
        units.truncate(MAX_SEMANTIC_UNITS);

        // A cache-backed embedder makes this affordable on reruns.
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(units.len());
        for unit in &units {
            embeddings.push(embedder.embed(unit).await?);
        }

        let sims: Vec<f32> = embeddings
            .windows(2)
            .map(|pair| cosine_similarity(&pair[0], &pair[1]))
            .collect();

        // Adaptive cutoff across very different documents: at least as
        // strict as (μ − 0.5σ).
        let mut cutoff = self.config.semantic_threshold;
        if !sims.is_empty() {
            let mu = sims.iter().sum::<f32>() / sims.len() as f32;
            let var =
                sims.iter().map(|s| (s - mu) * (s - mu)).sum::<f32>() / sims.len() as f32;
            cutoff = cutoff.min(mu - 0.5 * var.sqrt()).clamp(0.0, 0.99);
        }
        debug!("[canopy:split] semantic cutoff {:.3} over {} units", cutoff, units.len());

        let mut segments: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;

        for (i, unit) in units.iter().enumerate() {
            let count = self.tokenizer.count_tokens(unit);
            if current_tokens + count > max_tokens && !current.is_empty() {
                segments.push(current.join(" "));
                current.clear();
                current_tokens = 0;
            }
            current.push(unit);
            current_tokens += count;

            // Topic shift with enough substance accumulated: cut here.
            if i < sims.len()
                && sims[i] < cutoff
                && current_tokens >= self.config.min_chunk_tokens
            {
                segments.push(current.join(" "));
                current.clear();
                current_tokens = 0;
            }
        }
        if !current.is_empty() {
            segments.push(current.join(" "));
        }

        Ok(self.pack_parts(&segments))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shared packing
    // ═══════════════════════════════════════════════════════════════════════

    /// Pack pre-ordered parts into chunks under the token budget with token
    /// overlap between adjacent chunks. Oversized parts fall back to the
    /// fixed splitter.
    fn pack_parts(&self, parts: &[String]) -> Vec<String> {
        let max_tokens = self.config.max_tokens.max(1);
        let overlap_tokens = self.config.overlap;

        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let count = self.tokenizer.count_tokens(part);

            if count > max_tokens {
                if !current.is_empty() {
                    chunks.push(current.join("\n\n"));
                    current.clear();
                    current_tokens = 0;
                }
                for sub in self.split_fixed(part) {
                    chunks.push(sub);
                }
                continue;
            }

            if current_tokens + count > max_tokens && !current.is_empty() {
                chunks.push(current.join("\n\n"));
                current.clear();
                current_tokens = 0;
                if overlap_tokens > 0 {
                    let tail = chunks.last().expect("just pushed");
                    let carry = tail_tokens(tail, overlap_tokens, &self.tokenizer);
                    if !carry.is_empty() {
                        current_tokens = self.tokenizer.count_tokens(&carry);
                        current.push(carry);
                    }
                }
            }

            current.push(part.to_string());
            current_tokens += count;
        }

        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
        }

        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }
}

/// Simple sentence unitizer for semantic mode — fast and offline.
fn unitize_sentences(text: &str) -> Vec<String> {
    let s = text.replace("\r\n", "\n");
    if s.trim().is_empty() {
        return Vec::new();
    }
    let re = Regex::new(r"(?:[.!?])\s+|\n+").expect("static regex");
    re.split(&s).map(str::trim).filter(|u| !u.is_empty()).map(str::to_string).collect()
}

/// Keep roughly the last `overlap_tokens` worth of text from a chunk, cut at
/// a word boundary.
fn tail_tokens(text: &str, overlap_tokens: usize, tokenizer: &Tokenizer) -> String {
    let want_chars = tokenizer.chars_for_tokens(overlap_tokens);
    if text.len() <= want_chars {
        return text.to_string();
    }
    let mut start = text.len() - want_chars;
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    match text[start..].find(char::is_whitespace) {
        Some(ws) => text[start + ws..].trim().to_string(),
        None => text[start..].trim().to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::SplitMode;

    fn splitter(max_tokens: usize, overlap: usize) -> TextSplitter {
        TextSplitter::new(
            SplitterConfig { max_tokens, overlap, ..Default::default() },
            Tokenizer::heuristic(),
        )
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(splitter(100, 0).split_fixed("").is_empty());
        assert!(splitter(100, 0).split_markdown("   \n  ").is_empty());
    }

    #[test]
    fn short_text_is_one_chunk() {
        let chunks = splitter(200, 0).split_fixed("One sentence. Two sentences.");
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunks_respect_token_budget() {
        let text = "The first topic covers deployment pipelines in detail. \
                    The second topic explains rollback procedures carefully. \
                    The third topic documents monitoring dashboards thoroughly. \
                    The fourth topic lists escalation contacts completely."
            .repeat(4);
        let s = splitter(40, 0);
        let chunks = s.split_fixed(&text);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(
                s.tokenizer.count_tokens(chunk) <= 40 + 8,
                "chunk exceeded budget: {} tokens",
                s.tokenizer.count_tokens(chunk)
            );
        }
    }

    #[test]
    fn oversized_indivisible_unit_becomes_one_chunk() {
        // No sentence or clause delimiters anywhere.
        let giant = "word ".repeat(300).trim().to_string();
        let chunks = splitter(10, 0).split_fixed(&giant);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], giant);
    }

    #[test]
    fn oversized_sentence_recurses_on_clauses() {
        let long = format!(
            "{}, {}, {}",
            "alpha beta gamma delta epsilon zeta".repeat(4),
            "eta theta iota kappa lambda mu".repeat(4),
            "nu xi omicron pi rho sigma".repeat(4)
        );
        let chunks = splitter(12, 0).split_fixed(&long);
        assert!(chunks.len() >= 2, "expected clause-level split, got {:?}", chunks.len());
    }

    #[test]
    fn markdown_splits_at_headings() {
        let doc = "# Intro\nSome intro text here.\n\n## Deploy\nDeploy instructions.\n\n## Rollback\nRollback instructions.";
        let chunks = splitter(20, 0).split_markdown(doc);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].starts_with("# Intro"));
    }

    #[test]
    fn markdown_keeps_fences_atomic() {
        let doc = "# Runbook\nintro\n```bash\nkubectl get pods\n# this hash is not a heading\nkubectl rollout undo\n```\ntail text";
        let chunks = splitter(500, 0).split_markdown(doc);
        let joined = chunks.join("\n---\n");
        // Fence content must stay inside one chunk.
        let with_fence: Vec<&String> =
            chunks.iter().filter(|c| c.contains("kubectl get pods")).collect();
        assert_eq!(with_fence.len(), 1);
        assert!(with_fence[0].contains("rollout undo"), "fence was split: {joined}");
    }

    #[test]
    fn overlap_carries_text_between_chunks() {
        let text = "Sentence one about kafka. Sentence two about brokers. \
                    Sentence three about partitions. Sentence four about lag. \
                    Sentence five about offsets. Sentence six about rebalance."
            .repeat(3);
        let with = splitter(30, 2).split_fixed(&text);
        let without = splitter(30, 0).split_fixed(&text);
        assert!(with.len() >= without.len());
        // Overlapping sentences should repeat across chunk boundaries.
        if with.len() >= 2 {
            let first_tail: Vec<&str> = with[0].rsplit(". ").take(1).collect();
            assert!(
                with[1].contains(first_tail[0].trim_end_matches('.')),
                "no overlap carried into second chunk"
            );
        }
    }

    #[tokio::test]
    async fn embedding_mode_without_embedder_is_config_error() {
        let s = TextSplitter::new(
            SplitterConfig { mode: SplitMode::Embedding, ..Default::default() },
            Tokenizer::heuristic(),
        );
        assert!(matches!(
            s.split("text", None).await,
            Err(crate::atoms::error::EngineError::Config(_))
        ));
    }
}
