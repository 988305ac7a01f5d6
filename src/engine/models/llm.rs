// ── Canopy Models: Structured LLM Capability ───────────────────────────────
//
// `StructuredLlm` is the JSON-producing capability consumed by the content
// analyzer and conflict resolver: one prompt in, one parsed
// `serde_json::Value` out. The schema is conveyed in the prompt (the engine
// never trusts the model to honor it — callers parse defensively on top).
//
// The HTTP implementation strips markdown code fences and, as a last
// resort, regex-extracts the outermost JSON object/array from a chatty
// response before giving up.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::models::retry_with_backoff;

#[async_trait]
pub trait StructuredLlm: Send + Sync {
    fn model_id(&self) -> &str;

    /// One structured round trip. `schema_hint` names/describes the expected
    /// shape and is embedded into the system prompt.
    async fn complete_structured(
        &self,
        system: &str,
        prompt: &str,
        schema_hint: &str,
        max_tokens: usize,
    ) -> EngineResult<Value>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Defensive JSON extraction
// ═══════════════════════════════════════════════════════════════════════════

/// Parse model output into JSON, tolerating fences and prose around the
/// payload. Returns None only when nothing JSON-shaped can be recovered.
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    // 1. Direct parse.
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }

    // 2. Strip ```json fences.
    let fence = Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("static regex");
    if let Some(caps) = fence.captures(trimmed) {
        if let Ok(v) = serde_json::from_str::<Value>(caps[1].trim()) {
            return Some(v);
        }
    }

    // 3. Outermost object or array by brace matching.
    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if end > start {
                if let Ok(v) = serde_json::from_str::<Value>(&trimmed[start..=end]) {
                    return Some(v);
                }
            }
        }
    }

    None
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP implementation (chat-completions dialect)
// ═══════════════════════════════════════════════════════════════════════════

pub struct HttpStructuredLlm {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
}

impl HttpStructuredLlm {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: 0.1,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    async fn call(
        &self,
        system: &str,
        prompt: &str,
        schema_hint: &str,
        max_tokens: usize,
    ) -> EngineResult<Value> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let full_system = format!(
            "{system}\n\nRespond with a single JSON value matching this shape, and \
             nothing else:\n{schema_hint}"
        );
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                { "role": "system", "content": full_system },
                { "role": "user", "content": prompt },
            ],
            "max_tokens": max_tokens,
            "response_format": { "type": "json_object" },
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
            return Err(EngineError::provider("llm", format!("{} — {}", status, text)));
        }

        let v: Value = resp.json().await?;
        let content = v["choices"][0]["message"]["content"].as_str().unwrap_or_default();

        extract_json(content)
            .ok_or_else(|| EngineError::provider("llm", "response contained no parseable JSON"))
    }
}

#[async_trait]
impl StructuredLlm for HttpStructuredLlm {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete_structured(
        &self,
        system: &str,
        prompt: &str,
        schema_hint: &str,
        max_tokens: usize,
    ) -> EngineResult<Value> {
        retry_with_backoff("complete_structured", || {
            self.call(system, prompt, schema_hint, max_tokens)
        })
        .await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
