// ── Canopy Models: Embedding Capability ────────────────────────────────────
//
// `Embedder` is the capability interface every vectorizing component
// consumes. `HttpEmbedder` speaks Ollama's `/api/embed` (with the legacy
// `/api/embeddings` fallback) and OpenAI-compatible `/v1/embeddings`, in
// that order — whichever the configured base URL actually serves.
//
// Failure policy: transient errors retry with exponential backoff; after the
// retry budget the call fails loudly. A zero vector is never fabricated.

use async_trait::async_trait;
use log::info;
use reqwest::Client;
use serde_json::{json, Value};

use crate::atoms::error::{EngineError, EngineResult};
use crate::engine::models::retry_with_backoff;

// ═══════════════════════════════════════════════════════════════════════════
// Capability
// ═══════════════════════════════════════════════════════════════════════════

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable model identifier; used as the embedding key on tree nodes and
    /// in the persistent cache.
    fn model_id(&self) -> &str;

    /// Fixed output dimensionality.
    fn dimensionality(&self) -> usize;

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;

    /// Default batch implementation embeds sequentially; providers with a
    /// real batch endpoint override this.
    async fn embed_batch(&self, texts: &[String]) -> EngineResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }
}

/// Cosine similarity over dense vectors. Mismatched or empty inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    let denom = na.sqrt() * nb.sqrt() + 1e-12;
    dot / denom
}

// ═══════════════════════════════════════════════════════════════════════════
// HTTP implementation
// ═══════════════════════════════════════════════════════════════════════════

pub struct HttpEmbedder {
    client: Client,
    base_url: String,
    model: String,
    dimensionality: usize,
    api_key: Option<String>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, dimensionality: usize) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            dimensionality,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn parse_vector(v: &Value) -> Option<Vec<f32>> {
        // New Ollama shape: { embeddings: [[f32...], ...] }
        if let Some(arr) = v["embeddings"].as_array() {
            if let Some(first) = arr.first().and_then(|e| e.as_array()) {
                let vec: Vec<f32> =
                    first.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
                if !vec.is_empty() {
                    return Some(vec);
                }
            }
        }
        // Legacy Ollama shape: { embedding: [f32...] }
        if let Some(arr) = v["embedding"].as_array() {
            let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
            if !vec.is_empty() {
                return Some(vec);
            }
        }
        // OpenAI-compatible shape: { data: [{ embedding: [f32...] }] }
        if let Some(arr) = v["data"][0]["embedding"].as_array() {
            let vec: Vec<f32> = arr.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect();
            if !vec.is_empty() {
                return Some(vec);
            }
        }
        None
    }

    async fn embed_ollama(&self, text: &str) -> EngineResult<Vec<f32>> {
        let resp = self
            .client
            .post(self.url("/api/embed"))
            .json(&json!({ "model": self.model, "input": text }))
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await?;

        if resp.status().is_success() {
            let v: Value = resp.json().await?;
            if let Some(vec) = Self::parse_vector(&v) {
                return Ok(vec);
            }
        } else {
            let status = resp.status();
            info!("[models:embed] /api/embed returned {} — trying legacy endpoint", status);
        }

        // Legacy endpoint takes `prompt` instead of `input`.
        let resp = self
            .client
            .post(self.url("/api/embeddings"))
            .json(&json!({ "model": self.model, "prompt": text }))
            .timeout(std::time::Duration::from_secs(60))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "ollama-embed",
                format!("{} — {}", status, body),
            ));
        }

        let v: Value = resp.json().await?;
        Self::parse_vector(&v)
            .ok_or_else(|| EngineError::provider("ollama-embed", "no embedding array in response"))
    }

    async fn embed_openai(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut req = self
            .client
            .post(self.url("/v1/embeddings"))
            .json(&json!({ "model": self.model, "input": text }))
            .timeout(std::time::Duration::from_secs(30));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::provider(
                "openai-embed",
                format!("{} — {}", status, body),
            ));
        }

        let v: Value = resp.json().await?;
        Self::parse_vector(&v)
            .ok_or_else(|| EngineError::provider("openai-embed", "no data[0].embedding in response"))
    }

    async fn embed_any(&self, text: &str) -> EngineResult<Vec<f32>> {
        match self.embed_ollama(text).await {
            Ok(vec) => Ok(vec),
            Err(ollama_err) => match self.embed_openai(text).await {
                Ok(vec) => Ok(vec),
                Err(openai_err) => Err(EngineError::provider(
                    "embed",
                    format!("ollama: {} | openai: {}", ollama_err, openai_err),
                )),
            },
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let vec = retry_with_backoff("embed", || self.embed_any(text)).await?;
        if vec.is_empty() {
            return Err(EngineError::provider("embed", "empty embedding vector"));
        }
        Ok(vec)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, -0.2, 0.9];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_handles_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn parse_vector_accepts_all_known_shapes() {
        let new_ollama = json!({ "embeddings": [[0.1, 0.2]] });
        let legacy = json!({ "embedding": [0.1, 0.2, 0.3] });
        let openai = json!({ "data": [{ "embedding": [0.5] }] });
        assert_eq!(HttpEmbedder::parse_vector(&new_ollama).unwrap().len(), 2);
        assert_eq!(HttpEmbedder::parse_vector(&legacy).unwrap().len(), 3);
        assert_eq!(HttpEmbedder::parse_vector(&openai).unwrap().len(), 1);
        assert!(HttpEmbedder::parse_vector(&json!({})).is_none());
    }
}
