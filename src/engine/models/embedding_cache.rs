// ── Canopy Models: Embedding Cache ─────────────────────────────────────────
//
// Persistent key-value cache for embedding vectors, keyed by
// (model_id, sha256(text)). SQLite with WAL; vectors stored as
// little-endian f32 blobs.
//
// Concurrency contract: key-granular. Concurrent misses may duplicate the
// provider call (embedding is idempotent); writes take a short lock.
// Corrupt rows (wrong blob length, decode failure) are treated as misses
// and overwritten — never propagated.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;

use crate::atoms::error::EngineResult;
use crate::engine::models::embedding::Embedder;

pub(crate) fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

fn blob_to_vec(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Some(out)
}

// ═══════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════

pub struct EmbeddingCache {
    conn: Mutex<Connection>,
}

impl EmbeddingCache {
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory cache, mainly for tests.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS embeddings (
               model_id    TEXT NOT NULL,
               text_sha256 TEXT NOT NULL,
               dim         INTEGER NOT NULL,
               vector      BLOB NOT NULL,
               PRIMARY KEY (model_id, text_sha256)
             )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn get(&self, model_id: &str, text: &str) -> Option<Vec<f32>> {
        let sha = sha256_hex(text);
        let conn = self.conn.lock();
        let row: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT dim, vector FROM embeddings WHERE model_id = ?1 AND text_sha256 = ?2",
                params![model_id, sha],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .ok()
            .flatten();

        let (dim, blob) = row?;
        match blob_to_vec(&blob) {
            Some(vec) if vec.len() == dim as usize => Some(vec),
            // Corrupt row: treat as a miss. The next put overwrites it.
            _ => None,
        }
    }

    pub fn put(&self, model_id: &str, text: &str, vector: &[f32]) -> EngineResult<()> {
        if vector.is_empty() {
            return Ok(());
        }
        let sha = sha256_hex(text);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (model_id, text_sha256, dim, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![model_id, sha, vector.len() as i64, vec_to_blob(vector)],
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Caching wrapper
// ═══════════════════════════════════════════════════════════════════════════

/// Wraps any `Embedder` with the persistent cache. Hit path is synchronous;
/// misses call through and write back.
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Embedder for CachedEmbedder {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensionality(&self) -> usize {
        self.inner.dimensionality()
    }

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        if let Some(hit) = self.cache.get(self.inner.model_id(), text) {
            return Ok(hit);
        }
        let vec = self.inner.embed(text).await?;
        if let Err(e) = self.cache.put(self.inner.model_id(), text, &vec) {
            log::warn!("[models:embed-cache] write failed: {}", e);
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
    use crate::atoms::error::EngineResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "counting"
        }
        fn dimensionality(&self) -> usize {
            3
        }
        async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0, 2.0])
        }
    }

    #[test]
    fn blob_round_trip() {
        let v = vec![1.5f32, -2.25, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)).unwrap(), v);
    }

    #[test]
    fn corrupt_blob_is_a_miss() {
        assert!(blob_to_vec(&[1, 2, 3]).is_none());
        assert!(blob_to_vec(&[]).is_none());
    }

    #[test]
    fn cache_round_trip_and_overwrite() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        assert!(cache.get("m", "hello").is_none());
        cache.put("m", "hello", &[1.0, 2.0]).unwrap();
        assert_eq!(cache.get("m", "hello").unwrap(), vec![1.0, 2.0]);
        cache.put("m", "hello", &[3.0]).unwrap();
        assert_eq!(cache.get("m", "hello").unwrap(), vec![3.0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_keys_include_model_id() {
        let cache = EmbeddingCache::open_in_memory().unwrap();
        cache.put("a", "text", &[1.0]).unwrap();
        assert!(cache.get("b", "text").is_none());
    }

    #[tokio::test]
    async fn cached_embedder_calls_inner_once() {
        let inner = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let cache = Arc::new(EmbeddingCache::open_in_memory().unwrap());
        let cached = CachedEmbedder::new(inner.clone(), cache);

        let a = cached.embed("same text").await.unwrap();
        let b = cached.embed("same text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
