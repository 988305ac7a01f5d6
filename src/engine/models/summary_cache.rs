// ── Canopy Models: Summary Cache ───────────────────────────────────────────
//
// Persistent summary cache (SQLite, WAL). Keyed by
// (model_id, layer, max_tokens, sha256(context)) — a prompt change that
// alters any of those recomputes naturally. Thread-safe for concurrent
// reads/writes within one process; concurrent misses may duplicate work.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::atoms::error::EngineResult;
use crate::engine::models::embedding_cache::sha256_hex;

pub struct SummaryCache {
    conn: Mutex<Connection>,
}

impl SummaryCache {
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
            "CREATE TABLE IF NOT EXISTS summaries (
               model_id       TEXT NOT NULL,
               layer          INTEGER NOT NULL,
               max_tokens     INTEGER NOT NULL,
               context_sha256 TEXT NOT NULL,
               summary        TEXT NOT NULL,
               PRIMARY KEY (model_id, layer, max_tokens, context_sha256)
             )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn get(
        &self,
        model_id: &str,
        layer: i32,
        max_tokens: usize,
        context: &str,
    ) -> Option<String> {
        let sha = sha256_hex(context);
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT summary FROM summaries
             WHERE model_id = ?1 AND layer = ?2 AND max_tokens = ?3 AND context_sha256 = ?4",
            params![model_id, layer, max_tokens as i64, sha],
            |r| r.get::<_, String>(0),
        )
        .optional()
        .ok()
        .flatten()
        .filter(|s| !s.trim().is_empty())
    }

    pub fn put(
        &self,
        model_id: &str,
        layer: i32,
        max_tokens: usize,
        context: &str,
        summary: &str,
    ) -> EngineResult<()> {
        let s = summary.trim();
        if s.is_empty() {
            return Ok(());
        }
        let sha = sha256_hex(context);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO summaries
               (model_id, layer, max_tokens, context_sha256, summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![model_id, layer, max_tokens as i64, sha, s],
        )?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM summaries", [], |r| r.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
