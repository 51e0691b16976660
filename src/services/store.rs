// src/services/store.rs
//! Minimal single-writer engine store.
//!
//! - Owns a single SQLite connection (WAL) to avoid multi-writer contention.
//! - Creates every table the engine reads or writes; timestamps are RFC3339
//!   UTC TEXT, embeddings are little-endian f32 BLOBs, JSON columns hold
//!   topics / key events / evidence.
//! - Every mutable row carries a `version` stamp; mutations go through
//!   conditional updates retried with exponential backoff (`with_backoff`).
//! - Knowledge items are never deleted, only decayed toward a floor.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::error::{EngineError, Result};

/// Store is the single authority for writing to SQLite.
/// `db` is `pub(crate)` so sibling services can run their own read/write SQL.
pub struct Store {
    pub(crate) db: Connection,
    pub(crate) write_retries: u32,
    pub(crate) backoff_base_ms: u64,
}

/// One unit of stored memory. `decay_score` is derived-only: recomputable
/// from the timestamps and access count, never hand-edited.
#[derive(Debug, Clone)]
pub struct KnowledgeItem {
    pub item_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub item_class: String,
    pub project_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub decay_score: f64,
    pub score_computed_at: DateTime<Utc>,
    pub version: i64,
}

/// Intake shape at the ingestion boundary: content plus a precomputed
/// embedding. The engine never computes embeddings itself.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub item_id: Option<String>,
    pub content: String,
    pub embedding: Vec<f32>,
    pub item_class: String,
    pub project_code: Option<String>,
}

impl Store {
    /// Open/create the SQLite DB and ensure schema.
    pub fn open(db_path: &Path, cfg: &StoreConfig) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Connection::open(db_path)?;

        // WAL reduces writer/reader blocking; safe for our single-writer design.
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS items (
              item_id          TEXT PRIMARY KEY,
              content          TEXT NOT NULL,
              embedding        BLOB NOT NULL,      -- little-endian f32s
              item_class       TEXT NOT NULL,      -- drives the decay half-life
              project_code     TEXT,
              created_at       TEXT NOT NULL,      -- RFC3339 UTC
              last_accessed_at TEXT NOT NULL,
              access_count     INTEGER NOT NULL DEFAULT 0,
              decay_score      REAL NOT NULL DEFAULT 1.0,
              score_computed_at TEXT NOT NULL,    -- when decay_score was derived
              version          INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_items_project ON items(project_code);

            -- Directed typed relations; written only at the graph-authoring
            -- boundary, read-only to the engine.
            CREATE TABLE IF NOT EXISTS edges (
              source_id TEXT NOT NULL,
              target_id TEXT NOT NULL,
              edge_type TEXT NOT NULL,
              weight    REAL NOT NULL,
              PRIMARY KEY (source_id, target_id, edge_type)
            );
            CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);

            CREATE TABLE IF NOT EXISTS episodes (
              episode_id    TEXT PRIMARY KEY,
              project_code  TEXT NOT NULL,
              episode_type  TEXT NOT NULL,
              title         TEXT NOT NULL,
              summary       TEXT NOT NULL DEFAULT '',
              status        TEXT NOT NULL,
              started_at    TEXT NOT NULL,
              ended_at      TEXT,
              last_event_at TEXT NOT NULL,
              key_events    TEXT NOT NULL,         -- ordered JSON array
              topics        TEXT NOT NULL,         -- JSON array (set)
              decay_score   REAL NOT NULL DEFAULT 1.0,
              access_count  INTEGER NOT NULL DEFAULT 0,
              version       INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_episodes_key
              ON episodes(project_code, episode_type, status);

            CREATE TABLE IF NOT EXISTS proposals (
              proposal_id      TEXT PRIMARY KEY,
              agent_id         TEXT NOT NULL,
              action_name      TEXT NOT NULL,
              title            TEXT NOT NULL,
              description      TEXT NOT NULL DEFAULT '',
              reasoning        TEXT NOT NULL DEFAULT '',
              payload          TEXT NOT NULL,      -- JSON, schema-checked at intake
              confidence       REAL NOT NULL,
              priority         TEXT NOT NULL,
              status           TEXT NOT NULL,
              reviewed_by      TEXT,
              review_notes     TEXT,
              execution_result TEXT,
              execution_error  TEXT,
              created_at       TEXT NOT NULL,
              updated_at       TEXT NOT NULL,
              version          INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_proposals_pair
              ON proposals(agent_id, action_name, status);

            CREATE TABLE IF NOT EXISTS learnings (
              learning_id     TEXT PRIMARY KEY,
              agent_id        TEXT NOT NULL,
              learning_type   TEXT NOT NULL,
              content         TEXT NOT NULL,
              confidence      REAL NOT NULL,
              applied_count   INTEGER NOT NULL DEFAULT 0,
              last_applied_at TEXT
            );

            CREATE TABLE IF NOT EXISTS mistake_patterns (
              pattern_id          TEXT PRIMARY KEY,
              agent_id            TEXT NOT NULL,
              action_name         TEXT NOT NULL,
              pattern_description TEXT NOT NULL,
              category            TEXT NOT NULL,
              occurrence_count    INTEGER NOT NULL DEFAULT 1,
              first_seen_at       TEXT NOT NULL,
              last_seen_at        TEXT NOT NULL,
              status              TEXT NOT NULL DEFAULT 'active',
              resolution_notes    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_patterns_pair
              ON mistake_patterns(agent_id, action_name, status);

            -- Full recompute per (agent, action); never incrementally patched.
            CREATE TABLE IF NOT EXISTS calibration (
              agent_id              TEXT NOT NULL,
              action_name           TEXT NOT NULL,
              total_actions         INTEGER NOT NULL,
              mean_confidence       REAL NOT NULL,
              mean_success_rate     REAL NOT NULL,
              calibration_error     REAL NOT NULL,
              overconfidence_rate   REAL NOT NULL,
              underconfidence_rate  REAL NOT NULL,
              confidence_adjustment REAL NOT NULL,
              calculated_at         TEXT NOT NULL,
              PRIMARY KEY (agent_id, action_name)
            );

            -- Transition log is the audit source of truth; autonomy_levels is
            -- the materialized current level, updated in the same transaction
            -- as each approval.
            CREATE TABLE IF NOT EXISTS autonomy_transitions (
              transition_id  TEXT PRIMARY KEY,
              agent_id       TEXT NOT NULL,
              action_name    TEXT NOT NULL,
              previous_level INTEGER NOT NULL,
              new_level      INTEGER NOT NULL,
              reason         TEXT NOT NULL,
              evidence       TEXT NOT NULL,
              approved_by    TEXT,
              status         TEXT NOT NULL,
              created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_pair
              ON autonomy_transitions(agent_id, action_name, status);

            CREATE TABLE IF NOT EXISTS autonomy_levels (
              agent_id    TEXT NOT NULL,
              action_name TEXT NOT NULL,
              level       INTEGER NOT NULL,
              updated_at  TEXT NOT NULL,
              PRIMARY KEY (agent_id, action_name)
            );
            "#,
        )?;

        Ok(Self {
            db,
            write_retries: cfg.write_retries,
            backoff_base_ms: cfg.backoff_base_ms,
        })
    }

    // ---------- knowledge items ----------

    /// Insert a knowledge item at the ingestion boundary. Re-ingesting an
    /// existing id refreshes content/embedding but keeps the access history
    /// (idempotent under at-least-once delivery).
    pub fn insert_item(&self, item: &NewItem) -> Result<String> {
        if item.embedding.is_empty() {
            return Err(EngineError::schema("embedding", "must not be empty"));
        }
        let item_id = item
            .item_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now().to_rfc3339();
        self.db.execute(
            r#"
            INSERT INTO items(item_id, content, embedding, item_class, project_code,
                              created_at, last_accessed_at, access_count, decay_score,
                              score_computed_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 1.0, ?6, 0)
            ON CONFLICT(item_id) DO UPDATE SET
              content      = excluded.content,
              embedding    = excluded.embedding,
              item_class   = excluded.item_class,
              project_code = excluded.project_code,
              version      = items.version + 1
            "#,
            (
                &item_id,
                &item.content,
                embedding_to_blob(&item.embedding),
                &item.item_class,
                &item.project_code,
                &now,
            ),
        )?;
        Ok(item_id)
    }

    pub fn get_item(&self, item_id: &str) -> Result<Option<KnowledgeItem>> {
        let mut stmt = self.db.prepare(
            "SELECT item_id, content, embedding, item_class, project_code,
                    created_at, last_accessed_at, access_count, decay_score,
                    score_computed_at, version
             FROM items WHERE item_id=?1",
        )?;
        let mut rows = stmt.query([item_id])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(item_from_row(row)?));
        }
        Ok(None)
    }

    pub fn require_item(&self, item_id: &str) -> Result<KnowledgeItem> {
        self.get_item(item_id)?
            .ok_or_else(|| EngineError::not_found("item", item_id))
    }

    pub fn item_exists(&self, item_id: &str) -> Result<bool> {
        let mut stmt = self
            .db
            .prepare("SELECT 1 FROM items WHERE item_id=?1 LIMIT 1")?;
        Ok(stmt.exists([item_id])?)
    }

    /// All (id, embedding) pairs, for the exact vector backend.
    pub fn all_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let mut stmt = self.db.prepare("SELECT item_id, embedding FROM items")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob_to_embedding(&blob)))
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    // ---------- optimistic concurrency ----------

    /// Attempts a conditional mutation may make before surfacing `Conflict`.
    pub(crate) fn write_attempts(&self) -> u32 {
        self.write_retries + 1
    }

    /// Exponential backoff between conditional-update attempts.
    pub(crate) fn backoff(&self, attempt: u32) {
        std::thread::sleep(Duration::from_millis(
            self.backoff_base_ms << attempt.min(6),
        ));
    }

    pub(crate) fn conflict(&self, entity: &'static str, id: &str) -> EngineError {
        EngineError::Conflict {
            entity,
            id: id.to_string(),
            attempts: self.write_attempts(),
        }
    }
}

fn item_from_row(row: &rusqlite::Row<'_>) -> Result<KnowledgeItem> {
    let blob: Vec<u8> = row.get(2)?;
    let created: String = row.get(5)?;
    let accessed: String = row.get(6)?;
    let computed: String = row.get(9)?;
    Ok(KnowledgeItem {
        item_id: row.get(0)?,
        content: row.get(1)?,
        embedding: blob_to_embedding(&blob),
        item_class: row.get(3)?,
        project_code: row.get(4)?,
        created_at: parse_ts(&created),
        last_accessed_at: parse_ts(&accessed),
        access_count: row.get(7)?,
        decay_score: row.get(8)?,
        score_computed_at: parse_ts(&computed),
        version: row.get(10)?,
    })
}

// ---------- codecs ----------

pub(crate) fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

pub(crate) fn blob_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Parse an RFC3339 TEXT column; malformed rows map to the epoch rather than
/// failing every read that touches them.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
