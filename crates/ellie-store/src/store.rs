use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use ellie_core::similarity::{blob_to_embedding, embedding_to_blob};
use ellie_core::text::{query_terms, term_overlap};
use ellie_core::{
    ChatMessage, EllieError, Entity, Memory, MemoryId, MemoryKind, MemoryStatus, NewMemory, OrgId, Result,
    TaxonomyNode,
};

/// Most recent rows considered by one lexical search.
pub(crate) const SEARCH_SCAN_LIMIT: usize = 2000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        importance INTEGER NOT NULL,
        confidence REAL NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        superseded_by TEXT,
        occurred_at TEXT NOT NULL,
        project_id TEXT,
        conversation_id TEXT,
        room_id TEXT,
        embedding BLOB,
        classified_at TEXT,
        classified_model TEXT,
        classified_trace_id TEXT,
        classify_failures INTEGER NOT NULL DEFAULT 0,
        classify_failed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memories_org_status ON memories(org_id, status);
    CREATE INDEX IF NOT EXISTS idx_memories_superseded ON memories(superseded_by);

    CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        project_id TEXT,
        conversation_id TEXT,
        author TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_chat_room ON chat_messages(org_id, room_id, created_at, id);

    CREATE TABLE IF NOT EXISTS room_cursors (
        org_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        last_message_id TEXT,
        last_created_at TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (org_id, room_id)
    );

    CREATE TABLE IF NOT EXISTS taxonomy_nodes (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        parent_id TEXT,
        slug TEXT NOT NULL,
        depth INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_taxonomy_org ON taxonomy_nodes(org_id);

    CREATE TABLE IF NOT EXISTS memory_classifications (
        memory_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        confidence REAL NOT NULL,
        model TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (memory_id, node_id)
    );

    CREATE TABLE IF NOT EXISTS dedup_reviewed_pairs (
        org_id TEXT NOT NULL,
        memory_a TEXT NOT NULL,
        memory_b TEXT NOT NULL,
        model TEXT NOT NULL,
        trace_id TEXT NOT NULL,
        reviewed_at TEXT NOT NULL,
        PRIMARY KEY (org_id, memory_a, memory_b)
    );

    CREATE TABLE IF NOT EXISTS dedup_failed_reviews (
        org_id TEXT NOT NULL,
        memory_a TEXT NOT NULL,
        memory_b TEXT NOT NULL,
        failures INTEGER NOT NULL DEFAULT 1,
        failed_at TEXT NOT NULL,
        PRIMARY KEY (org_id, memory_a, memory_b)
    );

    CREATE TABLE IF NOT EXISTS entities (
        id TEXT PRIMARY KEY,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL,
        mention_count INTEGER NOT NULL DEFAULT 0,
        synthesis_memory_id TEXT,
        stale INTEGER NOT NULL DEFAULT 0,
        skipped_at_mentions INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (org_id, name_key)
    );

    CREATE TABLE IF NOT EXISTS entity_mentions (
        entity_id TEXT NOT NULL,
        memory_id TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (entity_id, memory_id)
    );

    CREATE TABLE IF NOT EXISTS retrieval_strategies (
        org_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        active INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (org_id, version)
    );

    CREATE TABLE IF NOT EXISTS injections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        org_id TEXT NOT NULL,
        room_id TEXT NOT NULL,
        memory_id TEXT NOT NULL,
        score REAL NOT NULL,
        injected_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_injections_room ON injections(org_id, room_id, injected_at);
";

/// Columns read by [`memory_from_row`], in order. Aliased `m`.
pub(crate) const MEMORY_COLUMNS: &str = "m.id, m.org_id, m.kind, m.title, m.content, m.metadata, m.importance, \
     m.confidence, m.status, m.superseded_by, m.occurred_at, m.project_id, m.conversation_id, m.room_id, \
     m.embedding, m.created_at, m.updated_at";

/// Columns read by [`message_from_row`], in order.
pub(crate) const MESSAGE_COLUMNS: &str = "id, org_id, room_id, project_id, conversation_id, author, content, created_at";

/// SQLite implementation of every Ellie store capability.
///
/// Clones share one connection. Timestamps are fixed-width RFC 3339 strings so
/// text ordering matches time ordering; embeddings are little-endian f32 blobs.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening memory store");
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path).map_err(EllieError::store)?;
        Self::init(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(EllieError::store)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        // WAL for concurrent readers across worker processes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
            .map_err(EllieError::store)?;
        conn.execute_batch(SCHEMA).map_err(EllieError::store)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.db.lock()
    }

    // ── Direct writes (seeding, CLI, tests) ────────────────────

    /// Insert a memory and return its id.
    pub fn add_memory(&self, memory: &NewMemory) -> Result<MemoryId> {
        let db = self.conn();
        insert_memory_row(&db, memory, Utc::now())
    }

    /// Store a chat message. Re-inserting the same id is a no-op.
    pub fn add_chat_message(&self, msg: &ChatMessage) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO chat_messages (id, org_id, room_id, project_id, conversation_id, author, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    msg.id.to_string(),
                    msg.org_id.to_string(),
                    msg.room_id.to_string(),
                    msg.project_id.map(|p| p.to_string()),
                    msg.conversation_id.map(|c| c.to_string()),
                    msg.author,
                    msg.content,
                    ts(msg.created_at),
                ],
            )
            .map_err(EllieError::store)?;
        Ok(())
    }

    pub fn add_taxonomy_node(&self, node: &TaxonomyNode) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO taxonomy_nodes (id, org_id, parent_id, slug, depth) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET parent_id = excluded.parent_id, slug = excluded.slug, depth = excluded.depth",
                params![
                    node.id.to_string(),
                    node.org_id.to_string(),
                    node.parent_id.map(|p| p.to_string()),
                    node.slug,
                    node.depth,
                ],
            )
            .map_err(EllieError::store)?;
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn get_memory(&self, org_id: OrgId, id: MemoryId) -> Result<Option<Memory>> {
        let db = self.conn();
        db.query_row(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.org_id = ?1 AND m.id = ?2"),
            params![org_id.to_string(), id.to_string()],
            memory_from_row,
        )
        .optional()
        .map_err(EllieError::store)
    }

    /// Memories of the org with the given status, newest first.
    pub fn list_memories(&self, org_id: OrgId, status: MemoryStatus, limit: usize) -> Result<Vec<Memory>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m WHERE m.org_id = ?1 AND m.status = ?2
                 ORDER BY m.occurred_at DESC, m.id LIMIT ?3"
            ))
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![org_id.to_string(), status.as_str(), limit as i64], memory_from_row)
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    /// (node id, confidence) assignments of a memory.
    pub fn classifications(&self, memory_id: MemoryId) -> Result<Vec<(Uuid, f64)>> {
        let db = self.conn();
        let mut stmt = db
            .prepare("SELECT node_id, confidence FROM memory_classifications WHERE memory_id = ?1 ORDER BY node_id")
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![memory_id.to_string()], |row| Ok((uuid_at(row, 0)?, row.get::<_, f64>(1)?)))
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    /// Entity by case-insensitive name.
    pub fn find_entity(&self, org_id: OrgId, name: &str) -> Result<Option<Entity>> {
        let db = self.conn();
        db.query_row(
            "SELECT id, org_id, name, mention_count, synthesis_memory_id, stale FROM entities
             WHERE org_id = ?1 AND name_key = ?2",
            params![org_id.to_string(), name.to_lowercase()],
            entity_from_row,
        )
        .optional()
        .map_err(EllieError::store)
    }

    /// Whether a pair is in the reviewed-pairs ledger.
    pub fn is_pair_reviewed(&self, org_id: OrgId, a: MemoryId, b: MemoryId) -> Result<bool> {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        let db = self.conn();
        let found: Option<i64> = db
            .query_row(
                "SELECT 1 FROM dedup_reviewed_pairs WHERE org_id = ?1 AND memory_a = ?2 AND memory_b = ?3",
                params![org_id.to_string(), a.to_string(), b.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(EllieError::store)?;
        Ok(found.is_some())
    }
}

// ── Row helpers ────────────────────────────────────────────────

/// Fixed-width UTC timestamp, so text order equals time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e))
}

pub(crate) fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(|e| conversion(idx, e))).transpose()
}

pub(crate) fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

pub(crate) fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion(idx, e))
    })
    .transpose()
}

pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let kind: String = row.get(2)?;
    let metadata: String = row.get(5)?;
    let status: String = row.get(8)?;
    let embedding: Option<Vec<u8>> = row.get(14)?;
    Ok(Memory {
        id: uuid_at(row, 0)?,
        org_id: uuid_at(row, 1)?,
        kind: kind.parse::<MemoryKind>().map_err(|e| conversion(2, e))?,
        title: row.get(3)?,
        content: row.get(4)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion(5, e))?,
        importance: row.get::<_, i64>(6)?.clamp(1, 5) as u8,
        confidence: row.get(7)?,
        status: status.parse::<MemoryStatus>().map_err(|e| conversion(8, e))?,
        superseded_by: opt_uuid_at(row, 9)?,
        occurred_at: time_at(row, 10)?,
        project_id: opt_uuid_at(row, 11)?,
        conversation_id: opt_uuid_at(row, 12)?,
        room_id: opt_uuid_at(row, 13)?,
        embedding: embedding.as_deref().and_then(blob_to_embedding),
        created_at: time_at(row, 15)?,
        updated_at: time_at(row, 16)?,
    })
}

pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: uuid_at(row, 0)?,
        org_id: uuid_at(row, 1)?,
        room_id: uuid_at(row, 2)?,
        project_id: opt_uuid_at(row, 3)?,
        conversation_id: opt_uuid_at(row, 4)?,
        author: row.get(5)?,
        content: row.get(6)?,
        created_at: time_at(row, 7)?,
    })
}

/// Reads `id, org_id, name, mention_count, synthesis_memory_id, stale`.
pub(crate) fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: uuid_at(row, 0)?,
        org_id: uuid_at(row, 1)?,
        name: row.get(2)?,
        mention_count: row.get::<_, i64>(3)?.max(0) as u32,
        synthesis_memory_id: opt_uuid_at(row, 4)?,
        stale: row.get::<_, i64>(5)? != 0,
    })
}

pub(crate) fn insert_memory_row(conn: &Connection, memory: &NewMemory, now: DateTime<Utc>) -> Result<MemoryId> {
    let id = Uuid::new_v4();
    let metadata = serde_json::to_string(&memory.metadata)?;
    let embedding = memory.embedding.as_deref().map(embedding_to_blob);
    conn.execute(
        "INSERT INTO memories (id, org_id, kind, title, content, metadata, importance, confidence, status,
                               occurred_at, project_id, conversation_id, room_id, embedding, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            id.to_string(),
            memory.org_id.to_string(),
            memory.kind.as_str(),
            memory.title,
            memory.content,
            metadata,
            i64::from(memory.importance),
            memory.confidence,
            ts(memory.occurred_at),
            memory.project_id.map(|p| p.to_string()),
            memory.conversation_id.map(|c| c.to_string()),
            memory.room_id.map(|r| r.to_string()),
            embedding,
            ts(now),
        ],
    )
    .map_err(EllieError::store)?;
    Ok(id)
}

/// Rank rows by term overlap with `query`, best first, ties broken by the
/// order the rows arrived in (newest first).
pub(crate) fn rank_lexical<T>(query: &str, rows: Vec<T>, text: impl Fn(&T) -> String, limit: usize) -> Vec<(T, f32)> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return Vec::new();
    }
    let mut scored: Vec<(T, f32)> = rows
        .into_iter()
        .filter_map(|row| {
            let score = term_overlap(&terms, &text(&row));
            (score > 0.0).then_some((row, score))
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(limit);
    scored
}
