//! Worker-side capabilities: ingestion, dedup, taxonomy, synthesis, backfill.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::collections::HashSet;
use tracing::debug;
use uuid::Uuid;

use ellie_core::similarity::embedding_to_blob;
use ellie_core::{
    ChatMessage, EllieError, Entity, Memory, MemoryId, NewMemory, OrgId, Result, RoomCursor, TaxonomyNode,
};
use ellie_workers::{
    Assignment, BackfillStore, DedupApplication, DedupStore, IngestionStore, SynthesisStore, SynthesisWrite,
    TaxonomyStore,
};

use crate::store::{
    MEMORY_COLUMNS, MESSAGE_COLUMNS, SqliteStore, entity_from_row, insert_memory_row, memory_from_row,
    message_from_row, opt_time_at, opt_uuid_at, ts, uuid_at,
};

fn canonical(a: MemoryId, b: MemoryId) -> (MemoryId, MemoryId) {
    if a <= b { (a, b) } else { (b, a) }
}

// ── Ingestion ──────────────────────────────────────────────────

#[async_trait]
impl IngestionStore for SqliteStore {
    async fn rooms_needing_ingestion(&self, limit: usize) -> Result<Vec<RoomCursor>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(
                "SELECT r.org_id, r.room_id, c.last_message_id, c.last_created_at
                 FROM (SELECT DISTINCT org_id, room_id FROM chat_messages) r
                 LEFT JOIN room_cursors c ON c.org_id = r.org_id AND c.room_id = r.room_id
                 WHERE c.last_created_at IS NULL
                    OR EXISTS (
                        SELECT 1 FROM chat_messages m
                        WHERE m.org_id = r.org_id AND m.room_id = r.room_id
                          AND (m.created_at > c.last_created_at
                               OR (m.created_at = c.last_created_at
                                   AND c.last_message_id IS NOT NULL AND m.id > c.last_message_id))
                    )
                 ORDER BY r.org_id, r.room_id
                 LIMIT ?1",
            )
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RoomCursor {
                    org_id: uuid_at(row, 0)?,
                    room_id: uuid_at(row, 1)?,
                    last_message_id: opt_uuid_at(row, 2)?,
                    last_created_at: opt_time_at(row, 3)?,
                })
            })
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn messages_after(&self, cursor: &RoomCursor, limit: usize) -> Result<Vec<ChatMessage>> {
        let db = self.conn();
        let org = cursor.org_id.to_string();
        let room = cursor.room_id.to_string();
        let limit = limit as i64;
        let base = format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE org_id = ?1 AND room_id = ?2");

        let rows = match (cursor.last_created_at, cursor.last_message_id) {
            (Some(at), Some(id)) => {
                let mut stmt = db
                    .prepare(&format!(
                        "{base} AND (created_at > ?3 OR (created_at = ?3 AND id > ?4))
                         ORDER BY created_at, id LIMIT ?5"
                    ))
                    .map_err(EllieError::store)?;
                stmt.query_map(params![org, room, ts(at), id.to_string(), limit], message_from_row)
                    .map_err(EllieError::store)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            }
            (Some(at), None) => {
                let mut stmt = db
                    .prepare(&format!("{base} AND created_at > ?3 ORDER BY created_at, id LIMIT ?4"))
                    .map_err(EllieError::store)?;
                stmt.query_map(params![org, room, ts(at), limit], message_from_row)
                    .map_err(EllieError::store)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            }
            _ => {
                let mut stmt = db
                    .prepare(&format!("{base} ORDER BY created_at, id LIMIT ?3"))
                    .map_err(EllieError::store)?;
                stmt.query_map(params![org, room, limit], message_from_row)
                    .map_err(EllieError::store)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            }
        };
        rows.map_err(EllieError::store)
    }

    async fn insert_memory(&self, memory: NewMemory) -> Result<MemoryId> {
        self.add_memory(&memory)
    }

    async fn record_entity_mention(&self, org_id: OrgId, name: &str, memory_id: MemoryId) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EllieError::Validation("entity name is empty".into()));
        }
        let now = ts(Utc::now());
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        tx.execute(
            "INSERT INTO entities (id, org_id, name, name_key, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(org_id, name_key) DO NOTHING",
            params![Uuid::new_v4().to_string(), org_id.to_string(), name, name.to_lowercase(), now],
        )
        .map_err(EllieError::store)?;
        let entity_id: String = tx
            .query_row(
                "SELECT id FROM entities WHERE org_id = ?1 AND name_key = ?2",
                params![org_id.to_string(), name.to_lowercase()],
                |row| row.get(0),
            )
            .map_err(EllieError::store)?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO entity_mentions (entity_id, memory_id, created_at) VALUES (?1, ?2, ?3)",
                params![entity_id, memory_id.to_string(), now],
            )
            .map_err(EllieError::store)?;
        if inserted > 0 {
            // A new mention invalidates any existing definition.
            tx.execute(
                "UPDATE entities SET mention_count = mention_count + 1,
                        stale = CASE WHEN synthesis_memory_id IS NULL THEN stale ELSE 1 END,
                        updated_at = ?2
                 WHERE id = ?1",
                params![entity_id, now],
            )
            .map_err(EllieError::store)?;
        }
        tx.commit().map_err(EllieError::store)?;
        Ok(())
    }

    async fn save_cursor(&self, cursor: &RoomCursor) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO room_cursors (org_id, room_id, last_message_id, last_created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(org_id, room_id) DO UPDATE SET
                    last_message_id = excluded.last_message_id,
                    last_created_at = excluded.last_created_at,
                    updated_at = excluded.updated_at",
                params![
                    cursor.org_id.to_string(),
                    cursor.room_id.to_string(),
                    cursor.last_message_id.map(|id| id.to_string()),
                    cursor.last_created_at.map(ts),
                    ts(Utc::now()),
                ],
            )
            .map_err(EllieError::store)?;
        Ok(())
    }
}

// ── Dedup ──────────────────────────────────────────────────────

#[async_trait]
impl DedupStore for SqliteStore {
    async fn dedup_orgs(&self) -> Result<Vec<OrgId>> {
        let db = self.conn();
        let mut stmt = db
            .prepare("SELECT DISTINCT org_id FROM memories WHERE status = 'active' ORDER BY org_id")
            .map_err(EllieError::store)?;
        let rows = stmt.query_map([], |row| uuid_at(row, 0)).map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn active_embedded_memories(&self, org_id: OrgId, limit: usize) -> Result<Vec<Memory>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m
                 WHERE m.org_id = ?1 AND m.status = 'active' AND m.embedding IS NOT NULL
                 ORDER BY m.occurred_at DESC, m.id LIMIT ?2"
            ))
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![org_id.to_string(), limit as i64], memory_from_row)
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn reviewed_pairs(
        &self,
        org_id: OrgId,
        pairs: &[(MemoryId, MemoryId)],
    ) -> Result<HashSet<(MemoryId, MemoryId)>> {
        let db = self.conn();
        let mut stmt = db
            .prepare("SELECT 1 FROM dedup_reviewed_pairs WHERE org_id = ?1 AND memory_a = ?2 AND memory_b = ?3")
            .map_err(EllieError::store)?;
        let mut reviewed = HashSet::new();
        for &(a, b) in pairs {
            let (lo, hi) = canonical(a, b);
            let found = stmt
                .exists(params![org_id.to_string(), lo.to_string(), hi.to_string()])
                .map_err(EllieError::store)?;
            if found {
                reviewed.insert((a, b));
            }
        }
        Ok(reviewed)
    }

    async fn failed_pairs(
        &self,
        org_id: OrgId,
        pairs: &[(MemoryId, MemoryId)],
        since: DateTime<Utc>,
    ) -> Result<HashSet<(MemoryId, MemoryId)>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(
                "SELECT 1 FROM dedup_failed_reviews
                 WHERE org_id = ?1 AND memory_a = ?2 AND memory_b = ?3 AND failed_at > ?4",
            )
            .map_err(EllieError::store)?;
        let since = ts(since);
        let mut failed = HashSet::new();
        for &(a, b) in pairs {
            let (lo, hi) = canonical(a, b);
            let found = stmt
                .exists(params![org_id.to_string(), lo.to_string(), hi.to_string(), since])
                .map_err(EllieError::store)?;
            if found {
                failed.insert((a, b));
            }
        }
        Ok(failed)
    }

    async fn record_failed_review(&self, org_id: OrgId, pairs: &[(MemoryId, MemoryId)], at: DateTime<Utc>) -> Result<()> {
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        for &(a, b) in pairs {
            let (lo, hi) = canonical(a, b);
            tx.execute(
                "INSERT INTO dedup_failed_reviews (org_id, memory_a, memory_b, failed_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(org_id, memory_a, memory_b) DO UPDATE SET
                    failures = failures + 1, failed_at = excluded.failed_at",
                params![org_id.to_string(), lo.to_string(), hi.to_string(), ts(at)],
            )
            .map_err(EllieError::store)?;
        }
        tx.commit().map_err(EllieError::store)?;
        Ok(())
    }

    async fn apply_dedup(&self, app: &DedupApplication) -> Result<Option<MemoryId>> {
        let now = Utc::now();
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;

        for id in &app.deprecate {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM memories WHERE org_id = ?1 AND id = ?2",
                    params![app.org_id.to_string(), id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(EllieError::store)?;
            if status.as_deref() != Some("active") {
                return Err(EllieError::Validation(format!("memory {id} is not an active memory of the org")));
            }
        }

        let merged_id = match &app.merged {
            Some(merged) => Some(insert_memory_row(&tx, merged, now)?),
            None => None,
        };
        let successor = merged_id.or(app.keep);
        for id in &app.deprecate {
            tx.execute(
                "UPDATE memories SET status = 'deprecated', superseded_by = ?3, updated_at = ?4
                 WHERE org_id = ?1 AND id = ?2",
                params![
                    app.org_id.to_string(),
                    id.to_string(),
                    successor.map(|s| s.to_string()),
                    ts(now)
                ],
            )
            .map_err(EllieError::store)?;
        }
        for &(a, b) in &app.pairs {
            let (lo, hi) = canonical(a, b);
            tx.execute(
                "INSERT OR IGNORE INTO dedup_reviewed_pairs (org_id, memory_a, memory_b, model, trace_id, reviewed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    app.org_id.to_string(),
                    lo.to_string(),
                    hi.to_string(),
                    app.model,
                    app.trace_id,
                    ts(now)
                ],
            )
            .map_err(EllieError::store)?;
        }
        tx.commit().map_err(EllieError::store)?;
        debug!(
            org_id = %app.org_id,
            deprecated = app.deprecate.len(),
            merged = merged_id.is_some(),
            "dedup decision stored"
        );
        Ok(merged_id)
    }
}

// ── Taxonomy ───────────────────────────────────────────────────

#[async_trait]
impl TaxonomyStore for SqliteStore {
    async fn orgs_with_taxonomy(&self) -> Result<Vec<OrgId>> {
        let db = self.conn();
        let mut stmt = db
            .prepare("SELECT DISTINCT org_id FROM taxonomy_nodes ORDER BY org_id")
            .map_err(EllieError::store)?;
        let rows = stmt.query_map([], |row| uuid_at(row, 0)).map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn taxonomy_nodes(&self, org_id: OrgId) -> Result<Vec<TaxonomyNode>> {
        let db = self.conn();
        let mut stmt = db
            .prepare("SELECT id, org_id, parent_id, slug, depth FROM taxonomy_nodes WHERE org_id = ?1 ORDER BY depth, slug")
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![org_id.to_string()], |row| {
                Ok(TaxonomyNode {
                    id: uuid_at(row, 0)?,
                    org_id: uuid_at(row, 1)?,
                    parent_id: opt_uuid_at(row, 2)?,
                    slug: row.get(3)?,
                    depth: row.get::<_, i64>(4)?.max(0) as u32,
                })
            })
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn unclassified_memories(
        &self,
        org_id: OrgId,
        retry_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m
                 WHERE m.org_id = ?1 AND m.status = 'active' AND m.classified_at IS NULL
                   AND (m.classify_failed_at IS NULL OR m.classify_failed_at <= ?2)
                 ORDER BY m.classify_failures, m.created_at, m.id LIMIT ?3"
            ))
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![org_id.to_string(), ts(retry_before), limit as i64], memory_from_row)
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn record_classification_failure(&self, org_id: OrgId, memory_id: MemoryId, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE memories SET classify_failures = classify_failures + 1, classify_failed_at = ?3
                 WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), memory_id.to_string(), ts(at)],
            )
            .map_err(EllieError::store)?;
        Ok(())
    }

    async fn save_classification(
        &self,
        org_id: OrgId,
        memory_id: MemoryId,
        assignments: &[Assignment],
        model: &str,
        trace_id: &str,
    ) -> Result<()> {
        let now = ts(Utc::now());
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        for a in assignments {
            tx.execute(
                "INSERT INTO memory_classifications (memory_id, node_id, confidence, model, trace_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(memory_id, node_id) DO UPDATE SET
                    confidence = excluded.confidence, model = excluded.model, trace_id = excluded.trace_id",
                params![memory_id.to_string(), a.node_id.to_string(), a.confidence, model, trace_id, now],
            )
            .map_err(EllieError::store)?;
        }
        let updated = tx
            .execute(
                "UPDATE memories SET classified_at = ?3, classified_model = ?4, classified_trace_id = ?5
                 WHERE org_id = ?1 AND id = ?2",
                params![org_id.to_string(), memory_id.to_string(), now, model, trace_id],
            )
            .map_err(EllieError::store)?;
        if updated == 0 {
            return Err(EllieError::Validation(format!("memory {memory_id} not found in org")));
        }
        tx.commit().map_err(EllieError::store)?;
        Ok(())
    }
}

// ── Synthesis ──────────────────────────────────────────────────

#[async_trait]
impl SynthesisStore for SqliteStore {
    async fn entities_needing_synthesis(&self, min_mentions: u32, limit: usize) -> Result<Vec<Entity>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(
                "SELECT id, org_id, name, mention_count, synthesis_memory_id, stale FROM entities
                 WHERE mention_count >= ?1 AND (synthesis_memory_id IS NULL OR stale = 1)
                   AND (skipped_at_mentions IS NULL OR mention_count > skipped_at_mentions)
                 ORDER BY mention_count DESC, name_key LIMIT ?2",
            )
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![i64::from(min_mentions), limit as i64], entity_from_row)
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn entity_source_memories(&self, org_id: OrgId, entity_id: Uuid, limit: usize) -> Result<Vec<Memory>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m
                 JOIN entity_mentions em ON em.memory_id = m.id
                 WHERE em.entity_id = ?1 AND m.org_id = ?2 AND m.status = 'active'
                 ORDER BY m.occurred_at DESC, m.id LIMIT ?3"
            ))
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![entity_id.to_string(), org_id.to_string(), limit as i64], memory_from_row)
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn save_synthesis(&self, entity: &Entity, write: &SynthesisWrite) -> Result<MemoryId> {
        let now = Utc::now();
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        let m = &write.memory;

        let memory_id = match write.existing {
            Some(existing) => {
                // A definition deprecated by dedup stays deprecated; a fresh one
                // is inserted below instead. Without a new vector the old one
                // no longer matches the content and is cleared for backfill.
                let updated = tx
                    .execute(
                        "UPDATE memories SET title = ?3, content = ?4, metadata = ?5, importance = ?6,
                                confidence = ?7, occurred_at = ?8, embedding = ?9, updated_at = ?10
                         WHERE org_id = ?1 AND id = ?2 AND status = 'active'",
                        params![
                            entity.org_id.to_string(),
                            existing.to_string(),
                            m.title,
                            m.content,
                            serde_json::to_string(&m.metadata)?,
                            i64::from(m.importance),
                            m.confidence,
                            ts(m.occurred_at),
                            m.embedding.as_deref().map(embedding_to_blob),
                            ts(now),
                        ],
                    )
                    .map_err(EllieError::store)?;
                if updated == 0 {
                    insert_memory_row(&tx, m, now)?
                } else {
                    existing
                }
            }
            None => insert_memory_row(&tx, m, now)?,
        };

        tx.execute(
            "UPDATE entities SET synthesis_memory_id = ?2, stale = 0, skipped_at_mentions = NULL, updated_at = ?3
             WHERE id = ?1",
            params![entity.id.to_string(), memory_id.to_string(), ts(now)],
        )
        .map_err(EllieError::store)?;
        tx.commit().map_err(EllieError::store)?;
        Ok(memory_id)
    }

    async fn skip_entity(&self, entity: &Entity) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE entities SET skipped_at_mentions = mention_count, updated_at = ?2 WHERE id = ?1",
                params![entity.id.to_string(), ts(Utc::now())],
            )
            .map_err(EllieError::store)?;
        debug!(entity = %entity.name, "entity set aside until its next mention");
        Ok(())
    }
}

// ── Backfill ───────────────────────────────────────────────────

#[async_trait]
impl BackfillStore for SqliteStore {
    async fn memories_missing_embedding(&self, limit: usize) -> Result<Vec<Memory>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {MEMORY_COLUMNS} FROM memories m
                 WHERE m.status = 'active' AND m.embedding IS NULL
                 ORDER BY m.created_at, m.id LIMIT ?1"
            ))
            .map_err(EllieError::store)?;
        let rows = stmt.query_map(params![limit as i64], memory_from_row).map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn save_embeddings(&self, embeddings: &[(MemoryId, Vec<f32>)]) -> Result<()> {
        let now = ts(Utc::now());
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        for (id, vector) in embeddings {
            tx.execute(
                "UPDATE memories SET embedding = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), embedding_to_blob(vector), now],
            )
            .map_err(EllieError::store)?;
        }
        tx.commit().map_err(EllieError::store)?;
        Ok(())
    }
}
