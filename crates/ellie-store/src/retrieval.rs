//! Read-side capabilities: lexical memory search, chat history, strategies
//! and the injection ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use tracing::debug;

use ellie_core::{ChatMessage, EllieError, Memory, OrgId, ProjectId, Result, RoomId};
use ellie_retrieval::{
    CandidateSource, InjectionRecord, InjectionStore, MemoryHit, RetrievalStore, RetrievalStrategy, StrategyStore,
};

use crate::store::{
    MEMORY_COLUMNS, MESSAGE_COLUMNS, SEARCH_SCAN_LIMIT, SqliteStore, memory_from_row, message_from_row,
    opt_uuid_at, rank_lexical, time_at, ts, uuid_at,
};

/// Restricts which active memories a search considers.
enum Scope {
    Room(RoomId),
    Project(ProjectId),
    /// Project memories plus org-level ones without a project.
    ProjectOrUnscoped(ProjectId),
    Org,
}

impl SqliteStore {
    /// Score active memories under `scope` against `query`, best first.
    fn search_memories(&self, org_id: OrgId, scope: Scope, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let (clause, scope_arg) = match scope {
            Scope::Room(room) => ("AND m.room_id = ?2", Some(room.to_string())),
            Scope::Project(project) => ("AND m.project_id = ?2", Some(project.to_string())),
            Scope::ProjectOrUnscoped(project) => {
                ("AND (m.project_id = ?2 OR m.project_id IS NULL)", Some(project.to_string()))
            }
            Scope::Org => ("AND ?2 IS NULL", None),
        };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS},
                    (SELECT s.id FROM memories s WHERE s.superseded_by = m.id ORDER BY s.updated_at DESC LIMIT 1)
             FROM memories m
             WHERE m.org_id = ?1 AND m.status = 'active' {clause}
             ORDER BY m.occurred_at DESC, m.id
             LIMIT ?3"
        );

        let rows = {
            let db = self.conn();
            let mut stmt = db.prepare(&sql).map_err(EllieError::store)?;
            let mapped = stmt
                .query_map(params![org_id.to_string(), scope_arg, SEARCH_SCAN_LIMIT as i64], |row| {
                    Ok((memory_from_row(row)?, opt_uuid_at(row, 17)?))
                })
                .map_err(EllieError::store)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)?
        };

        let ranked = rank_lexical(query, rows, |(m, _): &(Memory, _)| format!("{} {}", m.title, m.content), limit);
        Ok(ranked
            .into_iter()
            .map(|((memory, supersedes), score)| MemoryHit {
                supersedes,
                ..MemoryHit::new(memory, score)
            })
            .collect())
    }

    /// Store a strategy version for the org, optionally making it the active one.
    pub fn save_strategy(&self, org_id: OrgId, strategy: &RetrievalStrategy, activate: bool) -> Result<()> {
        let body = serde_json::to_string(strategy)?;
        let mut db = self.conn();
        let tx = db.transaction().map_err(EllieError::store)?;
        if activate {
            tx.execute(
                "UPDATE retrieval_strategies SET active = 0 WHERE org_id = ?1",
                params![org_id.to_string()],
            )
            .map_err(EllieError::store)?;
        }
        tx.execute(
            "INSERT INTO retrieval_strategies (org_id, version, active, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(org_id, version) DO UPDATE SET body = excluded.body,
                active = MAX(retrieval_strategies.active, excluded.active)",
            params![org_id.to_string(), strategy.version, activate, body, ts(Utc::now())],
        )
        .map_err(EllieError::store)?;
        tx.commit().map_err(EllieError::store)?;
        debug!(org_id = %org_id, version = strategy.version, activate, "retrieval strategy saved");
        Ok(())
    }
}

#[async_trait]
impl RetrievalStore for SqliteStore {
    async fn search_room_context(
        &self,
        org_id: OrgId,
        room_id: RoomId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        self.search_memories(org_id, Scope::Room(room_id), query, limit)
    }

    async fn search_project_memories(
        &self,
        org_id: OrgId,
        project_id: ProjectId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        self.search_memories(org_id, Scope::Project(project_id), query, limit)
    }

    async fn search_memories_org_wide(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        self.search_memories(org_id, Scope::Org, query, limit)
    }

    async fn search_chat_history(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows = {
            let db = self.conn();
            let mut stmt = db
                .prepare(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE org_id = ?1
                     ORDER BY created_at DESC, id LIMIT ?2"
                ))
                .map_err(EllieError::store)?;
            let mapped = stmt
                .query_map(params![org_id.to_string(), SEARCH_SCAN_LIMIT as i64], message_from_row)
                .map_err(EllieError::store)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)?
        };
        Ok(rank_lexical(query, rows, |m: &ChatMessage| m.content.clone(), limit)
            .into_iter()
            .map(|(m, _)| m)
            .collect())
    }
}

#[async_trait]
impl StrategyStore for SqliteStore {
    async fn active_strategy(&self, org_id: OrgId) -> Result<Option<RetrievalStrategy>> {
        let body: Option<String> = self
            .conn()
            .query_row(
                "SELECT body FROM retrieval_strategies WHERE org_id = ?1 AND active = 1
                 ORDER BY version DESC LIMIT 1",
                params![org_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(EllieError::store)?;
        body.map(|b| serde_json::from_str(&b).map_err(EllieError::from)).transpose()
    }
}

#[async_trait]
impl CandidateSource for SqliteStore {
    async fn injection_candidates(
        &self,
        org_id: OrgId,
        project_id: Option<ProjectId>,
        message: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>> {
        let scope = match project_id {
            Some(project) => Scope::ProjectOrUnscoped(project),
            None => Scope::Org,
        };
        self.search_memories(org_id, scope, message, limit)
    }
}

#[async_trait]
impl InjectionStore for SqliteStore {
    async fn recent_injections(
        &self,
        org_id: OrgId,
        room_id: RoomId,
        since: DateTime<Utc>,
    ) -> Result<Vec<InjectionRecord>> {
        let db = self.conn();
        let mut stmt = db
            .prepare(
                "SELECT org_id, room_id, memory_id, score, injected_at FROM injections
                 WHERE org_id = ?1 AND room_id = ?2 AND injected_at >= ?3
                 ORDER BY injected_at, id",
            )
            .map_err(EllieError::store)?;
        let rows = stmt
            .query_map(params![org_id.to_string(), room_id.to_string(), ts(since)], |row| {
                Ok(InjectionRecord {
                    org_id: uuid_at(row, 0)?,
                    room_id: uuid_at(row, 1)?,
                    memory_id: uuid_at(row, 2)?,
                    score: row.get(3)?,
                    injected_at: time_at(row, 4)?,
                })
            })
            .map_err(EllieError::store)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(EllieError::store)
    }

    async fn room_message_count(&self, org_id: OrgId, room_id: RoomId) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM chat_messages WHERE org_id = ?1 AND room_id = ?2",
                params![org_id.to_string(), room_id.to_string()],
                |row| row.get(0),
            )
            .map_err(EllieError::store)?;
        Ok(count.max(0) as u64)
    }

    async fn record_injection(&self, record: &InjectionRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO injections (org_id, room_id, memory_id, score, injected_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.org_id.to_string(),
                    record.room_id.to_string(),
                    record.memory_id.to_string(),
                    record.score,
                    ts(record.injected_at),
                ],
            )
            .map_err(EllieError::store)?;
        Ok(())
    }
}
