use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use ellie_core::text::truncate_with_ellipsis;
use ellie_core::{ChatMessage, Memory, MemoryId, OrgId, ProjectId, Result, RoomId};

/// A memory returned by a store search, with the store's own relevance score.
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub memory: Memory,
    /// Lexical relevance in [0, 1] as computed by the store.
    pub score: f32,
    /// A memory this one replaced, when the store knows of one.
    pub supersedes: Option<MemoryId>,
}

impl MemoryHit {
    pub fn new(memory: Memory, score: f32) -> Self {
        Self {
            memory,
            score,
            supersedes: None,
        }
    }
}

/// Read capabilities the cascade needs. Every search is scoped to one org.
#[async_trait]
pub trait RetrievalStore: Send + Sync {
    /// Active memories that originated in `room`.
    async fn search_room_context(&self, org_id: OrgId, room_id: RoomId, query: &str, limit: usize)
    -> Result<Vec<MemoryHit>>;

    async fn search_project_memories(
        &self,
        org_id: OrgId,
        project_id: ProjectId,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>>;

    async fn search_memories_org_wide(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<MemoryHit>>;

    async fn search_chat_history(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<ChatMessage>>;
}

/// One matching line of a raw log file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogHit {
    /// `file:line` of the match.
    pub location: String,
    pub text: String,
}

/// Last-resort search over raw transcripts.
#[async_trait]
pub trait LogScanner: Send + Sync {
    async fn scan(&self, org_id: OrgId, query: &str, limit: usize) -> Result<Vec<LogHit>>;
}

/// Which cascade tier produced the results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    RoomContext,
    Memory,
    ChatHistory,
    RawLogs,
    NoInformation,
}

impl Tier {
    /// 1-based tier number.
    pub fn number(&self) -> u8 {
        match self {
            Tier::RoomContext => 1,
            Tier::Memory => 2,
            Tier::ChatHistory => 3,
            Tier::RawLogs => 4,
            Tier::NoInformation => 5,
        }
    }
}

/// Uniform result shape across tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalItem {
    pub tier: Tier,
    /// "room_context", "project_memory", "org_memory", "chat_history" or "raw_log".
    pub source: String,
    pub id: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<MemoryId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalOutcome {
    pub items: Vec<RetrievalItem>,
    pub tier_used: Tier,
    /// True when every tier came back empty. Not an error.
    pub no_information: bool,
}

impl RetrievalOutcome {
    fn found(tier: Tier, items: Vec<RetrievalItem>) -> Self {
        Self {
            items,
            tier_used: tier,
            no_information: false,
        }
    }

    fn nothing() -> Self {
        Self {
            items: vec![],
            tier_used: Tier::NoInformation,
            no_information: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub org_id: OrgId,
    pub room_id: Option<RoomId>,
    pub project_id: Option<ProjectId>,
    pub query: String,
    /// 0 means "use the configured default".
    pub limit: usize,
}

/// Tiered retrieval: the first tier with results wins.
pub struct RetrievalCascade {
    store: Arc<dyn RetrievalStore>,
    scanner: Option<Arc<dyn LogScanner>>,
    default_limit: usize,
    snippet_chars: usize,
}

impl RetrievalCascade {
    pub fn new(store: Arc<dyn RetrievalStore>) -> Self {
        Self {
            store,
            scanner: None,
            default_limit: 10,
            snippet_chars: 280,
        }
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn LogScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_limits(mut self, default_limit: usize, snippet_chars: usize) -> Self {
        self.default_limit = default_limit.max(1);
        self.snippet_chars = snippet_chars.max(1);
        self
    }

    pub async fn retrieve(&self, req: &RetrievalRequest) -> Result<RetrievalOutcome> {
        let query = req.query.trim();
        if query.is_empty() {
            return Ok(RetrievalOutcome::nothing());
        }
        let limit = if req.limit == 0 { self.default_limit } else { req.limit };
        let org = req.org_id;

        // Tier 1
        if let Some(room) = req.room_id {
            let hits = self.store.search_room_context(org, room, query, limit).await?;
            if !hits.is_empty() {
                debug!(org = %org, room = %room, count = hits.len(), "retrieval served from room context");
                let items = hits
                    .iter()
                    .take(limit)
                    .map(|h| self.memory_item(Tier::RoomContext, "room_context", &h.memory))
                    .collect();
                return Ok(RetrievalOutcome::found(Tier::RoomContext, items));
            }
        }

        // Tier 2: project hits first, then org-wide, unique by memory id.
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        if let Some(project) = req.project_id {
            for hit in self.store.search_project_memories(org, project, query, limit).await? {
                if items.len() < limit && seen.insert(hit.memory.id) {
                    items.push(self.memory_item(Tier::Memory, "project_memory", &hit.memory));
                }
            }
        }
        for hit in self.store.search_memories_org_wide(org, query, limit).await? {
            if items.len() < limit && seen.insert(hit.memory.id) {
                items.push(self.memory_item(Tier::Memory, "org_memory", &hit.memory));
            }
        }
        if !items.is_empty() {
            return Ok(RetrievalOutcome::found(Tier::Memory, items));
        }

        // Tier 3
        let messages = self.store.search_chat_history(org, query, limit).await?;
        if !messages.is_empty() {
            let items = messages.iter().take(limit).map(|m| self.chat_item(m)).collect();
            return Ok(RetrievalOutcome::found(Tier::ChatHistory, items));
        }

        // Tier 4 is best-effort.
        if let Some(ref scanner) = self.scanner {
            match scanner.scan(org, query, limit).await {
                Ok(hits) if !hits.is_empty() => {
                    let items = hits.into_iter().take(limit).map(|h| self.log_item(h)).collect();
                    return Ok(RetrievalOutcome::found(Tier::RawLogs, items));
                }
                Ok(_) => {}
                Err(e) => warn!(org = %org, error = %e, "raw log scan failed, treating as no results"),
            }
        }

        Ok(RetrievalOutcome::nothing())
    }

    fn memory_item(&self, tier: Tier, source: &str, memory: &Memory) -> RetrievalItem {
        RetrievalItem {
            tier,
            source: source.into(),
            id: memory.id.to_string(),
            snippet: truncate_with_ellipsis(&format!("{}: {}", memory.title, memory.content), self.snippet_chars),
            room_id: memory.room_id,
            memory_id: Some(memory.id),
            conversation_id: memory.conversation_id,
            project_id: memory.project_id,
        }
    }

    fn chat_item(&self, msg: &ChatMessage) -> RetrievalItem {
        RetrievalItem {
            tier: Tier::ChatHistory,
            source: "chat_history".into(),
            id: msg.id.to_string(),
            snippet: truncate_with_ellipsis(&format!("{}: {}", msg.author, msg.content), self.snippet_chars),
            room_id: Some(msg.room_id),
            memory_id: None,
            conversation_id: msg.conversation_id,
            project_id: msg.project_id,
        }
    }

    fn log_item(&self, hit: LogHit) -> RetrievalItem {
        RetrievalItem {
            tier: Tier::RawLogs,
            source: "raw_log".into(),
            snippet: truncate_with_ellipsis(&hit.text, self.snippet_chars),
            id: hit.location,
            room_id: None,
            memory_id: None,
            conversation_id: None,
            project_id: None,
        }
    }
}
