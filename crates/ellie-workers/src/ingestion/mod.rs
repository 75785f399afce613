//! Chat transcript ingestion.
//!
//! For each room with unprocessed messages the worker fetches one batch after
//! the room cursor, extracts candidate memories, inserts them, records inline
//! code spans as entity mentions and only then advances the cursor. A batch
//! that fails midway is reprocessed from the old cursor (at-least-once).

pub mod heuristic;
pub mod llm;
pub mod window;

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use ellie_config::schema::IngestionConfig;
use ellie_core::{ChatMessage, EllieError, MemoryId, MemoryKind, NewMemory, OrgId, Result, RoomCursor};
use ellie_llm::LlmGateway;

pub use heuristic::{HeuristicExtractor, importance_for, is_low_signal};
pub use llm::LlmExtractor;
pub use window::PromptWindowSplitter;

use crate::runner::Worker;

/// A memory candidate tied to the message it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub message_id: Uuid,
    pub kind: MemoryKind,
    pub title: String,
    pub content: String,
    pub importance: i64,
    pub confidence: f64,
}

/// Turns chat messages into memory candidates.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, org_id: OrgId, messages: &[ChatMessage]) -> Result<Vec<Extracted>>;
}

/// Pick the extractor named by `ingestion.extractor`.
pub fn extractor_from_config(
    cfg: &IngestionConfig,
    gateway: Option<Arc<dyn LlmGateway>>,
) -> Result<Arc<dyn Extractor>> {
    match cfg.extractor.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicExtractor::new(cfg.max_content_chars)?)),
        "llm" => {
            let gateway = gateway.ok_or(EllieError::MissingDependency("llm gateway for the llm extractor"))?;
            Ok(Arc::new(LlmExtractor::new(gateway, cfg.window_char_budget, cfg.max_content_chars)?))
        }
        other => Err(EllieError::Config(format!("unknown extractor '{other}'"))),
    }
}

#[async_trait]
pub trait IngestionStore: Send + Sync {
    /// Cursors of rooms holding messages past their cursor. Rooms never
    /// ingested come back with a start cursor.
    async fn rooms_needing_ingestion(&self, limit: usize) -> Result<Vec<RoomCursor>>;

    /// Messages strictly after `cursor`, ordered by (created_at, id).
    async fn messages_after(&self, cursor: &RoomCursor, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn insert_memory(&self, memory: NewMemory) -> Result<MemoryId>;

    /// Count one mention of `name` by `memory_id`, creating the entity if needed.
    async fn record_entity_mention(&self, org_id: OrgId, name: &str, memory_id: MemoryId) -> Result<()>;

    async fn save_cursor(&self, cursor: &RoomCursor) -> Result<()>;
}

pub struct IngestionWorker {
    store: Arc<dyn IngestionStore>,
    extractor: Arc<dyn Extractor>,
    config: IngestionConfig,
    mention: Regex,
}

impl IngestionWorker {
    pub fn new(store: Arc<dyn IngestionStore>, extractor: Arc<dyn Extractor>, config: IngestionConfig) -> Result<Self> {
        let mention = Regex::new(r"`([A-Za-z0-9][A-Za-z0-9_.:/@-]{1,63})`")
            .map_err(|e| EllieError::Config(format!("invalid mention pattern: {e}")))?;
        Ok(Self {
            store,
            extractor,
            config,
            mention,
        })
    }

    /// Distinct inline code spans of `content`, in order of appearance.
    pub fn mentions(&self, content: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.mention.captures_iter(content) {
            let name = caps[1].to_string();
            if !names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                names.push(name);
            }
        }
        names
    }

    /// Ingest one batch of one room. Returns the number of messages consumed.
    async fn ingest_room(&self, mut cursor: RoomCursor) -> Result<usize> {
        let mut messages = self.store.messages_after(&cursor, self.config.batch_size).await?;
        messages.retain(|m| m.org_id == cursor.org_id && m.room_id == cursor.room_id && cursor.is_before(m));
        messages.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        let Some(last) = messages.last().cloned() else {
            return Ok(0);
        };

        let signal: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| !is_low_signal(&m.content, self.config.min_message_chars))
            .cloned()
            .collect();

        let mut inserted = 0;
        if !signal.is_empty() {
            let by_id: HashMap<Uuid, &ChatMessage> = signal.iter().map(|m| (m.id, m)).collect();
            for candidate in self.extractor.extract(cursor.org_id, &signal).await? {
                let Some(msg) = by_id.get(&candidate.message_id) else {
                    continue;
                };
                let memory_id = self.store.insert_memory(self.to_memory(msg, candidate)).await?;
                for name in self.mentions(&msg.content) {
                    self.store.record_entity_mention(msg.org_id, &name, memory_id).await?;
                }
                inserted += 1;
            }
        }

        cursor.advance_to(&last);
        self.store.save_cursor(&cursor).await?;
        debug!(
            org = %cursor.org_id,
            room = %cursor.room_id,
            messages = messages.len(),
            inserted,
            "room batch ingested"
        );
        Ok(messages.len())
    }

    fn to_memory(&self, msg: &ChatMessage, candidate: Extracted) -> NewMemory {
        let mut memory = NewMemory::new(
            msg.org_id,
            candidate.kind,
            candidate.title,
            candidate.content,
            candidate.importance,
            candidate.confidence,
            msg.created_at,
        )
        .with_metadata("source_message_id", json!(msg.id.to_string()))
        .with_metadata("author", json!(msg.author))
        .with_metadata("extractor", json!(self.extractor.name()));
        memory.project_id = msg.project_id;
        memory.conversation_id = msg.conversation_id;
        memory.room_id = Some(msg.room_id);
        memory
    }
}

#[async_trait]
impl Worker for IngestionWorker {
    fn name(&self) -> &'static str {
        "ingestion"
    }

    async fn run_once(&self) -> Result<usize> {
        let rooms = self.store.rooms_needing_ingestion(self.config.max_rooms_per_run).await?;
        let mut processed = 0;
        for cursor in rooms {
            processed += self.ingest_room(cursor).await?;
        }
        if processed > 0 {
            info!(messages = processed, "ingestion run complete");
        }
        Ok(processed)
    }
}
