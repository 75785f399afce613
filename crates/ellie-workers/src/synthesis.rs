//! Entity synthesis: one canonical definition memory per frequently mentioned entity.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ellie_config::schema::SynthesisConfig;
use ellie_core::{EllieError, Entity, Memory, MemoryId, MemoryKind, NewMemory, OrgId, Result};
use ellie_llm::{EmbeddingProvider, LlmGateway, LlmReply, embed_checked};
use uuid::Uuid;

use crate::runner::Worker;

const SYNTHESIS_IMPORTANCE: i64 = 5;
const SYNTHESIS_CONFIDENCE: f64 = 0.95;

/// A synthesized definition ready to be stored.
#[derive(Debug, Clone)]
pub struct SynthesisWrite {
    /// Existing definition memory to update in place.
    pub existing: Option<MemoryId>,
    pub memory: NewMemory,
}

#[async_trait]
pub trait SynthesisStore: Send + Sync {
    /// Entities with at least `min_mentions` mentions that were never
    /// synthesized or went stale since, excluding entities set aside with no
    /// new mention since.
    async fn entities_needing_synthesis(&self, min_mentions: u32, limit: usize) -> Result<Vec<Entity>>;

    /// Active memories mentioning the entity, most recent first.
    async fn entity_source_memories(&self, org_id: OrgId, entity_id: Uuid, limit: usize) -> Result<Vec<Memory>>;

    /// Create or update the definition memory, link it to the entity and mark
    /// the entity fresh. Returns the definition memory id.
    async fn save_synthesis(&self, entity: &Entity, write: &SynthesisWrite) -> Result<MemoryId>;

    /// Set the entity aside until its next new mention.
    async fn skip_entity(&self, entity: &Entity) -> Result<()>;
}

/// Produces a definition from source memories.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, org_id: OrgId, entity: &Entity, sources: &[Memory]) -> Result<LlmReply>;
}

pub struct LlmSynthesizer {
    gateway: Arc<dyn LlmGateway>,
}

impl LlmSynthesizer {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

pub fn synthesis_prompt(entity: &Entity, sources: &[Memory]) -> String {
    let mut prompt = format!(
        "Write the canonical definition of \"{name}\" from the team memories below.\n\
         Use exactly these sections, in this order:\n\
         ## What it is\n## What it does\n## Current status\n## Key technical details\n\n\
         Preserve concrete details (names, versions, numbers, URLs, owners).\n\
         If memories conflict, say so explicitly under the relevant section instead of dropping either fact.\n\
         Do not invent anything that is not in the memories.\n\nMemories about {name}:\n",
        name = entity.name
    );
    for m in sources {
        prompt.push_str(&format!(
            "- [{}] {} ({}): {}\n",
            m.occurred_at.format("%Y-%m-%d"),
            m.title,
            m.kind,
            m.content
        ));
    }
    prompt
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, org_id: OrgId, entity: &Entity, sources: &[Memory]) -> Result<LlmReply> {
        self.gateway.call(org_id, &synthesis_prompt(entity, sources)).await
    }
}

pub struct SynthesisWorker {
    store: Arc<dyn SynthesisStore>,
    synthesizer: Arc<dyn Synthesizer>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: SynthesisConfig,
}

impl SynthesisWorker {
    pub fn new(store: Arc<dyn SynthesisStore>, synthesizer: Arc<dyn Synthesizer>, config: SynthesisConfig) -> Self {
        Self {
            store,
            synthesizer,
            embedder: None,
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    async fn synthesize_entity(&self, entity: &Entity) -> Result<Option<MemoryId>> {
        let sources = self
            .store
            .entity_source_memories(entity.org_id, entity.id, self.config.max_sources)
            .await?;
        let sources: Vec<Memory> = sources.into_iter().filter(|m| m.is_active()).collect();
        if sources.is_empty() {
            debug!(entity = %entity.name, "no active source memories, skipping");
            return Ok(None);
        }

        let reply = self.synthesizer.synthesize(entity.org_id, entity, &sources).await?;
        let text = reply.text.trim();
        if text.is_empty() {
            return Err(EllieError::MalformedOutput("empty synthesis".into()));
        }

        let source_ids: Vec<String> = sources.iter().map(|m| m.id.to_string()).collect();
        let mut memory = NewMemory::new(
            entity.org_id,
            MemoryKind::Fact,
            entity.name.clone(),
            text,
            SYNTHESIS_IMPORTANCE,
            SYNTHESIS_CONFIDENCE,
            Utc::now(),
        )
        .with_metadata("entity_id", json!(entity.id.to_string()))
        .with_metadata("entity_name", json!(entity.name))
        .with_metadata("source_memory_ids", json!(source_ids))
        .with_metadata("synthesis_model", json!(reply.model))
        .with_metadata("synthesis_trace_id", json!(reply.trace_id));

        if let Some(ref embedder) = self.embedder {
            let embed_text = format!("{}\n{}", memory.title, memory.content);
            memory.embedding = embed_checked(embedder.as_ref(), &[embed_text.as_str()]).await?.into_iter().next();
        }

        let write = SynthesisWrite {
            existing: entity.synthesis_memory_id,
            memory,
        };
        let id = self.store.save_synthesis(entity, &write).await?;
        Ok(Some(id))
    }
}

#[async_trait]
impl Worker for SynthesisWorker {
    fn name(&self) -> &'static str {
        "synthesis"
    }

    async fn run_once(&self) -> Result<usize> {
        let entities = self
            .store
            .entities_needing_synthesis(self.config.min_mentions, self.config.batch_size)
            .await?;
        let mut synthesized = 0;
        for entity in &entities {
            match self.synthesize_entity(entity).await {
                Ok(Some(id)) => {
                    info!(entity = %entity.name, memory = %id, updated = entity.synthesis_memory_id.is_some(), "entity synthesized");
                    synthesized += 1;
                }
                Ok(None) => self.store.skip_entity(entity).await?,
                Err(e) if e.is_malformed() => {
                    warn!(entity = %entity.name, error = %e, "unusable synthesis, skipping");
                    self.store.skip_entity(entity).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(synthesized)
    }
}
