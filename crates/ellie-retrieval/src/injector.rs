use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use ellie_core::text::truncate_with_ellipsis;
use ellie_core::{EllieError, MemoryId, OrgId, ProjectId, Result, RetrievalScope, RoomId, TunerConfig, cosine_similarity};
use ellie_llm::{EmbeddingProvider, embed_checked};

use crate::cascade::MemoryHit;
use crate::injection::{InjectionBundle, InjectionCandidate, build_bundle};

/// Memory search used to gather injection candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Active memories of the org (and project, when given) relevant to `message`.
    async fn injection_candidates(
        &self,
        org_id: OrgId,
        project_id: Option<ProjectId>,
        message: &str,
        limit: usize,
    ) -> Result<Vec<MemoryHit>>;
}

/// One memory surfaced into one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionRecord {
    pub org_id: OrgId,
    pub room_id: RoomId,
    pub memory_id: MemoryId,
    pub score: f64,
    pub injected_at: DateTime<Utc>,
}

#[async_trait]
pub trait InjectionStore: Send + Sync {
    /// Injections into `room` at or after `since`.
    async fn recent_injections(&self, org_id: OrgId, room_id: RoomId, since: DateTime<Utc>)
    -> Result<Vec<InjectionRecord>>;

    async fn room_message_count(&self, org_id: OrgId, room_id: RoomId) -> Result<u64>;

    async fn record_injection(&self, record: &InjectionRecord) -> Result<()>;
}

/// Decides what to surface into a room for an incoming message.
pub struct ProactiveInjector {
    source: Arc<dyn CandidateSource>,
    store: Arc<dyn InjectionStore>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    tuning: TunerConfig,
    cooldown: Duration,
    candidate_limit: usize,
}

impl ProactiveInjector {
    pub fn new(source: Arc<dyn CandidateSource>, store: Arc<dyn InjectionStore>, tuning: TunerConfig) -> Self {
        Self {
            source,
            store,
            embedder: None,
            tuning,
            cooldown: Duration::from_secs(6 * 60 * 60),
            candidate_limit: 25,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_candidate_limit(mut self, limit: usize) -> Self {
        self.candidate_limit = limit.max(1);
        self
    }

    pub async fn inject(
        &self,
        org_id: OrgId,
        room_id: RoomId,
        project_id: Option<ProjectId>,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<InjectionBundle> {
        let message = message.trim();
        if message.is_empty() {
            return Err(EllieError::Validation("cannot inject for an empty message".into()));
        }

        let cooldown = chrono::Duration::from_std(self.cooldown)
            .map_err(|e| EllieError::Config(format!("injection cooldown out of range: {e}")))?;
        let recent = self.store.recent_injections(org_id, room_id, now - cooldown).await?;
        let cooling: HashSet<MemoryId> = recent.iter().map(|r| r.memory_id).collect();
        let message_count = self.store.room_message_count(org_id, room_id).await?;

        let hits = self
            .source
            .injection_candidates(org_id, project_id, message, self.candidate_limit)
            .await?;

        let message_vec = match self.embedder {
            Some(ref e) => embed_checked(e.as_ref(), &[message]).await?.into_iter().next(),
            None => None,
        };

        let candidates: Vec<InjectionCandidate> = hits
            .into_iter()
            .filter(|h| h.memory.is_active() && !cooling.contains(&h.memory.id))
            .filter(|h| self.in_scope(h, room_id, project_id))
            .map(|h| {
                let similarity = match (&message_vec, &h.memory.embedding) {
                    (Some(q), Some(v)) if !v.is_empty() => f64::from(cosine_similarity(q, v)),
                    _ => f64::from(h.score),
                };
                InjectionCandidate {
                    id: h.memory.id,
                    title: h.memory.title,
                    content: h.memory.content,
                    similarity,
                    importance: h.memory.importance,
                    confidence: h.memory.confidence,
                    occurred_at: h.memory.occurred_at,
                    supersedes: h.supersedes,
                }
            })
            .collect();

        let mut bundle = build_bundle(
            now,
            message_count,
            recent.len() as u64,
            &candidates,
            self.tuning.effective_min_relevance(),
            self.tuning.max_results,
        );
        if bundle.is_empty() {
            debug!(org = %org_id, room = %room_id, candidates = candidates.len(), "nothing worth injecting");
            return Ok(bundle);
        }
        bundle.text = truncate_with_ellipsis(&bundle.text, self.tuning.max_chars);

        for item in &bundle.items {
            self.store
                .record_injection(&InjectionRecord {
                    org_id,
                    room_id,
                    memory_id: item.candidate.id,
                    score: item.score,
                    injected_at: now,
                })
                .await?;
        }
        info!(org = %org_id, room = %room_id, injected = bundle.items.len(), "proactive context injected");
        Ok(bundle)
    }

    /// Narrow candidates to the configured retrieval scope.
    fn in_scope(&self, hit: &MemoryHit, room_id: RoomId, project_id: Option<ProjectId>) -> bool {
        match self.tuning.scope {
            RetrievalScope::Org => true,
            RetrievalScope::Project => project_id.is_none() || hit.memory.project_id == project_id,
            RetrievalScope::Room => hit.memory.room_id == Some(room_id),
        }
    }
}
