//! Near-duplicate consolidation.
//!
//! Each run scans the most recent active memories with embeddings per org,
//! clusters pairs above the similarity threshold, and asks the reviewer what
//! to keep, deprecate or merge for every cluster not reviewed before.
//! A cluster whose review failed waits `retry_after` before it is tried again.

pub mod decision;
pub mod pairs;
pub mod reviewer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use ellie_config::schema::DedupConfig;
use ellie_core::{EllieError, Memory, MemoryId, NewMemory, OrgId, Result};
use ellie_llm::{EmbeddingProvider, embed_checked};

pub use decision::{DedupDecision, MergedText, validate_dedup_decision};
pub use pairs::{DedupPair, cluster_pairs, detect_candidate_pairs, pairs_within};
pub use reviewer::{DedupReviewer, LlmDedupReviewer, review_prompt};

use crate::runner::Worker;

/// Everything one validated decision changes, applied atomically by the store.
#[derive(Debug, Clone)]
pub struct DedupApplication {
    pub org_id: OrgId,
    /// Merged memory to insert before deprecating.
    pub merged: Option<NewMemory>,
    /// Supersession target when nothing is merged.
    pub keep: Option<MemoryId>,
    pub deprecate: Vec<MemoryId>,
    /// Every pair of the cluster, recorded as reviewed.
    pub pairs: Vec<(MemoryId, MemoryId)>,
    pub model: String,
    pub trace_id: String,
}

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Orgs that have active memories, sorted.
    async fn dedup_orgs(&self) -> Result<Vec<OrgId>>;

    /// The `limit` most recent active memories of the org that have embeddings.
    async fn active_embedded_memories(&self, org_id: OrgId, limit: usize) -> Result<Vec<Memory>>;

    /// Which of `pairs` are already in the reviewed-pairs ledger.
    async fn reviewed_pairs(
        &self,
        org_id: OrgId,
        pairs: &[(MemoryId, MemoryId)],
    ) -> Result<HashSet<(MemoryId, MemoryId)>>;

    /// Which of `pairs` were part of a failed review after `since`.
    async fn failed_pairs(
        &self,
        org_id: OrgId,
        pairs: &[(MemoryId, MemoryId)],
        since: DateTime<Utc>,
    ) -> Result<HashSet<(MemoryId, MemoryId)>>;

    /// Remember that the review of a cluster with these pairs failed.
    async fn record_failed_review(&self, org_id: OrgId, pairs: &[(MemoryId, MemoryId)], at: DateTime<Utc>) -> Result<()>;

    /// Apply a decision. Returns the id of the merged memory, if one was created.
    async fn apply_dedup(&self, application: &DedupApplication) -> Result<Option<MemoryId>>;
}

pub struct DedupWorker {
    store: Arc<dyn DedupStore>,
    reviewer: Arc<dyn DedupReviewer>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: DedupConfig,
}

impl DedupWorker {
    pub fn new(store: Arc<dyn DedupStore>, reviewer: Arc<dyn DedupReviewer>, config: DedupConfig) -> Self {
        Self {
            store,
            reviewer,
            embedder: None,
            config,
        }
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Build the merged memory for a merge decision.
    fn merged_memory(
        &self,
        org_id: OrgId,
        merge: &MergedText,
        decision: &DedupDecision,
        members: &[&Memory],
        model: &str,
        trace_id: &str,
    ) -> Result<NewMemory> {
        let primary_id = decision.keep.or_else(|| decision.deprecate.first().copied());
        let primary = members
            .iter()
            .find(|m| Some(m.id) == primary_id)
            .ok_or_else(|| EllieError::Validation("merge has no source memory".into()))?;
        let importance = members.iter().map(|m| m.importance).max().unwrap_or(primary.importance);
        let confidence = members.iter().map(|m| m.confidence).fold(0.0, f64::max);
        let occurred_at = members.iter().map(|m| m.occurred_at).max().unwrap_or(primary.occurred_at);

        let mut sources: Vec<MemoryId> = decision.deprecate.clone();
        if let Some(keep) = decision.keep {
            sources.insert(0, keep);
        }
        let mut memory = NewMemory::new(
            org_id,
            primary.kind,
            merge.title.trim(),
            merge.content.trim(),
            i64::from(importance),
            confidence,
            occurred_at,
        )
        .with_metadata("merged_from", json!(sources.iter().map(|id| id.to_string()).collect::<Vec<_>>()))
        .with_metadata("dedup_model", json!(model))
        .with_metadata("dedup_trace_id", json!(trace_id));
        memory.project_id = primary.project_id;
        memory.room_id = primary.room_id;
        Ok(memory)
    }

    /// Review and apply one cluster. Returns false when the cluster was skipped.
    async fn process_cluster(&self, org_id: OrgId, cluster: &[MemoryId], pairs: &[DedupPair], by_id: &[Memory]) -> Result<bool> {
        let members: Vec<&Memory> = cluster
            .iter()
            .filter_map(|id| by_id.iter().find(|m| m.id == *id))
            .collect();
        let owned: Vec<Memory> = members.iter().map(|m| (*m).clone()).collect();

        let answer = match self.reviewer.review(org_id, &owned).await {
            Ok(answer) => answer,
            Err(e) if e.is_malformed() => {
                warn!(org = %org_id, size = cluster.len(), error = %e, "unusable dedup review, skipping cluster");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        let decision = answer.value;
        if let Err(e) = validate_dedup_decision(&decision, cluster) {
            warn!(org = %org_id, trace_id = %answer.trace_id, error = %e, "rejected dedup decision");
            return Ok(false);
        }

        let mut merged = match decision.merge {
            Some(ref merge) => Some(self.merged_memory(org_id, merge, &decision, &members, &answer.model, &answer.trace_id)?),
            None => None,
        };
        if let (Some(memory), Some(embedder)) = (merged.as_mut(), self.embedder.as_ref()) {
            let text = format!("{}\n{}", memory.title, memory.content);
            memory.embedding = embed_checked(embedder.as_ref(), &[text.as_str()]).await?.into_iter().next();
        }

        let application = DedupApplication {
            org_id,
            merged,
            keep: decision.keep,
            deprecate: decision.deprecate.clone(),
            pairs: pairs_within(pairs, cluster).iter().map(|p| p.key()).collect(),
            model: answer.model,
            trace_id: answer.trace_id,
        };
        let merged_id = self.store.apply_dedup(&application).await?;
        info!(
            org = %org_id,
            kept = ?decision.keep,
            deprecated = decision.deprecate.len(),
            merged = ?merged_id,
            "dedup decision applied"
        );
        Ok(true)
    }
}

#[async_trait]
impl Worker for DedupWorker {
    fn name(&self) -> &'static str {
        "dedup"
    }

    async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        let retry_since = chrono::Duration::from_std(self.config.retry_after())
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(|| EllieError::Config("dedup.retry_after_secs out of range".into()))?;
        let mut budget = self.config.max_clusters_per_run;
        let mut applied = 0;

        for org_id in self.store.dedup_orgs().await? {
            if budget == 0 {
                break;
            }
            let memories = self
                .store
                .active_embedded_memories(org_id, self.config.max_scan_memories)
                .await?;
            let pairs = detect_candidate_pairs(&memories, self.config.similarity_threshold);
            if pairs.is_empty() {
                continue;
            }
            let keys: Vec<_> = pairs.iter().map(|p| p.key()).collect();
            let reviewed = self.store.reviewed_pairs(org_id, &keys).await?;
            let failed = self.store.failed_pairs(org_id, &keys, retry_since).await?;

            for cluster in cluster_pairs(&pairs) {
                if budget == 0 {
                    break;
                }
                let inside: Vec<_> = pairs_within(&pairs, &cluster).iter().map(|p| p.key()).collect();
                if inside.iter().all(|k| reviewed.contains(k) || failed.contains(k)) {
                    continue;
                }
                budget -= 1;
                if self.process_cluster(org_id, &cluster, &pairs, &memories).await? {
                    applied += 1;
                } else {
                    self.store.record_failed_review(org_id, &inside, now).await?;
                }
            }
            debug!(org = %org_id, scanned = memories.len(), pairs = pairs.len(), "dedup scan complete");
        }
        Ok(applied)
    }
}
