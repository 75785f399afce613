//! Taxonomy classification of active memories.

pub mod classifier;
pub mod paths;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ellie_config::schema::TaxonomyConfig;
use ellie_core::{EllieError, Memory, MemoryId, OrgId, Result, TaxonomyNode, clamp_confidence};

pub use classifier::{
    Assignment, ClassificationResponse, LlmTaxonomyClassifier, MAX_ASSIGNMENTS, RawAssignment, TaxonomyClassifier,
    classification_prompt, validate_assignments,
};
pub use paths::build_path_index;

use crate::runner::Worker;

#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    /// Orgs that have at least one taxonomy node, sorted.
    async fn orgs_with_taxonomy(&self) -> Result<Vec<OrgId>>;

    async fn taxonomy_nodes(&self, org_id: OrgId) -> Result<Vec<TaxonomyNode>>;

    /// Active memories of the org never classified. Memories never attempted
    /// come first, oldest first; those whose last failed attempt is later than
    /// `retry_before` are left out.
    async fn unclassified_memories(
        &self,
        org_id: OrgId,
        retry_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Memory>>;

    /// Note that every attempt to classify the memory came back malformed.
    async fn record_classification_failure(&self, org_id: OrgId, memory_id: MemoryId, at: DateTime<Utc>) -> Result<()>;

    /// Upsert assignments per (memory, node) and mark the memory classified.
    async fn save_classification(
        &self,
        org_id: OrgId,
        memory_id: MemoryId,
        assignments: &[Assignment],
        model: &str,
        trace_id: &str,
    ) -> Result<()>;
}

pub struct TaxonomyWorker {
    store: Arc<dyn TaxonomyStore>,
    classifier: Arc<dyn TaxonomyClassifier>,
    config: TaxonomyConfig,
}

impl TaxonomyWorker {
    pub fn new(store: Arc<dyn TaxonomyStore>, classifier: Arc<dyn TaxonomyClassifier>, config: TaxonomyConfig) -> Self {
        Self {
            store,
            classifier,
            config,
        }
    }

    /// Classify one memory. Returns false when every attempt was malformed.
    async fn classify_memory(
        &self,
        org_id: OrgId,
        memory: &Memory,
        paths: &[String],
        index: &BTreeMap<String, Uuid>,
    ) -> Result<bool> {
        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            let answer = match self.classifier.classify(org_id, memory, paths).await {
                Ok(answer) => answer,
                Err(e) if e.is_malformed() => {
                    warn!(memory = %memory.id, attempt, error = %e, "malformed classification");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match validate_assignments(&answer.value.assignments, index) {
                Ok(mut assignments) => {
                    for a in &mut assignments {
                        a.confidence = clamp_confidence(a.confidence);
                    }
                    self.store
                        .save_classification(org_id, memory.id, &assignments, &answer.model, &answer.trace_id)
                        .await?;
                    debug!(memory = %memory.id, nodes = assignments.len(), attempt, "memory classified");
                    return Ok(true);
                }
                Err(e) => warn!(memory = %memory.id, attempt, error = %e, "malformed classification"),
            }
        }
        warn!(memory = %memory.id, attempts, "classification retries exhausted, skipping memory");
        Ok(false)
    }
}

#[async_trait]
impl Worker for TaxonomyWorker {
    fn name(&self) -> &'static str {
        "taxonomy"
    }

    async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        let retry_before = chrono::Duration::from_std(self.config.retry_after())
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(|| EllieError::Config("taxonomy.retry_after_secs out of range".into()))?;
        let mut remaining = self.config.batch_size;
        let mut classified = 0;

        for org_id in self.store.orgs_with_taxonomy().await? {
            if remaining == 0 {
                break;
            }
            let nodes = self.store.taxonomy_nodes(org_id).await?;
            if nodes.is_empty() {
                continue;
            }
            let index = build_path_index(&nodes)?;
            let paths: Vec<String> = index.keys().cloned().collect();

            let pending = self.store.unclassified_memories(org_id, retry_before, remaining).await?;
            remaining = remaining.saturating_sub(pending.len());
            for memory in &pending {
                if self.classify_memory(org_id, memory, &paths, &index).await? {
                    classified += 1;
                } else {
                    self.store.record_classification_failure(org_id, memory.id, now).await?;
                }
            }
        }
        if classified > 0 {
            info!(classified, "taxonomy run complete");
        }
        Ok(classified)
    }
}
