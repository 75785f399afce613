use async_trait::async_trait;
use std::sync::Arc;

use ellie_core::{Memory, OrgId, Result};
use ellie_llm::{LlmGateway, Structured, call_json};

use super::decision::DedupDecision;

/// Decides what to do with a cluster of near-duplicate memories.
#[async_trait]
pub trait DedupReviewer: Send + Sync {
    async fn review(&self, org_id: OrgId, cluster: &[Memory]) -> Result<Structured<DedupDecision>>;
}

pub struct LlmDedupReviewer {
    gateway: Arc<dyn LlmGateway>,
}

impl LlmDedupReviewer {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

pub fn review_prompt(cluster: &[Memory]) -> String {
    let mut prompt = String::from(
        "These memories were flagged as possible duplicates. Decide how to consolidate them.\n\
         - keep: id of the memory that stays authoritative, or null\n\
         - deprecate: ids that are redundant or outdated\n\
         - merge: {\"title\", \"content\"} when no single memory is complete and the\n\
           best answer combines them; deprecated memories then point to the merge\n\
         Never deprecate every memory unless you merge. Use only the ids below.\n\
         If they are not duplicates, answer {\"keep\": null, \"deprecate\": [], \"merge\": null}.\n\
         Respond with JSON only: {\"keep\": ..., \"deprecate\": [...], \"merge\": ...}\n\n",
    );
    for m in cluster {
        prompt.push_str(&format!(
            "id: {}\nkind: {}\ntitle: {}\ncontent: {}\n\n",
            m.id, m.kind, m.title, m.content
        ));
    }
    prompt
}

#[async_trait]
impl DedupReviewer for LlmDedupReviewer {
    async fn review(&self, org_id: OrgId, cluster: &[Memory]) -> Result<Structured<DedupDecision>> {
        call_json(self.gateway.as_ref(), org_id, &review_prompt(cluster)).await
    }
}
