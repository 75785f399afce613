use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use ellie_core::{EllieError, MemoryId, Result};

/// Replacement text for a merged memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedText {
    pub title: String,
    pub content: String,
}

/// What to do with one duplicate cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    #[serde(default)]
    pub keep: Option<MemoryId>,
    #[serde(default)]
    pub deprecate: Vec<MemoryId>,
    #[serde(default)]
    pub merge: Option<MergedText>,
}

impl DedupDecision {
    /// True when the decision leaves the cluster untouched.
    pub fn is_noop(&self) -> bool {
        self.deprecate.is_empty() && self.merge.is_none()
    }
}

fn invalid(reason: impl Into<String>) -> EllieError {
    EllieError::Validation(reason.into())
}

/// Reject any decision that would corrupt the store if applied.
pub fn validate_dedup_decision(decision: &DedupDecision, cluster: &[MemoryId]) -> Result<()> {
    let members: HashSet<&MemoryId> = cluster.iter().collect();

    if let Some(ref keep) = decision.keep {
        if !members.contains(keep) {
            return Err(invalid(format!("keep {keep} is not in the cluster")));
        }
    }

    let mut deprecated = HashSet::new();
    for id in &decision.deprecate {
        if !members.contains(id) {
            return Err(invalid(format!("deprecate {id} is not in the cluster")));
        }
        if !deprecated.insert(id) {
            return Err(invalid(format!("deprecate lists {id} twice")));
        }
        if decision.keep.as_ref() == Some(id) {
            return Err(invalid(format!("{id} is both kept and deprecated")));
        }
    }

    if let Some(ref merge) = decision.merge {
        if merge.title.trim().is_empty() || merge.content.trim().is_empty() {
            return Err(invalid("merge needs a title and content"));
        }
        if decision.deprecate.is_empty() {
            return Err(invalid("merge without any deprecated memory"));
        }
    } else {
        if !decision.deprecate.is_empty() && deprecated.len() == members.len() {
            return Err(invalid("cannot deprecate the whole cluster without a merge"));
        }
        if !decision.deprecate.is_empty() && decision.keep.is_none() {
            return Err(invalid("deprecation needs a keep or a merge to supersede into"));
        }
    }
    Ok(())
}
