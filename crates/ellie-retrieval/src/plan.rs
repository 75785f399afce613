use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use ellie_core::text::query_terms;
use ellie_core::{OrgId, Result};

/// Where a plan step searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanScope {
    Room,
    Project,
    Org,
    Chat,
    Logs,
}

/// A base step of a strategy. `query_template` may contain `{query}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyStep {
    pub scope: PlanScope,
    pub query_template: String,
    pub reason: String,
}

/// An extra step added when any of `keywords` occurs in the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicExpansion {
    pub keywords: Vec<String>,
    pub scope: PlanScope,
    pub query_template: String,
    pub reason: String,
}

/// A versioned retrieval strategy for one org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalStrategy {
    pub version: u32,
    pub steps: Vec<StrategyStep>,
    #[serde(default)]
    pub expansions: Vec<TopicExpansion>,
}

impl Default for RetrievalStrategy {
    /// Built-in strategy used until an org stores its own (version 0).
    fn default() -> Self {
        let step = |scope, reason: &str| StrategyStep {
            scope,
            query_template: "{query}".into(),
            reason: reason.into(),
        };
        Self {
            version: 0,
            steps: vec![
                step(PlanScope::Room, "recent context of the current room"),
                step(PlanScope::Project, "memories of the current project"),
                step(PlanScope::Org, "organization-wide memories"),
                step(PlanScope::Chat, "raw chat history"),
            ],
            expansions: vec![],
        }
    }
}

#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// The org's active strategy version, if one was ever stored.
    async fn active_strategy(&self, org_id: OrgId) -> Result<Option<RetrievalStrategy>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub scope: PlanScope,
    pub query: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalPlan {
    pub org_id: OrgId,
    pub strategy_version: u32,
    pub steps: Vec<PlanStep>,
}

fn render(template: &str, query: &str) -> String {
    template.replace("{query}", query).trim().to_string()
}

/// Whether `keyword`'s words appear as a contiguous run of the query's words.
fn keyword_matches(query_words: &[String], keyword: &str) -> bool {
    let needle = query_terms(keyword);
    if needle.is_empty() || needle.len() > query_words.len() {
        return false;
    }
    query_words.windows(needle.len()).any(|w| w == needle.as_slice())
}

/// Render `strategy` for `query`: base steps, then matching expansions,
/// deduplicated by (scope, lowercased query) keeping the first occurrence.
pub fn build_plan(strategy: &RetrievalStrategy, org_id: OrgId, query: &str) -> RetrievalPlan {
    let query = query.trim();
    let words = query_terms(query);

    let base = strategy.steps.iter().map(|s| PlanStep {
        scope: s.scope,
        query: render(&s.query_template, query),
        reason: s.reason.clone(),
    });
    let expanded = strategy
        .expansions
        .iter()
        .filter(|e| e.keywords.iter().any(|k| keyword_matches(&words, k)))
        .map(|e| PlanStep {
            scope: e.scope,
            query: render(&e.query_template, query),
            reason: e.reason.clone(),
        });

    let mut seen = HashSet::new();
    let steps = base
        .chain(expanded)
        .filter(|s| !s.query.is_empty())
        .filter(|s| seen.insert((s.scope, s.query.to_lowercase())))
        .collect();

    RetrievalPlan {
        org_id,
        strategy_version: strategy.version,
        steps,
    }
}

/// Loads the org's strategy and builds its plan.
pub struct RetrievalPlanner {
    store: Arc<dyn StrategyStore>,
}

impl RetrievalPlanner {
    pub fn new(store: Arc<dyn StrategyStore>) -> Self {
        Self { store }
    }

    pub async fn plan(&self, org_id: OrgId, query: &str) -> Result<RetrievalPlan> {
        let strategy = self.store.active_strategy(org_id).await?.unwrap_or_default();
        Ok(build_plan(&strategy, org_id, query))
    }
}
