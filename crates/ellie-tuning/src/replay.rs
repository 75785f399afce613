use async_trait::async_trait;
use std::collections::HashSet;

use ellie_core::{Result, TunerConfig};

use crate::evaluator::{EvalReport, Evaluator};
use crate::fixture::EvalCase;
use crate::tuner::Evaluate;

/// Re-derive a case's retrieval outcome under `config`.
///
/// Candidates below the sensitivity-adjusted minimum relevance are dropped,
/// the rest ranked by score and cut at `max_results` and at the `max_chars`
/// budget. Cases without recorded candidates are returned unchanged.
pub fn replay_case(case: &EvalCase, config: &TunerConfig) -> EvalCase {
    if case.candidates.is_empty() {
        return case.clone();
    }
    let threshold = config.effective_min_relevance();
    let mut ranked: Vec<_> = case.candidates.iter().filter(|c| c.score >= threshold).collect();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut retrieved = Vec::new();
    let mut used = 0;
    for c in ranked.into_iter().take(config.max_results) {
        if used + c.chars > config.max_chars {
            break;
        }
        used += c.chars;
        retrieved.push(c.id.clone());
    }

    let relevant: HashSet<&str> = case.relevant_ids.iter().map(String::as_str).collect();
    let referenced = retrieved.iter().filter(|id| relevant.contains(id.as_str())).count() as u64;
    let missed = (relevant.len() as u64).saturating_sub(referenced);

    EvalCase {
        injected: !retrieved.is_empty(),
        injected_count: retrieved.len() as u64,
        referenced_count: referenced,
        missed_count: missed,
        retrieved_ids: retrieved,
        ..case.clone()
    }
}

/// Evaluates tuning configs by replaying recorded candidate scores.
pub struct FixtureReplay {
    cases: Vec<EvalCase>,
    evaluator: Evaluator,
}

impl FixtureReplay {
    pub fn new(cases: Vec<EvalCase>, evaluator: Evaluator) -> Self {
        Self { cases, evaluator }
    }

    pub fn report(&self, config: &TunerConfig) -> EvalReport {
        let replayed: Vec<EvalCase> = self.cases.iter().map(|c| replay_case(c, config)).collect();
        self.evaluator.evaluate(&replayed)
    }
}

#[async_trait]
impl Evaluate for FixtureReplay {
    async fn evaluate(&self, config: &TunerConfig) -> Result<EvalReport> {
        Ok(self.report(config))
    }
}
