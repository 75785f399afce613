use serde::{Deserialize, Serialize};
use std::path::Path;

use ellie_core::{EllieError, Result};

/// A candidate memory as scored during a recorded retrieval, used by replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub id: String,
    pub score: f64,
    /// Rendered length of the candidate, counted against `max_chars`.
    #[serde(default)]
    pub chars: usize,
}

/// One labeled evaluation case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalCase {
    pub id: String,
    /// Whether the message should have triggered proactive injection.
    pub should_inject: bool,
    /// Whether anything was actually injected.
    pub injected: bool,
    /// Retrieved memory ids, best first.
    pub retrieved_ids: Vec<String>,
    /// Ids a human labeled relevant.
    pub relevant_ids: Vec<String>,
    /// The case exercised recovery after a missing-context turn.
    pub recovery_attempted: bool,
    pub recovered: bool,
    pub latency_ms: f64,
    /// Memories injected in the conversation.
    pub injected_count: u64,
    /// Injected memories the agent went on to reference.
    pub referenced_count: u64,
    /// Relevant memories that were never injected.
    pub missed_count: u64,
    /// Scored candidates, replayed under alternative configs.
    pub candidates: Vec<ScoredId>,
}

/// Parse NDJSON fixtures. Blank lines and `#` comments are skipped.
pub fn parse_fixtures(raw: &str) -> Result<Vec<EvalCase>> {
    let mut cases = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let case: EvalCase = serde_json::from_str(line)
            .map_err(|e| EllieError::Validation(format!("fixture line {}: {}", idx + 1, e)))?;
        cases.push(case);
    }
    Ok(cases)
}

pub fn load_fixtures(path: &Path) -> Result<Vec<EvalCase>> {
    let raw = std::fs::read_to_string(path)?;
    parse_fixtures(&raw)
}
