//! Proactive injection scoring.
//!
//! Every candidate gets a score in [0, 1]:
//!
//! | component        | weight | value                                         |
//! |------------------|--------|-----------------------------------------------|
//! | similarity       | 0.45   | 0.8 · similarity + 0.2 · confidence           |
//! | recency          | 0.20   | 1 / (1 + age_days / 30)                       |
//! | importance       | 0.15   | (importance − 1) / 4                          |
//! | novelty          | 0.12   | 1 / (1 + prior injections in the room)        |
//! | stage damping    | 0.08   | 0.45 after 60 messages, 0.7 after 20, else 1  |
//!
//! Every component is clamped to [0, 1] and non-finite values count as 0.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use ellie_core::MemoryId;

/// No bundle ever carries more items than this.
pub const MAX_BUNDLE_ITEMS: usize = 10;

const W_SIMILARITY: f64 = 0.45;
const W_RECENCY: f64 = 0.20;
const W_IMPORTANCE: f64 = 0.15;
const W_NOVELTY: f64 = 0.12;
const W_STAGE: f64 = 0.08;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionCandidate {
    pub id: MemoryId,
    pub title: String,
    pub content: String,
    pub similarity: f64,
    pub importance: u8,
    pub confidence: f64,
    pub occurred_at: DateTime<Utc>,
    /// Earlier decision this memory replaced.
    #[serde(default)]
    pub supersedes: Option<MemoryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: InjectionCandidate,
    pub score: f64,
    pub similarity: f64,
    pub recency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InjectionBundle {
    pub items: Vec<ScoredCandidate>,
    pub text: String,
}

impl InjectionBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn unit(x: f64) -> f64 {
    if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 }
}

fn stage_damping(room_message_count: u64) -> f64 {
    if room_message_count > 60 {
        0.45
    } else if room_message_count > 20 {
        0.7
    } else {
        1.0
    }
}

fn recency(now: DateTime<Utc>, occurred_at: DateTime<Utc>) -> f64 {
    let age_secs = (now - occurred_at).num_seconds().max(0) as f64;
    let age_days = age_secs / 86_400.0;
    unit(1.0 / (1.0 + age_days / 30.0))
}

/// Score one candidate.
pub fn score_candidate(
    now: DateTime<Utc>,
    room_message_count: u64,
    prior_injection_count: u64,
    candidate: &InjectionCandidate,
) -> ScoredCandidate {
    let similarity = unit(candidate.similarity);
    let effective = unit(0.8 * similarity + 0.2 * unit(candidate.confidence));
    let recency = recency(now, candidate.occurred_at);
    let importance = unit((f64::from(candidate.importance) - 1.0) / 4.0);
    let novelty = unit(1.0 / (1.0 + prior_injection_count as f64));
    let stage = stage_damping(room_message_count);

    let score = W_SIMILARITY * effective
        + W_RECENCY * recency
        + W_IMPORTANCE * importance
        + W_NOVELTY * novelty
        + W_STAGE * stage;

    ScoredCandidate {
        candidate: candidate.clone(),
        score: unit(score),
        similarity,
        recency,
    }
}

fn rank(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.similarity.total_cmp(&a.similarity))
        .then_with(|| b.recency.total_cmp(&a.recency))
        .then_with(|| a.candidate.id.cmp(&b.candidate.id))
}

/// Score, threshold, rank and cap `candidates`, then render the survivors.
pub fn build_bundle(
    now: DateTime<Utc>,
    room_message_count: u64,
    prior_injection_count: u64,
    candidates: &[InjectionCandidate],
    threshold: f64,
    max_items: usize,
) -> InjectionBundle {
    let mut items: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|c| score_candidate(now, room_message_count, prior_injection_count, c))
        .filter(|s| s.score >= threshold)
        .collect();
    items.sort_by(rank);
    items.truncate(max_items.min(MAX_BUNDLE_ITEMS));

    let text = render_bundle(&items);
    InjectionBundle { items, text }
}

/// Render bundle items as a context block. Empty input renders as "".
pub fn render_bundle(items: &[ScoredCandidate]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let mut out = String::from("Relevant context from earlier conversations:\n");
    for item in items {
        let c = &item.candidate;
        out.push_str(&format!("- {}: {}\n", c.title, c.content));
        if let Some(old) = c.supersedes {
            out.push_str(&format!("  (note: previous decision {old} has been superseded by this one)\n"));
        }
    }
    out
}
