use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use ellie_core::text::{title_from, truncate_chars};
use ellie_core::{ChatMessage, EllieError, MemoryKind, OrgId, Result};

use super::{Extracted, Extractor};

const TITLE_CHARS: usize = 80;
const CONFIDENCE: f64 = 0.6;

/// Replies that never carry durable knowledge, however long the room is.
const ACKNOWLEDGEMENTS: &[&str] = &[
    "ok", "okay", "k", "thanks", "thank you", "thx", "ty", "sounds good", "lgtm", "got it", "sure", "yes", "no",
    "yep", "nope", "+1", "nice", "great", "cool", "will do", "done", "ack", "agreed", "makes sense", "perfect",
];

/// Whether a message is too short or too generic to be worth extracting.
pub fn is_low_signal(content: &str, min_chars: usize) -> bool {
    let trimmed = content.trim();
    if trimmed.chars().count() < min_chars {
        return true;
    }
    let normalized: String = trimmed
        .to_lowercase()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string();
    ACKNOWLEDGEMENTS.contains(&normalized.as_str())
}

/// Default importance of a heuristically extracted memory.
pub fn importance_for(kind: MemoryKind) -> i64 {
    match kind {
        MemoryKind::TechnicalDecision | MemoryKind::ProcessDecision | MemoryKind::AntiPattern => 4,
        MemoryKind::Lesson | MemoryKind::Preference | MemoryKind::Fact | MemoryKind::Pattern => 3,
        MemoryKind::Context => 2,
    }
}

/// Keyword-triggered classifier. Messages that trigger nothing produce nothing.
pub struct HeuristicExtractor {
    anti_pattern: Regex,
    decision: Regex,
    process: Regex,
    preference: Regex,
    lesson: Regex,
    fact: Regex,
    context: Regex,
    max_content_chars: usize,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EllieError::Config(format!("invalid extraction pattern: {e}")))
}

impl HeuristicExtractor {
    pub fn new(max_content_chars: usize) -> Result<Self> {
        Ok(Self {
            anti_pattern: compile(
                r"(?i)\b(anti-?pattern|never (use|do|call|deploy|merge|commit|push)|(don't|do not|avoid|stop) (using|doing|calling|deploying|merging))\b",
            )?,
            decision: compile(
                r"(?i)\b(we decided|decided to|decision is|we chose|chose to|going with|we'll use|we will use|switching to|migrating to|opted (to|for)|agreed to|settled on)\b",
            )?,
            process: compile(
                r"(?i)\b(process|workflow|review|release|sprint|stand-?up|on-?call|retro|meeting|approval|deploy(ment)? window)\b",
            )?,
            preference: compile(r"(?i)\b(i prefer|we prefer|prefer to|i'd rather|we'd rather|please always|please never|i like to)\b")?,
            lesson: compile(r"(?i)\b(lesson learned|learned that|turns out|root cause|post-?mortem|next time|in hindsight)\b")?,
            fact: compile(
                r"(?i)\b(runs on|lives in|hosted on|depends on|is configured|is set to|owned by|located in|deadline is|the password policy|the limit is)\b",
            )?,
            context: compile(r"(?i)\b(fyi|for context|background|heads up|note that|keep in mind)\b")?,
            max_content_chars,
        })
    }

    /// Kind triggered by `content`, checked from most to least specific.
    pub fn classify(&self, content: &str) -> Option<MemoryKind> {
        if self.anti_pattern.is_match(content) {
            Some(MemoryKind::AntiPattern)
        } else if self.decision.is_match(content) {
            if self.process.is_match(content) {
                Some(MemoryKind::ProcessDecision)
            } else {
                Some(MemoryKind::TechnicalDecision)
            }
        } else if self.preference.is_match(content) {
            Some(MemoryKind::Preference)
        } else if self.lesson.is_match(content) {
            Some(MemoryKind::Lesson)
        } else if self.fact.is_match(content) {
            Some(MemoryKind::Fact)
        } else if self.context.is_match(content) {
            Some(MemoryKind::Context)
        } else {
            None
        }
    }

    pub fn extract_message(&self, msg: &ChatMessage) -> Option<Extracted> {
        let kind = self.classify(&msg.content)?;
        let content = truncate_chars(msg.content.trim(), self.max_content_chars);
        Some(Extracted {
            message_id: msg.id,
            kind,
            title: title_from(&content, TITLE_CHARS),
            content,
            importance: importance_for(kind),
            confidence: CONFIDENCE,
        })
    }
}

#[async_trait]
impl Extractor for HeuristicExtractor {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn extract(&self, org_id: OrgId, messages: &[ChatMessage]) -> Result<Vec<Extracted>> {
        let out: Vec<Extracted> = messages.iter().filter_map(|m| self.extract_message(m)).collect();
        debug!(org = %org_id, messages = messages.len(), extracted = out.len(), "heuristic extraction");
        Ok(out)
    }
}
