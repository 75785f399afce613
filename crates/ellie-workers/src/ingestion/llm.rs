use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use ellie_core::text::{title_from, truncate_chars};
use ellie_core::{ChatMessage, MemoryKind, OrgId, Result};
use ellie_llm::{LlmGateway, call_json};

use super::heuristic::HeuristicExtractor;
use super::window::PromptWindowSplitter;
use super::{Extracted, Extractor};

/// Instructions placed before the message lines of every extraction prompt.
pub const EXTRACTION_HEADER: &str = "\
You extract durable team knowledge from a chat transcript.
Return only memories worth remembering for months: decisions, preferences,
lessons, anti-patterns, recurring patterns, facts and essential context.
Skip greetings, acknowledgements and chatter.

Allowed kinds: preference, technical_decision, process_decision, fact, lesson,
anti_pattern, pattern, context.

Respond with JSON only:
{\"memories\": [{\"message_id\": \"<id from the transcript>\", \"kind\": \"<kind>\",
\"title\": \"<short title>\", \"content\": \"<self-contained statement>\",
\"importance\": <1-5>, \"confidence\": <0.0-1.0>}]}
Use {\"memories\": []} when nothing qualifies.

Transcript (one message per line, `[id] author: content`):
";

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    memories: Vec<RawMemory>,
}

#[derive(Debug, Deserialize)]
struct RawMemory {
    message_id: String,
    kind: String,
    #[serde(default)]
    title: String,
    content: String,
    #[serde(default = "default_importance")]
    importance: i64,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_importance() -> i64 {
    3
}

fn default_confidence() -> f64 {
    0.7
}

/// LLM-backed extractor. Each prompt-budget sub-window is one gateway call;
/// a sub-window whose answer is unusable falls back to the heuristic extractor.
pub struct LlmExtractor {
    gateway: Arc<dyn LlmGateway>,
    splitter: PromptWindowSplitter,
    fallback: HeuristicExtractor,
    max_content_chars: usize,
}

impl LlmExtractor {
    pub fn new(gateway: Arc<dyn LlmGateway>, window_char_budget: usize, max_content_chars: usize) -> Result<Self> {
        Ok(Self {
            gateway,
            splitter: PromptWindowSplitter::new(window_char_budget, EXTRACTION_HEADER, max_content_chars)?,
            fallback: HeuristicExtractor::new(max_content_chars)?,
            max_content_chars,
        })
    }

    fn accept(&self, raw: RawMemory, window_ids: &HashSet<Uuid>) -> Option<Extracted> {
        let message_id: Uuid = raw.message_id.trim().parse().ok()?;
        if !window_ids.contains(&message_id) {
            return None;
        }
        let kind: MemoryKind = raw.kind.parse().ok()?;
        let content = truncate_chars(raw.content.trim(), self.max_content_chars);
        if content.is_empty() {
            return None;
        }
        let title = if raw.title.trim().is_empty() {
            title_from(&content, 80)
        } else {
            truncate_chars(raw.title.trim(), 80)
        };
        Some(Extracted {
            message_id,
            kind,
            title,
            content,
            importance: raw.importance,
            confidence: raw.confidence,
        })
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn extract(&self, org_id: OrgId, messages: &[ChatMessage]) -> Result<Vec<Extracted>> {
        let mut out = Vec::new();
        for window in self.splitter.split(messages) {
            let prompt = format!("{}{}", EXTRACTION_HEADER, self.splitter.render(window));
            match call_json::<ExtractionResponse>(self.gateway.as_ref(), org_id, &prompt).await {
                Ok(answer) => {
                    let ids: HashSet<Uuid> = window.iter().map(|m| m.id).collect();
                    let before = out.len();
                    out.extend(answer.value.memories.into_iter().filter_map(|raw| self.accept(raw, &ids)));
                    debug!(
                        org = %org_id,
                        messages = window.len(),
                        extracted = out.len() - before,
                        trace_id = %answer.trace_id,
                        "llm extraction"
                    );
                }
                Err(e) if e.is_malformed() => {
                    warn!(org = %org_id, messages = window.len(), error = %e, "unusable extraction output, using heuristics");
                    out.extend(window.iter().filter_map(|m| self.fallback.extract_message(m)));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}
