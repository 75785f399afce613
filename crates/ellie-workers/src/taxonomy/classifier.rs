use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use ellie_core::{EllieError, Memory, OrgId, Result};
use ellie_llm::{LlmGateway, Structured, call_json};

/// At most this many nodes per memory.
pub const MAX_ASSIGNMENTS: usize = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationResponse {
    #[serde(default)]
    pub assignments: Vec<RawAssignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAssignment {
    pub path: String,
    pub confidence: f64,
}

/// A validated (node, confidence) assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub node_id: Uuid,
    pub path: String,
    pub confidence: f64,
}

/// Check a classifier answer against the org's path index.
///
/// Empty answers, more than three assignments, unknown paths and confidences
/// outside [0, 1] are malformed. Repeated paths collapse to the most
/// confident one.
pub fn validate_assignments(raw: &[RawAssignment], index: &BTreeMap<String, Uuid>) -> Result<Vec<Assignment>> {
    if raw.is_empty() {
        return Err(EllieError::MalformedOutput("no taxonomy assignments".into()));
    }
    if raw.len() > MAX_ASSIGNMENTS {
        return Err(EllieError::MalformedOutput(format!(
            "{} assignments, at most {} allowed",
            raw.len(),
            MAX_ASSIGNMENTS
        )));
    }

    let mut out: Vec<Assignment> = Vec::new();
    for a in raw {
        let path = a.path.trim().trim_matches('/');
        let node_id = *index
            .get(path)
            .ok_or_else(|| EllieError::MalformedOutput(format!("unknown taxonomy path '{path}'")))?;
        if !a.confidence.is_finite() || !(0.0..=1.0).contains(&a.confidence) {
            return Err(EllieError::MalformedOutput(format!("confidence {} out of range", a.confidence)));
        }
        match out.iter_mut().find(|o| o.node_id == node_id) {
            Some(existing) => existing.confidence = existing.confidence.max(a.confidence),
            None => out.push(Assignment {
                node_id,
                path: path.to_string(),
                confidence: a.confidence,
            }),
        }
    }
    Ok(out)
}

#[async_trait]
pub trait TaxonomyClassifier: Send + Sync {
    async fn classify(&self, org_id: OrgId, memory: &Memory, paths: &[String])
    -> Result<Structured<ClassificationResponse>>;
}

pub struct LlmTaxonomyClassifier {
    gateway: Arc<dyn LlmGateway>,
}

impl LlmTaxonomyClassifier {
    pub fn new(gateway: Arc<dyn LlmGateway>) -> Self {
        Self { gateway }
    }
}

pub fn classification_prompt(memory: &Memory, paths: &[String]) -> String {
    format!(
        "Classify this memory into at most {MAX_ASSIGNMENTS} taxonomy paths.\n\
         Use only paths from the list, exactly as written.\n\
         Respond with JSON only: {{\"assignments\": [{{\"path\": \"...\", \"confidence\": 0.0-1.0}}]}}\n\n\
         Valid paths:\n{}\n\nMemory ({}):\ntitle: {}\ncontent: {}\n",
        paths.join("\n"),
        memory.kind,
        memory.title,
        memory.content
    )
}

#[async_trait]
impl TaxonomyClassifier for LlmTaxonomyClassifier {
    async fn classify(
        &self,
        org_id: OrgId,
        memory: &Memory,
        paths: &[String],
    ) -> Result<Structured<ClassificationResponse>> {
        call_json(self.gateway.as_ref(), org_id, &classification_prompt(memory, paths)).await
    }
}
