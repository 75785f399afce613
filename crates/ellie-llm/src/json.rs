//! JSON extraction from model output.
//!
//! Models wrap JSON in markdown fences, prefix it with prose, or trail it with
//! explanations. Extraction strips all of that; anything that still fails to
//! deserialize is reported as [`EllieError::MalformedOutput`] so callers can
//! skip the item instead of failing the batch.

use ellie_core::{EllieError, OrgId, Result};
use serde::de::DeserializeOwned;

use crate::gateway::LlmGateway;

/// A parsed model answer plus its provenance.
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    pub model: String,
    pub trace_id: String,
}

/// Locate the JSON document inside `text`.
///
/// Prefers the body of the first fenced code block, then the span from the
/// first `{`/`[` to the last matching closer.
pub fn extract_json(text: &str) -> Option<&str> {
    let mut body = text.trim();

    if let Some(start) = body.find("```") {
        let after = &body[start + 3..];
        // Skip the info string ("json", "JSON", ...) up to the end of the line.
        let after = match after.find('\n') {
            Some(nl) => &after[nl + 1..],
            None => after,
        };
        body = match after.find("```") {
            Some(end) => &after[..end],
            None => after,
        };
    }

    let open = body.find(['{', '['])?;
    let closer = if body[open..].starts_with('{') { '}' } else { ']' };
    let close = body.rfind(closer)?;
    if close < open {
        return None;
    }
    Some(body[open..=close].trim())
}

/// Extract and deserialize a JSON document from model output.
pub fn parse_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json(text)
        .ok_or_else(|| EllieError::MalformedOutput("no JSON document in model output".into()))?;
    serde_json::from_str(json).map_err(|e| EllieError::MalformedOutput(format!("invalid JSON: {}", e)))
}

/// Call the gateway and parse its answer as `T`.
///
/// Transport failures keep their own error kind; only unusable output is
/// reported as malformed.
pub async fn call_json<T: DeserializeOwned>(
    gateway: &dyn LlmGateway,
    org_id: OrgId,
    prompt: &str,
) -> Result<Structured<T>> {
    let reply = gateway.call(org_id, prompt).await?;
    let value = parse_json(&reply.text)?;
    Ok(Structured {
        value,
        model: reply.model,
        trace_id: reply.trace_id,
    })
}
