//! Mock gateway and embedder for deterministic testing.
//!
//! Return pre-configured answers without making any HTTP calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ellie_core::{EllieError, OrgId, Result};

use crate::embedding::EmbeddingProvider;
use crate::gateway::{LlmGateway, LlmReply};

/// A mock LLM gateway that replays queued answers in order.
///
/// # Example
/// ```
/// use ellie_llm::mock::MockGateway;
/// let gateway = MockGateway::new().with_response(r#"{"keep": null}"#);
/// ```
#[derive(Clone, Default)]
pub struct MockGateway {
    responses: Arc<Mutex<VecDeque<std::result::Result<String, String>>>>,
    /// Every (org, prompt) received, for assertions in tests.
    pub prompts: Arc<Mutex<Vec<(OrgId, String)>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text answer.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(Ok(text.to_string()));
        self
    }

    /// Queue a transport error.
    pub fn with_error(self, error: &str) -> Self {
        self.responses.lock().push_back(Err(error.to_string()));
        self
    }

    /// Number of calls received so far.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Prompts received so far, in order.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(&self, org_id: OrgId, prompt: &str) -> Result<LlmReply> {
        let n = {
            let mut prompts = self.prompts.lock();
            prompts.push((org_id, prompt.to_string()));
            prompts.len()
        };
        let next = self.responses.lock().pop_front();
        match next {
            Some(Ok(text)) => Ok(LlmReply {
                text,
                model: "mock/test-model".into(),
                trace_id: format!("trace-{n}"),
            }),
            Some(Err(e)) => Err(EllieError::Llm(e)),
            None => Err(EllieError::Llm("mock: no more queued responses".into())),
        }
    }
}

/// Deterministic bag-of-words embedder.
///
/// Each lowercase word is hashed into one of `dims` buckets and the vector is
/// L2-normalized, so identical texts embed identically and texts sharing most
/// words are close. Specific vectors can be pinned per text.
#[derive(Clone)]
pub struct MockEmbedding {
    dims: usize,
    pinned: Arc<Mutex<HashMap<String, Vec<f32>>>>,
    /// Number of texts embedded so far.
    pub embedded: Arc<Mutex<usize>>,
    short_by: usize,
}

impl MockEmbedding {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            pinned: Arc::new(Mutex::new(HashMap::new())),
            embedded: Arc::new(Mutex::new(0)),
            short_by: 0,
        }
    }

    /// Return `vector` whenever exactly `text` is embedded.
    pub fn pin(self, text: &str, vector: Vec<f32>) -> Self {
        self.pinned.lock().insert(text.to_string(), vector);
        self
    }

    /// Misbehave by returning `n` fewer vectors than requested.
    pub fn dropping(mut self, n: usize) -> Self {
        self.short_by = n;
        self
    }

    /// The vector this embedder produces for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.pinned.lock().get(text) {
            return v.clone();
        }
        let mut v = vec![0.0f32; self.dims.max(1)];
        for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = (fnv1a(word.as_bytes()) % v.len() as u64) as usize;
            v[bucket] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf29ce484222325u64, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x100000001b3)
    })
}

#[async_trait]
impl EmbeddingProvider for MockEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        *self.embedded.lock() += texts.len();
        let keep = texts.len().saturating_sub(self.short_by);
        Ok(texts.iter().take(keep).map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "mock"
    }
}
