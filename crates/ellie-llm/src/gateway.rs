use async_trait::async_trait;
use ellie_core::{EllieError, OrgId, Result};
use std::time::Duration;
use tracing::debug;

/// Text returned by the gateway plus what produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub text: String,
    /// Model identifier reported by the gateway.
    pub model: String,
    /// Gateway trace id, recorded next to every LLM-derived write.
    pub trace_id: String,
}

/// The single call shape every LLM-mediated component goes through.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Human-readable name, e.g. "openai".
    fn name(&self) -> &str;

    /// Send one prompt on behalf of an org.
    async fn call(&self, org_id: OrgId, prompt: &str) -> Result<LlmReply>;
}

/// OpenAI-compatible chat completions gateway (OpenAI, vLLM, LiteLLM, etc.)
pub struct OpenAiGateway {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
}

impl OpenAiGateway {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: None,
            base_url: "https://api.openai.com/v1".into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 2048,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Use a custom base URL (for self-hosted gateways).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_sampling(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LlmGateway for OpenAiGateway {
    fn name(&self) -> &str {
        "openai"
    }

    async fn call(&self, org_id: OrgId, prompt: &str) -> Result<LlmReply> {
        debug!(model = %self.model, org = %org_id, prompt_chars = prompt.len(), "calling llm gateway");

        let body = serde_json::json!({
            "model": &self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("X-Ellie-Org", org_id.to_string())
            .timeout(self.timeout)
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| EllieError::Llm(format!("request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EllieError::Llm(format!("HTTP {}: {}", status, text)));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EllieError::Llm(format!("response parse error: {}", e)))?;

        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| EllieError::Llm("response has no message content".into()))?
            .to_string();
        let model = data["model"].as_str().unwrap_or(&self.model).to_string();
        let trace_id = data["id"]
            .as_str()
            .map(String::from)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(LlmReply {
            text,
            model,
            trace_id,
        })
    }
}
