use async_trait::async_trait;
use ellie_core::{EllieError, Result};
use tracing::debug;

/// Trait for generating text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a batch of texts, one vector per text, in order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// The dimensionality of the output embeddings.
    fn dimensions(&self) -> usize;

    /// Provider name.
    fn name(&self) -> &str;
}

/// Embed `texts` and verify the provider kept its contract: one vector per
/// input, each exactly `dimensions()` long. Any mismatch is a hard error.
pub async fn embed_checked(provider: &dyn EmbeddingProvider, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Ok(vec![]);
    }
    let vectors = provider.embed(texts).await?;
    if vectors.len() != texts.len() {
        return Err(EllieError::Embedding(format!(
            "{} returned {} vectors for {} texts",
            provider.name(),
            vectors.len(),
            texts.len()
        )));
    }
    let dims = provider.dimensions();
    if let Some((idx, bad)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
        return Err(EllieError::Embedding(format!(
            "{} returned a {}-dim vector at index {}, expected {}",
            provider.name(),
            bad.len(),
            idx,
            dims
        )));
    }
    Ok(vectors)
}

/// OpenAI embeddings provider (text-embedding-3-small, text-embedding-3-large, etc.)
pub struct OpenAiEmbedding {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    dims: usize,
}

impl OpenAiEmbedding {
    /// Create an OpenAI embedding provider with text-embedding-3-small (1536 dims).
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: "https://api.openai.com/v1".into(),
            model: "text-embedding-3-small".into(),
            dims: 1536,
        }
    }

    /// Use a specific model (e.g. "text-embedding-3-large" with 3072 dims).
    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self
    }

    /// Use a custom base URL (e.g. for Azure OpenAI).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!(model = %self.model, count = texts.len(), "generating embeddings");

        let body = serde_json::json!({
            "model": &self.model,
            "input": texts,
        });

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| EllieError::Embedding(format!("embedding request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EllieError::Embedding(format!("embedding HTTP {}: {}", status, text)));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EllieError::Embedding(format!("embedding parse error: {}", e)))?;

        // Items carry an explicit index; order by it rather than trusting array order.
        let mut indexed: Vec<(u64, Vec<f32>)> = data["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .enumerate()
                    .filter_map(|(pos, item)| {
                        let idx = item["index"].as_u64().unwrap_or(pos as u64);
                        item["embedding"].as_array().map(|arr| {
                            let v = arr
                                .iter()
                                .filter_map(|v| v.as_f64().map(|f| f as f32))
                                .collect();
                            (idx, v)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        indexed.sort_by_key(|(idx, _)| *idx);

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Ollama embeddings provider (uses /api/embeddings endpoint).
pub struct OllamaEmbedding {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedding {
    pub fn new(model: &str, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "http://127.0.0.1:11434".into(),
            model: model.to_string(),
            dims,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedding {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());

        for text in texts {
            let body = serde_json::json!({
                "model": &self.model,
                "prompt": text,
            });

            let resp = self
                .client
                .post(format!("{}/api/embeddings", self.base_url))
                .json(&body)
                .send()
                .await
                .map_err(|e| EllieError::Embedding(format!("ollama embedding: {}", e)))?;

            if !resp.status().is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(EllieError::Embedding(format!("ollama embedding error: {}", text)));
            }

            let data: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| EllieError::Embedding(e.to_string()))?;

            // An empty vector is kept so embed_checked reports the mismatch.
            let embedding: Vec<f32> = data["embedding"]
                .as_array()
                .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
                .unwrap_or_default();
            results.push(embedding);
        }

        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
