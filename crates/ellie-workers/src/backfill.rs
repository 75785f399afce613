use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use ellie_core::{Memory, MemoryId, Result};
use ellie_llm::{EmbeddingProvider, embed_checked};

use crate::runner::Worker;

#[async_trait]
pub trait BackfillStore: Send + Sync {
    /// Active memories without an embedding, oldest first.
    async fn memories_missing_embedding(&self, limit: usize) -> Result<Vec<Memory>>;

    async fn save_embeddings(&self, embeddings: &[(MemoryId, Vec<f32>)]) -> Result<()>;
}

/// Embeds memories written without a vector (ingestion, merges, updates).
pub struct BackfillWorker {
    store: Arc<dyn BackfillStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
}

impl BackfillWorker {
    pub fn new(store: Arc<dyn BackfillStore>, embedder: Arc<dyn EmbeddingProvider>, batch_size: usize) -> Self {
        Self {
            store,
            embedder,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl Worker for BackfillWorker {
    fn name(&self) -> &'static str {
        "backfill"
    }

    async fn run_once(&self) -> Result<usize> {
        let memories = self.store.memories_missing_embedding(self.batch_size).await?;
        if memories.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = memories.iter().map(Memory::embedding_text).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let vectors = embed_checked(self.embedder.as_ref(), &refs).await?;

        let rows: Vec<(MemoryId, Vec<f32>)> = memories.iter().map(|m| m.id).zip(vectors).collect();
        self.store.save_embeddings(&rows).await?;
        info!(count = rows.len(), provider = self.embedder.name(), "embeddings backfilled");
        Ok(rows.len())
    }
}
