//! Embedding collaborator contract and the OpenAI-compatible client.

pub mod openai;

pub use openai::OpenAIEmbedder;

use async_trait::async_trait;

use crate::error::Result;

/// Turns text into a fixed-length vector.
///
/// Failures are reported as `GraphRagError::Embedding`; retry policy, if
/// any, belongs to the implementation.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, preserving order. Defaults to one call per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }
}
