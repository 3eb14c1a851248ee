//! Text-generation collaborator contract and the OpenAI-compatible client.

pub mod openai;
mod sse;

pub use openai::OpenAIGenerator;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};

use crate::error::Result;

/// A stream of generated text chunks, in order.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Prompt in, text out.
///
/// Failures are reported as `GraphRagError::Generation`. Timeouts and retry
/// belong to the implementation; callers propagate errors unchanged.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Stream the answer as it is produced. Implementations without native
    /// streaming yield the whole completion as a single chunk.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let text = self.generate(prompt).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}
