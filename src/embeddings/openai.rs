use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::Embedder;
use crate::cache::EmbeddingCache;
use crate::error::{GraphRagError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
///
/// Splits large inputs into batches, retries rate-limit and server errors
/// with exponential backoff, and serves repeated single texts from an
/// optional LRU cache.
pub struct OpenAIEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    batch_size: usize,
    dimensions: Option<usize>,
    max_retries: usize,
    cache: Option<Arc<EmbeddingCache>>,
}

/// Non-success HTTP answer; `status` decides whether a retry makes sense.
struct ApiFailure {
    status: Option<StatusCode>,
    message: String,
}

impl ApiFailure {
    fn is_retryable(&self) -> bool {
        match self.status {
            Some(status) => status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error(),
            // transport errors (timeouts, resets) are worth another try
            None => true,
        }
    }
}

impl OpenAIEmbedder {
    /// `batch_size` is capped at the API maximum of 2048.
    pub fn new(api_key: String, model: String, batch_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GraphRagError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model,
            batch_size: batch_size.clamp(1, 2048),
            dimensions: None,
            max_retries: 3,
            cache: None,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Request (and verify) vectors of exactly this length.
    pub fn with_dimensions(mut self, dimensions: Option<usize>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<EmbeddingCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, ApiFailure> {
        let body = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiFailure {
                status: None,
                message: format!("Network error: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(ApiFailure {
                status: Some(status),
                message: format!("Embedding API error {}: {}", status, body),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await.map_err(|e| ApiFailure {
            status: Some(status),
            message: format!("Failed to parse response: {}", e),
        })?;
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    async fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = std::time::Instant::now();
        let mut attempt = 0;
        let mut delay = Duration::from_secs(1);

        loop {
            match self.request(texts).await {
                Ok(embeddings) => {
                    log::debug!(
                        "Embedding API call for {} texts took {:?} (attempt {})",
                        texts.len(),
                        start.elapsed(),
                        attempt + 1
                    );
                    return self.check_response(texts.len(), embeddings);
                }
                Err(failure) if attempt < self.max_retries && failure.is_retryable() => {
                    log::warn!("Retry {}/{} after error: {}", attempt + 1, self.max_retries, failure.message);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(failure) => return Err(GraphRagError::Embedding(failure.message)),
            }
        }
    }

    fn check_response(&self, expected: usize, embeddings: Vec<Vec<f32>>) -> Result<Vec<Vec<f32>>> {
        if embeddings.len() != expected {
            return Err(GraphRagError::Embedding(format!(
                "expected {} embeddings, API returned {}",
                expected,
                embeddings.len()
            )));
        }
        if let Some(dim) = self.dimensions {
            if let Some(bad) = embeddings.iter().find(|e| e.len() != dim) {
                return Err(GraphRagError::Embedding(format!(
                    "model returned {} dimensions, configured {}",
                    bad.len(),
                    dim
                )));
            }
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(text) {
                log::debug!("Embedding cache hit ({} chars)", text.len());
                return Ok(cached);
            }
        }

        let mut embeddings = self.request_with_retry(&[text.to_string()]).await?;
        let embedding = embeddings
            .pop()
            .ok_or_else(|| GraphRagError::Embedding("Empty response from embedding API".to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put(text.to_string(), embedding.clone());
        }
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut all = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            all.extend(self.request_with_retry(chunk).await?);

            // small pause between full batches keeps us under rate limits
            if chunk.len() == self.batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(all)
    }
}
