use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::sse::{parse_sse_line, LineBuffer, SseEvent};
use super::{TextGenerator, TokenStream};
use crate::error::{GraphRagError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
///
/// Each prompt is sent as a single user message. No retries: a failed call
/// surfaces as `GraphRagError::Generation`.
pub struct OpenAIGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAIGenerator {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GraphRagError::Generation(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            model,
            temperature: 0.2,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn send(&self, prompt: &str, stream: bool) -> Result<reqwest::Response> {
        let request = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.temperature,
            stream,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GraphRagError::Generation(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphRagError::Generation(format!("Chat API error {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl TextGenerator for OpenAIGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let start = std::time::Instant::now();
        let response = self.send(prompt, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GraphRagError::Generation(format!("Failed to parse response: {}", e)))?;
        log::debug!("Chat completion ({} prompt chars) took {:?}", prompt.len(), start.elapsed());

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GraphRagError::Generation("Empty completion".to_string()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let response = self.send(prompt, true).await?;
        let (tx, rx) = mpsc::channel::<Result<String>>(16);

        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut lines = LineBuffer::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(GraphRagError::Generation(format!("Stream error: {}", e))))
                            .await;
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    match parse_sse_line(&line) {
                        Ok(Some(SseEvent::Content(text))) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        Ok(Some(SseEvent::Done)) => return,
                        Ok(None) => {}
                        Err(e) => log::warn!("Skipping malformed stream chunk: {}", e),
                    }
                }
            }

            if let Some(rest) = lines.finish() {
                if let Ok(Some(SseEvent::Content(text))) = parse_sse_line(&rest) {
                    let _ = tx.send(Ok(text)).await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
