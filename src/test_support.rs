//! Deterministic collaborators shared by unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::Duration;

use crate::connectors::{DataConnector, SourceRecord, SourceType};
use crate::embeddings::Embedder;
use crate::error::{GraphRagError, Result};
use crate::llm::{TextGenerator, TokenStream};

/// Text generator answering from substring rules, first match wins.
pub struct ScriptedGenerator {
    rules: Vec<(String, String)>,
    failures: Vec<String>,
    default: String,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            failures: Vec::new(),
            default: default.into(),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_when(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }

    pub fn fail_when(mut self, needle: impl Into<String>) -> Self {
        self.failures.push(needle.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    async fn respond(&self, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.iter().any(|n| prompt.contains(n.as_str())) {
            return Err(GraphRagError::Generation("scripted failure".to_string()));
        }
        Ok(self
            .rules
            .iter()
            .find(|(needle, _)| prompt.contains(needle.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default.clone()))
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.respond(prompt).await
    }

    /// Streams the response word by word.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let text = self.respond(prompt).await?;
        let chunks: Vec<Result<String>> = text.split_inclusive(' ').map(|s| Ok(s.to_string())).collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// Bag-of-words embedder: each lowercase word lands in a hashed bucket, so
/// texts sharing words are similar.
pub struct HashEmbedder {
    dimension: usize,
    failures: Vec<String>,
    calls: Mutex<usize>,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            failures: Vec::new(),
            calls: Mutex::new(0),
        }
    }

    pub fn fail_when(mut self, needle: impl Into<String>) -> Self {
        self.failures.push(needle.into());
        self
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        vector[0] = 0.01;
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            vector[(hasher.finish() as usize) % self.dimension] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        vector.iter().map(|x| x / norm).collect()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        *self.calls.lock().unwrap() += 1;
        if self.failures.iter().any(|n| text.contains(n.as_str())) {
            return Err(GraphRagError::Embedding("scripted failure".to_string()));
        }
        Ok(self.vector(text))
    }
}

/// Connector serving a fixed record list.
pub struct InMemoryConnector {
    source: SourceType,
    records: Vec<SourceRecord>,
    permitted: bool,
    deny_on_fetch: bool,
    panic_on_fetch: bool,
    fetch_delay: Option<Duration>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    fetch_calls: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl InMemoryConnector {
    pub fn new(source: SourceType, records: Vec<SourceRecord>) -> Self {
        Self {
            source,
            records,
            permitted: true,
            deny_on_fetch: false,
            panic_on_fetch: false,
            fetch_delay: None,
            last_sync: Mutex::new(None),
            fetch_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn without_permission(mut self) -> Self {
        self.permitted = false;
        self
    }

    /// Claims permission but fails every fetch with `PermissionDenied`.
    pub fn denying_fetch(mut self) -> Self {
        self.deny_on_fetch = true;
        self
    }

    pub fn panicking_fetch(mut self) -> Self {
        self.panic_on_fetch = true;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// The `since` argument of every fetch so far.
    pub fn fetch_calls(&self) -> Vec<Option<DateTime<Utc>>> {
        self.fetch_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataConnector for InMemoryConnector {
    fn name(&self) -> &str {
        self.source.as_str()
    }

    fn source_type(&self) -> SourceType {
        self.source
    }

    async fn check_permissions(&self) -> Result<bool> {
        Ok(self.permitted)
    }

    async fn fetch(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Result<Vec<SourceRecord>> {
        self.fetch_calls.lock().unwrap().push(since);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if self.panic_on_fetch {
            panic!("connector exploded");
        }
        if self.deny_on_fetch {
            return Err(GraphRagError::PermissionDenied(self.source.to_string()));
        }
        Ok(self
            .records
            .iter()
            .filter(|r| since.map_or(true, |s| r.modified_at > s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(*self.last_sync.lock().unwrap())
    }

    async fn set_last_sync_time(&self, time: Option<DateTime<Utc>>) -> Result<()> {
        *self.last_sync.lock().unwrap() = time;
        Ok(())
    }
}
