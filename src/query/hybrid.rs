use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::community::truncate_chars;
use crate::cypher::CypherExecutor;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::{GraphEntity, GraphRepository, ScoredCommunity};
use crate::llm::TextGenerator;

/// `[hybrid]` settings. Weights need not sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridQueryConfig {
    pub cypher_weight: f64,
    pub embedding_weight: f64,
    pub community_weight: f64,
    /// Entities kept from the similarity search and in the fused ranking.
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub include_community_context: bool,
    pub community_top_k: usize,
    pub max_context_entities: usize,
    pub max_context_communities: usize,
    pub max_context_chars: usize,
}

impl Default for HybridQueryConfig {
    fn default() -> Self {
        Self {
            cypher_weight: 0.4,
            embedding_weight: 0.4,
            community_weight: 0.2,
            top_k: 10,
            similarity_threshold: 0.0,
            include_community_context: true,
            community_top_k: 5,
            max_context_entities: 10,
            max_context_communities: 3,
            max_context_chars: 4000,
        }
    }
}

/// Per-query knobs on top of the engine config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Graph pattern contributing the Cypher signal.
    pub cypher_query: Option<String>,
    /// Restrict the similarity search to one entity type.
    pub entity_type: Option<String>,
}

impl QueryOptions {
    pub fn with_cypher(mut self, query: impl Into<String>) -> Self {
        self.cypher_query = Some(query.into());
        self
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    Cypher,
    Embedding,
    Community,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredQueryEntity {
    pub entity: GraphEntity,
    /// Sum of the weighted per-source scores.
    pub score: f64,
    pub sources: Vec<MatchSource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryMetadata {
    pub cypher_matches: usize,
    pub embedding_matches: usize,
    pub communities_searched: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HybridQueryResult {
    /// Fused ranking: score descending, then entity id.
    pub entities: Vec<ScoredQueryEntity>,
    pub communities: Vec<ScoredCommunity>,
    pub context: String,
    pub answer: Option<String>,
    pub metadata: QueryMetadata,
}

impl HybridQueryResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.communities.is_empty()
    }
}

/// Retrieval result plus the answer tokens, pulled at the consumer's pace.
pub struct StreamingAnswer {
    pub result: HybridQueryResult,
    pub tokens: ReceiverStream<Result<String>>,
}

/// Fuses Cypher matches, embedding similarity and community context into
/// one ranked entity list.
#[derive(Clone)]
pub struct HybridQueryEngine {
    repository: Arc<dyn GraphRepository>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn TextGenerator>,
    cypher: CypherExecutor,
    config: HybridQueryConfig,
}

impl HybridQueryEngine {
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn TextGenerator>,
        config: HybridQueryConfig,
    ) -> Self {
        Self {
            cypher: CypherExecutor::new(repository.clone()),
            repository,
            embedder,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &HybridQueryConfig {
        &self.config
    }

    /// Retrieve and rank; no answer is generated.
    ///
    /// A source is used when it is configured: the Cypher signal needs a
    /// query in `options`, the embedding signal a positive weight, the
    /// community signal `include_community_context`. With none of them the
    /// result is empty.
    pub async fn query(&self, query: &str, options: &QueryOptions) -> Result<HybridQueryResult> {
        let start = Instant::now();
        let config = &self.config;
        let mut fused: HashMap<String, ScoredQueryEntity> = HashMap::new();
        let mut metadata = QueryMetadata::default();

        if let Some(cypher) = options.cypher_query.as_deref().filter(|q| !q.trim().is_empty()) {
            let matched = self.cypher.execute(cypher).await?;
            metadata.cypher_matches = matched.entities.len();
            for entity in matched.entities {
                add_signal(&mut fused, entity, config.cypher_weight, MatchSource::Cypher);
            }
        }

        let wants_embedding = config.embedding_weight > 0.0;
        let wants_communities = config.include_community_context;
        let mut communities = Vec::new();

        if wants_embedding || wants_communities {
            let query_embedding = self.embedder.embed(query).await?;

            if wants_embedding {
                let similar = self
                    .repository
                    .search_entities_by_similarity(
                        &query_embedding,
                        config.top_k,
                        config.similarity_threshold,
                        options.entity_type.as_deref(),
                    )
                    .await?;
                metadata.embedding_matches = similar.len();
                for scored in similar {
                    let weight = config.embedding_weight * f64::from(scored.score);
                    add_signal(&mut fused, scored.entity, weight, MatchSource::Embedding);
                }
            }

            if wants_communities {
                communities = self
                    .repository
                    .search_communities_by_similarity(&query_embedding, config.community_top_k, None)
                    .await?;
                metadata.communities_searched = communities.len();
                for scored in &communities {
                    let bonus = config.community_weight * f64::from(scored.score);
                    for entity_id in &scored.community.community.entity_ids {
                        if let Some(hit) = fused.get_mut(entity_id) {
                            hit.score += bonus;
                            if !hit.sources.contains(&MatchSource::Community) {
                                hit.sources.push(MatchSource::Community);
                            }
                        }
                    }
                }
            }
        }

        let mut entities: Vec<ScoredQueryEntity> = fused.into_values().collect();
        entities.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.entity.id.cmp(&b.entity.id)));
        entities.truncate(config.top_k);

        let context = build_context(&entities, &communities, config);
        metadata.execution_time_ms = start.elapsed().as_millis() as u64;
        log::debug!(
            "Hybrid query: {} entities, {} communities in {}ms",
            entities.len(),
            communities.len(),
            metadata.execution_time_ms
        );

        Ok(HybridQueryResult {
            entities,
            communities,
            context,
            answer: None,
            metadata,
        })
    }

    pub async fn query_with_answer(&self, query: &str, options: &QueryOptions) -> Result<HybridQueryResult> {
        let mut result = self.query(query, options).await?;
        let answer = self.generator.generate(&answer_prompt(&result.context, query)).await?;
        result.answer = Some(answer.trim().to_string());
        Ok(result)
    }

    /// Like [`query_with_answer`](Self::query_with_answer), but the answer
    /// arrives as tokens. The producer waits for the consumer between
    /// tokens and stops when `cancel` fires or the stream is dropped.
    pub async fn query_with_answer_streaming(
        &self,
        query: &str,
        options: &QueryOptions,
        cancel: CancellationToken,
    ) -> Result<StreamingAnswer> {
        let result = self.query(query, options).await?;
        let mut upstream = self.generator.generate_stream(&answer_prompt(&result.context, query)).await?;
        let (tx, rx) = mpsc::channel::<Result<String>>(1);

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = upstream.next() => next,
                };
                let Some(token) = next else { break };
                let failed = token.is_err();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(token) => if sent.is_err() { break },
                }
                if failed {
                    break;
                }
            }
        });

        Ok(StreamingAnswer {
            result,
            tokens: ReceiverStream::new(rx),
        })
    }
}

fn add_signal(fused: &mut HashMap<String, ScoredQueryEntity>, entity: GraphEntity, weight: f64, source: MatchSource) {
    let hit = fused.entry(entity.id.clone()).or_insert_with(|| ScoredQueryEntity {
        entity,
        score: 0.0,
        sources: Vec::new(),
    });
    hit.score += weight;
    if !hit.sources.contains(&source) {
        hit.sources.push(source);
    }
}

fn build_context(entities: &[ScoredQueryEntity], communities: &[ScoredCommunity], config: &HybridQueryConfig) -> String {
    let mut context = String::new();

    if !entities.is_empty() {
        context.push_str("Relevant entities:\n");
        for hit in entities.iter().take(config.max_context_entities) {
            let entity = &hit.entity;
            context.push_str(&format!("- {} ({})", entity.name, entity.entity_type));
            if let Some(description) = entity.description.as_deref().filter(|d| !d.is_empty()) {
                context.push_str(": ");
                context.push_str(description);
            }
            context.push('\n');
        }
    }

    let summaries: Vec<&str> = communities
        .iter()
        .filter_map(|c| c.community.summary_text())
        .take(config.max_context_communities)
        .collect();
    if !summaries.is_empty() {
        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str("Related topics:\n");
        for summary in summaries {
            context.push_str(&format!("- {}\n", summary));
        }
    }

    truncate_chars(context.trim_end(), config.max_context_chars)
}

fn answer_prompt(context: &str, query: &str) -> String {
    let context = if context.is_empty() {
        "(no relevant information found)"
    } else {
        context
    };
    format!(
        "You are a personal assistant answering questions from the user's own knowledge graph.\n\n\
         Context:\n{}\n\n\
         Question: {}\n\n\
         Answer using only the context. If the context does not contain the answer, say so briefly.",
        context, query
    )
}
