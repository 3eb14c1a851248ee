//! Caller-facing facade tying storage, collaborators and engines together.

use futures_util::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::community::{CommunityDetectionConfig, CommunityDetector, CommunitySummarizer};
use crate::config::Config;
use crate::connectors::DataConnector;
use crate::cypher::{CypherExecutor, CypherResult};
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::extraction::{EntityExtractor, ExtractorConfig};
use crate::graph::{
    CommunitySummary, DetectedCommunity, GraphEntity, GraphRelationship, GraphRepository, GraphStats,
    ScoredCommunity, ScoredEntity, StoredCommunity,
};
use crate::indexing::{IndexingConfig, IndexingProgress, IndexingService};
use crate::llm::TextGenerator;
use crate::query::{
    GlobalQueryConfig, GlobalQueryEngine, GlobalQueryEvent, GlobalQueryResult, HybridQueryConfig,
    HybridQueryEngine, HybridQueryResult, QueryOptions, StreamingAnswer,
};

/// Tunables for every component the facade builds.
#[derive(Debug, Clone, Default)]
pub struct GraphRagSettings {
    pub community: CommunityDetectionConfig,
    pub extraction: ExtractorConfig,
    pub hybrid: HybridQueryConfig,
    pub global: GlobalQueryConfig,
    pub indexing: IndexingConfig,
}

impl From<&Config> for GraphRagSettings {
    fn from(config: &Config) -> Self {
        Self {
            community: config.community.clone(),
            extraction: config.extraction.clone(),
            hybrid: config.hybrid.clone(),
            global: config.global.clone(),
            indexing: config.indexing.clone(),
        }
    }
}

/// Personal GraphRAG engine.
///
/// Owns one [`IndexingService`] and the query engines, all sharing the
/// same repository and collaborators. Cloning is cheap and yields a handle
/// to the same engine.
#[derive(Clone)]
pub struct GraphRag {
    repository: Arc<dyn GraphRepository>,
    embedder: Arc<dyn Embedder>,
    hybrid: HybridQueryEngine,
    global: GlobalQueryEngine,
    cypher: CypherExecutor,
    indexing: IndexingService,
}

impl GraphRag {
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        generator: Arc<dyn TextGenerator>,
        embedder: Arc<dyn Embedder>,
        connectors: Vec<Arc<dyn DataConnector>>,
        settings: GraphRagSettings,
    ) -> Self {
        let indexing = IndexingService::new(
            repository.clone(),
            EntityExtractor::new(generator.clone(), embedder.clone(), settings.extraction),
            CommunityDetector::new(settings.community),
            CommunitySummarizer::new(generator.clone(), embedder.clone()),
            connectors,
            settings.indexing,
        );
        Self {
            hybrid: HybridQueryEngine::new(repository.clone(), embedder.clone(), generator.clone(), settings.hybrid),
            global: GlobalQueryEngine::new(repository.clone(), generator, settings.global),
            cypher: CypherExecutor::new(repository.clone()),
            indexing,
            repository,
            embedder,
        }
    }

    pub fn repository(&self) -> &Arc<dyn GraphRepository> {
        &self.repository
    }

    // Indexing control

    pub async fn start_indexing(&self, full_reindex: bool) -> Result<()> {
        self.indexing.start_indexing(full_reindex).await
    }

    pub fn pause_indexing(&self) -> Result<()> {
        self.indexing.pause_indexing()
    }

    pub fn resume_indexing(&self) -> Result<()> {
        self.indexing.resume_indexing()
    }

    pub fn cancel_indexing(&self) -> Result<()> {
        self.indexing.cancel_indexing()
    }

    pub fn indexing_progress(&self) -> IndexingProgress {
        self.indexing.progress()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<IndexingProgress> {
        self.indexing.subscribe()
    }

    pub fn progress_stream(&self) -> WatchStream<IndexingProgress> {
        self.indexing.progress_stream()
    }

    pub async fn wait_for_indexing(&self) -> IndexingProgress {
        self.indexing.wait_for_completion().await
    }

    // Queries

    pub async fn query(&self, query: &str, options: &QueryOptions) -> Result<HybridQueryResult> {
        self.hybrid.query(query, options).await
    }

    pub async fn query_with_answer(&self, query: &str, options: &QueryOptions) -> Result<HybridQueryResult> {
        self.hybrid.query_with_answer(query, options).await
    }

    pub async fn query_with_answer_streaming(
        &self,
        query: &str,
        options: &QueryOptions,
        cancel: CancellationToken,
    ) -> Result<StreamingAnswer> {
        self.hybrid.query_with_answer_streaming(query, options, cancel).await
    }

    pub async fn global_query(&self, query: &str, level: u32) -> Result<GlobalQueryResult> {
        self.global.global_query(query, level).await
    }

    pub async fn global_query_auto(&self, query: &str) -> Result<GlobalQueryResult> {
        self.global.global_query_auto(query).await
    }

    /// Streamed global query at an explicit level (or automatic with `None`),
    /// with the reduce answer delivered token by token.
    pub fn global_query_streaming(
        &self,
        query: &str,
        level: Option<u32>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, GlobalQueryEvent> {
        self.global.global_query_stream(query, level, true, cancel)
    }

    pub fn global_query_auto_streaming(
        &self,
        query: &str,
        cancel: CancellationToken,
    ) -> BoxStream<'static, GlobalQueryEvent> {
        self.global_query_streaming(query, None, cancel)
    }

    pub async fn cypher_query(&self, query: &str) -> Result<CypherResult> {
        self.cypher.execute(query).await
    }

    /// Embedding search over entities.
    pub async fn search_entities(
        &self,
        query: &str,
        top_k: usize,
        entity_type: Option<&str>,
    ) -> Result<Vec<ScoredEntity>> {
        let embedding = self.embedder.embed(query).await?;
        self.repository
            .search_entities_by_similarity(&embedding, top_k, 0.0, entity_type)
            .await
    }

    /// Embedding search over community summaries.
    pub async fn search_communities(
        &self,
        query: &str,
        top_k: usize,
        level: Option<u32>,
    ) -> Result<Vec<ScoredCommunity>> {
        let embedding = self.embedder.embed(query).await?;
        self.repository
            .search_communities_by_similarity(&embedding, top_k, level)
            .await
    }

    /// Retrieval context for `query` without generating an answer.
    pub async fn get_context(&self, query: &str) -> Result<String> {
        Ok(self.hybrid.query(query, &QueryOptions::default()).await?.context)
    }

    // Graph passthrough

    pub async fn add_entity(&self, entity: &GraphEntity) -> Result<()> {
        self.repository.add_entity(entity).await
    }

    pub async fn update_entity(&self, entity: &GraphEntity) -> Result<()> {
        self.repository.update_entity(entity).await
    }

    pub async fn delete_entity(&self, id: &str) -> Result<bool> {
        self.repository.delete_entity(id).await
    }

    pub async fn get_entity(&self, id: &str) -> Result<Option<GraphEntity>> {
        self.repository.get_entity(id).await
    }

    pub async fn get_entities_by_type(&self, entity_type: &str) -> Result<Vec<GraphEntity>> {
        self.repository.get_entities_by_type(entity_type).await
    }

    pub async fn get_entity_neighbors(
        &self,
        entity_id: &str,
        depth: usize,
        relationship_type: Option<&str>,
    ) -> Result<Vec<GraphEntity>> {
        self.repository.get_entity_neighbors(entity_id, depth, relationship_type).await
    }

    pub async fn add_relationship(&self, relationship: &GraphRelationship) -> Result<()> {
        self.repository.add_relationship(relationship).await
    }

    pub async fn delete_relationship(&self, id: &str) -> Result<bool> {
        self.repository.delete_relationship(id).await
    }

    pub async fn get_relationships(&self, entity_id: Option<&str>) -> Result<Vec<GraphRelationship>> {
        self.repository.get_relationships(entity_id).await
    }

    pub async fn add_community(&self, community: &DetectedCommunity) -> Result<()> {
        self.repository.add_community(community).await
    }

    pub async fn update_community_summary(&self, summary: &CommunitySummary) -> Result<()> {
        self.repository.update_community_summary(summary).await
    }

    pub async fn get_communities_by_level(&self, level: u32) -> Result<Vec<StoredCommunity>> {
        self.repository.get_communities_by_level(level).await
    }

    pub async fn get_stats(&self) -> Result<GraphStats> {
        self.repository.get_stats().await
    }

    /// Drop all graph data and forget every connector's sync state, so the
    /// next run fetches everything. Refused while indexing is active.
    /// A cancelled run still winding down is awaited first.
    pub async fn clear_graph(&self) -> Result<()> {
        self.indexing
            .while_idle("clear the graph", || async {
                self.repository.clear().await?;
                for connector in self.indexing.connectors() {
                    connector.set_last_sync_time(None).await?;
                }
                Ok(())
            })
            .await?;
        log::info!("Graph cleared");
        Ok(())
    }
}
