use async_trait::async_trait;

use super::{
    CommunitySummary, DetectedCommunity, GraphEntity, GraphRelationship, GraphStats, ScoredCommunity,
    ScoredEntity, StoredCommunity,
};
use crate::error::Result;

/// Storage capability the engine depends on.
///
/// Implementations own all persisted entities, relationships and
/// communities, apply their own per-call write atomicity, and must be safe
/// for concurrent readers. Any method may return
/// [`GraphRagError::NotInitialized`](crate::GraphRagError::NotInitialized)
/// when called before setup.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    /// Insert or replace an entity. Fails with `DimensionMismatch` when the
    /// embedding length differs from the store's established dimension.
    async fn add_entity(&self, entity: &GraphEntity) -> Result<()>;

    /// Replace an existing entity; `EntityNotFound` if absent.
    async fn update_entity(&self, entity: &GraphEntity) -> Result<()>;

    /// Delete an entity and the relationships touching it. Returns whether it existed.
    async fn delete_entity(&self, id: &str) -> Result<bool>;

    async fn get_entity(&self, id: &str) -> Result<Option<GraphEntity>>;

    /// Entities with exactly this type, ordered by id.
    async fn get_entities_by_type(&self, entity_type: &str) -> Result<Vec<GraphEntity>>;

    /// Every entity, ordered by id.
    async fn get_all_entities(&self) -> Result<Vec<GraphEntity>>;

    /// Insert or replace a relationship. Endpoints are not checked.
    async fn add_relationship(&self, relationship: &GraphRelationship) -> Result<()>;

    async fn delete_relationship(&self, id: &str) -> Result<bool>;

    /// Relationships touching `entity_id` (either direction), or all of them
    /// when `None`. Relationships with a missing endpoint are never returned.
    async fn get_relationships(&self, entity_id: Option<&str>) -> Result<Vec<GraphRelationship>>;

    async fn add_community(&self, community: &DetectedCommunity) -> Result<()>;

    /// Attach a summary to an existing community; `CommunityNotFound` if absent.
    async fn update_community_summary(&self, summary: &CommunitySummary) -> Result<()>;

    /// Communities at `level`, ordered by id.
    async fn get_communities_by_level(&self, level: u32) -> Result<Vec<StoredCommunity>>;

    /// Remove every community (detection always recomputes from scratch).
    async fn clear_communities(&self) -> Result<()>;

    /// Breadth-first traversal treating edges as undirected. `depth` is the
    /// number of hops; the start entity is excluded.
    async fn get_entity_neighbors(
        &self,
        entity_id: &str,
        depth: usize,
        relationship_type: Option<&str>,
    ) -> Result<Vec<GraphEntity>>;

    /// Cosine-similarity search over entity embeddings.
    async fn search_entities_by_similarity(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
        entity_type: Option<&str>,
    ) -> Result<Vec<ScoredEntity>>;

    /// Cosine-similarity search over community summary embeddings.
    async fn search_communities_by_similarity(
        &self,
        embedding: &[f32],
        top_k: usize,
        level: Option<u32>,
    ) -> Result<Vec<ScoredCommunity>>;

    async fn get_stats(&self) -> Result<GraphStats>;

    /// Remove everything, including the established embedding dimension.
    async fn clear(&self) -> Result<()>;
}
