use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::traversal::breadth_first_neighbors;
use super::vector::{rank_by_similarity, DimensionGuard};
use super::{
    CommunitySummary, DetectedCommunity, GraphEntity, GraphRelationship, GraphRepository, GraphStats,
    ScoredCommunity, ScoredEntity, StoredCommunity,
};
use crate::error::{GraphRagError, Result};

#[derive(Debug, Default)]
struct MemoryGraph {
    entities: BTreeMap<String, GraphEntity>,
    relationships: BTreeMap<String, GraphRelationship>,
    communities: BTreeMap<String, StoredCommunity>,
}

impl MemoryGraph {
    fn is_valid(&self, rel: &GraphRelationship) -> bool {
        self.entities.contains_key(&rel.source_id) && self.entities.contains_key(&rel.target_id)
    }
}

/// Volatile graph store for tests and throwaway sessions. Ready on construction.
#[derive(Debug, Default)]
pub struct InMemoryGraphRepository {
    graph: RwLock<MemoryGraph>,
    dimension: DimensionGuard,
}

impl InMemoryGraphRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryGraph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryGraph> {
        self.graph.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl GraphRepository for InMemoryGraphRepository {
    async fn add_entity(&self, entity: &GraphEntity) -> Result<()> {
        self.dimension.check_or_establish(entity.embedding.len())?;
        self.write().entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn update_entity(&self, entity: &GraphEntity) -> Result<()> {
        let mut graph = self.write();
        if !graph.entities.contains_key(&entity.id) {
            return Err(GraphRagError::EntityNotFound(entity.id.clone()));
        }
        self.dimension.check_or_establish(entity.embedding.len())?;
        graph.entities.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> Result<bool> {
        let mut graph = self.write();
        let removed = graph.entities.remove(id).is_some();
        graph
            .relationships
            .retain(|_, rel| rel.source_id != id && rel.target_id != id);
        Ok(removed)
    }

    async fn get_entity(&self, id: &str) -> Result<Option<GraphEntity>> {
        Ok(self.read().entities.get(id).cloned())
    }

    async fn get_entities_by_type(&self, entity_type: &str) -> Result<Vec<GraphEntity>> {
        Ok(self
            .read()
            .entities
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    async fn get_all_entities(&self) -> Result<Vec<GraphEntity>> {
        Ok(self.read().entities.values().cloned().collect())
    }

    async fn add_relationship(&self, relationship: &GraphRelationship) -> Result<()> {
        if !relationship.weight.is_finite() || relationship.weight < 0.0 {
            return Err(GraphRagError::InvalidInput(format!(
                "relationship {} has invalid weight {}",
                relationship.id, relationship.weight
            )));
        }
        self.write()
            .relationships
            .insert(relationship.id.clone(), relationship.clone());
        Ok(())
    }

    async fn delete_relationship(&self, id: &str) -> Result<bool> {
        Ok(self.write().relationships.remove(id).is_some())
    }

    async fn get_relationships(&self, entity_id: Option<&str>) -> Result<Vec<GraphRelationship>> {
        let graph = self.read();
        Ok(graph
            .relationships
            .values()
            .filter(|rel| graph.is_valid(rel))
            .filter(|rel| match entity_id {
                Some(id) => rel.source_id == id || rel.target_id == id,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn add_community(&self, community: &DetectedCommunity) -> Result<()> {
        self.write().communities.insert(
            community.id.clone(),
            StoredCommunity {
                community: community.clone(),
                summary: None,
            },
        );
        Ok(())
    }

    async fn update_community_summary(&self, summary: &CommunitySummary) -> Result<()> {
        let mut graph = self.write();
        let stored = graph
            .communities
            .get_mut(&summary.community_id)
            .ok_or_else(|| GraphRagError::CommunityNotFound(summary.community_id.clone()))?;
        self.dimension.check_or_establish(summary.embedding.len())?;
        stored.summary = Some(summary.clone());
        Ok(())
    }

    async fn get_communities_by_level(&self, level: u32) -> Result<Vec<StoredCommunity>> {
        Ok(self
            .read()
            .communities
            .values()
            .filter(|c| c.community.level == level)
            .cloned()
            .collect())
    }

    async fn clear_communities(&self) -> Result<()> {
        self.write().communities.clear();
        Ok(())
    }

    async fn get_entity_neighbors(
        &self,
        entity_id: &str,
        depth: usize,
        relationship_type: Option<&str>,
    ) -> Result<Vec<GraphEntity>> {
        let graph = self.read();
        let ids = breadth_first_neighbors(entity_id, depth, |node| {
            Ok(graph
                .relationships
                .values()
                .filter(|rel| graph.is_valid(rel))
                .filter(|rel| relationship_type.map_or(true, |t| rel.relationship_type == t))
                .filter_map(|rel| {
                    if rel.source_id == node {
                        Some(rel.target_id.clone())
                    } else if rel.target_id == node {
                        Some(rel.source_id.clone())
                    } else {
                        None
                    }
                })
                .collect())
        })?;
        Ok(ids
            .iter()
            .filter_map(|id| graph.entities.get(id).cloned())
            .collect())
    }

    async fn search_entities_by_similarity(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
        entity_type: Option<&str>,
    ) -> Result<Vec<ScoredEntity>> {
        self.dimension.check_query(embedding.len())?;
        let graph = self.read();
        let candidates = graph
            .entities
            .values()
            .filter(|e| entity_type.map_or(true, |t| e.entity_type == t))
            .map(|e| (e, e.embedding.as_slice()));
        Ok(rank_by_similarity(embedding, candidates, top_k, threshold)
            .into_iter()
            .map(|(entity, score)| ScoredEntity {
                entity: entity.clone(),
                score,
            })
            .collect())
    }

    async fn search_communities_by_similarity(
        &self,
        embedding: &[f32],
        top_k: usize,
        level: Option<u32>,
    ) -> Result<Vec<ScoredCommunity>> {
        self.dimension.check_query(embedding.len())?;
        let graph = self.read();
        let candidates = graph
            .communities
            .values()
            .filter(|c| level.map_or(true, |l| c.community.level == l))
            .filter_map(|c| {
                c.summary
                    .as_ref()
                    .filter(|s| !s.embedding.is_empty())
                    .map(|s| (c, s.embedding.as_slice()))
            });
        Ok(rank_by_similarity(embedding, candidates, top_k, f32::MIN)
            .into_iter()
            .map(|(community, score)| ScoredCommunity {
                community: community.clone(),
                score,
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        let graph = self.read();
        let mut entity_types = BTreeMap::new();
        for entity in graph.entities.values() {
            *entity_types.entry(entity.entity_type.clone()).or_insert(0) += 1;
        }
        let mut community_levels: Vec<u32> = graph.communities.values().map(|c| c.community.level).collect();
        community_levels.sort_unstable();
        community_levels.dedup();

        Ok(GraphStats {
            entity_count: graph.entities.len(),
            relationship_count: graph.relationships.values().filter(|r| graph.is_valid(r)).count(),
            community_count: graph.communities.len(),
            community_levels,
            embedding_dimension: self.dimension.get(),
            entity_types,
        })
    }

    async fn clear(&self) -> Result<()> {
        *self.write() = MemoryGraph::default();
        self.dimension.reset();
        Ok(())
    }
}
