use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::traversal::breadth_first_neighbors;
use super::vector::{decode_embedding, encode_embedding, rank_by_similarity, DimensionGuard};
use super::{
    CommunitySummary, DetectedCommunity, GraphEntity, GraphRelationship, GraphRepository, GraphStats,
    ScoredCommunity, ScoredEntity, StoredCommunity,
};
use crate::db::{migrate, Db};
use crate::error::{GraphRagError, Result};

const DIMENSION_KEY: &str = "embedding_dimension";

const ENTITY_COLUMNS: &str = "id, name, entity_type, embedding, description, metadata_json, last_modified";

const VALID_RELATIONSHIPS: &str = "SELECT r.id, r.source_id, r.target_id, r.relationship_type, r.weight, r.metadata_json
     FROM relationships r
     JOIN entities s ON s.id = r.source_id
     JOIN entities t ON t.id = r.target_id";

const COMMUNITY_COLUMNS: &str = "id, level, entity_ids_json, modularity, parent_id, child_ids_json, \
     summary, summary_embedding, entity_count, relationship_count";

/// Graph repository backed by a SQLite file.
///
/// Must be [`initialize`](Self::initialize)d before use; every call before
/// that fails with `NotInitialized`.
#[derive(Debug)]
pub struct SqliteGraphRepository {
    db: Db,
    initialized: AtomicBool,
    dimension: DimensionGuard,
}

impl SqliteGraphRepository {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            initialized: AtomicBool::new(false),
            dimension: DimensionGuard::default(),
        }
    }

    /// Apply migrations and load the persisted embedding dimension.
    pub async fn initialize(&self) -> Result<()> {
        let dimension = self
            .db
            .with_connection(|conn| {
                migrate::run_migrations(conn)?;
                let value: Option<String> = conn
                    .query_row("SELECT value FROM graph_meta WHERE key = ?1", params![DIMENSION_KEY], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok(value.and_then(|v| v.parse::<usize>().ok()))
            })
            .await?;

        self.dimension.reset();
        if let Some(dim) = dimension {
            self.dimension.check_or_establish(dim)?;
        }
        self.initialized.store(true, Ordering::SeqCst);
        log::info!(
            "Graph store ready at {} (embedding dimension: {:?})",
            self.db.path().display(),
            dimension
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(GraphRagError::NotInitialized(
                "graph store used before initialize()".to_string(),
            ))
        }
    }
}

fn bad_column(idx: usize, name: &str, ty: rusqlite::types::Type) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, name.to_string(), ty)
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<GraphEntity> {
    let blob: Vec<u8> = row.get(3)?;
    let embedding = decode_embedding(&blob).ok_or_else(|| bad_column(3, "embedding", rusqlite::types::Type::Blob))?;
    let modified: String = row.get(6)?;
    let last_modified = DateTime::parse_from_rfc3339(&modified)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| bad_column(6, "last_modified", rusqlite::types::Type::Text))?;

    Ok(GraphEntity {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type: row.get(2)?,
        embedding,
        description: row.get(4)?,
        metadata_json: row.get(5)?,
        last_modified,
    })
}

fn relationship_from_row(row: &Row<'_>) -> rusqlite::Result<GraphRelationship> {
    Ok(GraphRelationship {
        id: row.get(0)?,
        source_id: row.get(1)?,
        target_id: row.get(2)?,
        relationship_type: row.get(3)?,
        weight: row.get(4)?,
        metadata_json: row.get(5)?,
    })
}

fn community_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCommunity> {
    let id: String = row.get(0)?;
    let entity_ids_json: String = row.get(2)?;
    let entity_ids: Vec<String> = serde_json::from_str(&entity_ids_json)
        .map_err(|_| bad_column(2, "entity_ids_json", rusqlite::types::Type::Text))?;
    let child_ids_json: String = row.get(5)?;
    let child_community_ids: Vec<String> = serde_json::from_str(&child_ids_json)
        .map_err(|_| bad_column(5, "child_ids_json", rusqlite::types::Type::Text))?;

    let summary_text: Option<String> = row.get(6)?;
    let summary = match summary_text {
        Some(text) => {
            let blob: Option<Vec<u8>> = row.get(7)?;
            let embedding = match blob {
                Some(b) => decode_embedding(&b)
                    .ok_or_else(|| bad_column(7, "summary_embedding", rusqlite::types::Type::Blob))?,
                None => Vec::new(),
            };
            let entity_count: Option<i64> = row.get(8)?;
            let relationship_count: Option<i64> = row.get(9)?;
            Some(CommunitySummary {
                community_id: id.clone(),
                summary: text,
                embedding,
                entity_count: entity_count.unwrap_or(entity_ids.len() as i64).max(0) as usize,
                relationship_count: relationship_count.unwrap_or(0).max(0) as usize,
            })
        }
        None => None,
    };

    let level: i64 = row.get(1)?;
    Ok(StoredCommunity {
        community: DetectedCommunity {
            id,
            level: level.max(0) as u32,
            entity_ids,
            modularity: row.get(3)?,
            parent_community_id: row.get(4)?,
            child_community_ids,
        },
        summary,
    })
}

/// Check `len` against the persisted dimension, recording it on first use.
/// Runs inside the caller's write transaction so a failed write leaves no
/// dimension behind.
fn ensure_dimension(conn: &Connection, len: usize) -> Result<()> {
    if len == 0 {
        return Err(GraphRagError::InvalidInput("embedding must not be empty".to_string()));
    }
    let stored: Option<String> = conn
        .query_row("SELECT value FROM graph_meta WHERE key = ?1", params![DIMENSION_KEY], |row| {
            row.get(0)
        })
        .optional()?;
    match stored.and_then(|v| v.parse::<usize>().ok()) {
        Some(expected) if expected != len => Err(GraphRagError::DimensionMismatch { expected, actual: len }),
        Some(_) => Ok(()),
        None => {
            conn.execute(
                "INSERT OR REPLACE INTO graph_meta (key, value) VALUES (?1, ?2)",
                params![DIMENSION_KEY, len.to_string()],
            )?;
            Ok(())
        }
    }
}

fn upsert_entity(conn: &Connection, entity: &GraphEntity) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO entities (id, name, entity_type, embedding, description, metadata_json, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entity.id,
            entity.name,
            entity.entity_type,
            encode_embedding(&entity.embedding),
            entity.description,
            entity.metadata_json,
            entity.last_modified.to_rfc3339(),
        ],
    )
}

fn validate_weight(relationship: &GraphRelationship) -> Result<()> {
    if !relationship.weight.is_finite() || relationship.weight < 0.0 {
        return Err(GraphRagError::InvalidInput(format!(
            "relationship {} has invalid weight {}",
            relationship.id, relationship.weight
        )));
    }
    Ok(())
}

#[async_trait]
impl GraphRepository for SqliteGraphRepository {
    async fn add_entity(&self, entity: &GraphEntity) -> Result<()> {
        self.ensure_initialized()?;
        let len = entity.embedding.len();
        self.dimension.check_query(len)?;
        let entity = entity.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_dimension(&tx, len)?;
                upsert_entity(&tx, &entity)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.dimension.check_or_establish(len)?;
        Ok(())
    }

    async fn update_entity(&self, entity: &GraphEntity) -> Result<()> {
        self.ensure_initialized()?;
        let len = entity.embedding.len();
        self.dimension.check_query(len)?;
        let entity = entity.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_dimension(&tx, len)?;
                let updated = tx.execute(
                    "UPDATE entities SET name = ?2, entity_type = ?3, embedding = ?4, description = ?5,
                            metadata_json = ?6, last_modified = ?7
                     WHERE id = ?1",
                    params![
                        entity.id,
                        entity.name,
                        entity.entity_type,
                        encode_embedding(&entity.embedding),
                        entity.description,
                        entity.metadata_json,
                        entity.last_modified.to_rfc3339(),
                    ],
                )?;
                if updated == 0 {
                    return Err(GraphRagError::EntityNotFound(entity.id.clone()));
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.dimension.check_or_establish(len)?;
        Ok(())
    }

    async fn delete_entity(&self, id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let id = id.to_string();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM entities WHERE id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1",
                    params![id],
                )?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
    }

    async fn get_entity(&self, id: &str) -> Result<Option<GraphEntity>> {
        self.ensure_initialized()?;
        let id = id.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
                Ok(conn.query_row(&sql, params![id], entity_from_row).optional()?)
            })
            .await
    }

    async fn get_entities_by_type(&self, entity_type: &str) -> Result<Vec<GraphEntity>> {
        self.ensure_initialized()?;
        let entity_type = entity_type.to_string();
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM entities WHERE entity_type = ?1 ORDER BY id", ENTITY_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![entity_type], entity_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn get_all_entities(&self) -> Result<Vec<GraphEntity>> {
        self.ensure_initialized()?;
        self.db
            .with_connection(|conn| {
                let sql = format!("SELECT {} FROM entities ORDER BY id", ENTITY_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], entity_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn add_relationship(&self, relationship: &GraphRelationship) -> Result<()> {
        self.ensure_initialized()?;
        validate_weight(relationship)?;
        let rel = relationship.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO relationships (id, source_id, target_id, relationship_type, weight, metadata_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![rel.id, rel.source_id, rel.target_id, rel.relationship_type, rel.weight, rel.metadata_json],
                )?;
                Ok(())
            })
            .await
    }

    async fn delete_relationship(&self, id: &str) -> Result<bool> {
        self.ensure_initialized()?;
        let id = id.to_string();
        self.db
            .with_connection(move |conn| Ok(conn.execute("DELETE FROM relationships WHERE id = ?1", params![id])? > 0))
            .await
    }

    async fn get_relationships(&self, entity_id: Option<&str>) -> Result<Vec<GraphRelationship>> {
        self.ensure_initialized()?;
        let entity_id = entity_id.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                let rows = match entity_id {
                    Some(id) => {
                        let sql = format!(
                            "{} WHERE r.source_id = ?1 OR r.target_id = ?1 ORDER BY r.id",
                            VALID_RELATIONSHIPS
                        );
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt
                            .query_map(params![id], relationship_from_row)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                    None => {
                        let sql = format!("{} ORDER BY r.id", VALID_RELATIONSHIPS);
                        let mut stmt = conn.prepare(&sql)?;
                        let rows = stmt
                            .query_map([], relationship_from_row)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        rows
                    }
                };
                Ok(rows)
            })
            .await
    }

    async fn add_community(&self, community: &DetectedCommunity) -> Result<()> {
        self.ensure_initialized()?;
        let community = community.clone();
        self.db
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO communities (id, level, entity_ids_json, modularity, parent_id, child_ids_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        community.id,
                        community.level,
                        serde_json::to_string(&community.entity_ids)?,
                        community.modularity,
                        community.parent_community_id,
                        serde_json::to_string(&community.child_community_ids)?,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn update_community_summary(&self, summary: &CommunitySummary) -> Result<()> {
        self.ensure_initialized()?;
        let len = summary.embedding.len();
        self.dimension.check_query(len)?;
        let summary = summary.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_dimension(&tx, len)?;
                let updated = tx.execute(
                    "UPDATE communities SET summary = ?2, summary_embedding = ?3, entity_count = ?4, relationship_count = ?5
                     WHERE id = ?1",
                    params![
                        summary.community_id,
                        summary.summary,
                        encode_embedding(&summary.embedding),
                        summary.entity_count as i64,
                        summary.relationship_count as i64,
                    ],
                )?;
                if updated == 0 {
                    return Err(GraphRagError::CommunityNotFound(summary.community_id.clone()));
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.dimension.check_or_establish(len)?;
        Ok(())
    }

    async fn get_communities_by_level(&self, level: u32) -> Result<Vec<StoredCommunity>> {
        self.ensure_initialized()?;
        self.db
            .with_connection(move |conn| {
                let sql = format!("SELECT {} FROM communities WHERE level = ?1 ORDER BY id", COMMUNITY_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![level], community_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn clear_communities(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.db
            .with_connection(|conn| {
                conn.execute("DELETE FROM communities", [])?;
                Ok(())
            })
            .await
    }

    async fn get_entity_neighbors(
        &self,
        entity_id: &str,
        depth: usize,
        relationship_type: Option<&str>,
    ) -> Result<Vec<GraphEntity>> {
        self.ensure_initialized()?;
        let start = entity_id.to_string();
        let rel_type = relationship_type.map(str::to_string);
        self.db
            .with_connection(move |conn| {
                let mut edge_stmt = conn.prepare(
                    "SELECT source_id, target_id FROM relationships
                     WHERE (source_id = ?1 OR target_id = ?1)
                       AND (?2 IS NULL OR relationship_type = ?2)
                     ORDER BY id",
                )?;
                let mut exists_stmt = conn.prepare("SELECT 1 FROM entities WHERE id = ?1")?;

                let ids = breadth_first_neighbors(&start, depth, |node| {
                    let edges = edge_stmt
                        .query_map(params![node, rel_type], |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    let mut adjacent = Vec::with_capacity(edges.len());
                    for (source, target) in edges {
                        let other = if source == node { target } else { source };
                        if exists_stmt.exists(params![other])? {
                            adjacent.push(other);
                        }
                    }
                    Ok(adjacent)
                })?;

                let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
                let mut entity_stmt = conn.prepare(&sql)?;
                let mut neighbors = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(entity) = entity_stmt.query_row(params![id], entity_from_row).optional()? {
                        neighbors.push(entity);
                    }
                }
                Ok(neighbors)
            })
            .await
    }

    async fn search_entities_by_similarity(
        &self,
        embedding: &[f32],
        top_k: usize,
        threshold: f32,
        entity_type: Option<&str>,
    ) -> Result<Vec<ScoredEntity>> {
        self.ensure_initialized()?;
        self.dimension.check_query(embedding.len())?;
        let candidates = match entity_type {
            Some(t) => self.get_entities_by_type(t).await?,
            None => self.get_all_entities().await?,
        };
        let ranked = rank_by_similarity(
            embedding,
            candidates.iter().map(|e| (e, e.embedding.as_slice())),
            top_k,
            threshold,
        );
        Ok(ranked
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
        self.ensure_initialized()?;
        self.dimension.check_query(embedding.len())?;
        let candidates = self
            .db
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT {} FROM communities
                     WHERE summary_embedding IS NOT NULL AND (?1 IS NULL OR level = ?1)
                     ORDER BY id",
                    COMMUNITY_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![level], community_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let ranked = rank_by_similarity(
            embedding,
            candidates.iter().filter_map(|c| {
                c.summary
                    .as_ref()
                    .filter(|s| !s.embedding.is_empty())
                    .map(|s| (c, s.embedding.as_slice()))
            }),
            top_k,
            f32::MIN,
        );
        Ok(ranked
            .into_iter()
            .map(|(community, score)| ScoredCommunity {
                community: community.clone(),
                score,
            })
            .collect())
    }

    async fn get_stats(&self) -> Result<GraphStats> {
        self.ensure_initialized()?;
        let dimension = self.dimension.get();
        self.db
            .with_connection(move |conn| {
                let entity_count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
                let relationship_count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM ({})", VALID_RELATIONSHIPS),
                    [],
                    |row| row.get(0),
                )?;
                let community_count: i64 = conn.query_row("SELECT COUNT(*) FROM communities", [], |row| row.get(0))?;

                let mut stmt = conn.prepare("SELECT DISTINCT level FROM communities ORDER BY level")?;
                let community_levels = stmt
                    .query_map([], |row| row.get::<_, u32>(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                let mut stmt = conn.prepare("SELECT entity_type, COUNT(*) FROM entities GROUP BY entity_type")?;
                let entity_types: BTreeMap<String, usize> = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize)))?
                    .collect::<std::result::Result<_, _>>()?;

                Ok(GraphStats {
                    entity_count: entity_count as usize,
                    relationship_count: relationship_count as usize,
                    community_count: community_count as usize,
                    community_levels,
                    embedding_dimension: dimension,
                    entity_types,
                })
            })
            .await
    }

    async fn clear(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.db
            .with_connection(|conn| {
                let tx = conn.transaction()?;
                tx.execute_batch(
                    "DELETE FROM relationships;
                     DELETE FROM communities;
                     DELETE FROM entities;
                     DELETE FROM graph_meta;",
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        self.dimension.reset();
        log::info!("Graph store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn repo(dir: &TempDir) -> SqliteGraphRepository {
        let repo = SqliteGraphRepository::new(Db::new(dir.path().join("graph.db")));
        repo.initialize().await.unwrap();
        repo
    }

    fn entity(id: &str, name: &str, ty: &str, embedding: Vec<f32>) -> GraphEntity {
        GraphEntity::new(id, name, ty, embedding)
    }

    #[tokio::test]
    async fn test_uninitialized_store_rejects_calls() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteGraphRepository::new(Db::new(dir.path().join("graph.db")));
        let err = repo.get_all_entities().await.unwrap_err();
        assert!(matches!(err, GraphRagError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_entity_crud() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;

        let alice = entity("e1", "Alice", "PERSON", vec![1.0, 0.0]).with_description("engineer");
        repo.add_entity(&alice).await.unwrap();

        let loaded = repo.get_entity("e1").await.unwrap().unwrap();
        assert_eq!(loaded.name, "Alice");
        assert_eq!(loaded.embedding, vec![1.0, 0.0]);
        assert_eq!(loaded.description.as_deref(), Some("engineer"));

        let mut renamed = loaded.clone();
        renamed.name = "Alice B".into();
        repo.update_entity(&renamed).await.unwrap();
        assert_eq!(repo.get_entity("e1").await.unwrap().unwrap().name, "Alice B");

        let missing = entity("nope", "X", "PERSON", vec![1.0, 0.0]);
        assert!(matches!(
            repo.update_entity(&missing).await,
            Err(GraphRagError::EntityNotFound(_))
        ));

        assert!(repo.delete_entity("e1").await.unwrap());
        assert!(!repo.delete_entity("e1").await.unwrap());
        assert!(repo.get_entity("e1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dimension_persisted_across_instances() {
        let dir = TempDir::new().unwrap();
        {
            let repo = repo(&dir).await;
            repo.add_entity(&entity("e1", "A", "PERSON", vec![1.0, 2.0, 3.0]))
                .await
                .unwrap();
        }
        let repo = repo(&dir).await;
        let err = repo
            .add_entity(&entity("e2", "B", "PERSON", vec![1.0, 2.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRagError::DimensionMismatch { expected: 3, actual: 2 }));
        assert_eq!(repo.get_stats().await.unwrap().embedding_dimension, Some(3));
    }

    #[tokio::test]
    async fn test_dangling_relationships_filtered() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        repo.add_entity(&entity("a", "A", "PERSON", vec![1.0])).await.unwrap();
        repo.add_entity(&entity("b", "B", "PERSON", vec![1.0])).await.unwrap();
        repo.add_relationship(&GraphRelationship::new("r1", "a", "b", "KNOWS"))
            .await
            .unwrap();
        repo.add_relationship(&GraphRelationship::new("r2", "a", "ghost", "KNOWS"))
            .await
            .unwrap();

        let all = repo.get_relationships(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "r1");
        assert_eq!(repo.get_relationships(Some("a")).await.unwrap().len(), 1);
        assert_eq!(repo.get_stats().await.unwrap().relationship_count, 1);
    }

    #[tokio::test]
    async fn test_negative_weight_rejected() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        let rel = GraphRelationship::new("r1", "a", "b", "KNOWS").with_weight(-1.0);
        assert!(matches!(
            repo.add_relationship(&rel).await,
            Err(GraphRagError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_neighbors_undirected_with_depth() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        for id in ["a", "b", "c", "d"] {
            repo.add_entity(&entity(id, id, "PERSON", vec![1.0])).await.unwrap();
        }
        repo.add_relationship(&GraphRelationship::new("r1", "a", "b", "KNOWS")).await.unwrap();
        repo.add_relationship(&GraphRelationship::new("r2", "c", "b", "KNOWS")).await.unwrap();
        repo.add_relationship(&GraphRelationship::new("r3", "a", "d", "WORKS_WITH")).await.unwrap();

        let one_hop: Vec<String> = repo
            .get_entity_neighbors("a", 1, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(one_hop, vec!["b", "d"]);

        let two_hop = repo.get_entity_neighbors("a", 2, Some("KNOWS")).await.unwrap();
        let ids: Vec<&str> = two_hop.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_similarity_search_threshold_and_type() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        repo.add_entity(&entity("a", "A", "PERSON", vec![1.0, 0.0])).await.unwrap();
        repo.add_entity(&entity("b", "B", "PLACE", vec![0.9, 0.1])).await.unwrap();
        repo.add_entity(&entity("c", "C", "PERSON", vec![0.0, 1.0])).await.unwrap();

        let hits = repo
            .search_entities_by_similarity(&[1.0, 0.0], 10, 0.5, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entity.id, "a");

        let people = repo
            .search_entities_by_similarity(&[1.0, 0.0], 10, 0.0, Some("PERSON"))
            .await
            .unwrap();
        assert!(people.iter().all(|h| h.entity.entity_type == "PERSON"));

        let err = repo
            .search_entities_by_similarity(&[1.0, 0.0, 0.0], 10, 0.0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphRagError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_communities_and_summaries() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        let community = DetectedCommunity {
            id: "c0-0".into(),
            level: 0,
            entity_ids: vec!["a".into(), "b".into()],
            modularity: 0.25,
            parent_community_id: Some("c1-0".into()),
            child_community_ids: vec![],
        };
        repo.add_community(&community).await.unwrap();

        let stored = repo.get_communities_by_level(0).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].community, community);
        assert!(stored[0].summary.is_none());

        let summary = CommunitySummary {
            community_id: "c0-0".into(),
            summary: "Two colleagues".into(),
            embedding: vec![0.0, 1.0],
            entity_count: 2,
            relationship_count: 1,
        };
        repo.update_community_summary(&summary).await.unwrap();

        let hits = repo
            .search_communities_by_similarity(&[0.0, 1.0], 5, Some(0))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].community.summary_text(), Some("Two colleagues"));

        let orphan = CommunitySummary {
            community_id: "missing".into(),
            ..summary
        };
        assert!(matches!(
            repo.update_community_summary(&orphan).await,
            Err(GraphRagError::CommunityNotFound(_))
        ));

        repo.clear_communities().await.unwrap();
        assert!(repo.get_communities_by_level(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_resets_dimension() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir).await;
        repo.add_entity(&entity("a", "A", "PERSON", vec![1.0, 0.0])).await.unwrap();
        repo.clear().await.unwrap();

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.entity_count, 0);
        assert_eq!(stats.embedding_dimension, None);
        repo.add_entity(&entity("a", "A", "PERSON", vec![1.0, 0.0, 0.0])).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_does_not_fix_dimension() {
        let dir = TempDir::new().unwrap();
        {
            let repo = repo(&dir).await;
            let ghost = entity("ghost", "Ghost", "PERSON", vec![1.0, 0.0, 0.0]);
            assert!(matches!(
                repo.update_entity(&ghost).await,
                Err(GraphRagError::EntityNotFound(_))
            ));
            let orphan = CommunitySummary {
                community_id: "missing".into(),
                summary: "nobody".into(),
                embedding: vec![1.0, 0.0, 0.0, 0.0],
                entity_count: 0,
                relationship_count: 0,
            };
            assert!(matches!(
                repo.update_community_summary(&orphan).await,
                Err(GraphRagError::CommunityNotFound(_))
            ));
            assert_eq!(repo.get_stats().await.unwrap().embedding_dimension, None);
        }

        // a fresh instance must not see a dimension either
        let repo = repo(&dir).await;
        assert_eq!(repo.get_stats().await.unwrap().embedding_dimension, None);
        repo.add_entity(&entity("a", "A", "PERSON", vec![1.0, 0.0])).await.unwrap();
        assert_eq!(repo.get_stats().await.unwrap().embedding_dimension, Some(2));
        assert!(matches!(
            repo.add_entity(&entity("b", "B", "PERSON", vec![1.0, 0.0, 0.0])).await,
            Err(GraphRagError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }
}
