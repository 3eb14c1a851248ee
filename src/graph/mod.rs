//! Knowledge graph data model and repository implementations.
//!
//! Entities, relationships and detected communities are owned by a
//! [`GraphRepository`]; every other component works on copies or ids.

mod memory;
mod repository;
mod sqlite;
mod traversal;
pub mod vector;

pub use memory::InMemoryGraphRepository;
pub use repository::GraphRepository;
pub use sqlite::SqliteGraphRepository;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEntity {
    /// Stable key.
    pub id: String,
    pub name: String,
    /// Open tag such as `PERSON`, `ORGANIZATION`, `EVENT`.
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Fixed-length vector; the length is fixed per store once observed.
    pub embedding: Vec<f32>,
    pub description: Option<String>,
    /// Opaque key-value metadata, stored as a JSON object.
    pub metadata_json: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl GraphEntity {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        entity_type: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            entity_type: entity_type.into(),
            embedding,
            description: None,
            metadata_json: None,
            last_modified: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata_json = Some(metadata.to_string());
        self
    }

    /// Parsed metadata object. Non-object or unparsable metadata yields `None`.
    pub fn metadata(&self) -> Option<serde_json::Map<String, serde_json::Value>> {
        let raw = self.metadata_json.as_deref()?;
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(map)) => Some(map),
            _ => None,
        }
    }
}

/// A typed, weighted, directed edge between two entities.
///
/// Endpoints are not checked at write time; relationships whose endpoints
/// do not exist are filtered out on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    /// Non-negative; defaults to 1.0.
    pub weight: f64,
    pub metadata_json: Option<String>,
}

impl GraphRelationship {
    pub fn new(
        id: impl Into<String>,
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type: relationship_type.into(),
            weight: 1.0,
            metadata_json: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata_json = Some(metadata.to_string());
        self
    }
}

/// A cluster of entities at one hierarchy level (0 = most granular).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedCommunity {
    pub id: String,
    pub level: u32,
    /// Sorted, de-duplicated member entity ids.
    pub entity_ids: Vec<String>,
    /// Contribution of this community to the modularity of the original graph.
    pub modularity: f64,
    pub parent_community_id: Option<String>,
    pub child_community_ids: Vec<String>,
}

/// Generated natural-language description of a community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunitySummary {
    pub community_id: String,
    pub summary: String,
    pub embedding: Vec<f32>,
    pub entity_count: usize,
    pub relationship_count: usize,
}

/// A persisted community together with its summary, if one was generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCommunity {
    pub community: DetectedCommunity,
    pub summary: Option<CommunitySummary>,
}

impl StoredCommunity {
    pub fn summary_text(&self) -> Option<&str> {
        self.summary.as_ref().map(|s| s.summary.as_str())
    }

    /// Entity count from the summary when present, else the member list.
    pub fn entity_count(&self) -> usize {
        self.summary
            .as_ref()
            .map(|s| s.entity_count)
            .unwrap_or(self.community.entity_ids.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntity {
    pub entity: GraphEntity,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCommunity {
    pub community: StoredCommunity,
    /// Cosine similarity to the query vector.
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    /// Relationships whose endpoints both exist.
    pub relationship_count: usize,
    pub community_count: usize,
    /// Distinct community levels present, ascending.
    pub community_levels: Vec<u32>,
    pub embedding_dimension: Option<usize>,
    pub entity_types: BTreeMap<String, usize>,
}

impl GraphStats {
    pub fn max_community_level(&self) -> Option<u32> {
        self.community_levels.last().copied()
    }
}

/// Deterministic id: `prefix_` followed by the first 16 hex chars of
/// SHA-256 over the `\u{1f}`-joined parts.
pub fn stable_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}_{}", prefix, &digest[..16])
}
