//! Entity extraction: source records in, embedded graph entities and
//! relationships out.

mod extractor;
mod merge;
mod parse;
mod structured;

pub use extractor::EntityExtractor;
pub use merge::{EntityMerger, MergeOutcome};

use serde::{Deserialize, Serialize};

use crate::graph::{stable_id, GraphEntity, GraphRelationship};

/// `[extraction]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Candidates below this confidence are dropped.
    pub min_confidence: f32,
    pub max_entities_per_item: usize,
    /// Same-type entities at or above this cosine similarity are merged.
    pub merge_similarity_threshold: f32,
    /// Document text beyond this many characters is not sent to the generator.
    pub max_content_chars: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            max_entities_per_item: 25,
            merge_similarity_threshold: 0.92,
            max_content_chars: 6000,
        }
    }
}

/// Candidate entity before embedding and merging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: Option<String>,
    pub confidence: f32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ExtractedEntity {
    pub fn new(name: impl Into<String>, entity_type: &str, confidence: f32) -> Self {
        Self {
            name: name.into().trim().to_string(),
            entity_type: normalize_type(entity_type),
            description: None,
            confidence,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        if !description.trim().is_empty() {
            self.description = Some(description.trim().to_string());
        }
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Stable id from type and normalized name; re-extracting the same
    /// entity yields the same id.
    pub fn entity_id(&self) -> String {
        stable_id("ent", &[&self.entity_type, &normalize_name(&self.name)])
    }

    /// Text that gets embedded.
    pub fn embedding_text(&self) -> String {
        match &self.description {
            Some(description) => format!("{}: {}", self.name, description),
            None => self.name.clone(),
        }
    }
}

/// Candidate relationship. Endpoints are entity names as extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelationship {
    pub source: String,
    pub target: String,
    /// Endpoint entity types, when known; they disambiguate same-name entities.
    pub source_type: Option<String>,
    pub target_type: Option<String>,
    pub relationship_type: String,
    pub description: Option<String>,
    pub weight: f64,
    pub confidence: f32,
}

impl ExtractedRelationship {
    pub fn new(source: impl Into<String>, target: impl Into<String>, relationship_type: &str, confidence: f32) -> Self {
        Self {
            source: source.into().trim().to_string(),
            target: target.into().trim().to_string(),
            source_type: None,
            target_type: None,
            relationship_type: normalize_type(relationship_type),
            description: None,
            weight: 1.0,
            confidence,
        }
    }

    pub fn with_endpoint_types(mut self, source_type: Option<&str>, target_type: Option<&str>) -> Self {
        let normalize = |t: Option<&str>| t.map(normalize_type).filter(|t| !t.is_empty());
        self.source_type = normalize(source_type);
        self.target_type = normalize(target_type);
        self
    }
}

/// Embedded, persistable output for one source record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<GraphRelationship>,
}

impl ExtractionResult {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Lowercase with single spaces.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Upper snake case: `works at` and `Works-At` become `WORKS_AT`.
pub fn normalize_type(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_uppercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
    }
    let trimmed = out.trim_end_matches('_');
    if trimmed.is_empty() {
        "UNKNOWN".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type() {
        assert_eq!(normalize_type("works at"), "WORKS_AT");
        assert_eq!(normalize_type("Works-At "), "WORKS_AT");
        assert_eq!(normalize_type("person"), "PERSON");
        assert_eq!(normalize_type("  --  "), "UNKNOWN");
    }

    #[test]
    fn test_entity_id_is_stable_across_spelling() {
        let a = ExtractedEntity::new("Alice  Smith", "person", 0.9);
        let b = ExtractedEntity::new(" alice smith", "PERSON", 0.4);
        let c = ExtractedEntity::new("Alice Smith", "ORGANIZATION", 0.9);
        assert_eq!(a.entity_id(), b.entity_id());
        assert_ne!(a.entity_id(), c.entity_id());
        assert!(a.entity_id().starts_with("ent_"));
    }

    #[test]
    fn test_embedding_text() {
        let e = ExtractedEntity::new("Acme", "ORGANIZATION", 1.0).with_description("Rocket maker");
        assert_eq!(e.embedding_text(), "Acme: Rocket maker");
        assert_eq!(ExtractedEntity::new("Bob", "PERSON", 1.0).with_description("  ").embedding_text(), "Bob");
    }
}
