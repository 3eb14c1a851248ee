use std::collections::HashMap;
use std::sync::Arc;

use super::parse::{extraction_prompt, parse_extraction};
use super::structured::{extract_structured, Candidates};
use super::{normalize_name, ExtractedEntity, ExtractionResult, ExtractorConfig};
use crate::community::truncate_chars;
use crate::connectors::SourceRecord;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::{stable_id, GraphEntity, GraphRelationship};
use crate::llm::TextGenerator;

/// Entity ids of one extraction, by name and type.
#[derive(Default)]
struct EndpointIndex {
    by_key: HashMap<(String, String), String>,
    by_name: HashMap<String, Vec<String>>,
}

impl EndpointIndex {
    fn insert(&mut self, name: &str, entity_type: &str, id: &str) {
        let name = normalize_name(name);
        self.by_key
            .entry((name.clone(), entity_type.to_string()))
            .or_insert_with(|| id.to_string());
        let ids = self.by_name.entry(name).or_default();
        if !ids.iter().any(|known| known == id) {
            ids.push(id.to_string());
        }
    }

    /// A typed endpoint matches name and type; otherwise the name alone must
    /// identify a single entity.
    fn resolve(&self, name: &str, entity_type: Option<&str>) -> Option<&String> {
        let name = normalize_name(name);
        if let Some(id) = entity_type.and_then(|t| self.by_key.get(&(name.clone(), t.to_string()))) {
            return Some(id);
        }
        match self.by_name.get(&name).map(Vec::as_slice) {
            Some([only]) => Some(only),
            Some(ids) if ids.len() > 1 => {
                log::debug!("Relationship endpoint '{}' is ambiguous across {} entities", name, ids.len());
                None
            }
            _ => None,
        }
    }
}

/// Turns one source record into embedded entities and relationships.
///
/// Structured records are mapped field by field; documents go through the
/// text generator. Collaborator failures propagate; a malformed generator
/// response only yields an empty extraction.
pub struct EntityExtractor {
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
    config: ExtractorConfig,
}

impl EntityExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, embedder: Arc<dyn Embedder>, config: ExtractorConfig) -> Self {
        Self {
            generator,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    pub async fn extract(&self, record: &SourceRecord) -> Result<ExtractionResult> {
        let candidates = if record.source.is_structured() {
            extract_structured(record)
        } else {
            self.extract_with_generator(record).await?
        };
        let candidates = self.filter(candidates);
        if candidates.entities.is_empty() {
            return Ok(ExtractionResult::default());
        }

        let texts: Vec<String> = candidates.entities.iter().map(ExtractedEntity::embedding_text).collect();
        let embeddings = self.embedder.embed_batch(&texts).await?;

        let mut endpoints = EndpointIndex::default();
        let mut entities = Vec::with_capacity(candidates.entities.len());
        for (candidate, embedding) in candidates.entities.into_iter().zip(embeddings) {
            let id = candidate.entity_id();
            endpoints.insert(&candidate.name, &candidate.entity_type, &id);

            let mut metadata = candidate.metadata;
            metadata.insert("confidence".to_string(), serde_json::json!(candidate.confidence));
            metadata
                .entry("source")
                .or_insert_with(|| serde_json::json!(record.source.as_str()));
            metadata
                .entry("source_id")
                .or_insert_with(|| serde_json::json!(record.id));

            let mut entity = GraphEntity::new(id, candidate.name, candidate.entity_type, embedding)
                .with_metadata(serde_json::Value::Object(metadata));
            entity.description = candidate.description;
            entities.push(entity);
        }

        let relationships = candidates
            .relationships
            .into_iter()
            .filter_map(|rel| {
                let source = endpoints.resolve(&rel.source, rel.source_type.as_deref())?;
                let target = endpoints.resolve(&rel.target, rel.target_type.as_deref())?;
                if source == target {
                    return None;
                }
                let mut metadata = serde_json::json!({
                    "source_record": record.id,
                    "confidence": rel.confidence,
                });
                if let Some(description) = rel.description {
                    metadata["description"] = serde_json::json!(description);
                }
                Some(
                    GraphRelationship::new(
                        stable_id("rel", &[source.as_str(), rel.relationship_type.as_str(), target.as_str()]),
                        source.clone(),
                        target.clone(),
                        rel.relationship_type,
                    )
                    .with_weight(rel.weight)
                    .with_metadata(metadata),
                )
            })
            .collect();

        Ok(ExtractionResult {
            entities,
            relationships,
        })
    }

    async fn extract_with_generator(&self, record: &SourceRecord) -> Result<Candidates> {
        let content = record.content.trim();
        if content.is_empty() {
            return Ok(Candidates {
                entities: Vec::new(),
                relationships: Vec::new(),
            });
        }
        let content = truncate_chars(content, self.config.max_content_chars);
        let response = self.generator.generate(&extraction_prompt(record, &content)).await?;

        match parse_extraction(&response) {
            Ok(candidates) => Ok(candidates),
            Err(e) => {
                log::warn!("Unparsable extraction for record {}: {}", record.id, e);
                Ok(Candidates {
                    entities: Vec::new(),
                    relationships: Vec::new(),
                })
            }
        }
    }

    /// Drop low-confidence candidates, fold duplicates within the item and
    /// keep the most confident `max_entities_per_item` entities.
    fn filter(&self, candidates: Candidates) -> Candidates {
        let min = self.config.min_confidence;

        let mut by_id: Vec<ExtractedEntity> = Vec::new();
        for entity in candidates.entities.into_iter().filter(|e| e.confidence >= min) {
            match by_id.iter_mut().find(|e| e.entity_id() == entity.entity_id()) {
                Some(existing) => {
                    if existing.description.is_none() {
                        existing.description = entity.description;
                    }
                    existing.confidence = existing.confidence.max(entity.confidence);
                    for (key, value) in entity.metadata {
                        existing.metadata.entry(key).or_insert(value);
                    }
                }
                None => by_id.push(entity),
            }
        }

        // stable sort keeps extraction order among equal confidences
        by_id.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        by_id.truncate(self.config.max_entities_per_item);

        let relationships = candidates
            .relationships
            .into_iter()
            .filter(|r| r.confidence >= min)
            .collect();

        Candidates {
            entities: by_id,
            relationships,
        }
    }
}
