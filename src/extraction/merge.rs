use chrono::Utc;
use std::collections::{BTreeMap, HashMap};

use super::ExtractionResult;
use crate::graph::vector::cosine_similarity;
use crate::graph::{GraphEntity, GraphRelationship};

/// Entities and relationships to persist after merging one extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// New entities and cached entities that absorbed new information.
    pub entities: Vec<GraphEntity>,
    pub relationships: Vec<GraphRelationship>,
    /// Candidates folded into an existing entity.
    pub merged_count: usize,
}

/// Deduplication cache for one indexing run.
///
/// An incoming entity merges into a cached one with the same id (same type
/// and normalized name) or, failing that, into the most similar cached
/// entity of the same type at or above the similarity threshold.
/// Relationships are rewired to the surviving ids; a relationship seen
/// again in the same run accumulates weight.
pub struct EntityMerger {
    threshold: f32,
    entities: BTreeMap<String, GraphEntity>,
    relationships: HashMap<String, GraphRelationship>,
}

impl EntityMerger {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            entities: BTreeMap::new(),
            relationships: HashMap::new(),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Make an already-stored entity known to the cache.
    pub fn seed(&mut self, entity: GraphEntity) {
        self.entities.entry(entity.id.clone()).or_insert(entity);
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn merge(&mut self, extraction: ExtractionResult) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        let mut alias: HashMap<String, String> = HashMap::new();
        let mut touched: Vec<String> = Vec::new();

        for entity in extraction.entities {
            let incoming_id = entity.id.clone();
            let target = if self.entities.contains_key(&incoming_id) {
                Some(incoming_id.clone())
            } else {
                self.most_similar(&entity)
            };

            let survivor = match target {
                Some(existing_id) => {
                    if let Some(existing) = self.entities.get_mut(&existing_id) {
                        absorb(existing, &entity);
                    }
                    outcome.merged_count += 1;
                    existing_id
                }
                None => {
                    self.entities.insert(incoming_id.clone(), entity);
                    incoming_id.clone()
                }
            };
            alias.insert(incoming_id, survivor.clone());
            if !touched.contains(&survivor) {
                touched.push(survivor);
            }
        }

        for mut rel in extraction.relationships {
            let (Some(source), Some(target)) = (
                resolve(&alias, &self.entities, &rel.source_id),
                resolve(&alias, &self.entities, &rel.target_id),
            ) else {
                log::debug!("Dropping relationship {} with unresolved endpoint", rel.id);
                continue;
            };
            if source == target {
                continue;
            }
            rel.source_id = source;
            rel.target_id = target;

            let rel = match self.relationships.get_mut(&rel.id) {
                Some(existing) => {
                    existing.weight += rel.weight;
                    existing.clone()
                }
                None => {
                    self.relationships.insert(rel.id.clone(), rel.clone());
                    rel
                }
            };
            outcome.relationships.retain(|r| r.id != rel.id);
            outcome.relationships.push(rel);
        }

        outcome.entities = touched
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect();
        outcome
    }

    fn most_similar(&self, entity: &GraphEntity) -> Option<String> {
        self.entities
            .values()
            .filter(|e| e.entity_type == entity.entity_type)
            .map(|e| (e, cosine_similarity(&e.embedding, &entity.embedding)))
            .filter(|(_, score)| *score >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(e, _)| e.id.clone())
    }
}

fn resolve(alias: &HashMap<String, String>, entities: &BTreeMap<String, GraphEntity>, id: &str) -> Option<String> {
    match alias.get(id) {
        Some(survivor) => Some(survivor.clone()),
        None => entities.contains_key(id).then(|| id.to_string()),
    }
}

/// Fold `incoming` into `existing`: the longer description wins, metadata
/// keys are unioned with existing values kept.
fn absorb(existing: &mut GraphEntity, incoming: &GraphEntity) {
    let longer = match (&existing.description, &incoming.description) {
        (None, Some(_)) => true,
        (Some(a), Some(b)) => b.len() > a.len(),
        _ => false,
    };
    if longer {
        existing.description = incoming.description.clone();
    }

    if let Some(incoming_meta) = incoming.metadata() {
        let mut merged = existing.metadata().unwrap_or_default();
        for (key, value) in incoming_meta {
            merged.entry(key).or_insert(value);
        }
        existing.metadata_json = Some(serde_json::Value::Object(merged).to_string());
    }
    existing.last_modified = Utc::now();
}
