use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::CommunityDetectionResult;
use crate::embeddings::Embedder;
use crate::error::Result;
use crate::graph::{CommunitySummary, DetectedCommunity, GraphEntity, GraphRelationship};
use crate::llm::TextGenerator;

const MAX_PROMPT_ENTITIES: usize = 30;
const MAX_PROMPT_RELATIONSHIPS: usize = 40;
const MAX_PROMPT_CHILDREN: usize = 20;
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Generates a natural-language summary and its embedding for each community.
///
/// Leaf communities are described from their member entities and the
/// relationships inside them; coarser communities from their children's
/// summaries.
pub struct CommunitySummarizer {
    generator: Arc<dyn TextGenerator>,
    embedder: Arc<dyn Embedder>,
}

impl CommunitySummarizer {
    pub fn new(generator: Arc<dyn TextGenerator>, embedder: Arc<dyn Embedder>) -> Self {
        Self { generator, embedder }
    }

    /// `entities` and `relationships` may cover the whole graph; only
    /// members and edges between members are used.
    pub async fn summarize_leaf(
        &self,
        community: &DetectedCommunity,
        entities: &[GraphEntity],
        relationships: &[GraphRelationship],
    ) -> Result<CommunitySummary> {
        let member_ids: BTreeSet<&str> = community.entity_ids.iter().map(String::as_str).collect();
        let members: Vec<&GraphEntity> = entities.iter().filter(|e| member_ids.contains(e.id.as_str())).collect();
        let internal: Vec<&GraphRelationship> = relationships
            .iter()
            .filter(|r| member_ids.contains(r.source_id.as_str()) && member_ids.contains(r.target_id.as_str()))
            .collect();

        let prompt = leaf_prompt(&members, &internal);
        let fallback = || {
            let names: Vec<&str> = members.iter().take(10).map(|e| e.name.as_str()).collect();
            format!("Group of {} related entities: {}.", community.entity_ids.len(), names.join(", "))
        };
        let summary = self.complete(&prompt, fallback).await?;
        let embedding = self.embedder.embed(&summary).await?;

        Ok(CommunitySummary {
            community_id: community.id.clone(),
            summary,
            embedding,
            entity_count: community.entity_ids.len(),
            relationship_count: internal.len(),
        })
    }

    /// Summarize a coarser community from its children. Counts are the sums
    /// of the children's counts.
    pub async fn summarize_parent(
        &self,
        community: &DetectedCommunity,
        children: &[&CommunitySummary],
    ) -> Result<CommunitySummary> {
        let prompt = parent_prompt(children);
        let fallback = || format!("Group of {} related topics.", children.len());
        let summary = self.complete(&prompt, fallback).await?;
        let embedding = self.embedder.embed(&summary).await?;

        Ok(CommunitySummary {
            community_id: community.id.clone(),
            summary,
            embedding,
            entity_count: children.iter().map(|c| c.entity_count).sum(),
            relationship_count: children.iter().map(|c| c.relationship_count).sum(),
        })
    }

    /// Summarize every community, finest level first. When `cancel` fires,
    /// the summaries produced so far are returned.
    pub async fn summarize_hierarchy(
        &self,
        result: &CommunityDetectionResult,
        entities: &[GraphEntity],
        relationships: &[GraphRelationship],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<CommunitySummary>> {
        let mut summaries: Vec<CommunitySummary> = Vec::with_capacity(result.community_count());
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for (level, communities) in result.levels.iter().enumerate() {
            let start = std::time::Instant::now();
            for community in communities {
                if cancel.is_some_and(|c| c.is_cancelled()) {
                    log::info!("Summarization cancelled after {} communities", summaries.len());
                    return Ok(summaries);
                }

                let children: Vec<&CommunitySummary> = community
                    .child_community_ids
                    .iter()
                    .filter_map(|id| by_id.get(id).map(|&i| &summaries[i]))
                    .collect();

                let summary = if level == 0 || children.is_empty() {
                    self.summarize_leaf(community, entities, relationships).await?
                } else {
                    self.summarize_parent(community, &children).await?
                };
                by_id.insert(summary.community_id.clone(), summaries.len());
                summaries.push(summary);
            }
            log::info!(
                "Summarized {} communities at level {} in {:?}",
                communities.len(),
                level,
                start.elapsed()
            );
        }

        Ok(summaries)
    }

    async fn complete(&self, prompt: &str, fallback: impl FnOnce() -> String) -> Result<String> {
        let text = self.generator.generate(prompt).await?;
        let text = text.trim();
        if text.is_empty() {
            log::warn!("Empty community summary from generator, using fallback");
            Ok(fallback())
        } else {
            Ok(text.to_string())
        }
    }
}

fn leaf_prompt(members: &[&GraphEntity], relationships: &[&GraphRelationship]) -> String {
    let names: HashMap<&str, &str> = members.iter().map(|e| (e.id.as_str(), e.name.as_str())).collect();
    let mut prompt = String::from(
        "You are analysing a community of closely related entities from a personal knowledge graph.\n\nEntities:\n",
    );

    for entity in members.iter().take(MAX_PROMPT_ENTITIES) {
        prompt.push_str(&format!("- {} ({})", entity.name, entity.entity_type));
        if let Some(description) = entity.description.as_deref().filter(|d| !d.trim().is_empty()) {
            prompt.push_str(": ");
            prompt.push_str(&truncate_chars(description.trim(), MAX_DESCRIPTION_CHARS));
        }
        prompt.push('\n');
    }
    if members.len() > MAX_PROMPT_ENTITIES {
        prompt.push_str(&format!("- ... and {} more entities\n", members.len() - MAX_PROMPT_ENTITIES));
    }

    if !relationships.is_empty() {
        prompt.push_str("\nRelationships:\n");
        for rel in relationships.iter().take(MAX_PROMPT_RELATIONSHIPS) {
            let source = names.get(rel.source_id.as_str()).copied().unwrap_or(rel.source_id.as_str());
            let target = names.get(rel.target_id.as_str()).copied().unwrap_or(rel.target_id.as_str());
            prompt.push_str(&format!("- {} -[{}]-> {}\n", source, rel.relationship_type, target));
        }
        if relationships.len() > MAX_PROMPT_RELATIONSHIPS {
            prompt.push_str(&format!(
                "- ... and {} more relationships\n",
                relationships.len() - MAX_PROMPT_RELATIONSHIPS
            ));
        }
    }

    prompt.push_str(
        "\nWrite a concise summary (2-4 sentences) of what ties these entities together and why the group matters. \
         Respond with the summary only.",
    );
    prompt
}

fn parent_prompt(children: &[&CommunitySummary]) -> String {
    let mut prompt = String::from(
        "You are analysing a broad theme in a personal knowledge graph made of several smaller groups.\n\nGroup summaries:\n",
    );
    for (i, child) in children.iter().take(MAX_PROMPT_CHILDREN).enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, child.summary.trim()));
    }
    if children.len() > MAX_PROMPT_CHILDREN {
        prompt.push_str(&format!("... and {} more groups\n", children.len() - MAX_PROMPT_CHILDREN));
    }
    prompt.push_str(
        "\nWrite a concise summary (2-4 sentences) of the overarching theme connecting these groups. \
         Respond with the summary only.",
    );
    prompt
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
