//! Prompt construction and lenient parsing of generator extraction output.

use serde::Deserialize;

use super::structured::Candidates;
use super::{ExtractedEntity, ExtractedRelationship};
use crate::connectors::SourceRecord;
use crate::error::{GraphRagError, Result};

#[derive(Debug, Default, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    entities: Vec<RawEntity>,
    #[serde(default)]
    relationships: Vec<RawRelationship>,
}

#[derive(Debug, Deserialize)]
struct RawEntity {
    name: String,
    #[serde(rename = "type", default)]
    entity_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct RawRelationship {
    source: String,
    target: String,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    target_type: Option<String>,
    #[serde(rename = "type", default)]
    relationship_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    weight: Option<f64>,
    #[serde(default)]
    confidence: Option<f32>,
}

pub(crate) fn extraction_prompt(record: &SourceRecord, content: &str) -> String {
    format!(
        "Extract the people, organizations, locations, events, projects and topics mentioned in the text below, \
         and the relationships between them.\n\n\
         Respond with JSON only, in this shape:\n\
         {{\"entities\": [{{\"name\": \"...\", \"type\": \"PERSON\", \"description\": \"...\", \"confidence\": 0.9}}],\n \
         \"relationships\": [{{\"source\": \"...\", \"source_type\": \"PERSON\", \"target\": \"...\", \"target_type\": \"ORGANIZATION\", \"type\": \"WORKS_AT\", \"description\": \"...\", \"confidence\": 0.8}}]}}\n\n\
         Use entity names and types exactly as they appear in the entities list for relationship endpoints. \
         Confidence is between 0 and 1.\n\n\
         Title: {}\n\
         Text:\n{}\n",
        record.title, content
    )
}

/// Parse the JSON object between the first `{` and the last `}`. Missing
/// confidences count as 1.0.
pub(crate) fn parse_extraction(response: &str) -> Result<Candidates> {
    let (Some(start), Some(end)) = (response.find('{'), response.rfind('}')) else {
        return Err(GraphRagError::InvalidInput("No JSON object in extraction response".to_string()));
    };
    if end < start {
        return Err(GraphRagError::InvalidInput("No JSON object in extraction response".to_string()));
    }
    let raw: RawExtraction = serde_json::from_str(&response[start..=end])?;

    let entities = raw
        .entities
        .into_iter()
        .filter(|e| !e.name.trim().is_empty())
        .map(|e| {
            let mut entity = ExtractedEntity::new(e.name, &e.entity_type, e.confidence.unwrap_or(1.0));
            if let Some(description) = e.description {
                entity = entity.with_description(description);
            }
            entity
        })
        .collect();

    let relationships = raw
        .relationships
        .into_iter()
        .filter(|r| !r.source.trim().is_empty() && !r.target.trim().is_empty())
        .map(|r| {
            let mut rel = ExtractedRelationship::new(
                r.source,
                r.target,
                if r.relationship_type.trim().is_empty() { "RELATED_TO" } else { &r.relationship_type },
                r.confidence.unwrap_or(1.0),
            )
            .with_endpoint_types(r.source_type.as_deref(), r.target_type.as_deref());
            rel.description = r.description.filter(|d| !d.trim().is_empty());
            if let Some(weight) = r.weight.filter(|w| w.is_finite() && *w >= 0.0) {
                rel.weight = weight;
            }
            rel
        })
        .collect();

    Ok(Candidates { entities, relationships })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped_json() {
        let response = r#"Sure! Here it is:
```json
{"entities": [
  {"name": "Alice", "type": "person", "description": "Engineer", "confidence": 0.9},
  {"name": "Acme Corp", "type": "Organization"},
  {"name": "  ", "type": "PERSON"}
 ],
 "relationships": [{"source": "Alice", "target": "Acme Corp", "type": "works at", "confidence": 0.7}]}
```"#;
        let out = parse_extraction(response).unwrap();
        assert_eq!(out.entities.len(), 2);
        assert_eq!(out.entities[0].entity_type, "PERSON");
        assert_eq!(out.entities[1].entity_type, "ORGANIZATION");
        assert!((out.entities[1].confidence - 1.0).abs() < f32::EPSILON);
        assert_eq!(out.relationships[0].relationship_type, "WORKS_AT");
        assert!((out.relationships[0].confidence - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_extraction("I could not find anything").is_err());
        assert!(parse_extraction("} backwards {").is_err());
        assert!(parse_extraction("{\"entities\": [oops]}").is_err());
    }

    #[test]
    fn test_missing_type_defaults() {
        let out = parse_extraction(r#"{"entities": [{"name": "X"}], "relationships": [{"source": "X", "target": "Y"}]}"#)
            .unwrap();
        assert_eq!(out.entities[0].entity_type, "UNKNOWN");
        assert_eq!(out.relationships[0].relationship_type, "RELATED_TO");
    }
}
