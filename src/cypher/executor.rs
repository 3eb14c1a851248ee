use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use super::ast::{
    ComparisonOperator, Condition, CypherQuery, Direction, MatchPattern, NodePattern, Operand, RelationshipPattern,
    ReturnClause,
};
use super::eval::{evaluate_condition, PropertyMap};
use super::parser::parse;
use super::CypherError;
use crate::error::Result;
use crate::graph::{GraphEntity, GraphRelationship, GraphRepository};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CypherResult {
    /// Matched entities, deduplicated, ordered by id.
    pub entities: Vec<GraphEntity>,
    /// Relationships bound by the returned rows, deduplicated, ordered by id.
    pub relationships: Vec<GraphRelationship>,
    /// Rows that survived `WHERE` and `LIMIT`.
    pub row_count: usize,
    pub execution_time_ms: u64,
}

/// Evaluates parsed queries against a repository.
#[derive(Clone)]
pub struct CypherExecutor {
    repository: Arc<dyn GraphRepository>,
}

/// One match: an entity per node position and a relationship per hop.
struct Row<'a> {
    nodes: Vec<&'a GraphEntity>,
    relationships: Vec<&'a GraphRelationship>,
}

impl CypherExecutor {
    pub fn new(repository: Arc<dyn GraphRepository>) -> Self {
        Self { repository }
    }

    /// Parse and run. Malformed text fails with `GraphRagError::Cypher`
    /// before anything touches the repository; blank text returns nothing.
    pub async fn execute(&self, query: &str) -> Result<CypherResult> {
        let parsed = parse(query)?;
        self.execute_query(&parsed).await
    }

    pub async fn execute_query(&self, query: &CypherQuery) -> Result<CypherResult> {
        let start = Instant::now();
        if query.is_empty() {
            return Ok(CypherResult::default());
        }
        if let Some(condition) = query.cross_pattern_condition() {
            let vars: Vec<String> = condition.variables().into_iter().collect();
            return Err(CypherError::syntax(
                0,
                format!("WHERE condition mixes variables of separate MATCH patterns: {}", vars.join(", ")),
            )
            .into());
        }

        // Fetch everything the patterns can touch up front, then match in memory.
        let mut pool: BTreeMap<String, GraphEntity> = BTreeMap::new();
        let mut all_loaded = false;
        for node in query.match_patterns.iter().flat_map(|p| p.nodes.iter()) {
            if node.labels.is_empty() {
                if !all_loaded {
                    for entity in self.repository.get_all_entities().await? {
                        pool.insert(entity.id.clone(), entity);
                    }
                    all_loaded = true;
                }
            } else if !all_loaded {
                for label in &node.labels {
                    for entity in self.repository.get_entities_by_type(label).await? {
                        pool.insert(entity.id.clone(), entity);
                    }
                }
            }
        }

        let needs_relationships = query.match_patterns.iter().any(|p| !p.relationships.is_empty());
        let relationships = if needs_relationships {
            self.repository.get_relationships(None).await?
        } else {
            Vec::new()
        };

        let mut rows_out: Vec<(usize, Row<'_>)> = Vec::new();
        for (index, pattern) in query.match_patterns.iter().enumerate() {
            let condition = query
                .where_clause
                .as_ref()
                .and_then(|c| c.restrict_to(&pattern.variables()));
            for row in match_pattern(pattern, &pool, &relationships) {
                if let Some(cond) = &condition {
                    if !evaluate_condition(cond, &row_properties(pattern, &row)) {
                        continue;
                    }
                }
                rows_out.push((index, row));
            }
        }

        if let Some(limit) = query.limit {
            rows_out.truncate(limit);
        }

        let mut entities: BTreeMap<&str, &GraphEntity> = BTreeMap::new();
        let mut rels: BTreeMap<&str, &GraphRelationship> = BTreeMap::new();
        for (index, row) in &rows_out {
            let pattern = &query.match_patterns[*index];
            for (pos, entity) in row.nodes.iter().enumerate() {
                if returned(&query.return_clause, pattern.nodes[pos].variable.as_deref()) {
                    entities.insert(entity.id.as_str(), *entity);
                }
            }
            for (pos, rel) in row.relationships.iter().enumerate() {
                if returned(&query.return_clause, pattern.relationships[pos].variable.as_deref()) {
                    rels.insert(rel.id.as_str(), *rel);
                }
            }
        }

        let result = CypherResult {
            entities: entities.into_values().cloned().collect(),
            relationships: rels.into_values().cloned().collect(),
            row_count: rows_out.len(),
            execution_time_ms: start.elapsed().as_millis() as u64,
        };
        log::debug!(
            "Cypher query matched {} rows ({} entities, {} relationships) in {}ms",
            result.row_count,
            result.entities.len(),
            result.relationships.len(),
            result.execution_time_ms
        );
        Ok(result)
    }
}

fn returned(clause: &ReturnClause, variable: Option<&str>) -> bool {
    match clause {
        ReturnClause::All => true,
        ReturnClause::Variables(vars) => variable.is_some_and(|v| vars.iter().any(|r| r == v)),
    }
}

fn node_matches(node: &NodePattern, entity: &GraphEntity) -> bool {
    if !node.labels.is_empty() && !node.labels.iter().any(|l| *l == entity.entity_type) {
        return false;
    }
    if node.properties.is_empty() {
        return true;
    }
    let props = PropertyMap::from_entity(entity);
    node.properties.iter().all(|(key, expected)| {
        let condition = Condition::Comparison {
            left: Operand::Property {
                variable: String::new(),
                key: key.clone(),
            },
            operator: ComparisonOperator::Eq,
            right: Operand::Literal(expected.clone()),
        };
        evaluate_condition(&condition, &props)
    })
}

fn relationship_matches(pattern: &RelationshipPattern, rel: &GraphRelationship) -> bool {
    pattern.types.is_empty() || pattern.types.iter().any(|t| *t == rel.relationship_type)
}

/// Rows for one pattern, in node-candidate id order then relationship id order.
fn match_pattern<'a>(
    pattern: &MatchPattern,
    pool: &'a BTreeMap<String, GraphEntity>,
    relationships: &'a [GraphRelationship],
) -> Vec<Row<'a>> {
    let Some(first) = pattern.nodes.first() else {
        return Vec::new();
    };

    let mut rows: Vec<Row<'a>> = pool
        .values()
        .filter(|e| node_matches(first, e))
        .map(|e| Row {
            nodes: vec![e],
            relationships: Vec::new(),
        })
        .collect();

    for (hop, rel_pattern) in pattern.relationships.iter().enumerate() {
        let next_node = &pattern.nodes[hop + 1];
        let mut extended = Vec::new();
        for row in rows {
            let current = row.nodes[hop];
            for rel in relationships {
                if !relationship_matches(rel_pattern, rel) {
                    continue;
                }
                let other_id = match rel_pattern.direction {
                    Direction::Outgoing if rel.source_id == current.id => &rel.target_id,
                    Direction::Incoming if rel.target_id == current.id => &rel.source_id,
                    Direction::Either if rel.source_id == current.id => &rel.target_id,
                    Direction::Either if rel.target_id == current.id => &rel.source_id,
                    _ => continue,
                };
                let Some(other) = pool.get(other_id) else {
                    continue;
                };
                if !node_matches(next_node, other) {
                    continue;
                }
                // a relationship is used at most once per row
                if row.relationships.iter().any(|r| r.id == rel.id) {
                    continue;
                }
                let mut nodes = row.nodes.clone();
                nodes.push(other);
                let mut rels = row.relationships.clone();
                rels.push(rel);
                let candidate = Row {
                    nodes,
                    relationships: rels,
                };
                if consistent_bindings(pattern, &candidate) {
                    extended.push(candidate);
                }
            }
        }
        rows = extended;
    }

    rows
}

/// A variable repeated within a pattern must bind the same element everywhere.
fn consistent_bindings(pattern: &MatchPattern, row: &Row<'_>) -> bool {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for (pos, entity) in row.nodes.iter().enumerate() {
        if let Some(var) = pattern.nodes[pos].variable.as_deref() {
            if let Some(previous) = seen.insert(var, entity.id.as_str()) {
                if previous != entity.id {
                    return false;
                }
            }
        }
    }
    true
}

fn row_properties(pattern: &MatchPattern, row: &Row<'_>) -> BTreeMap<String, PropertyMap> {
    let mut props = BTreeMap::new();
    for (pos, entity) in row.nodes.iter().enumerate() {
        if let Some(var) = &pattern.nodes[pos].variable {
            props.insert(var.clone(), PropertyMap::from_entity(entity));
        }
    }
    for (pos, rel) in row.relationships.iter().enumerate() {
        if let Some(var) = &pattern.relationships[pos].variable {
            props.insert(var.clone(), PropertyMap::from_relationship(rel));
        }
    }
    props
}
