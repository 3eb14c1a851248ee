use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::ast::{ComparisonOperator, Condition, Operand, PropertyValue};
use crate::graph::{GraphEntity, GraphRelationship};

/// Attribute bag of one bound entity or relationship.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap(BTreeMap<String, PropertyValue>);

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: PropertyValue) {
        self.0.insert(key.into(), value);
    }

    /// `id`, `name`, `type`, `description` plus every metadata key.
    /// Built-in attributes win over metadata keys of the same name.
    pub fn from_entity(entity: &GraphEntity) -> Self {
        let mut map = Self::metadata_map(entity.metadata());
        map.insert("id", PropertyValue::String(entity.id.clone()));
        map.insert("name", PropertyValue::String(entity.name.clone()));
        map.insert("type", PropertyValue::String(entity.entity_type.clone()));
        if let Some(description) = &entity.description {
            map.insert("description", PropertyValue::String(description.clone()));
        }
        map
    }

    pub fn from_relationship(relationship: &GraphRelationship) -> Self {
        let metadata = relationship
            .metadata_json
            .as_deref()
            .and_then(|raw| match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(serde_json::Value::Object(map)) => Some(map),
                _ => None,
            });
        let mut map = Self::metadata_map(metadata);
        map.insert("id", PropertyValue::String(relationship.id.clone()));
        map.insert("type", PropertyValue::String(relationship.relationship_type.clone()));
        map.insert("weight", PropertyValue::Number(relationship.weight));
        map.insert("source", PropertyValue::String(relationship.source_id.clone()));
        map.insert("target", PropertyValue::String(relationship.target_id.clone()));
        map
    }

    fn metadata_map(metadata: Option<serde_json::Map<String, serde_json::Value>>) -> Self {
        let mut map = Self::new();
        for (key, value) in metadata.into_iter().flatten() {
            map.insert(key, PropertyValue::from(&value));
        }
        map
    }
}

/// Resolves `variable.key` operands.
pub trait PropertyLookup {
    fn lookup(&self, variable: &str, key: &str) -> Option<&PropertyValue>;
}

/// A single property map answers for any variable name.
impl PropertyLookup for PropertyMap {
    fn lookup(&self, _variable: &str, key: &str) -> Option<&PropertyValue> {
        self.get(key)
    }
}

/// One property map per bound variable.
impl PropertyLookup for BTreeMap<String, PropertyMap> {
    fn lookup(&self, variable: &str, key: &str) -> Option<&PropertyValue> {
        self.get(variable)?.get(key)
    }
}

/// Evaluate a `WHERE` tree. Total: a comparison involving a missing
/// property, or values that cannot be compared, is `false`.
pub fn evaluate_condition<L: PropertyLookup + ?Sized>(condition: &Condition, properties: &L) -> bool {
    match condition {
        Condition::Comparison { left, operator, right } => {
            let (Some(left), Some(right)) = (resolve(left, properties), resolve(right, properties)) else {
                return false;
            };
            compare(left, *operator, right)
        }
        Condition::And(children) => children.iter().all(|c| evaluate_condition(c, properties)),
        Condition::Or(children) => children.iter().any(|c| evaluate_condition(c, properties)),
        Condition::Not(child) => !evaluate_condition(child, properties),
    }
}

fn resolve<'a, L: PropertyLookup + ?Sized>(operand: &'a Operand, properties: &'a L) -> Option<&'a PropertyValue> {
    match operand {
        Operand::Property { variable, key } => properties.lookup(variable, key),
        Operand::Literal(value) => Some(value),
    }
}

fn compare(left: &PropertyValue, operator: ComparisonOperator, right: &PropertyValue) -> bool {
    match operator {
        ComparisonOperator::Eq => values_equal(left, right),
        ComparisonOperator::NotEq => !values_equal(left, right),
        ComparisonOperator::Contains => match (left.coerce_string(), right.coerce_string()) {
            (Some(haystack), Some(needle)) => haystack.contains(&needle),
            _ => false,
        },
        ComparisonOperator::Lt => order(left, right) == Some(Ordering::Less),
        ComparisonOperator::Gt => order(left, right) == Some(Ordering::Greater),
        ComparisonOperator::LtEq => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        ComparisonOperator::GtEq => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn values_equal(left: &PropertyValue, right: &PropertyValue) -> bool {
    match (left, right) {
        (PropertyValue::String(a), PropertyValue::String(b)) => a == b,
        (PropertyValue::Bool(a), PropertyValue::Bool(b)) => a == b,
        (PropertyValue::Null, PropertyValue::Null) => true,
        (PropertyValue::Number(_), _) | (_, PropertyValue::Number(_)) => {
            matches!((left.as_number(), right.as_number()), (Some(a), Some(b)) if a == b)
        }
        _ => false,
    }
}

fn order(left: &PropertyValue, right: &PropertyValue) -> Option<Ordering> {
    match (left, right) {
        (PropertyValue::String(a), PropertyValue::String(b)) => Some(a.cmp(b)),
        (PropertyValue::Number(_), _) | (_, PropertyValue::Number(_)) => {
            left.as_number()?.partial_cmp(&right.as_number()?)
        }
        _ => None,
    }
}
