use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Parsed query. The default value (no patterns) is what empty input parses to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CypherQuery {
    pub match_patterns: Vec<MatchPattern>,
    pub where_clause: Option<Condition>,
    pub return_clause: ReturnClause,
    pub limit: Option<usize>,
}

impl CypherQuery {
    pub fn is_empty(&self) -> bool {
        self.match_patterns.is_empty()
    }

    pub fn return_all(&self) -> bool {
        matches!(self.return_clause, ReturnClause::All)
    }

    /// First `WHERE` conjunct whose variables no single pattern binds.
    /// Patterns match independently, so such a conjunct has no row to be
    /// evaluated against.
    pub fn cross_pattern_condition(&self) -> Option<&Condition> {
        let condition = self.where_clause.as_ref()?;
        let scopes: Vec<BTreeSet<String>> = self.match_patterns.iter().map(MatchPattern::variables).collect();
        condition.conjuncts().into_iter().find(|c| {
            let vars = c.variables();
            !scopes.iter().any(|scope| vars.is_subset(scope))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ReturnClause {
    #[default]
    All,
    Variables(Vec<String>),
}

/// A chain of nodes; `relationships[i]` connects `nodes[i]` and `nodes[i + 1]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchPattern {
    pub nodes: Vec<NodePattern>,
    pub relationships: Vec<RelationshipPattern>,
}

impl MatchPattern {
    /// Named variables bound by this pattern.
    pub fn variables(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.variable.clone())
            .chain(self.relationships.iter().filter_map(|r| r.variable.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePattern {
    pub variable: Option<String>,
    /// Entity types; several labels match the union.
    pub labels: Vec<String>,
    /// Inline `{key: value}` equality constraints.
    pub properties: BTreeMap<String, PropertyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipPattern {
    pub variable: Option<String>,
    /// Relationship types; empty matches any.
    pub types: Vec<String>,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// `-[]->`
    Outgoing,
    /// `<-[]-`
    Incoming,
    /// `-[]-`
    Either,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    Comparison {
        left: Operand,
        operator: ComparisonOperator,
        right: Operand,
    },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Variables referenced anywhere in the tree.
    pub fn variables(&self) -> BTreeSet<String> {
        let mut vars = BTreeSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, vars: &mut BTreeSet<String>) {
        match self {
            Condition::Comparison { left, right, .. } => {
                for operand in [left, right] {
                    if let Operand::Property { variable, .. } = operand {
                        vars.insert(variable.clone());
                    }
                }
            }
            Condition::And(children) | Condition::Or(children) => {
                children.iter().for_each(|c| c.collect_variables(vars));
            }
            Condition::Not(child) => child.collect_variables(vars),
        }
    }

    /// Top-level `AND` operands, nested `AND`s flattened.
    pub fn conjuncts(&self) -> Vec<&Condition> {
        match self {
            Condition::And(children) => children.iter().flat_map(Condition::conjuncts).collect(),
            other => vec![other],
        }
    }

    /// The part of this condition that only references `bound` variables.
    ///
    /// Conjuncts over other variables are dropped, so callers must first
    /// reject queries with a `cross_pattern_condition`. `None` means
    /// unconstrained.
    pub fn restrict_to(&self, bound: &BTreeSet<String>) -> Option<Condition> {
        match self {
            Condition::Comparison { .. } => self.variables().is_subset(bound).then(|| self.clone()),
            Condition::And(children) => {
                let kept: Vec<Condition> = children.iter().filter_map(|c| c.restrict_to(bound)).collect();
                match kept.len() {
                    0 => None,
                    1 => kept.into_iter().next(),
                    _ => Some(Condition::And(kept)),
                }
            }
            Condition::Or(_) | Condition::Not(_) => self.variables().is_subset(bound).then(|| self.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Property { variable: String, key: String },
    Literal(PropertyValue),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    Contains,
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            ComparisonOperator::Eq => "=",
            ComparisonOperator::NotEq => "<>",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Gt => ">",
            ComparisonOperator::LtEq => "<=",
            ComparisonOperator::GtEq => ">=",
            ComparisonOperator::Contains => "CONTAINS",
        };
        f.write_str(symbol)
    }
}

/// Attribute value as seen by `WHERE` evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl PropertyValue {
    /// String coercion used by `CONTAINS`. `Null` has none.
    pub fn coerce_string(&self) -> Option<String> {
        match self {
            PropertyValue::String(s) => Some(s.clone()),
            PropertyValue::Number(n) => Some(format_number(*n)),
            PropertyValue::Bool(b) => Some(b.to_string()),
            PropertyValue::Null => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<&serde_json::Value> for PropertyValue {
    fn from(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => PropertyValue::Null,
            serde_json::Value::Bool(b) => PropertyValue::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(PropertyValue::Number).unwrap_or(PropertyValue::Null),
            serde_json::Value::String(s) => PropertyValue::String(s.clone()),
            other => PropertyValue::String(other.to_string()),
        }
    }
}

/// Integers print without a fractional part so `31` contains `"31"`.
fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(var: &str) -> Condition {
        Condition::Comparison {
            left: Operand::Property {
                variable: var.into(),
                key: "name".into(),
            },
            operator: ComparisonOperator::Eq,
            right: Operand::Literal(PropertyValue::String("x".into())),
        }
    }

    #[test]
    fn test_restrict_to_drops_foreign_conjuncts() {
        let cond = Condition::And(vec![cmp("a"), cmp("b")]);
        let bound: BTreeSet<String> = ["a".to_string()].into();
        assert_eq!(cond.restrict_to(&bound), Some(cmp("a")));

        let or = Condition::Or(vec![cmp("a"), cmp("b")]);
        assert_eq!(or.restrict_to(&bound), None);
    }

    #[test]
    fn test_cross_pattern_condition() {
        let pattern = |var: &str| MatchPattern {
            nodes: vec![NodePattern {
                variable: Some(var.into()),
                ..NodePattern::default()
            }],
            relationships: vec![],
        };
        let mut query = CypherQuery {
            match_patterns: vec![pattern("a"), pattern("b")],
            where_clause: Some(Condition::And(vec![cmp("a"), Condition::And(vec![cmp("b")])])),
            ..CypherQuery::default()
        };
        assert_eq!(query.cross_pattern_condition(), None);

        let or = Condition::Or(vec![cmp("a"), cmp("b")]);
        query.where_clause = Some(Condition::And(vec![cmp("a"), or.clone()]));
        assert_eq!(query.cross_pattern_condition(), Some(&or));
    }

    #[test]
    fn test_number_coercion() {
        assert_eq!(PropertyValue::Number(31.0).coerce_string().unwrap(), "31");
        assert_eq!(PropertyValue::Number(2.5).coerce_string().unwrap(), "2.5");
        assert_eq!(PropertyValue::String(" 7 ".into()).as_number(), Some(7.0));
        assert!(PropertyValue::Null.coerce_string().is_none());
    }
}
