//! Cypher subset: lexer, recursive-descent parser and an executor that
//! evaluates patterns against a [`GraphRepository`](crate::graph::GraphRepository).
//!
//! Supported: `MATCH` with one or more comma-separated patterns (nodes with
//! labels and inline property maps, optional relationship hops), `WHERE`
//! with `AND`/`OR`/`NOT` and comparisons, `RETURN *` or variables, `LIMIT`.

pub mod ast;
mod eval;
mod executor;
mod lexer;
mod parser;

pub use ast::{
    ComparisonOperator, Condition, CypherQuery, Direction, MatchPattern, NodePattern, Operand, PropertyValue,
    RelationshipPattern, ReturnClause,
};
pub use eval::{evaluate_condition, PropertyLookup, PropertyMap};
pub use executor::{CypherExecutor, CypherResult};
pub use parser::parse;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CypherError {
    /// Malformed query text; `position` is a byte offset into the query.
    #[error("syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },
}

impl CypherError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        CypherError::Syntax {
            position,
            message: message.into(),
        }
    }

    pub fn position(&self) -> usize {
        match self {
            CypherError::Syntax { position, .. } => *position,
        }
    }
}
