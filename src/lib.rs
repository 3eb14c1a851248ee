pub mod cache;
pub mod community;
pub mod config;
pub mod connectors;
pub mod cypher;
pub mod db;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod graph;
pub mod indexing;
pub mod llm;
pub mod query;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use engine::{GraphRag, GraphRagSettings};
pub use error::{GraphRagError, Result};
