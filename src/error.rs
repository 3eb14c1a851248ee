use thiserror::Error;

use crate::cypher::CypherError;

/// Main error type for GraphRAG
#[derive(Error, Debug)]
pub enum GraphRagError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation invoked before the component was set up
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// Embedding length disagrees with the store's established dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A data connector lacks the access it needs
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Text-generation callback failed
    #[error("Generation error: {0}")]
    Generation(String),

    /// Embedding callback failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Malformed graph query
    #[error("Cypher error: {0}")]
    Cypher(#[from] CypherError),

    /// Entity not found
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Community not found
    #[error("Community not found: {0}")]
    CommunityNotFound(String),

    /// Illegal indexing state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Indexing pipeline failure
    #[error("Indexing error: {0}")]
    Indexing(String),
}

impl GraphRagError {
    /// True for failures raised by an injected collaborator (generation or
    /// embedding callback). These fail the surrounding run or query.
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(self, GraphRagError::Generation(_) | GraphRagError::Embedding(_))
    }
}

/// Convenient Result type using GraphRagError
pub type Result<T> = std::result::Result<T, GraphRagError>;
