//! Background indexing: fetch, extract, merge, store, detect communities
//! and summarize, as a pausable and cancellable run.

mod progress;
mod service;

pub use progress::{IndexingPhase, IndexingProgress, IndexingStatus};
pub use service::IndexingService;

use serde::{Deserialize, Serialize};

/// `[indexing]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Items per batch; pause takes effect between batches.
    pub batch_size: usize,
    /// Cap on records fetched per connector and run.
    pub fetch_limit: Option<usize>,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            fetch_limit: None,
        }
    }
}
