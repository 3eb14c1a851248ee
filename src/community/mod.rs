//! Hierarchical community detection and summarization.

mod detector;
mod summarizer;

pub use detector::CommunityDetector;
pub use summarizer::CommunitySummarizer;
pub(crate) use summarizer::truncate_chars;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::graph::DetectedCommunity;

/// Louvain parameters (`[community]` in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunityDetectionConfig {
    /// Modularity resolution γ; larger values favour smaller communities.
    pub resolution: f64,
    /// Upper bound on local-move passes per level.
    pub max_iterations: usize,
    /// A move must beat staying put by more than this gain.
    pub min_improvement: f64,
    /// Fixes the node visiting order; `None` draws from OS entropy.
    pub random_seed: Option<u64>,
    /// Maximum number of hierarchy levels.
    pub max_depth: usize,
    /// Communities with fewer entities are dropped.
    pub min_community_size: usize,
}

impl Default for CommunityDetectionConfig {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            max_iterations: 100,
            min_improvement: 0.001,
            random_seed: None,
            max_depth: 2,
            min_community_size: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityDetectionResult {
    /// One list per level, finest (level 0) first.
    pub levels: Vec<Vec<DetectedCommunity>>,
    /// Entity id to the finest community containing it.
    pub entity_to_community: BTreeMap<String, String>,
    /// Modularity of the unfiltered level-0 partition on the input graph.
    pub modularity: f64,
}

impl CommunityDetectionResult {
    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|l| l.is_empty())
    }

    pub fn community_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn communities(&self) -> impl Iterator<Item = &DetectedCommunity> {
        self.levels.iter().flatten()
    }
}
