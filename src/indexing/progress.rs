use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl IndexingStatus {
    /// A run is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, IndexingStatus::Running | IndexingStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IndexingStatus::Completed | IndexingStatus::Failed | IndexingStatus::Cancelled
        )
    }
}

impl fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexingStatus::Idle => "idle",
            IndexingStatus::Running => "running",
            IndexingStatus::Paused => "paused",
            IndexingStatus::Completed => "completed",
            IndexingStatus::Failed => "failed",
            IndexingStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingPhase {
    #[default]
    Idle,
    Fetching,
    Extracting,
    DetectingCommunities,
    Summarizing,
    Finalizing,
    Done,
}

impl fmt::Display for IndexingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexingPhase::Idle => "idle",
            IndexingPhase::Fetching => "fetching",
            IndexingPhase::Extracting => "extracting",
            IndexingPhase::DetectingCommunities => "detecting_communities",
            IndexingPhase::Summarizing => "summarizing",
            IndexingPhase::Finalizing => "finalizing",
            IndexingPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// Read model of the current (or last) indexing run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexingProgress {
    pub status: IndexingStatus,
    pub current_phase: IndexingPhase,
    pub processed_items: usize,
    pub total_items: usize,
    /// Items skipped because of an item-local failure.
    pub failed_items: usize,
    pub entities_extracted: usize,
    pub entities_stored: usize,
    pub relationships_extracted: usize,
    pub relationships_stored: usize,
    pub communities_detected: usize,
    pub communities_summarized: usize,
    /// Connectors skipped for missing permission or a failed fetch.
    pub skipped_connectors: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl IndexingProgress {
    /// processed / total, 0 when there is nothing to process.
    pub fn progress(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.processed_items as f64 / self.total_items as f64
        }
    }
}
