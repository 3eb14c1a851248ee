//! Query engines over the knowledge graph.
//!
//! [`HybridQueryEngine`] answers a question from a handful of matched
//! entities; [`GlobalQueryEngine`] synthesizes an answer from community
//! summaries by map-reduce.

mod global;
mod hybrid;

pub use global::{CommunityAnswer, GlobalQueryConfig, GlobalQueryEngine, GlobalQueryEvent, GlobalQueryResult};
pub use hybrid::{
    HybridQueryConfig, HybridQueryEngine, HybridQueryResult, MatchSource, QueryMetadata, QueryOptions,
    ScoredQueryEntity, StreamingAnswer,
};
