use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::graph::{GraphRepository, StoredCommunity};
use crate::llm::TextGenerator;

const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information in your knowledge graph to answer this question.";

const BROAD_KEYWORDS: &[&str] = &[
    "overall",
    "overview",
    "summary",
    "summarize",
    "summarise",
    "big picture",
    "in general",
    "everything",
    "all of my",
    "across",
    "main themes",
];

const SPECIFIC_KEYWORDS: &[&str] = &[
    "who ", "when ", "where ", "which ", "specific", "exactly", "detail", "particular",
];

/// `[global]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalQueryConfig {
    /// Partial answers scoring below this (0-100) are discarded.
    pub min_helpfulness_score: u32,
    pub max_community_answers: usize,
    /// Style requested from the reduce step.
    pub response_type: String,
    /// Upper bound on communities visited in the map phase.
    pub max_map_communities: usize,
}

impl Default for GlobalQueryConfig {
    fn default() -> Self {
        Self {
            min_helpfulness_score: 20,
            max_community_answers: 10,
            response_type: "multiple paragraphs".to_string(),
            max_map_communities: 50,
        }
    }
}

/// One partial answer from the map phase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommunityAnswer {
    pub community_id: String,
    pub answer: String,
    /// Self-reported helpfulness, 0-100; unparsable scores are 0.
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalQueryResult {
    pub answer: String,
    /// Partial answers that survived filtering and were reduced.
    pub useful_answers: usize,
    pub community_level: u32,
    pub communities_processed: usize,
    pub community_answers: Vec<CommunityAnswer>,
    pub map_duration_ms: u64,
    pub reduce_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Progress of a streamed global query, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GlobalQueryEvent {
    Started { community_level: u32, total_communities: usize },
    /// `current` is 1-based.
    ProcessingCommunity { current: usize, total: usize, community_id: String },
    Reducing { useful_answers: usize },
    Token { text: String },
    Completed { result: GlobalQueryResult },
    Cancelled { processed: usize },
    Failed { message: String },
}

impl GlobalQueryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GlobalQueryEvent::Completed { .. } | GlobalQueryEvent::Cancelled { .. } | GlobalQueryEvent::Failed { .. }
        )
    }
}

/// Map-reduce over community summaries.
///
/// MAP asks the generator for a partial answer and a helpfulness score per
/// community; partial answers below the minimum score are dropped, the best
/// `max_community_answers` are kept, and REDUCE merges them into one answer.
#[derive(Clone)]
pub struct GlobalQueryEngine {
    repository: Arc<dyn GraphRepository>,
    generator: Arc<dyn TextGenerator>,
    config: GlobalQueryConfig,
}

fn score_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)score\s*[:=]\s*(\d{1,3})").ok())
        .as_ref()
}

struct MapOutcome {
    level: u32,
    communities: Vec<StoredCommunity>,
}

impl GlobalQueryEngine {
    pub fn new(repository: Arc<dyn GraphRepository>, generator: Arc<dyn TextGenerator>, config: GlobalQueryConfig) -> Self {
        Self {
            repository,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &GlobalQueryConfig {
        &self.config
    }

    pub async fn global_query(&self, query: &str, level: u32) -> Result<GlobalQueryResult> {
        let start = Instant::now();
        let selection = self.select_communities(level).await?;

        let map_start = Instant::now();
        let mut answers = Vec::with_capacity(selection.communities.len());
        for community in &selection.communities {
            answers.push(self.map_community(query, community).await?);
        }
        let map_duration_ms = map_start.elapsed().as_millis() as u64;
        log::info!(
            "Global query map phase: {} communities at level {} in {}ms",
            answers.len(),
            selection.level,
            map_duration_ms
        );

        let survivors = self.filter_answers(answers);
        let reduce_start = Instant::now();
        let answer = if survivors.is_empty() {
            INSUFFICIENT_INFORMATION.to_string()
        } else {
            let text = self.generator.generate(&self.reduce_prompt(query, &survivors)).await?;
            text.trim().to_string()
        };
        let reduce_duration_ms = if survivors.is_empty() {
            0
        } else {
            reduce_start.elapsed().as_millis() as u64
        };

        Ok(GlobalQueryResult {
            answer,
            useful_answers: survivors.len(),
            community_level: selection.level,
            communities_processed: selection.communities.len(),
            community_answers: survivors,
            map_duration_ms,
            reduce_duration_ms,
            total_duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Pick the level from the query's phrasing, then run [`global_query`](Self::global_query).
    pub async fn global_query_auto(&self, query: &str) -> Result<GlobalQueryResult> {
        let level = self.auto_level(query).await?;
        self.global_query(query, level).await
    }

    /// Run a global query as an event stream. `level` of `None` selects it
    /// automatically. With `stream_tokens`, the reduce answer arrives as
    /// `Token` events before `Completed`.
    ///
    /// The stream is pulled at the consumer's pace. `cancel` is checked
    /// before each community and before reducing; a cancelled run ends with
    /// `Cancelled` and makes no further generator calls.
    pub fn global_query_stream(
        &self,
        query: &str,
        level: Option<u32>,
        stream_tokens: bool,
        cancel: CancellationToken,
    ) -> BoxStream<'static, GlobalQueryEvent> {
        let (tx, rx) = mpsc::channel::<GlobalQueryEvent>(1);
        let engine = self.clone();
        let query = query.to_string();

        tokio::spawn(async move {
            let terminal = match engine.run_stream(&query, level, stream_tokens, &cancel, &tx).await {
                Ok(event) => event,
                Err(e) => {
                    log::error!("Global query failed: {}", e);
                    GlobalQueryEvent::Failed { message: e.to_string() }
                }
            };
            let _ = tx.send(terminal).await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    /// Emits progress on `tx` and returns the terminal event. A closed
    /// channel counts as cancellation.
    async fn run_stream(
        &self,
        query: &str,
        level: Option<u32>,
        stream_tokens: bool,
        cancel: &CancellationToken,
        tx: &mpsc::Sender<GlobalQueryEvent>,
    ) -> Result<GlobalQueryEvent> {
        let start = Instant::now();
        let level = match level {
            Some(level) => level,
            None => self.auto_level(query).await?,
        };
        let selection = self.select_communities(level).await?;
        let total = selection.communities.len();

        let emit = |event: GlobalQueryEvent| async move { tx.send(event).await.is_ok() };

        if !emit(GlobalQueryEvent::Started {
            community_level: selection.level,
            total_communities: total,
        })
        .await
        {
            return Ok(GlobalQueryEvent::Cancelled { processed: 0 });
        }

        let map_start = Instant::now();
        let mut answers = Vec::with_capacity(total);
        for (i, community) in selection.communities.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(GlobalQueryEvent::Cancelled { processed: i });
            }
            let event = GlobalQueryEvent::ProcessingCommunity {
                current: i + 1,
                total,
                community_id: community.community.id.clone(),
            };
            if !emit(event).await || cancel.is_cancelled() {
                return Ok(GlobalQueryEvent::Cancelled { processed: i });
            }
            answers.push(self.map_community(query, community).await?);
        }
        let map_duration_ms = map_start.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return Ok(GlobalQueryEvent::Cancelled { processed: total });
        }

        let survivors = self.filter_answers(answers);
        let mut result = GlobalQueryResult {
            answer: INSUFFICIENT_INFORMATION.to_string(),
            useful_answers: survivors.len(),
            community_level: selection.level,
            communities_processed: total,
            community_answers: Vec::new(),
            map_duration_ms,
            reduce_duration_ms: 0,
            total_duration_ms: 0,
        };

        if !survivors.is_empty() {
            if !emit(GlobalQueryEvent::Reducing {
                useful_answers: survivors.len(),
            })
            .await
            {
                return Ok(GlobalQueryEvent::Cancelled { processed: total });
            }

            let reduce_start = Instant::now();
            let prompt = self.reduce_prompt(query, &survivors);
            if stream_tokens {
                let mut tokens = self.generator.generate_stream(&prompt).await?;
                let mut answer = String::new();
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(GlobalQueryEvent::Cancelled { processed: total }),
                        next = tokens.next() => next,
                    };
                    let Some(token) = next else { break };
                    let token = token?;
                    answer.push_str(&token);
                    if !emit(GlobalQueryEvent::Token { text: token }).await {
                        return Ok(GlobalQueryEvent::Cancelled { processed: total });
                    }
                }
                result.answer = answer.trim().to_string();
            } else {
                result.answer = self.generator.generate(&prompt).await?.trim().to_string();
            }
            result.reduce_duration_ms = reduce_start.elapsed().as_millis() as u64;
        }

        result.community_answers = survivors;
        result.total_duration_ms = start.elapsed().as_millis() as u64;
        Ok(GlobalQueryEvent::Completed { result })
    }

    async fn auto_level(&self, query: &str) -> Result<u32> {
        let stats = self.repository.get_stats().await?;
        Ok(select_level(query, &stats.community_levels).unwrap_or(0))
    }

    /// Summarized communities at `level` in map order: entity count
    /// descending, then id; at most `max_map_communities`.
    async fn select_communities(&self, level: u32) -> Result<MapOutcome> {
        let mut communities: Vec<StoredCommunity> = self
            .repository
            .get_communities_by_level(level)
            .await?
            .into_iter()
            .filter(|c| c.summary_text().is_some_and(|s| !s.trim().is_empty()))
            .collect();
        communities.sort_by(|a, b| {
            b.entity_count()
                .cmp(&a.entity_count())
                .then_with(|| a.community.id.cmp(&b.community.id))
        });
        communities.truncate(self.config.max_map_communities);
        Ok(MapOutcome { level, communities })
    }

    async fn map_community(&self, query: &str, community: &StoredCommunity) -> Result<CommunityAnswer> {
        let summary = community.summary_text().unwrap_or_default();
        let response = self.generator.generate(&map_prompt(query, summary)).await?;
        let (answer, score) = self.parse_partial_answer(&response);
        log::debug!("Community {} scored {}", community.community.id, score);
        Ok(CommunityAnswer {
            community_id: community.community.id.clone(),
            answer,
            score,
        })
    }

    /// Split a map response into answer text and helpfulness score.
    fn parse_partial_answer(&self, response: &str) -> (String, u32) {
        let Some(pattern) = score_pattern() else {
            log::warn!("Score pattern unavailable; treating response as unscored");
            return (response.trim().to_string(), 0);
        };
        let score = pattern
            .captures_iter(response)
            .last()
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .map(|s| s.min(100))
            .unwrap_or(0);

        let answer = response
            .lines()
            .filter(|line| !pattern.is_match(line))
            .collect::<Vec<_>>()
            .join("\n");
        let answer = answer.trim();
        let answer = answer.strip_prefix("Answer:").unwrap_or(answer).trim();
        (answer.to_string(), score)
    }

    /// Keep answers scoring at least the minimum, best first, capped.
    fn filter_answers(&self, answers: Vec<CommunityAnswer>) -> Vec<CommunityAnswer> {
        let mut survivors: Vec<CommunityAnswer> = answers
            .into_iter()
            .filter(|a| a.score >= self.config.min_helpfulness_score)
            .collect();
        survivors.sort_by(|a, b| b.score.cmp(&a.score));
        survivors.truncate(self.config.max_community_answers);
        survivors
    }

    fn reduce_prompt(&self, query: &str, answers: &[CommunityAnswer]) -> String {
        let mut partials = String::new();
        for (i, answer) in answers.iter().enumerate() {
            partials.push_str(&format!("Analyst {} (helpfulness {}):\n{}\n\n", i + 1, answer.score, answer.answer));
        }
        format!(
            "You are synthesizing reports from several analysts, each of whom studied one part of the user's \
             personal knowledge graph.\n\n\
             Reports, most helpful first:\n{}\
             Question: {}\n\n\
             Combine the reports into one comprehensive answer formatted as {}. Drop information that is \
             irrelevant to the question and do not mention the analysts.",
            partials, query, self.config.response_type
        )
    }
}

fn map_prompt(query: &str, summary: &str) -> String {
    format!(
        "You are an analyst with one section of the user's personal knowledge graph.\n\n\
         Section summary:\n{}\n\n\
         Question: {}\n\n\
         Answer the question using only this section. Then rate how helpful your answer is for the \
         question on a scale from 0 (not at all) to 100 (fully answers it).\n\
         Respond in this format:\n\
         Answer: <your answer>\n\
         Score: <0-100>",
        summary, query
    )
}

/// Level heuristic over the levels actually present: broad phrasing picks
/// the coarsest level, specific phrasing the finest, anything else the
/// middle one. `None` when there are no levels.
pub(crate) fn select_level(query: &str, levels: &[u32]) -> Option<u32> {
    let mut levels = levels.to_vec();
    levels.sort_unstable();
    levels.dedup();
    let (&finest, &coarsest) = (levels.first()?, levels.last()?);

    let query = format!("{} ", query.to_lowercase());
    if BROAD_KEYWORDS.iter().any(|k| query.contains(k)) {
        Some(coarsest)
    } else if SPECIFIC_KEYWORDS.iter().any(|k| query.contains(k)) {
        Some(finest)
    } else {
        Some(levels[levels.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CommunitySummary, DetectedCommunity, InMemoryGraphRepository};
    use crate::test_support::ScriptedGenerator;

    async fn add_community(repo: &InMemoryGraphRepository, id: &str, level: u32, members: usize, summary: &str) {
        repo.add_community(&DetectedCommunity {
            id: id.to_string(),
            level,
            entity_ids: (0..members).map(|i| format!("{}-e{}", id, i)).collect(),
            modularity: 0.1,
            parent_community_id: None,
            child_community_ids: vec![],
        })
        .await
        .unwrap();
        repo.update_community_summary(&CommunitySummary {
            community_id: id.to_string(),
            summary: summary.to_string(),
            embedding: vec![1.0, 0.0],
            entity_count: members,
            relationship_count: 0,
        })
        .await
        .unwrap();
    }

    async fn repository() -> Arc<InMemoryGraphRepository> {
        let repo = Arc::new(InMemoryGraphRepository::new());
        add_community(&repo, "c0-0", 0, 3, "Hiking club with Alice").await;
        add_community(&repo, "c0-1", 0, 5, "Work at Acme on rust").await;
        add_community(&repo, "c0-2", 0, 2, "Gardening with Bob").await;
        add_community(&repo, "c1-0", 1, 10, "Life overview").await;
        repo
    }

    fn generator() -> Arc<ScriptedGenerator> {
        Arc::new(
            ScriptedGenerator::new("Final combined answer")
                .respond_when("Hiking club", "Answer: Alice hikes on weekends.\nScore: 80")
                .respond_when("Work at Acme", "Answer: Alice writes rust at Acme.\nScore: 95")
                .respond_when("Gardening", "Answer: Not relevant.\nScore: 5")
                .respond_when("Life overview", "Answer: Busy life.\nScore: 60"),
        )
    }

    #[tokio::test]
    async fn test_map_filter_reduce() {
        let generator = generator();
        let engine = GlobalQueryEngine::new(repository().await, generator.clone(), GlobalQueryConfig::default());

        let result = engine.global_query("What does Alice do?", 0).await.unwrap();
        assert_eq!(result.answer, "Final combined answer");
        assert_eq!(result.community_level, 0);
        assert_eq!(result.communities_processed, 3);
        assert_eq!(result.useful_answers, 2);
        assert_eq!(result.community_answers[0].community_id, "c0-1");
        assert_eq!(result.community_answers[0].answer, "Alice writes rust at Acme.");
        assert_eq!(result.community_answers[1].score, 80);

        let prompts = generator.prompts();
        assert_eq!(prompts.len(), 4);
        // map order: entity count descending
        assert!(prompts[0].contains("Work at Acme"));
        assert!(prompts[1].contains("Hiking club"));
        assert!(prompts[2].contains("Gardening"));
        let reduce = &prompts[3];
        assert!(reduce.contains("Alice writes rust at Acme."));
        assert!(!reduce.contains("Not relevant."));
        assert!(reduce.contains("multiple paragraphs"));
    }

    #[tokio::test]
    async fn test_answer_cap() {
        let config = GlobalQueryConfig {
            max_community_answers: 1,
            ..GlobalQueryConfig::default()
        };
        let engine = GlobalQueryEngine::new(repository().await, generator(), config);
        let result = engine.global_query("q", 0).await.unwrap();
        assert_eq!(result.useful_answers, 1);
        assert_eq!(result.community_answers[0].score, 95);
    }

    #[tokio::test]
    async fn test_no_survivors_skips_reduce() {
        let generator = Arc::new(ScriptedGenerator::new("Answer: meh\nno score given"));
        let engine = GlobalQueryEngine::new(repository().await, generator.clone(), GlobalQueryConfig::default());
        let result = engine.global_query("q", 0).await.unwrap();
        assert_eq!(result.useful_answers, 0);
        assert_eq!(result.answer, INSUFFICIENT_INFORMATION);
        assert_eq!(result.reduce_duration_ms, 0);
        assert_eq!(generator.call_count(), 3);
    }

    #[tokio::test]
    async fn test_empty_level_answers_without_generator() {
        let generator = generator();
        let engine = GlobalQueryEngine::new(repository().await, generator.clone(), GlobalQueryConfig::default());
        let result = engine.global_query("q", 7).await.unwrap();
        assert_eq!(result.communities_processed, 0);
        assert_eq!(result.answer, INSUFFICIENT_INFORMATION);
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_level_selection() {
        let generator = generator();
        let engine = GlobalQueryEngine::new(repository().await, generator, GlobalQueryConfig::default());
        let result = engine.global_query_auto("Give me an overview of my life").await.unwrap();
        assert_eq!(result.community_level, 1);
        assert_eq!(result.answer, "Final combined answer");
    }

    #[test]
    fn test_select_level_heuristic() {
        assert_eq!(select_level("anything", &[]), None);
        assert_eq!(select_level("Summarize my year", &[0, 1, 2]), Some(2));
        assert_eq!(select_level("Who did I meet in Oslo?", &[2, 0, 1]), Some(0));
        assert_eq!(select_level("What hobbies do I have", &[0, 1, 2]), Some(1));
        assert_eq!(select_level("What hobbies do I have", &[0, 1]), Some(1));
        assert_eq!(select_level("When", &[3]), Some(3));
    }

    #[tokio::test]
    async fn test_scored_answer_without_text_survives() {
        let generator = Arc::new(
            ScriptedGenerator::new("Final combined answer")
                .respond_when("Hiking club", "Score: 90")
                .respond_when("Work at Acme", "Answer: Alice writes rust at Acme.\nScore: 95")
                .respond_when("Gardening", "Answer: Not relevant.\nScore: 5"),
        );
        let engine = GlobalQueryEngine::new(repository().await, generator, GlobalQueryConfig::default());
        let result = engine.global_query("q", 0).await.unwrap();
        assert_eq!(result.useful_answers, 2);
        assert_eq!(result.community_answers[1].community_id, "c0-0");
        assert_eq!(result.community_answers[1].answer, "");
    }

    #[test]
    fn test_parse_partial_answer() {
        let engine = GlobalQueryEngine::new(
            Arc::new(InMemoryGraphRepository::new()),
            Arc::new(ScriptedGenerator::new("")),
            GlobalQueryConfig::default(),
        );
        assert_eq!(
            engine.parse_partial_answer("Answer: Yes.\nScore: 73"),
            ("Yes.".to_string(), 73)
        );
        assert_eq!(engine.parse_partial_answer("Helpful. SCORE=250").1, 100);
        assert_eq!(engine.parse_partial_answer("Score: high").1, 0);
        assert!(score_pattern().is_some());
    }

    #[tokio::test]
    async fn test_stream_events_in_order() {
        let engine = GlobalQueryEngine::new(repository().await, generator(), GlobalQueryConfig::default());
        let events: Vec<GlobalQueryEvent> = engine
            .global_query_stream("q", Some(0), false, CancellationToken::new())
            .collect()
            .await;

        assert_eq!(
            events[0],
            GlobalQueryEvent::Started {
                community_level: 0,
                total_communities: 3
            }
        );
        let currents: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                GlobalQueryEvent::ProcessingCommunity { current, total, .. } => {
                    assert_eq!(*total, 3);
                    Some(*current)
                }
                _ => None,
            })
            .collect();
        assert_eq!(currents, vec![1, 2, 3]);
        assert_eq!(events[4], GlobalQueryEvent::Reducing { useful_answers: 2 });
        match events.last().unwrap() {
            GlobalQueryEvent::Completed { result } => assert_eq!(result.answer, "Final combined answer"),
            other => panic!("unexpected terminal event {:?}", other),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_stream_tokens_then_completed() {
        let engine = GlobalQueryEngine::new(repository().await, generator(), GlobalQueryConfig::default());
        let events: Vec<GlobalQueryEvent> = engine
            .global_query_stream("q", Some(0), true, CancellationToken::new())
            .collect()
            .await;
        let tokens: String = events
            .iter()
            .filter_map(|e| match e {
                GlobalQueryEvent::Token { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, "Final combined answer");
        assert!(matches!(events.last(), Some(GlobalQueryEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn test_stream_cancel_mid_map() {
        let generator = generator();
        let engine = GlobalQueryEngine::new(repository().await, generator.clone(), GlobalQueryConfig::default());
        let cancel = CancellationToken::new();
        let mut stream = engine.global_query_stream("q", Some(0), false, cancel.clone());

        assert!(matches!(stream.next().await, Some(GlobalQueryEvent::Started { .. })));
        assert!(matches!(
            stream.next().await,
            Some(GlobalQueryEvent::ProcessingCommunity { current: 1, .. })
        ));
        cancel.cancel();

        let rest: Vec<GlobalQueryEvent> = stream.collect().await;
        let last = rest.last().unwrap();
        assert!(matches!(last, GlobalQueryEvent::Cancelled { .. }));
        assert!(!rest.iter().any(|e| matches!(e, GlobalQueryEvent::Reducing { .. })));
        // the reduce call is never made
        assert!(generator.call_count() < 3);
    }

    #[tokio::test]
    async fn test_stream_failure_is_terminal_event() {
        let generator = Arc::new(ScriptedGenerator::new("Score: 50").fail_when("Gardening"));
        let engine = GlobalQueryEngine::new(repository().await, generator, GlobalQueryConfig::default());
        let events: Vec<GlobalQueryEvent> = engine
            .global_query_stream("q", Some(0), false, CancellationToken::new())
            .collect()
            .await;
        assert!(matches!(events.last(), Some(GlobalQueryEvent::Failed { .. })));
    }
}
