use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use super::{IndexingConfig, IndexingPhase, IndexingProgress, IndexingStatus};
use crate::community::{CommunityDetector, CommunitySummarizer};
use crate::connectors::{DataConnector, SourceRecord};
use crate::error::{GraphRagError, Result};
use crate::extraction::{EntityExtractor, EntityMerger};
use crate::graph::GraphRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Pause,
    Cancel,
}

enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Default)]
struct ItemCounts {
    entities_extracted: usize,
    relationships_extracted: usize,
    entities_stored: usize,
    relationships_stored: usize,
}

struct Inner {
    repository: Arc<dyn GraphRepository>,
    extractor: EntityExtractor,
    detector: CommunityDetector,
    summarizer: CommunitySummarizer,
    connectors: Vec<Arc<dyn DataConnector>>,
    config: IndexingConfig,
    progress: watch::Sender<IndexingProgress>,
    control: watch::Sender<Control>,
    cancel_token: Mutex<CancellationToken>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the background indexing pipeline.
///
/// Cloning yields another handle to the same service. Progress is a
/// read model published through a `watch` channel; pause and cancel are
/// requests the worker honours at its next checkpoint (between batches for
/// pause, between items for cancel), while the read model reflects them
/// immediately.
#[derive(Clone)]
pub struct IndexingService {
    inner: Arc<Inner>,
}

impl IndexingService {
    pub fn new(
        repository: Arc<dyn GraphRepository>,
        extractor: EntityExtractor,
        detector: CommunityDetector,
        summarizer: CommunitySummarizer,
        connectors: Vec<Arc<dyn DataConnector>>,
        config: IndexingConfig,
    ) -> Self {
        let (progress, _) = watch::channel(IndexingProgress::default());
        let (control, _) = watch::channel(Control::Run);
        Self {
            inner: Arc::new(Inner {
                repository,
                extractor,
                detector,
                summarizer,
                connectors,
                config,
                progress,
                control,
                cancel_token: Mutex::new(CancellationToken::new()),
                worker: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn connectors(&self) -> &[Arc<dyn DataConnector>] {
        &self.inner.connectors
    }

    pub fn progress(&self) -> IndexingProgress {
        self.inner.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexingProgress> {
        self.inner.progress.subscribe()
    }

    /// Current progress followed by every later update.
    pub fn progress_stream(&self) -> WatchStream<IndexingProgress> {
        WatchStream::new(self.subscribe())
    }

    /// Start a run from idle or a terminal state. With `full_reindex`, each
    /// connector's sync state is reset and everything is fetched again.
    pub async fn start_indexing(&self, full_reindex: bool) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        let status = self.inner.progress.borrow().status;
        if status.is_active() {
            return Err(GraphRagError::InvalidState(format!("Cannot start indexing while {}", status)));
        }
        // a cancelled run may still be winding down
        if let Some(previous) = worker.take() {
            let _ = previous.await;
        }

        let token = CancellationToken::new();
        *self.inner.cancel_token.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        self.inner.control.send_replace(Control::Run);
        self.inner.progress.send_replace(IndexingProgress {
            status: IndexingStatus::Running,
            current_phase: IndexingPhase::Fetching,
            started_at: Some(Utc::now()),
            ..IndexingProgress::default()
        });
        log::info!("Indexing started (full_reindex={})", full_reindex);

        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move {
            let pipeline = tokio::spawn(run_pipeline(inner.clone(), full_reindex, token));
            let outcome = match pipeline.await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("Indexing worker crashed: {}", e)),
            };
            inner.finish(outcome);
        }));
        Ok(())
    }

    /// running → paused. The batch in flight completes first.
    pub fn pause_indexing(&self) -> Result<()> {
        self.transition("pause", |s| s == IndexingStatus::Running, IndexingStatus::Paused)?;
        self.inner.control.send_replace(Control::Pause);
        log::info!("Indexing pause requested");
        Ok(())
    }

    /// paused → running, continuing with the next unprocessed batch.
    pub fn resume_indexing(&self) -> Result<()> {
        self.transition("resume", |s| s == IndexingStatus::Paused, IndexingStatus::Running)?;
        self.inner.control.send_replace(Control::Run);
        log::info!("Indexing resumed");
        Ok(())
    }

    /// running or paused → cancelled. Already persisted data stays.
    pub fn cancel_indexing(&self) -> Result<()> {
        self.transition("cancel", |s| s.is_active(), IndexingStatus::Cancelled)?;
        self.inner.control.send_replace(Control::Cancel);
        self.inner
            .cancel_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        log::info!("Indexing cancel requested");
        Ok(())
    }

    /// Resolves once the current run (if any) has ended, with the final snapshot.
    pub async fn wait_for_completion(&self) -> IndexingProgress {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|p| !p.status.is_active()).await;

        let handle = self.inner.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Indexing supervisor failed: {}", e);
            }
        }
        self.progress()
    }

    /// Run `f` with no run active and the previous worker fully stopped.
    /// Starting a run is blocked until `f` returns.
    pub async fn while_idle<F, Fut, T>(&self, action: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut worker = self.inner.worker.lock().await;
        let status = self.inner.progress.borrow().status;
        if status.is_active() {
            return Err(GraphRagError::InvalidState(format!("Cannot {} while indexing is {}", action, status)));
        }
        if let Some(previous) = worker.take() {
            if let Err(e) = previous.await {
                log::error!("Indexing supervisor failed: {}", e);
            }
        }
        f().await
    }

    fn transition(
        &self,
        action: &str,
        allowed: impl Fn(IndexingStatus) -> bool,
        next: IndexingStatus,
    ) -> Result<()> {
        let mut rejected = None;
        self.inner.progress.send_if_modified(|p| {
            if allowed(p.status) {
                p.status = next;
                true
            } else {
                rejected = Some(p.status);
                false
            }
        });
        match rejected {
            Some(status) => Err(GraphRagError::InvalidState(format!("Cannot {} indexing while {}", action, status))),
            None => Ok(()),
        }
    }
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut IndexingProgress)) {
        self.progress.send_modify(f);
    }

    fn set_phase(&self, phase: IndexingPhase) {
        log::info!("Indexing phase: {}", phase);
        self.update(|p| p.current_phase = phase);
    }

    fn finish(&self, outcome: std::result::Result<RunOutcome, String>) {
        self.progress.send_modify(|p| {
            match outcome {
                Ok(RunOutcome::Completed) if p.status != IndexingStatus::Cancelled => {
                    p.status = IndexingStatus::Completed;
                    p.current_phase = IndexingPhase::Done;
                }
                Ok(_) => p.status = IndexingStatus::Cancelled,
                // a call interrupted by cancellation is not a failure of the run
                Err(message) if p.status == IndexingStatus::Cancelled => {
                    log::warn!("Indexing error after cancel: {}", message);
                }
                Err(message) => {
                    p.status = IndexingStatus::Failed;
                    p.error = Some(message);
                }
            }
            p.finished_at = Some(Utc::now());
        });
        let p = self.progress.borrow();
        match p.status {
            IndexingStatus::Failed => log::error!(
                "Indexing failed after {}/{} items: {}",
                p.processed_items,
                p.total_items,
                p.error.as_deref().unwrap_or("unknown error")
            ),
            status => log::info!(
                "Indexing {}: {}/{} items, {} entities, {} relationships, {} communities",
                status,
                p.processed_items,
                p.total_items,
                p.entities_stored,
                p.relationships_stored,
                p.communities_detected
            ),
        }
    }

    async fn process_item(&self, record: &SourceRecord, merger: &mut EntityMerger) -> Result<ItemCounts> {
        let extraction = self.extractor.extract(record).await?;
        let mut counts = ItemCounts {
            entities_extracted: extraction.entities.len(),
            relationships_extracted: extraction.relationships.len(),
            ..ItemCounts::default()
        };

        for entity in &extraction.entities {
            if !merger.contains(&entity.id) {
                if let Some(stored) = self.repository.get_entity(&entity.id).await? {
                    merger.seed(stored);
                }
            }
        }

        let merged = merger.merge(extraction);
        for entity in &merged.entities {
            self.repository.add_entity(entity).await?;
            counts.entities_stored += 1;
        }
        for relationship in &merged.relationships {
            self.repository.add_relationship(relationship).await?;
            counts.relationships_stored += 1;
        }
        Ok(counts)
    }
}

/// Failures confined to one item (or one summary); the run skips them.
fn is_item_local(error: &GraphRagError) -> bool {
    matches!(
        error,
        GraphRagError::DimensionMismatch { .. }
            | GraphRagError::InvalidInput(_)
            | GraphRagError::Serialization(_)
            | GraphRagError::EntityNotFound(_)
            | GraphRagError::CommunityNotFound(_)
    )
}

/// Wait while paused. `false` when the run should stop.
async fn checkpoint(control: &mut watch::Receiver<Control>) -> bool {
    loop {
        let state = *control.borrow_and_update();
        match state {
            Control::Run => return true,
            Control::Cancel => return false,
            Control::Pause => {}
        }
        if control.changed().await.is_err() {
            return false;
        }
    }
}

fn cancel_requested(control: &watch::Receiver<Control>) -> bool {
    *control.borrow() == Control::Cancel
}

async fn fetch_connector(
    connector: &dyn DataConnector,
    full_reindex: bool,
    limit: Option<usize>,
) -> Result<Vec<SourceRecord>> {
    if !connector.has_required_permissions().await {
        return Err(GraphRagError::PermissionDenied(format!(
            "{} lacks the required permissions",
            connector.name()
        )));
    }
    if full_reindex {
        connector.set_last_sync_time(None).await?;
    }
    let since = if full_reindex {
        None
    } else {
        connector.last_sync_time().await?
    };
    connector.fetch(since, limit).await
}

async fn run_pipeline(inner: Arc<Inner>, full_reindex: bool, token: CancellationToken) -> Result<RunOutcome> {
    let mut control = inner.control.subscribe();
    let run_started: DateTime<Utc> = Utc::now();

    // fetch everything first so the total is known before processing
    let mut items: Vec<SourceRecord> = Vec::new();
    let mut synced: Vec<Arc<dyn DataConnector>> = Vec::new();
    for connector in &inner.connectors {
        if !checkpoint(&mut control).await {
            return Ok(RunOutcome::Cancelled);
        }
        match fetch_connector(connector.as_ref(), full_reindex, inner.config.fetch_limit).await {
            Ok(records) => {
                log::info!("Fetched {} records from {}", records.len(), connector.name());
                items.extend(records);
                synced.push(connector.clone());
            }
            Err(e) => {
                log::warn!("Skipping connector {}: {}", connector.name(), e);
                let name = connector.name().to_string();
                inner.update(|p| p.skipped_connectors.push(name));
            }
        }
    }
    let total = items.len();
    inner.update(|p| p.total_items = total);

    inner.set_phase(IndexingPhase::Extracting);
    let mut merger = EntityMerger::new(inner.extractor.config().merge_similarity_threshold);
    for batch in items.chunks(inner.config.batch_size.max(1)) {
        if !checkpoint(&mut control).await {
            return Ok(RunOutcome::Cancelled);
        }
        for record in batch {
            if cancel_requested(&control) {
                return Ok(RunOutcome::Cancelled);
            }
            match inner.process_item(record, &mut merger).await {
                Ok(counts) => inner.update(|p| {
                    p.processed_items += 1;
                    p.entities_extracted += counts.entities_extracted;
                    p.relationships_extracted += counts.relationships_extracted;
                    p.entities_stored += counts.entities_stored;
                    p.relationships_stored += counts.relationships_stored;
                }),
                Err(e) if is_item_local(&e) => {
                    log::warn!("Skipping record {}: {}", record.id, e);
                    inner.update(|p| {
                        p.processed_items += 1;
                        p.failed_items += 1;
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    if !checkpoint(&mut control).await {
        return Ok(RunOutcome::Cancelled);
    }
    inner.set_phase(IndexingPhase::DetectingCommunities);
    let entities = inner.repository.get_all_entities().await?;
    let relationships = inner.repository.get_relationships(None).await?;
    let detector = inner.detector.clone();
    let started = std::time::Instant::now();
    let (detection, entities, relationships) = tokio::task::spawn_blocking(move || {
        let detection = detector.detect(&entities, &relationships);
        (detection, entities, relationships)
    })
    .await
    .map_err(|e| GraphRagError::Indexing(format!("Community detection crashed: {}", e)))?;
    log::info!(
        "Detected {} communities over {} levels in {:?}",
        detection.community_count(),
        detection.levels.len(),
        started.elapsed()
    );

    inner.repository.clear_communities().await?;
    for community in detection.communities() {
        inner.repository.add_community(community).await?;
    }
    let detected = detection.community_count();
    inner.update(|p| p.communities_detected = detected);

    if !checkpoint(&mut control).await {
        return Ok(RunOutcome::Cancelled);
    }
    inner.set_phase(IndexingPhase::Summarizing);
    let summaries = inner
        .summarizer
        .summarize_hierarchy(&detection, &entities, &relationships, Some(&token))
        .await?;
    let mut summarized = 0;
    for summary in &summaries {
        match inner.repository.update_community_summary(summary).await {
            Ok(()) => summarized += 1,
            Err(e) if is_item_local(&e) => {
                log::warn!("Skipping summary for {}: {}", summary.community_id, e)
            }
            Err(e) => return Err(e),
        }
    }
    inner.update(|p| p.communities_summarized = summarized);

    if token.is_cancelled() || !checkpoint(&mut control).await {
        return Ok(RunOutcome::Cancelled);
    }
    inner.set_phase(IndexingPhase::Finalizing);
    for connector in &synced {
        if let Err(e) = connector.set_last_sync_time(Some(run_started)).await {
            log::warn!("Failed to record sync time for {}: {}", connector.name(), e);
        }
    }

    Ok(RunOutcome::Completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::community::CommunityDetectionConfig;
    use crate::connectors::SourceType;
    use crate::extraction::ExtractorConfig;
    use crate::graph::{GraphEntity, InMemoryGraphRepository};
    use crate::llm::TextGenerator;
    use crate::embeddings::Embedder;
    use crate::test_support::{HashEmbedder, InMemoryConnector, ScriptedGenerator};
    use futures_util::StreamExt;
    use std::time::Duration;

    const DIM: usize = 1024;

    fn docs(n: usize) -> Vec<SourceRecord> {
        (0..n)
            .map(|i| {
                SourceRecord::new(format!("doc{}", i), SourceType::Documents, format!("Doc {}", i))
                    .with_content(format!("team{} alpha{} and beta{}", i, i, i))
            })
            .collect()
    }

    fn generator(n: usize) -> ScriptedGenerator {
        let mut generator = ScriptedGenerator::new("A short community summary.");
        for i in 0..n {
            generator = generator.respond_when(
                format!("team{} ", i),
                format!(
                    r#"{{"entities": [{{"name": "Alpha{i}", "type": "PERSON"}}, {{"name": "Beta{i}", "type": "PROJECT"}}],
                        "relationships": [{{"source": "Alpha{i}", "target": "Beta{i}", "type": "WORKS_ON"}}]}}"#,
                    i = i
                ),
            );
        }
        generator
    }

    fn service(
        repository: Arc<InMemoryGraphRepository>,
        generator: ScriptedGenerator,
        connectors: Vec<Arc<dyn DataConnector>>,
        batch_size: usize,
    ) -> IndexingService {
        service_with_embedder(repository, generator, HashEmbedder::new(DIM), connectors, batch_size)
    }

    fn service_with_embedder(
        repository: Arc<InMemoryGraphRepository>,
        generator: ScriptedGenerator,
        embedder: HashEmbedder,
        connectors: Vec<Arc<dyn DataConnector>>,
        batch_size: usize,
    ) -> IndexingService {
        let generator: Arc<dyn TextGenerator> = Arc::new(generator);
        let embedder: Arc<dyn Embedder> = Arc::new(embedder);
        IndexingService::new(
            repository,
            EntityExtractor::new(generator.clone(), embedder.clone(), ExtractorConfig::default()),
            CommunityDetector::new(CommunityDetectionConfig {
                random_seed: Some(7),
                ..CommunityDetectionConfig::default()
            }),
            CommunitySummarizer::new(generator, embedder),
            connectors,
            IndexingConfig {
                batch_size,
                fetch_limit: None,
            },
        )
    }

    #[tokio::test]
    async fn test_full_run_completes() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(3)));
        let contacts = Arc::new(InMemoryConnector::new(
            SourceType::Contacts,
            vec![SourceRecord::new("c1", SourceType::Contacts, "Carol").with_field("organization", "Acme")],
        ));
        let service = service(repo.clone(), generator(3), vec![documents.clone(), contacts], 2);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;

        assert_eq!(done.status, IndexingStatus::Completed);
        assert_eq!(done.current_phase, IndexingPhase::Done);
        assert_eq!(done.total_items, 4);
        assert_eq!(done.processed_items, 4);
        assert_eq!(done.entities_stored, 8);
        assert_eq!(done.relationships_stored, 4);
        assert_eq!(done.communities_detected, 4);
        assert_eq!(done.communities_summarized, 4);
        assert!(done.error.is_none());
        assert!(done.finished_at.is_some());

        let stats = repo.get_stats().await.unwrap();
        assert_eq!(stats.entity_count, 8);
        assert_eq!(stats.community_levels, vec![0]);
        let communities = repo.get_communities_by_level(0).await.unwrap();
        assert!(communities.iter().all(|c| c.summary.is_some()));
        assert!(documents.last_sync_time().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_incremental_and_full_reindex_sync_state() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(2)));
        let service = service(repo.clone(), generator(2), vec![documents.clone()], 10);

        service.start_indexing(false).await.unwrap();
        service.wait_for_completion().await;
        let synced_at = documents.last_sync_time().await.unwrap();
        assert!(synced_at.is_some());

        service.start_indexing(false).await.unwrap();
        let second = service.wait_for_completion().await;
        assert_eq!(second.status, IndexingStatus::Completed);
        // records predate the last sync, so nothing is fetched again
        assert_eq!(second.total_items, 0);
        assert_eq!(second.progress(), 0.0);

        service.start_indexing(true).await.unwrap();
        let third = service.wait_for_completion().await;
        assert_eq!(third.total_items, 2);

        assert_eq!(documents.fetch_calls(), vec![None, synced_at, None]);
        // re-indexing upserts: no duplicates
        assert_eq!(repo.get_stats().await.unwrap().entity_count, 4);
    }

    #[tokio::test]
    async fn test_connectors_without_permission_are_skipped() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let denied = Arc::new(InMemoryConnector::new(SourceType::Photos, vec![]).without_permission());
        let failing = Arc::new(InMemoryConnector::new(SourceType::Calendar, vec![]).denying_fetch());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(1)));
        let service = service(repo, generator(1), vec![denied, failing, documents], 10);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Completed);
        assert_eq!(done.processed_items, 1);
        assert_eq!(done.skipped_connectors, vec!["photos".to_string(), "calendar".to_string()]);
    }

    #[tokio::test]
    async fn test_generation_failure_fails_run_and_keeps_progress() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(4)));
        let service = service(repo.clone(), generator(4).fail_when("team2 "), vec![documents.clone()], 1);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("Generation error"));
        assert_eq!(done.processed_items, 2);
        assert_eq!(repo.get_stats().await.unwrap().entity_count, 4);
        assert!(documents.last_sync_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_skips_items() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        repo.add_entity(&GraphEntity::new("seed", "Seed", "PERSON", vec![1.0, 0.0, 0.0]))
            .await
            .unwrap();
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(2)));
        let service = service(repo, generator(2), vec![documents], 10);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Completed);
        assert_eq!(done.processed_items, 2);
        assert_eq!(done.failed_items, 2);
        assert_eq!(done.entities_stored, 0);
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_progress() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(5)));
        let generator = generator(5).with_delay(Duration::from_millis(20));
        let service = service(repo, generator, vec![documents], 1);

        service.start_indexing(false).await.unwrap();
        service.pause_indexing().unwrap();
        assert_eq!(service.progress().status, IndexingStatus::Paused);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let paused_at = service.progress().processed_items;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(service.progress().processed_items, paused_at);
        assert!(paused_at < 5);

        service.resume_indexing().unwrap();
        assert_eq!(service.progress().status, IndexingStatus::Running);
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Completed);
        assert_eq!(done.processed_items, 5);
    }

    #[tokio::test]
    async fn test_cancel_from_paused() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(5)));
        let service = service(repo, generator(5).with_delay(Duration::from_millis(20)), vec![documents.clone()], 1);

        service.start_indexing(false).await.unwrap();
        service.pause_indexing().unwrap();
        service.cancel_indexing().unwrap();
        assert_eq!(service.progress().status, IndexingStatus::Cancelled);

        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Cancelled);
        assert!(done.processed_items < 5);
        assert!(documents.last_sync_time().await.unwrap().is_none());

        // terminal: a new run may start
        service.start_indexing(false).await.unwrap();
        assert_eq!(service.wait_for_completion().await.status, IndexingStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(3)));
        let service = service(repo, generator(3).with_delay(Duration::from_millis(20)), vec![documents], 1);

        assert!(matches!(service.pause_indexing(), Err(GraphRagError::InvalidState(_))));
        assert!(matches!(service.resume_indexing(), Err(GraphRagError::InvalidState(_))));
        assert!(matches!(service.cancel_indexing(), Err(GraphRagError::InvalidState(_))));

        service.start_indexing(false).await.unwrap();
        assert!(matches!(service.start_indexing(false).await, Err(GraphRagError::InvalidState(_))));
        assert!(matches!(service.resume_indexing(), Err(GraphRagError::InvalidState(_))));
        service.cancel_indexing().unwrap();
        assert!(matches!(service.pause_indexing(), Err(GraphRagError::InvalidState(_))));
        service.wait_for_completion().await;
    }

    #[tokio::test]
    async fn test_progress_stream_is_monotonic() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(4)));
        let service = service(repo, generator(4).with_delay(Duration::from_millis(5)), vec![documents], 1);

        service.start_indexing(false).await.unwrap();
        let mut stream = service.progress_stream();
        let mut snapshots = Vec::new();
        while let Some(snapshot) = stream.next().await {
            let done = !snapshot.status.is_active();
            snapshots.push(snapshot);
            if done {
                break;
            }
        }

        assert!(snapshots
            .windows(2)
            .all(|w| w[1].processed_items >= w[0].processed_items && w[1].progress() >= w[0].progress()));
        assert_eq!(snapshots.last().unwrap().status, IndexingStatus::Completed);
        assert!(snapshots.iter().all(|s| s.status != IndexingStatus::Idle));
    }

    #[tokio::test]
    async fn test_worker_panic_reports_failed() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let exploding = Arc::new(InMemoryConnector::new(SourceType::Documents, vec![]).panicking_fetch());
        let service = service(repo, generator(0), vec![exploding], 1);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Failed);
        assert!(done.error.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_run() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(3)));
        let embedder = HashEmbedder::new(DIM).fail_when("Alpha1");
        let service = service_with_embedder(repo.clone(), generator(3), embedder, vec![documents.clone()], 1);

        service.start_indexing(false).await.unwrap();
        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Failed);
        assert!(done.error.as_deref().unwrap().contains("Embedding error"));
        assert_eq!(done.processed_items, 1);
        assert_eq!(repo.get_stats().await.unwrap().entity_count, 2);
        assert!(documents.last_sync_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_failing_call_stays_cancelled() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(1)));
        let generator = generator(1).fail_when("team0 ").with_delay(Duration::from_millis(50));
        let service = service(repo, generator, vec![documents], 1);

        service.start_indexing(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.cancel_indexing().unwrap();

        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Cancelled);
        assert!(done.error.is_none());
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_fetch_processes_nothing() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(
            InMemoryConnector::new(SourceType::Documents, docs(2)).with_fetch_delay(Duration::from_millis(50)),
        );
        let service = service(repo.clone(), generator(2), vec![documents.clone()], 1);

        service.start_indexing(false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.cancel_indexing().unwrap();

        let done = service.wait_for_completion().await;
        assert_eq!(done.status, IndexingStatus::Cancelled);
        assert_eq!(done.processed_items, 0);
        assert_eq!(documents.fetch_calls().len(), 1);
        assert_eq!(repo.get_stats().await.unwrap().entity_count, 0);
    }

    #[tokio::test]
    async fn test_while_idle_waits_for_cancelled_worker() {
        let repo = Arc::new(InMemoryGraphRepository::new());
        let documents = Arc::new(InMemoryConnector::new(SourceType::Documents, docs(1)));
        let service = service(repo.clone(), generator(1).with_delay(Duration::from_millis(100)), vec![documents], 1);

        service.start_indexing(false).await.unwrap();
        assert!(matches!(
            service.while_idle("clear", || async { Ok(()) }).await,
            Err(GraphRagError::InvalidState(_))
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        service.cancel_indexing().unwrap();

        // the item in flight lands before the closure runs
        let repo_in_closure = repo.clone();
        let seen = service
            .while_idle("clear", || async move { Ok(repo_in_closure.get_stats().await?.entity_count) })
            .await
            .unwrap();
        assert_eq!(seen, 2);
        assert_eq!(service.progress().status, IndexingStatus::Cancelled);
    }
}
