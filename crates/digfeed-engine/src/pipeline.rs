//! Two-stage producer/consumer buffer between slow catalog sampling and
//! fast consumption.
//!
//! Stage 1 keeps the raw queue topped up from an `ItemSource`; stage 2 turns
//! raw items into `ReadyRecord`s. Both loops are bound to the generation that
//! spawned them and stop writing as soon as `reset` or `stop` moves the
//! generation on.

use crate::error::{FeedError, Result};
use crate::resolver::{resolve_media, MediaResolver};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use digfeed_proto::config::{PipelineConfig, RetryConfig};
use digfeed_proto::protocol::{CatalogItem, FeedEvent, PipelineState, ReadyRecord};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// Consecutive unplayable items after which stage 1 gives up on the source.
const UNRESOLVABLE_STREAK_LIMIT: usize = 50;

/// Something that produces catalog items one at a time.
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Key reported in `NoResults`.
    fn describe(&self) -> String;

    async fn next_item(&self) -> Result<CatalogItem>;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub raw_target: usize,
    pub ready_target: usize,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    /// Applied to media resolution in stage 2.
    pub retry: RetryPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &PipelineConfig, retry: &RetryConfig) -> Self {
        Self {
            raw_target: config.raw_target.max(1),
            ready_target: config.ready_target.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry: RetryPolicy::new(retry),
        }
    }
}

#[derive(Default)]
struct Queues {
    state: PipelineState,
    raw: VecDeque<CatalogItem>,
    ready: VecDeque<ReadyRecord>,
}

pub struct ContentPipeline {
    settings: PipelineSettings,
    queues: Mutex<Queues>,
    generation: AtomicU64,
    ready_notify: Notify,
    events: broadcast::Sender<FeedEvent>,
}

impl ContentPipeline {
    pub fn new(settings: PipelineSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            settings,
            queues: Mutex::new(Queues::default()),
            generation: AtomicU64::new(0),
            ready_notify: Notify::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> PipelineState {
        self.queues.lock().await.state
    }

    pub async fn raw_len(&self) -> usize {
        self.queues.lock().await.raw.len()
    }

    pub async fn ready_len(&self) -> usize {
        self.queues.lock().await.ready.len()
    }

    fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit(&self, event: FeedEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Start a new session on `source`. Any loops from the previous
    /// generation become inert. Returns the new generation.
    pub async fn reset(
        self: &Arc<Self>,
        source: Arc<dyn ItemSource>,
        resolver: Arc<dyn MediaResolver>,
    ) -> u64 {
        let generation = {
            let mut queues = self.queues.lock().await;
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            queues.raw.clear();
            queues.ready.clear();
            queues.state = PipelineState::Running;
            generation
        };
        self.ready_notify.notify_waiters();
        info!(
            "[pipeline] Session {} started on {}",
            generation,
            source.describe()
        );
        self.emit(FeedEvent::SessionStarted { generation });

        let can_search = resolver.can_search();
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.fill_raw(generation, source, can_search).await });
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.fill_ready(generation, resolver).await });
        generation
    }

    /// Stop the session and wake every waiting consumer.
    pub async fn stop(&self) {
        let stopped = {
            let mut queues = self.queues.lock().await;
            if queues.state != PipelineState::Running {
                return;
            }
            queues.state = PipelineState::Stopped;
            queues.raw.clear();
            queues.ready.clear();
            self.generation.fetch_add(1, Ordering::SeqCst)
        };
        self.ready_notify.notify_waiters();
        info!("[pipeline] Session {} stopped", stopped);
        self.emit(FeedEvent::SessionStopped {
            generation: stopped,
        });
    }

    /// Next ready record, waiting while the pipeline runs. `None` once the
    /// pipeline is not running and nothing is buffered.
    pub async fn consume(&self) -> Option<ReadyRecord> {
        loop {
            let notified = self.ready_notify.notified();
            {
                let mut queues = self.queues.lock().await;
                if let Some(record) = queues.ready.pop_front() {
                    return Some(record);
                }
                if queues.state != PipelineState::Running {
                    return None;
                }
            }
            let _ = tokio::time::timeout(self.settings.poll_interval, notified).await;
        }
    }

    /// Stop because of a terminal condition, unless `generation` is already
    /// stale.
    async fn terminate(&self, generation: u64, event: FeedEvent) {
        {
            let mut queues = self.queues.lock().await;
            if !self.is_live(generation) {
                return;
            }
            queues.state = PipelineState::Stopped;
            queues.raw.clear();
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
        self.ready_notify.notify_waiters();
        error!("[pipeline] Session {} ended: {:?}", generation, event);
        self.emit(event);
    }

    async fn fill_raw(&self, generation: u64, source: Arc<dyn ItemSource>, can_search: bool) {
        let mut unresolvable = 0;
        while self.is_live(generation) {
            if self.raw_len().await >= self.settings.raw_target {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            }

            match source.next_item().await {
                Ok(item) => {
                    if !item.is_resolvable(can_search) {
                        debug!("[pipeline] Skipping unresolvable item {}", item.id);
                        unresolvable += 1;
                        if unresolvable >= UNRESOLVABLE_STREAK_LIMIT {
                            let criteria_key = source.describe();
                            self.terminate(generation, FeedEvent::NoResults { criteria_key })
                                .await;
                            break;
                        }
                        continue;
                    }
                    unresolvable = 0;
                    let mut queues = self.queues.lock().await;
                    if !self.is_live(generation) {
                        break;
                    }
                    debug!("[pipeline] Raw <- {} ({})", item.id, item.title);
                    queues.raw.push_back(item);
                }
                Err(FeedError::NotFound(_)) => {
                    let criteria_key = source.describe();
                    self.terminate(generation, FeedEvent::NoResults { criteria_key })
                        .await;
                    break;
                }
                Err(e) if e.disables_source() || matches!(e, FeedError::SourcesUnavailable(_)) => {
                    let reason = e.to_string();
                    self.terminate(generation, FeedEvent::SourcesUnavailable { reason })
                        .await;
                    break;
                }
                Err(e) => {
                    warn!(
                        "[pipeline] Sampling failed ({}), retrying in {:?}",
                        e, self.settings.retry_delay
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
            }
        }
        debug!("[pipeline] Stage 1 of session {} exited", generation);
    }

    async fn fill_ready(&self, generation: u64, resolver: Arc<dyn MediaResolver>) {
        loop {
            let next = {
                let mut queues = self.queues.lock().await;
                if !self.is_live(generation) {
                    break;
                }
                if queues.ready.len() < self.settings.ready_target {
                    queues.raw.pop_front()
                } else {
                    None
                }
            };
            let Some(item) = next else {
                tokio::time::sleep(self.settings.poll_interval).await;
                continue;
            };

            let label = format!("resolve {}", item.id);
            let resolved = self
                .settings
                .retry
                .run(&label, || resolve_media(&item, resolver.as_ref()))
                .await;
            match resolved {
                Ok(media) => {
                    {
                        let mut queues = self.queues.lock().await;
                        if !self.is_live(generation) {
                            break;
                        }
                        queues.ready.push_back(ReadyRecord { item, media });
                    }
                    self.ready_notify.notify_waiters();
                }
                Err(FeedError::NotFound(_)) => {
                    debug!("[pipeline] No media for {}, dropped", item.id);
                }
                Err(e) if e.disables_source() => {
                    let reason = format!("media search: {}", e);
                    self.terminate(generation, FeedEvent::SourcesUnavailable { reason })
                        .await;
                    break;
                }
                Err(e) => {
                    warn!("[pipeline] Resolving {} failed, dropped: {}", item.id, e);
                }
            }
        }
        debug!("[pipeline] Stage 2 of session {} exited", generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::NoSearch;
    use digfeed_proto::protocol::{MediaRef, SourceKind};
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Media {
        Embedded,
        /// No embedded ids; only search can resolve the item.
        SearchOnly,
        /// Embedded on even calls, nothing to resolve on odd calls.
        Alternating,
    }

    /// Source producing `<prefix>-<n>` items, with an optional per-call delay
    /// and scripted failures for the first calls.
    struct ScriptedSource {
        prefix: &'static str,
        delay: Duration,
        media: Media,
        failures: std::sync::Mutex<VecDeque<FeedError>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(prefix: &'static str) -> Self {
            Self {
                prefix,
                delay: Duration::ZERO,
                media: Media::Embedded,
                failures: std::sync::Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn with_media(mut self, media: Media) -> Self {
            self.media = media;
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn failing(self, errors: Vec<FeedError>) -> Self {
            self.failures.lock().unwrap().extend(errors);
            self
        }
    }

    #[async_trait]
    impl ItemSource for ScriptedSource {
        fn describe(&self) -> String {
            format!("test:{}", self.prefix)
        }

        async fn next_item(&self) -> Result<CatalogItem> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            let id = format!("{}-{}", self.prefix, n);
            let embedded = match self.media {
                Media::Embedded => true,
                Media::SearchOnly => false,
                Media::Alternating => n % 2 == 0,
            };
            let title = match self.media {
                Media::Alternating if !embedded => String::new(),
                _ => format!("Title {}", n),
            };
            Ok(CatalogItem {
                id: id.clone(),
                source: SourceKind::Catalog,
                title,
                artist: String::new(),
                year: None,
                cover_url: None,
                detail_url: None,
                media_ids: if embedded {
                    vec![format!("m{}", id)]
                } else {
                    Vec::new()
                },
                collection_id: None,
            })
        }
    }

    /// Search that answers `v:<query>` after failing with scripted errors;
    /// `always` repeats its error forever.
    #[derive(Default)]
    struct ScriptedSearch {
        failures: std::sync::Mutex<VecDeque<FeedError>>,
        always: Option<FeedError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaResolver for ScriptedSearch {
        async fn search(&self, query: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.always {
                return Err(e.clone());
            }
            if let Some(e) = self.failures.lock().unwrap().pop_front() {
                return Err(e);
            }
            Ok(Some(format!("v:{}", query)))
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            raw_target: 15,
            ready_target: 5,
            poll_interval: Duration::from_millis(200),
            retry_delay: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: 3,
                rate_limit_base: Duration::from_secs(1),
                transient_base: Duration::from_millis(100),
                multiplier: 2.0,
                max_backoff: Duration::from_secs(2),
            },
        }
    }

    fn pipeline() -> Arc<ContentPipeline> {
        Arc::new(ContentPipeline::new(settings()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_yields_resolved_records() {
        let pipeline = pipeline();
        pipeline
            .reset(Arc::new(ScriptedSource::new("a")), Arc::new(NoSearch))
            .await;

        let record = pipeline.consume().await.unwrap();
        assert_eq!(record.item.id, "a-0");
        assert_eq!(record.media, MediaRef::Single("ma-0".into()));
        assert_eq!(pipeline.state().await, PipelineState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_discards_previous_generation() {
        let pipeline = pipeline();
        let slow = Arc::new(ScriptedSource::new("old").with_delay(Duration::from_millis(300)));
        let first = pipeline.reset(slow, Arc::new(NoSearch)).await;

        // Let the old session buffer some records and leave a call in flight
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(pipeline.ready_len().await > 0);

        let second = pipeline
            .reset(Arc::new(ScriptedSource::new("new")), Arc::new(NoSearch))
            .await;
        assert_eq!(second, first + 1);
        assert_eq!(pipeline.generation(), second);

        for _ in 0..10 {
            let record = pipeline.consume().await.unwrap();
            assert!(record.item.id.starts_with("new-"), "stale record {}", record.item.id);
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        while pipeline.ready_len().await > 0 {
            let record = pipeline.consume().await.unwrap();
            assert!(record.item.id.starts_with("new-"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_two_drains_when_raw_is_full() {
        let pipeline = pipeline();
        let source = Arc::new(ScriptedSource::new("a"));
        pipeline.reset(source.clone(), Arc::new(NoSearch)).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.raw_len().await, 15);
        assert_eq!(pipeline.ready_len().await, 5);
        assert_eq!(source.calls.load(Ordering::SeqCst), 20);

        pipeline.consume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pipeline.ready_len().await, 5);
        assert_eq!(pipeline.raw_len().await, 15);
        assert_eq!(source.calls.load(Ordering::SeqCst), 21);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_is_terminal() {
        let pipeline = pipeline();
        let mut events = pipeline.subscribe();
        let source = Arc::new(
            ScriptedSource::new("a").failing(vec![FeedError::NotFound("zero matches".into())]),
        );
        let generation = pipeline.reset(source.clone(), Arc::new(NoSearch)).await;

        assert_eq!(events.recv().await.unwrap(), FeedEvent::SessionStarted { generation });
        assert_eq!(
            events.recv().await.unwrap(),
            FeedEvent::NoResults {
                criteria_key: "test:a".into()
            }
        );
        assert_eq!(pipeline.consume().await, None);
        assert_eq!(pipeline.state().await, PipelineState::Stopped);

        // No automatic retry
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_failure_is_sources_unavailable() {
        let pipeline = pipeline();
        let mut events = pipeline.subscribe();
        let source = Arc::new(
            ScriptedSource::new("a").failing(vec![FeedError::QuotaExceeded("daily".into())]),
        );
        pipeline.reset(source, Arc::new(NoSearch)).await;

        events.recv().await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, FeedEvent::SourcesUnavailable { .. }));
        assert!(event.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let pipeline = pipeline();
        let source = Arc::new(ScriptedSource::new("a").failing(vec![
            FeedError::Transient("timeout".into()),
            FeedError::RateLimited { retry_after: None },
        ]));
        pipeline.reset(source, Arc::new(NoSearch)).await;

        let record = pipeline.consume().await.unwrap();
        assert_eq!(record.item.id, "a-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_waiting_consumer() {
        let pipeline = pipeline();
        let source = Arc::new(ScriptedSource::new("a").with_delay(Duration::from_secs(3600)));
        pipeline.reset(source, Arc::new(NoSearch)).await;

        let waiter = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.consume().await })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        pipeline.stop().await;

        assert_eq!(waiter.await.unwrap(), None);
        assert_eq!(pipeline.state().await, PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_search_failure_is_retried_in_order() {
        let pipeline = pipeline();
        let search = Arc::new(ScriptedSearch::default());
        search
            .failures
            .lock()
            .unwrap()
            .push_back(FeedError::Transient("503".into()));
        let source = Arc::new(ScriptedSource::new("a").with_media(Media::SearchOnly));
        pipeline.reset(source, search.clone()).await;

        let first = pipeline.consume().await.unwrap();
        assert_eq!(first.item.id, "a-0");
        assert_eq!(first.media, MediaRef::Single("v:Title 0".into()));
        assert_eq!(pipeline.consume().await.unwrap().item.id, "a-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_quota_ends_session() {
        let pipeline = pipeline();
        let mut events = pipeline.subscribe();
        let search = Arc::new(ScriptedSearch {
            always: Some(FeedError::QuotaExceeded("daily".into())),
            ..Default::default()
        });
        let source = Arc::new(ScriptedSource::new("a").with_media(Media::SearchOnly));
        pipeline.reset(source.clone(), search.clone()).await;

        events.recv().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            FeedEvent::SourcesUnavailable { .. }
        ));
        assert_eq!(pipeline.state().await, PipelineState::Stopped);
        assert_eq!(pipeline.consume().await, None);

        // Quota is not retried, and sampling stops with the session
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        let sampled = source.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), sampled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_only_items_without_search_end_session() {
        let pipeline = pipeline();
        let mut events = pipeline.subscribe();
        let source = Arc::new(ScriptedSource::new("a").with_media(Media::SearchOnly));
        pipeline.reset(source.clone(), Arc::new(NoSearch)).await;

        events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            FeedEvent::NoResults {
                criteria_key: "test:a".into()
            }
        );
        assert_eq!(pipeline.raw_len().await, 0);
        assert_eq!(
            source.calls.load(Ordering::SeqCst),
            UNRESOLVABLE_STREAK_LIMIT
        );
        assert_eq!(pipeline.consume().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stage_one_skips_unresolvable_items() {
        let pipeline = pipeline();
        let source = Arc::new(ScriptedSource::new("a").with_media(Media::Alternating));
        pipeline.reset(source, Arc::new(NoSearch)).await;

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(pipeline.consume().await.unwrap().item.id);
        }
        assert_eq!(ids, vec!["a-0", "a-2", "a-4"]);
        assert_eq!(pipeline.state().await, PipelineState::Running);
    }

    #[tokio::test]
    async fn test_consume_on_idle_pipeline_ends_immediately() {
        let pipeline = pipeline();
        assert_eq!(pipeline.state().await, PipelineState::Idle);
        assert_eq!(pipeline.consume().await, None);
    }
}
