//! One feed session: the samplers, the pipeline and the window wired
//! together, plus the bookkeeping the HTTP API reports.

use crate::embed::{EmbedFactory, EmbedPlayer};
use anyhow::Context;
use digfeed_engine::channels::AggregatorConfig;
use digfeed_engine::window::{PositionOutOfRange, WindowSnapshot};
use digfeed_engine::{
    CatalogSource, ChannelAggregator, ChannelFeed, ContentPipeline, DiscogsCatalog, FeedError,
    MediaResolver, NoSearch, PipelineSettings, RandomSampler, RateLimitedClient, RetryPolicy,
    SamplerConfig, WindowSettings, WindowedResourceCache, YouTubeChannels, YouTubeSearch,
};
use digfeed_proto::config::Config;
use digfeed_proto::protocol::{CatalogFilter, Criteria, FeedEvent, PipelineState, ReadyRecord};
use digfeed_proto::state::FeedStore;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub criteria: Option<Criteria>,
    pub pipeline_state: PipelineState,
    pub generation: u64,
    pub raw_len: usize,
    pub ready_len: usize,
    pub window: WindowSnapshot,
    pub players: Vec<EmbedPlayer>,
    pub last_terminal_event: Option<FeedEvent>,
}

#[derive(Default)]
struct Status {
    criteria: Option<Criteria>,
    last_terminal_event: Option<FeedEvent>,
}

pub struct FeedSession {
    sampler: Arc<RandomSampler>,
    channels: Arc<ChannelAggregator>,
    resolver: Arc<dyn MediaResolver>,
    pipeline: Arc<ContentPipeline>,
    window: Arc<WindowedResourceCache<EmbedFactory>>,
    embeds: Arc<EmbedFactory>,
    archiver: Mutex<Option<CancellationToken>>,
    status: RwLock<Status>,
}

impl FeedSession {
    pub async fn new(config: &Config, store: Arc<FeedStore>) -> anyhow::Result<Self> {
        let retry = RetryPolicy::new(&config.retry);

        let mut catalog_client = RateLimitedClient::new(
            &config.catalog.user_agent,
            Duration::from_millis(config.catalog.min_interval_ms),
        )
        .context("building catalog client")?;
        if let Some(token) = config.catalog.token.as_deref().filter(|t| !t.is_empty()) {
            catalog_client = catalog_client.with_authorization(format!("Discogs token={}", token));
        }
        let catalog = DiscogsCatalog::new(catalog_client, config.catalog.api_base.clone());
        let sampler = RandomSampler::new(
            Arc::new(catalog),
            retry.clone(),
            SamplerConfig::from_config(&config.catalog),
            Arc::clone(&store),
        )
        .await;

        let video_client = RateLimitedClient::new(
            &config.catalog.user_agent,
            Duration::from_millis(config.channels.min_interval_ms),
        )
        .context("building video client")?;
        let resolver: Arc<dyn MediaResolver> = match config.channels.api_key.as_deref() {
            Some(key) if !key.is_empty() => Arc::new(YouTubeSearch::new(
                video_client.clone(),
                &config.channels.api_base,
                key,
            )),
            _ => {
                info!("No video API key configured, media search disabled");
                Arc::new(NoSearch)
            }
        };
        let channels = ChannelAggregator::new(
            Arc::new(YouTubeChannels::new(video_client, &config.channels)),
            retry,
            AggregatorConfig::from_config(&config.channels),
            store,
        )
        .await;

        let pipeline = Arc::new(ContentPipeline::new(PipelineSettings::from_config(
            &config.pipeline,
            &config.retry,
        )));
        let embeds = Arc::new(EmbedFactory::new());
        let window = WindowedResourceCache::new(
            Arc::clone(&embeds),
            pipeline.clone(),
            WindowSettings::from_config(&config.window),
        );

        Ok(Self {
            sampler: Arc::new(sampler),
            channels: Arc::new(channels),
            resolver,
            pipeline,
            window: Arc::new(window),
            embeds,
            archiver: Mutex::new(None),
            status: RwLock::new(Status::default()),
        })
    }

    pub async fn start_catalog(&self, filter: CatalogFilter) -> u64 {
        let criteria = Criteria::Catalog(filter.clone());
        info!("Starting catalog feed: {}", criteria.key());
        let source = Arc::new(CatalogSource::new(Arc::clone(&self.sampler), filter));
        self.begin(criteria, source).await
    }

    /// Channel mode. Initializes the aggregator and the background archiver
    /// on first use.
    pub async fn start_channels(&self) -> digfeed_engine::Result<u64> {
        if self.channels.sources().is_empty() {
            return Err(FeedError::SourcesUnavailable(
                "no channel sources configured".into(),
            ));
        }
        self.channels.initialize().await;
        {
            let mut archiver = self.archiver.lock().await;
            if archiver.is_none() {
                let cancel = CancellationToken::new();
                let _ = self.channels.spawn_archiver(cancel.clone());
                *archiver = Some(cancel);
            }
        }
        if !self.channels.has_any_content().await {
            return Err(FeedError::SourcesUnavailable(
                "no channel returned any items".into(),
            ));
        }

        info!("Starting channel feed");
        let source = Arc::new(ChannelFeed::new(Arc::clone(&self.channels)));
        Ok(self.begin(Criteria::Channels, source).await)
    }

    async fn begin(&self, criteria: Criteria, source: Arc<dyn digfeed_engine::ItemSource>) -> u64 {
        self.window.clear().await;
        if matches!(criteria, Criteria::Catalog(_)) {
            self.cancel_archiver().await;
        }
        {
            let mut status = self.status.write().await;
            status.criteria = Some(criteria);
            status.last_terminal_event = None;
        }
        self.pipeline
            .reset(source, Arc::clone(&self.resolver))
            .await
    }

    pub async fn stop(&self) {
        self.pipeline.stop().await;
        self.window.clear().await;
        self.cancel_archiver().await;
        self.status.write().await.criteria = None;
    }

    async fn cancel_archiver(&self) {
        if let Some(cancel) = self.archiver.lock().await.take() {
            info!("Stopping channel archiver");
            cancel.cancel();
        }
    }

    /// Pull one record straight from the pipeline, bypassing the window.
    pub async fn next_record(&self) -> Option<ReadyRecord> {
        self.pipeline.consume().await
    }

    pub async fn set_position(
        &self,
        index: usize,
    ) -> Result<WindowSnapshot, PositionOutOfRange> {
        self.window.set_position(index).await
    }

    /// Natural end of playback: advance to the suggested next slot.
    pub async fn playback_ended(
        &self,
        index: usize,
    ) -> Result<WindowSnapshot, PositionOutOfRange> {
        let next = self.window.playback_ended(index);
        self.window.set_position(next).await
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let status = self.status.read().await;
        SessionSnapshot {
            criteria: status.criteria.clone(),
            pipeline_state: self.pipeline.state().await,
            generation: self.pipeline.generation(),
            raw_len: self.pipeline.raw_len().await,
            ready_len: self.pipeline.ready_len().await,
            window: self.window.snapshot().await,
            players: self.embeds.players(),
            last_terminal_event: status.last_terminal_event.clone(),
        }
    }

    /// Event loop: records terminal events for the state snapshot.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut pipeline_rx = self.pipeline.subscribe();
        let mut window_rx = self.window.subscribe();
        loop {
            let received = tokio::select! {
                r = pipeline_rx.recv() => r,
                r = window_rx.recv() => r,
            };
            match received {
                Ok(event) => self.handle_event(event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event loop missed {} feed events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok(())
    }

    async fn handle_event(&self, event: FeedEvent) {
        debug!("Feed event: {:?}", event);
        if event.is_terminal() {
            self.status.write().await.last_terminal_event = Some(event);
        }
    }
}
