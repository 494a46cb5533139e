//! Channel-mode sampling over a small fixed set of video channels.
//!
//! Two upstream listings exist per channel: a free Atom feed that only
//! carries the newest entries, and a quota-charged paginated listing that
//! reaches the whole upload history. Sampling reads from a local archive;
//! the free feed seeds it and a background archiver extends it one page per
//! source per round.

use crate::client::RateLimitedClient;
use crate::error::{FeedError, Result};
use crate::pipeline::ItemSource;
use crate::retry::RetryPolicy;
use crate::seen::SeenSet;
use async_trait::async_trait;
use digfeed_proto::config::{ChannelSource, ChannelsConfig};
use digfeed_proto::protocol::{CatalogItem, SourceKind};
use digfeed_proto::state::{ChannelArchive, FeedStore};
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SEEN_SCOPE: &str = "channels";
const LISTING_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub items: Vec<CatalogItem>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait ChannelApi: Send + Sync {
    /// Newest entries from the free feed. Costs no quota.
    async fn recent(&self, channel_id: &str) -> Result<Vec<CatalogItem>>;

    /// One page of the full upload listing. Costs quota.
    async fn list_page(&self, channel_id: &str, page_token: Option<&str>) -> Result<ListingPage>;
}

// ── wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    id: String,
    #[serde(rename = "yt:videoId", alias = "videoId", default)]
    video_id: Option<String>,
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: Option<AtomAuthor>,
    #[serde(default)]
    published: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomAuthor {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    snippet: PlaylistSnippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistSnippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel_title: String,
    #[serde(default)]
    published_at: Option<String>,
    resource_id: ResourceId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    #[serde(default)]
    video_id: Option<String>,
}

// ── client ───────────────────────────────────────────────────────────────────

pub struct YouTubeChannels {
    client: RateLimitedClient,
    feed_base: String,
    api_base: String,
    api_key: Option<String>,
    free_feed_cap: usize,
}

impl YouTubeChannels {
    pub fn new(client: RateLimitedClient, config: &ChannelsConfig) -> Self {
        Self {
            client,
            feed_base: config.feed_base.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            free_feed_cap: config.free_feed_cap,
        }
    }
}

#[async_trait]
impl ChannelApi for YouTubeChannels {
    async fn recent(&self, channel_id: &str) -> Result<Vec<CatalogItem>> {
        let xml = self
            .client
            .get_text(&self.feed_base, &[("channel_id", channel_id.to_string())])
            .await?;
        let feed: AtomFeed = quick_xml::de::from_str(&xml)
            .map_err(|e| FeedError::Decode(format!("channel feed {}: {}", channel_id, e)))?;

        Ok(feed
            .entries
            .into_iter()
            .filter_map(|entry| item_from_entry(channel_id, entry))
            .take(self.free_feed_cap)
            .collect())
    }

    async fn list_page(&self, channel_id: &str, page_token: Option<&str>) -> Result<ListingPage> {
        let Some(key) = &self.api_key else {
            return Err(FeedError::Auth("no video API key configured".into()));
        };
        let url = format!("{}/playlistItems", self.api_base);
        let mut query = vec![
            ("part", "snippet".to_string()),
            ("playlistId", uploads_playlist_id(channel_id)),
            ("maxResults", LISTING_PAGE_SIZE.to_string()),
            ("key", key.clone()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response: PlaylistItemsResponse = self.client.get_json(&url, &query).await?;
        Ok(ListingPage {
            items: response
                .items
                .into_iter()
                .filter_map(|item| item_from_snippet(channel_id, item.snippet))
                .collect(),
            next_page_token: response.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

/// "UCxxxx" channel id -> "UUxxxx" uploads playlist id.
fn uploads_playlist_id(channel_id: &str) -> String {
    match channel_id.strip_prefix("UC") {
        Some(rest) => format!("UU{}", rest),
        None => channel_id.to_string(),
    }
}

fn video_item(
    channel_id: &str,
    video_id: String,
    title: String,
    artist: String,
    published: Option<&str>,
) -> CatalogItem {
    CatalogItem {
        source: SourceKind::Channel {
            channel_id: channel_id.to_string(),
        },
        title,
        artist,
        year: published
            .and_then(|p| p.get(..4))
            .and_then(|y| y.parse().ok()),
        cover_url: Some(format!("https://i.ytimg.com/vi/{}/hqdefault.jpg", video_id)),
        detail_url: Some(format!("https://www.youtube.com/watch?v={}", video_id)),
        media_ids: vec![video_id.clone()],
        collection_id: None,
        id: video_id,
    }
}

fn item_from_entry(channel_id: &str, entry: AtomEntry) -> Option<CatalogItem> {
    let video_id = entry
        .video_id
        .filter(|v| !v.is_empty())
        .or_else(|| entry.id.strip_prefix("yt:video:").map(str::to_string))?;
    Some(video_item(
        channel_id,
        video_id,
        entry.title,
        entry.author.map(|a| a.name).unwrap_or_default(),
        entry.published.as_deref(),
    ))
}

fn item_from_snippet(channel_id: &str, snippet: PlaylistSnippet) -> Option<CatalogItem> {
    let video_id = snippet.resource_id.video_id.filter(|v| !v.is_empty())?;
    Some(video_item(
        channel_id,
        video_id,
        snippet.title,
        snippet.channel_title,
        snippet.published_at.as_deref(),
    ))
}

// ── aggregator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub sources: Vec<ChannelSource>,
    pub page_delay: Duration,
    pub seen_capacity: usize,
}

impl AggregatorConfig {
    pub fn from_config(config: &ChannelsConfig) -> Self {
        Self {
            sources: config.sources.clone(),
            page_delay: Duration::from_millis(config.archive_page_delay_ms),
            seen_capacity: config.seen_capacity,
        }
    }
}

/// Why the archiver stopped calling a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Halt {
    /// Listing reached its last page. Persisted with the archive.
    Exhausted,
    /// Auth or quota failure. Lasts for the process lifetime.
    Disabled(String),
}

pub struct ChannelAggregator {
    api: Arc<dyn ChannelApi>,
    retry: RetryPolicy,
    config: AggregatorConfig,
    store: Arc<FeedStore>,
    archives: Mutex<HashMap<String, ChannelArchive>>,
    halted: Mutex<HashMap<String, Halt>>,
    seen: Mutex<SeenSet>,
    initialized: OnceCell<()>,
}

impl ChannelAggregator {
    pub async fn new(
        api: Arc<dyn ChannelApi>,
        retry: RetryPolicy,
        config: AggregatorConfig,
        store: Arc<FeedStore>,
    ) -> Self {
        let seen = SeenSet::from_ids(config.seen_capacity, store.seen(SEEN_SCOPE).await);
        Self {
            api,
            retry,
            config,
            store,
            archives: Mutex::new(HashMap::new()),
            halted: Mutex::new(HashMap::new()),
            seen: Mutex::new(seen),
            initialized: OnceCell::new(),
        }
    }

    pub fn sources(&self) -> &[ChannelSource] {
        &self.config.sources
    }

    /// Load persisted archives and seed empty ones from the free feed.
    /// Runs once; later calls return immediately.
    pub async fn initialize(&self) {
        self.initialized.get_or_init(|| self.load_sources()).await;
    }

    async fn load_sources(&self) {
        for source in &self.config.sources {
            let archive = self.store.archive(&source.id).await.unwrap_or_default();
            if archive.exhausted {
                self.halted
                    .lock()
                    .await
                    .insert(source.id.clone(), Halt::Exhausted);
            }
            let cached = archive.items.len();
            self.archives.lock().await.insert(source.id.clone(), archive);

            if cached > 0 {
                debug!("[channels] {} restored with {} items", source.name, cached);
            } else {
                self.seed_from_feed(source).await;
            }
        }
        info!(
            "[channels] Initialized {} sources ({} with content)",
            self.config.sources.len(),
            self.sources_with_content().await
        );
    }

    async fn seed_from_feed(&self, source: &ChannelSource) -> usize {
        match self
            .retry
            .run("channel feed", || self.api.recent(&source.id))
            .await
        {
            Ok(items) => {
                let added = self.merge_into_archive(&source.id, items, None).await;
                debug!("[channels] {} seeded with {} feed items", source.name, added);
                added
            }
            Err(e) if e.disables_source() => {
                self.halt(&source.id, Halt::Disabled(e.to_string())).await;
                0
            }
            Err(e) => {
                warn!("[channels] Feed for {} failed: {}", source.name, e);
                0
            }
        }
    }

    /// Merge items (and optionally listing progress) into an archive and
    /// persist it. Returns how many ids were new.
    async fn merge_into_archive(
        &self,
        channel_id: &str,
        items: Vec<CatalogItem>,
        progress: Option<Option<String>>,
    ) -> usize {
        let (added, snapshot) = {
            let mut archives = self.archives.lock().await;
            let archive = archives.entry(channel_id.to_string()).or_default();
            let added = archive.merge(items);
            if let Some(next) = progress {
                archive.exhausted = next.is_none();
                archive.next_page_token = next;
            }
            (added, archive.clone())
        };
        if let Err(e) = self.store.set_archive(channel_id, snapshot).await {
            warn!("[channels] Failed to persist archive for {}: {}", channel_id, e);
        }
        added
    }

    async fn halt(&self, channel_id: &str, reason: Halt) {
        match &reason {
            Halt::Exhausted => info!("[channels] {} archive complete", channel_id),
            Halt::Disabled(why) => warn!("[channels] Disabling {}: {}", channel_id, why),
        }
        self.halted.lock().await.insert(channel_id.to_string(), reason);
    }

    pub async fn halt_reason(&self, channel_id: &str) -> Option<Halt> {
        self.halted.lock().await.get(channel_id).cloned()
    }

    pub async fn archive_len(&self, channel_id: &str) -> usize {
        self.archives
            .lock()
            .await
            .get(channel_id)
            .map_or(0, |a| a.items.len())
    }

    async fn sources_with_content(&self) -> usize {
        self.archives
            .lock()
            .await
            .values()
            .filter(|a| !a.items.is_empty())
            .count()
    }

    pub async fn has_any_content(&self) -> bool {
        self.sources_with_content().await > 0
    }

    /// One archiver round: fetch the next listing page for every source that
    /// is neither halted nor complete, pausing between pages. Returns the
    /// number of sources still active, or `None` when cancelled.
    pub async fn archive_round(&self, cancel: &CancellationToken) -> Option<usize> {
        let mut active = 0;
        for source in &self.config.sources {
            if self.halted.lock().await.contains_key(&source.id) {
                continue;
            }
            let token = self
                .archives
                .lock()
                .await
                .get(&source.id)
                .and_then(|a| a.next_page_token.clone());

            match self
                .retry
                .run("channel listing", || {
                    self.api.list_page(&source.id, token.as_deref())
                })
                .await
            {
                Ok(page) => {
                    let next = page.next_page_token;
                    let done = next.is_none();
                    let added = self
                        .merge_into_archive(&source.id, page.items, Some(next))
                        .await;
                    debug!("[channels] {} archive +{} items", source.name, added);
                    if done {
                        self.halt(&source.id, Halt::Exhausted).await;
                    } else {
                        active += 1;
                    }
                }
                Err(e) if e.disables_source() => {
                    self.halt(&source.id, Halt::Disabled(e.to_string())).await;
                }
                Err(e) => {
                    warn!("[channels] Listing for {} failed: {}", source.name, e);
                    active += 1;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.config.page_delay) => {}
            }
        }
        Some(active)
    }

    /// Extend archives in the background until every source is halted or
    /// `cancel` fires.
    pub fn spawn_archiver(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            aggregator.initialize().await;
            info!("[channels] Archiver started");
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                match aggregator.archive_round(&cancel).await {
                    Some(0) => {
                        info!("[channels] Archiver finished, no active sources");
                        break;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            debug!("[channels] Archiver stopped");
        })
    }

    /// Uniform over sources with cached items, then uniform over that
    /// source's unseen items (falling back to seen ones).
    pub async fn sample(&self) -> Result<CatalogItem> {
        self.initialize().await;
        if !self.has_any_content().await {
            for source in &self.config.sources {
                if !self.halted.lock().await.contains_key(&source.id) {
                    self.seed_from_feed(source).await;
                }
            }
        }

        let picked = {
            let archives = self.archives.lock().await;
            let seen = self.seen.lock().await;
            let stocked: Vec<&ChannelArchive> = self
                .config
                .sources
                .iter()
                .filter_map(|s| archives.get(&s.id))
                .filter(|a| !a.items.is_empty())
                .collect();
            stocked
                .choose(&mut rand::thread_rng())
                .and_then(|archive| pick_item(archive, &seen))
        };

        let item = picked.ok_or_else(|| {
            FeedError::SourcesUnavailable("no channel has any cached items".into())
        })?;
        self.mark_seen(&item.id).await;
        Ok(item)
    }

    /// Sample one specific source, filling its archive on demand: free feed
    /// first, then one listing page.
    pub async fn sample_source(&self, channel_id: &str) -> Result<CatalogItem> {
        self.initialize().await;
        let source = self
            .config
            .sources
            .iter()
            .find(|s| s.id == channel_id)
            .ok_or_else(|| FeedError::NotFound(format!("unknown channel {}", channel_id)))?;

        if self.archive_len(channel_id).await == 0
            && self.seed_from_feed(source).await == 0
            && !self.halted.lock().await.contains_key(channel_id)
        {
            match self
                .retry
                .run("channel listing", || self.api.list_page(channel_id, None))
                .await
            {
                Ok(page) => {
                    let next = page.next_page_token;
                    self.merge_into_archive(channel_id, page.items, Some(next))
                        .await;
                }
                Err(e) if e.disables_source() => {
                    self.halt(channel_id, Halt::Disabled(e.to_string())).await;
                }
                Err(e) => return Err(e),
            }
        }

        let picked = {
            let archives = self.archives.lock().await;
            let seen = self.seen.lock().await;
            archives
                .get(channel_id)
                .and_then(|archive| pick_item(archive, &seen))
        };
        let item = picked.ok_or_else(|| {
            FeedError::SourcesUnavailable(format!("{} has no items", source.name))
        })?;
        self.mark_seen(&item.id).await;
        Ok(item)
    }

    async fn mark_seen(&self, id: &str) {
        let snapshot = {
            let mut seen = self.seen.lock().await;
            if !seen.insert(id.to_string()) {
                return;
            }
            seen.to_vec()
        };
        if let Err(e) = self.store.set_seen(SEEN_SCOPE, snapshot).await {
            warn!("[channels] Failed to persist seen ids: {}", e);
        }
    }
}

fn pick_item(archive: &ChannelArchive, seen: &SeenSet) -> Option<CatalogItem> {
    let mut rng = rand::thread_rng();
    let unseen: Vec<&CatalogItem> = archive
        .items
        .iter()
        .filter(|i| !seen.contains(&i.id))
        .collect();
    match unseen.choose(&mut rng) {
        Some(item) => Some((*item).clone()),
        None => archive.items.choose(&mut rng).cloned(),
    }
}

/// `ItemSource` adapter for channel mode.
pub struct ChannelFeed {
    aggregator: Arc<ChannelAggregator>,
}

impl ChannelFeed {
    pub fn new(aggregator: Arc<ChannelAggregator>) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl ItemSource for ChannelFeed {
    fn describe(&self) -> String {
        "channels".to_string()
    }

    async fn next_item(&self) -> Result<CatalogItem> {
        self.aggregator.sample().await
    }
}
