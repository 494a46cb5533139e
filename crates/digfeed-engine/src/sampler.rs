//! Random catalog sampling under a request budget.
//!
//! A sample costs one search page plus (optionally) one detail lookup. The
//! total count for a filter is probed once and cached; afterwards each draw
//! picks a random page inside the usable range, filters it against the seen
//! window and keeps a few leftovers in a per-filter pool so the next call can
//! skip the search entirely.

use crate::catalog::{CatalogApi, SearchHit};
use crate::error::{FeedError, Result};
use crate::pipeline::ItemSource;
use crate::retry::RetryPolicy;
use crate::seen::SeenSet;
use async_trait::async_trait;
use chrono::Utc;
use digfeed_proto::config::{CatalogConfig, NoveltyPolicy};
use digfeed_proto::protocol::{CatalogFilter, CatalogItem};
use digfeed_proto::state::{FeedStore, ProbeEntry};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

const SEEN_SCOPE: &str = "catalog";

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    pub per_page: u32,
    /// Safety ceiling on reachable pages.
    pub max_pages: u32,
    pub pool_depth: usize,
    pub seen_capacity: usize,
    pub probe_ttl: chrono::Duration,
    pub fetch_details: bool,
    pub novelty: NoveltyPolicy,
}

impl SamplerConfig {
    pub fn from_config(config: &CatalogConfig) -> Self {
        Self {
            per_page: config.per_page.max(1),
            max_pages: config.max_pages.max(1),
            pool_depth: config.pool_depth,
            seen_capacity: config.seen_capacity,
            probe_ttl: chrono::Duration::hours(config.probe_ttl_hours),
            fetch_details: config.fetch_details,
            novelty: config.novelty,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::from_config(&CatalogConfig::default())
    }
}

/// What a probe learned about a filter.
#[derive(Debug, Clone)]
pub struct Probe {
    pub total_items: u64,
    pub usable_pages: u32,
    /// Page 1 as fetched by the probe; `None` when restored from the store.
    pub first_page: Option<Arc<Vec<SearchHit>>>,
}

type ProbeCell = Arc<OnceCell<Result<Probe>>>;

pub struct RandomSampler {
    api: Arc<dyn CatalogApi>,
    retry: RetryPolicy,
    config: SamplerConfig,
    store: Arc<FeedStore>,
    probes: Mutex<HashMap<String, Probe>>,
    inflight: Mutex<HashMap<String, ProbeCell>>,
    pools: Mutex<HashMap<String, VecDeque<SearchHit>>>,
    seen: Mutex<SeenSet>,
}

impl RandomSampler {
    /// Build a sampler, restoring the seen window from `store`.
    pub async fn new(
        api: Arc<dyn CatalogApi>,
        retry: RetryPolicy,
        config: SamplerConfig,
        store: Arc<FeedStore>,
    ) -> Self {
        let seen = SeenSet::from_ids(config.seen_capacity, store.seen(SEEN_SCOPE).await);
        if !seen.is_empty() {
            info!("[sampler] Restored {} seen ids", seen.len());
        }
        Self {
            api,
            retry,
            config,
            store,
            probes: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
            seen: Mutex::new(seen),
        }
    }

    /// Return one catalog item matching `filter`, preferring ids outside the
    /// seen window.
    pub async fn sample(&self, filter: &CatalogFilter) -> Result<CatalogItem> {
        let key = filter.key();
        let hit = match self.take_pooled(&key).await {
            Some(hit) => {
                debug!("[sampler] Pool hit for {}", key);
                hit
            }
            None => self.draw(filter, &key).await?,
        };

        let item = self.hydrate(hit).await;
        self.mark_seen(&item.id).await;
        Ok(item)
    }

    /// Count probe for `filter`, deduplicated per key: concurrent callers
    /// share one in-flight request and its outcome.
    pub async fn probe(&self, filter: &CatalogFilter) -> Result<Probe> {
        let key = filter.key();
        let cell = {
            let mut inflight = self.inflight.lock().await;
            if let Some(probe) = self.probes.lock().await.get(&key) {
                return Ok(probe.clone());
            }
            Arc::clone(
                inflight
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let outcome = cell
            .get_or_init(|| self.run_probe(filter, &key))
            .await
            .clone();

        let mut inflight = self.inflight.lock().await;
        if let Ok(probe) = &outcome {
            self.probes.lock().await.insert(key.clone(), probe.clone());
        }
        if inflight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            inflight.remove(&key);
        }
        outcome
    }

    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }

    pub async fn pool_len(&self, filter: &CatalogFilter) -> usize {
        self.pools
            .lock()
            .await
            .get(&filter.key())
            .map_or(0, VecDeque::len)
    }

    async fn run_probe(&self, filter: &CatalogFilter, key: &str) -> Result<Probe> {
        if let Some(entry) = self.store.probe(key).await {
            if entry.total_items > 0 && entry.is_fresh(self.config.probe_ttl, Utc::now()) {
                debug!("[sampler] Using stored probe for {}", key);
                return Ok(Probe {
                    total_items: entry.total_items,
                    usable_pages: entry.total_pages.clamp(1, self.config.max_pages),
                    first_page: None,
                });
            }
        }

        let per_page = self.config.per_page;
        let page = self
            .retry
            .run("probe", || self.api.search(filter, 1, per_page))
            .await?;

        if page.total_items == 0 || page.hits.is_empty() {
            info!("[sampler] No catalog matches for {}", key);
            return Err(FeedError::NotFound(format!("no catalog matches for {}", key)));
        }

        let usable_pages = page.total_pages.clamp(1, self.config.max_pages);
        info!(
            "[sampler] Probed {}: {} items over {} pages ({} usable)",
            key, page.total_items, page.total_pages, usable_pages
        );

        let entry = ProbeEntry {
            total_items: page.total_items,
            total_pages: page.total_pages,
            fetched_at: Utc::now(),
        };
        if let Err(e) = self.store.set_probe(key, entry).await {
            warn!("[sampler] Failed to persist probe for {}: {}", key, e);
        }

        Ok(Probe {
            total_items: page.total_items,
            usable_pages,
            first_page: Some(Arc::new(page.hits)),
        })
    }

    async fn take_pooled(&self, key: &str) -> Option<SearchHit> {
        let mut pools = self.pools.lock().await;
        let pool = pools.get_mut(key)?;
        let seen = self.seen.lock().await;
        while let Some(hit) = pool.pop_front() {
            if !seen.contains(&hit.id) {
                return Some(hit);
            }
        }
        None
    }

    async fn draw(&self, filter: &CatalogFilter, key: &str) -> Result<SearchHit> {
        let probe = self.probe(filter).await?;
        let mut reprobes_left = match self.config.novelty {
            NoveltyPolicy::ReuseSeen => 0,
            NoveltyPolicy::Reprobe { attempts } => attempts,
        };

        loop {
            let hits = self.fetch_random_page(filter, &probe).await?;
            let fresh: Vec<SearchHit> = {
                let seen = self.seen.lock().await;
                hits.iter()
                    .filter(|h| !seen.contains(&h.id))
                    .cloned()
                    .collect()
            };

            if !fresh.is_empty() {
                return self.pick_and_pool(key, fresh).await;
            }

            if reprobes_left == 0 {
                debug!("[sampler] Every hit already seen for {}, reusing", key);
                return hits
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .ok_or_else(|| FeedError::NotFound(format!("empty page for {}", key)));
            }
            reprobes_left -= 1;
        }
    }

    async fn fetch_random_page(
        &self,
        filter: &CatalogFilter,
        probe: &Probe,
    ) -> Result<Vec<SearchHit>> {
        let page = rand::thread_rng().gen_range(1..=probe.usable_pages);
        if page == 1 {
            if let Some(first) = &probe.first_page {
                return Ok(first.to_vec());
            }
        }

        let per_page = self.config.per_page;
        match self
            .retry
            .run("page", || self.api.search(filter, page, per_page))
            .await
        {
            Ok(result) if !result.hits.is_empty() => Ok(result.hits),
            Ok(_) | Err(FeedError::NotFound(_)) => {
                warn!("[sampler] Page {} unavailable, falling back to probe page", page);
                self.fallback_page(filter, probe).await
            }
            Err(e) => Err(e),
        }
    }

    async fn fallback_page(&self, filter: &CatalogFilter, probe: &Probe) -> Result<Vec<SearchHit>> {
        if let Some(first) = &probe.first_page {
            return Ok(first.to_vec());
        }
        let per_page = self.config.per_page;
        let result = self
            .retry
            .run("page", || self.api.search(filter, 1, per_page))
            .await?;
        if result.hits.is_empty() {
            return Err(FeedError::NotFound(format!(
                "no catalog matches for {}",
                filter.key()
            )));
        }
        Ok(result.hits)
    }

    async fn pick_and_pool(&self, key: &str, mut fresh: Vec<SearchHit>) -> Result<SearchHit> {
        fresh.shuffle(&mut rand::thread_rng());
        let chosen = fresh
            .pop()
            .ok_or_else(|| FeedError::NotFound(format!("empty page for {}", key)))?;

        fresh.truncate(self.config.pool_depth);
        if !fresh.is_empty() {
            self.pools
                .lock()
                .await
                .entry(key.to_string())
                .or_default()
                .extend(fresh);
        }
        Ok(chosen)
    }

    /// Swap a search hit for the full record when detail lookups are on.
    /// A failed lookup degrades to the search fields.
    async fn hydrate(&self, hit: SearchHit) -> CatalogItem {
        if !self.config.fetch_details {
            return hit.into_item();
        }
        match self.retry.run("item", || self.api.item(&hit.id)).await {
            Ok(mut item) => {
                if item.cover_url.is_none() {
                    item.cover_url = hit.cover_url;
                }
                if item.detail_url.is_none() {
                    item.detail_url = hit.detail_url;
                }
                item
            }
            Err(e) => {
                warn!("[sampler] Detail lookup for {} failed: {}", hit.id, e);
                hit.into_item()
            }
        }
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
            warn!("[sampler] Failed to persist seen ids: {}", e);
        }
    }
}

/// `ItemSource` adapter binding a sampler to one filter.
pub struct CatalogSource {
    sampler: Arc<RandomSampler>,
    filter: CatalogFilter,
}

impl CatalogSource {
    pub fn new(sampler: Arc<RandomSampler>, filter: CatalogFilter) -> Self {
        Self { sampler, filter }
    }
}

#[async_trait]
impl ItemSource for CatalogSource {
    fn describe(&self) -> String {
        format!("catalog:{}", self.filter.key())
    }

    async fn next_item(&self) -> Result<CatalogItem> {
        self.sampler.sample(&self.filter).await
    }
}
