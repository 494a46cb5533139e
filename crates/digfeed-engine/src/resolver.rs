//! Turning a catalog item into something playable.

use crate::client::RateLimitedClient;
use crate::error::{FeedError, Result};
use async_trait::async_trait;
use digfeed_proto::protocol::{CatalogItem, MediaRef};
use serde::Deserialize;

/// Active media search, used when an item embeds no media of its own.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Best matching media id for `query`, if any.
    async fn search(&self, query: &str) -> Result<Option<String>>;

    /// False when `search` can never find anything.
    fn can_search(&self) -> bool {
        true
    }
}

/// Resolver for setups without a search API: only embedded media plays.
pub struct NoSearch;

#[async_trait]
impl MediaResolver for NoSearch {
    async fn search(&self, _query: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn can_search(&self) -> bool {
        false
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    #[serde(default)]
    video_id: Option<String>,
}

pub struct YouTubeSearch {
    client: RateLimitedClient,
    api_base: String,
    api_key: String,
}

impl YouTubeSearch {
    pub fn new(client: RateLimitedClient, api_base: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl MediaResolver for YouTubeSearch {
    async fn search(&self, query: &str) -> Result<Option<String>> {
        let url = format!("{}/search", self.api_base);
        let params = [
            ("part", "snippet".to_string()),
            ("type", "video".to_string()),
            ("maxResults", "1".to_string()),
            ("q", query.to_string()),
            ("key", self.api_key.clone()),
        ];
        let response: SearchResponse = self.client.get_json(&url, &params).await?;
        Ok(response
            .items
            .into_iter()
            .find_map(|item| item.id.video_id.filter(|id| !id.is_empty())))
    }
}

/// Embedded ids first (one plays alone, several become a collection), then
/// the item's collection id, then active search. `NotFound` when nothing
/// plays.
pub async fn resolve_media(item: &CatalogItem, resolver: &dyn MediaResolver) -> Result<MediaRef> {
    match item.media_ids.as_slice() {
        [single] => return Ok(MediaRef::Single(single.clone())),
        [_, _, ..] => return Ok(MediaRef::Collection(item.media_ids.clone())),
        [] => {}
    }
    if let Some(collection) = item.collection_id.as_ref().filter(|c| !c.is_empty()) {
        return Ok(MediaRef::Playlist(collection.clone()));
    }

    let query = item.search_query();
    if query.is_empty() {
        return Err(FeedError::NotFound(format!("nothing to search for item {}", item.id)));
    }
    match resolver.search(&query).await? {
        Some(id) => Ok(MediaRef::Single(id)),
        None => Err(FeedError::NotFound(format!("no media found for {:?}", query))),
    }
}
