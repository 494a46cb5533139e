//! Release catalog client (Discogs-style search and release detail API).

use crate::client::RateLimitedClient;
use crate::error::{FeedError, Result};
use async_trait::async_trait;
use digfeed_proto::protocol::{CatalogFilter, CatalogItem, SourceKind};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

const WEB_BASE: &str = "https://www.discogs.com";

/// One search result, before detail lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub year: Option<u16>,
    pub cover_url: Option<String>,
    pub detail_url: Option<String>,
}

impl SearchHit {
    /// Item built from search fields alone (no embedded media).
    pub fn into_item(self) -> CatalogItem {
        CatalogItem {
            id: self.id,
            source: SourceKind::Catalog,
            title: self.title,
            artist: self.artist,
            year: self.year,
            cover_url: self.cover_url,
            detail_url: self.detail_url,
            media_ids: Vec::new(),
            collection_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub hits: Vec<SearchHit>,
    pub total_items: u64,
    pub total_pages: u32,
}

#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// One page (1-based) of search results for `filter`.
    async fn search(&self, filter: &CatalogFilter, page: u32, per_page: u32) -> Result<SearchPage>;

    /// Full record for `id`, with embedded media ids.
    async fn item(&self, id: &str) -> Result<CatalogItem>;
}

// ── wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    pages: u32,
    #[serde(default)]
    items: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    year: Option<Value>,
    #[serde(default)]
    cover_image: Option<String>,
    #[serde(default)]
    thumb: Option<String>,
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    artists: Vec<ArtistRef>,
    #[serde(default)]
    year: Option<Value>,
    #[serde(default)]
    images: Vec<ImageRef>,
    #[serde(default)]
    videos: Vec<VideoRef>,
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtistRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct VideoRef {
    uri: String,
}

// ── client ───────────────────────────────────────────────────────────────────

pub struct DiscogsCatalog {
    client: RateLimitedClient,
    api_base: String,
}

impl DiscogsCatalog {
    pub fn new(client: RateLimitedClient, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CatalogApi for DiscogsCatalog {
    async fn search(&self, filter: &CatalogFilter, page: u32, per_page: u32) -> Result<SearchPage> {
        let url = format!("{}/database/search", self.api_base);
        let mut query = vec![("type", "release".to_string())];
        query.extend(filter.query_pairs());
        query.push(("page", page.to_string()));
        query.push(("per_page", per_page.to_string()));

        let response: SearchResponse = self.client.get_json(&url, &query).await?;
        Ok(SearchPage {
            hits: response.results.into_iter().map(hit_from_result).collect(),
            total_items: response.pagination.items,
            total_pages: response.pagination.pages,
        })
    }

    async fn item(&self, id: &str) -> Result<CatalogItem> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return Err(FeedError::NotFound(format!("invalid release id {:?}", id)));
        }
        let url = format!("{}/releases/{}", self.api_base, id);
        let release: ReleaseResponse = self.client.get_json(&url, &[]).await?;
        Ok(item_from_release(release))
    }
}

fn hit_from_result(result: SearchResult) -> SearchHit {
    let (artist, title) = split_display_title(&result.title);
    SearchHit {
        id: result.id.to_string(),
        title,
        artist,
        year: result.year.as_ref().and_then(parse_year),
        cover_url: result.cover_image.or(result.thumb).filter(|u| !u.is_empty()),
        detail_url: result.uri.map(|u| absolute_web_url(&u)),
    }
}

fn item_from_release(release: ReleaseResponse) -> CatalogItem {
    let artist = release
        .artists
        .iter()
        .map(|a| strip_disambiguation(&a.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut media_ids: Vec<String> = Vec::new();
    for video in &release.videos {
        if let Some(id) = extract_video_id(&video.uri) {
            if !media_ids.contains(&id) {
                media_ids.push(id);
            }
        }
    }

    CatalogItem {
        id: release.id.to_string(),
        source: SourceKind::Catalog,
        title: release.title,
        artist,
        year: release.year.as_ref().and_then(parse_year),
        cover_url: release.images.into_iter().next().map(|i| i.uri),
        detail_url: release.uri.map(|u| absolute_web_url(&u)),
        media_ids,
        collection_id: None,
    }
}

/// Search titles come as "Artist - Title".
fn split_display_title(raw: &str) -> (String, String) {
    match raw.split_once(" - ") {
        Some((artist, title)) => (strip_disambiguation(artist), title.trim().to_string()),
        None => (String::new(), raw.trim().to_string()),
    }
}

/// "Artist (2)" -> "Artist"
fn strip_disambiguation(name: &str) -> String {
    let name = name.trim();
    if let Some(open) = name.rfind(" (") {
        let tail = &name[open + 2..];
        if let Some(digits) = tail.strip_suffix(')') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return name[..open].to_string();
            }
        }
    }
    name.to_string()
}

/// Years arrive as numbers, numeric strings, or 0 / "" when unknown.
fn parse_year(value: &Value) -> Option<u16> {
    let year = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse::<u64>().ok()?,
        _ => return None,
    };
    (year > 0 && year <= u16::MAX as u64).then_some(year as u16)
}

fn absolute_web_url(uri: &str) -> String {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        uri.to_string()
    } else {
        format!("{}{}", WEB_BASE, uri)
    }
}

/// Video id from a watch, short or embed URL.
pub fn extract_video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let id = match host {
        "youtu.be" => url.path_segments()?.next()?.to_string(),
        "youtube.com" | "music.youtube.com" | "youtube-nocookie.com" => {
            let mut segments = url.path_segments()?;
            match segments.next()? {
                "watch" => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned())?,
                "embed" | "shorts" | "v" => segments.next()?.to_string(),
                _ => return None,
            }
        }
        _ => return None,
    };
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}
