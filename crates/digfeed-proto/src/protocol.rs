use serde::{Deserialize, Serialize};

/// Catalog filter. Every field is optional; an empty filter samples the
/// whole catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CatalogFilter {
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    /// Year or year range as the catalog understands it ("1994", "1990-1999").
    #[serde(default)]
    pub era: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

impl CatalogFilter {
    /// Canonical key: fixed field order, trimmed, lowercased, empty fields
    /// rendered as nothing so `None` and `Some("")` collapse.
    pub fn key(&self) -> String {
        fn norm(v: &Option<String>) -> String {
            v.as_deref().map(|s| s.trim().to_lowercase()).unwrap_or_default()
        }
        format!(
            "genre={}|style={}|era={}|country={}",
            norm(&self.genre),
            norm(&self.style),
            norm(&self.era),
            norm(&self.country)
        )
    }

    /// Non-empty filter values as query pairs, using the catalog's
    /// parameter names.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        [
            ("genre", &self.genre),
            ("style", &self.style),
            ("year", &self.era),
            ("country", &self.country),
        ]
        .into_iter()
        .filter_map(|(name, value)| {
            let v = value.as_deref()?.trim();
            (!v.is_empty()).then(|| (name, v.to_string()))
        })
        .collect()
    }
}

/// What a session samples from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Criteria {
    Catalog(CatalogFilter),
    Channels,
}

impl Criteria {
    pub fn key(&self) -> String {
        match self {
            Criteria::Catalog(filter) => format!("catalog:{}", filter.key()),
            Criteria::Channels => "channels".to_string(),
        }
    }
}

/// Where a `CatalogItem` came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Catalog,
    Channel { channel_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub source: SourceKind,
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default)]
    pub detail_url: Option<String>,
    /// Playable media ids embedded in the catalog record, in catalog order.
    #[serde(default)]
    pub media_ids: Vec<String>,
    #[serde(default)]
    pub collection_id: Option<String>,
}

impl CatalogItem {
    pub fn has_embedded_media(&self) -> bool {
        !self.media_ids.is_empty() || self.collection_id.is_some()
    }

    /// True when the item can become a `ReadyRecord`: either media is
    /// embedded, or search is available and there is enough text for it.
    pub fn is_resolvable(&self, can_search: bool) -> bool {
        self.has_embedded_media() || (can_search && !self.search_query().is_empty())
    }

    /// Query used for active media search.
    pub fn search_query(&self) -> String {
        let artist = self.artist.trim();
        let title = self.title.trim();
        match (artist.is_empty(), title.is_empty()) {
            (false, false) => format!("{} {}", artist, title),
            (true, false) => title.to_string(),
            (false, true) => artist.to_string(),
            (true, true) => String::new(),
        }
    }
}

/// Resolved playable reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MediaRef {
    Single(String),
    /// Ordered ids played back as one virtual collection.
    Collection(Vec<String>),
    Playlist(String),
}

impl MediaRef {
    /// First playable id; for playlists the playlist id itself.
    pub fn primary_id(&self) -> Option<&str> {
        match self {
            MediaRef::Single(id) | MediaRef::Playlist(id) => Some(id),
            MediaRef::Collection(ids) => ids.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyRecord {
    pub item: CatalogItem,
    pub media: MediaRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Events broadcast by the pipeline and the window cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    SessionStarted { generation: u64 },
    SessionStopped { generation: u64 },
    /// Zero catalog matches for the active criteria. Terminal.
    NoResults { criteria_key: String },
    /// No source can produce items (all empty, disabled or unauthorized). Terminal.
    SourcesUnavailable { reason: String },
    ResourceReady { index: usize },
    ResourceEnded { index: usize },
}

impl FeedEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FeedEvent::NoResults { .. } | FeedEvent::SourcesUnavailable { .. }
        )
    }
}
