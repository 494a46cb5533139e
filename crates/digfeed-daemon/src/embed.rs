//! Embedded-player bookkeeping for the window cache.
//!
//! The daemon does not render anything itself: each live slot is an
//! `EmbedPlayer` record holding the embed URL the UI should mount and
//! whether it should be audible. The UI polls `/api/state` and mirrors it.

use async_trait::async_trait;
use digfeed_engine::window::ResourceFactory;
use digfeed_engine::{FeedError, Result};
use digfeed_proto::protocol::{MediaRef, ReadyRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

const EMBED_BASE: &str = "https://www.youtube-nocookie.com/embed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct EmbedId(u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbedPlayer {
    pub id: EmbedId,
    pub slot: usize,
    pub item_id: String,
    pub url: String,
    pub muted: bool,
}

/// Embed URL for a media reference. Starts muted; the UI unmutes the active
/// player.
pub fn embed_url(media: &MediaRef) -> Option<String> {
    let url = match media {
        MediaRef::Single(id) => format!("{}/{}?enablejsapi=1&autoplay=1&mute=1", EMBED_BASE, id),
        MediaRef::Collection(ids) => {
            let (first, rest) = ids.split_first()?;
            if rest.is_empty() {
                format!("{}/{}?enablejsapi=1&autoplay=1&mute=1", EMBED_BASE, first)
            } else {
                format!(
                    "{}/{}?enablejsapi=1&autoplay=1&mute=1&playlist={}",
                    EMBED_BASE,
                    first,
                    rest.join(",")
                )
            }
        }
        MediaRef::Playlist(list) => format!(
            "{}/videoseries?list={}&enablejsapi=1&autoplay=1&mute=1",
            EMBED_BASE, list
        ),
    };
    Some(url)
}

#[derive(Default)]
pub struct EmbedFactory {
    next_id: AtomicU64,
    players: Mutex<BTreeMap<EmbedId, EmbedPlayer>>,
}

impl EmbedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live players ordered by slot.
    pub fn players(&self) -> Vec<EmbedPlayer> {
        let mut players: Vec<EmbedPlayer> = match self.players.lock() {
            Ok(players) => players.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        players.sort_by_key(|p| p.slot);
        players
    }

    fn with_players<T>(&self, f: impl FnOnce(&mut BTreeMap<EmbedId, EmbedPlayer>) -> T) -> T {
        match self.players.lock() {
            Ok(mut players) => f(&mut players),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl ResourceFactory for EmbedFactory {
    type Handle = EmbedId;

    async fn create(&self, index: usize, record: &ReadyRecord) -> Result<EmbedId> {
        let url = embed_url(&record.media).ok_or_else(|| {
            FeedError::NotFound(format!("empty media collection for {}", record.item.id))
        })?;
        let id = EmbedId(self.next_id.fetch_add(1, Ordering::SeqCst));
        debug!("[embed] Slot {} -> {}", index, url);
        self.with_players(|players| {
            players.insert(
                id,
                EmbedPlayer {
                    id,
                    slot: index,
                    item_id: record.item.id.clone(),
                    url,
                    muted: true,
                },
            )
        });
        Ok(id)
    }

    async fn destroy(&self, handle: EmbedId) {
        self.with_players(|players| players.remove(&handle));
    }

    async fn set_active(&self, handle: &EmbedId, active: bool) {
        self.with_players(|players| {
            if let Some(player) = players.get_mut(handle) {
                player.muted = !active;
            }
        });
    }
}
