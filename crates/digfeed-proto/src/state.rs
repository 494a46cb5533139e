//! Best-effort persisted state.
//!
//! Everything in here is a cache: losing the file costs extra probe calls
//! and a fresh dedup window, never correctness. Writes go through
//! `tokio::fs` and failures are logged by the caller, not propagated into
//! sampling.

use crate::protocol::CatalogItem;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Cached outcome of a count probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeEntry {
    pub total_items: u64,
    pub total_pages: u32,
    pub fetched_at: DateTime<Utc>,
}

impl ProbeEntry {
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Local copy of one channel's listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelArchive {
    #[serde(default)]
    pub items: Vec<CatalogItem>,
    /// Continuation token for the next listing page; `None` before the first
    /// paginated fetch and after exhaustion.
    #[serde(default)]
    pub next_page_token: Option<String>,
    /// The paginated listing returned its last page.
    #[serde(default)]
    pub exhausted: bool,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChannelArchive {
    /// Append items whose id is not already archived. Returns how many were new.
    pub fn merge(&mut self, incoming: Vec<CatalogItem>) -> usize {
        let mut added = 0;
        for item in incoming {
            if !self.items.iter().any(|existing| existing.id == item.id) {
                self.items.push(item);
                added += 1;
            }
        }
        self.updated_at = Some(Utc::now());
        added
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub probes: HashMap<String, ProbeEntry>,
    /// Seen ids per scope, oldest first.
    #[serde(default)]
    pub seen: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub archives: HashMap<String, ChannelArchive>,
}

pub struct FeedStore {
    state: RwLock<PersistentState>,
    state_file: Option<PathBuf>,
    /// Serializes writers of `state_file` and its temp sibling.
    save_lock: Mutex<()>,
}

impl FeedStore {
    pub fn open(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);
        Self {
            state: RwLock::new(persistent),
            state_file: Some(state_file),
            save_lock: Mutex::new(()),
        }
    }

    /// Store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(PersistentState::default()),
            state_file: None,
            save_lock: Mutex::new(()),
        }
    }

    pub async fn probe(&self, key: &str) -> Option<ProbeEntry> {
        self.state.read().await.probes.get(key).cloned()
    }

    pub async fn set_probe(&self, key: &str, entry: ProbeEntry) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.probes.insert(key.to_string(), entry);
        }
        self.save().await
    }

    pub async fn seen(&self, scope: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .seen
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_seen(&self, scope: &str, ids: Vec<String>) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.seen.insert(scope.to_string(), ids);
        }
        self.save().await
    }

    pub async fn archive(&self, channel_id: &str) -> Option<ChannelArchive> {
        self.state.read().await.archives.get(channel_id).cloned()
    }

    pub async fn set_archive(&self, channel_id: &str, archive: ChannelArchive) -> anyhow::Result<()> {
        {
            let mut state = self.state.write().await;
            state.archives.insert(channel_id.to_string(), archive);
        }
        self.save().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let Some(state_file) = &self.state_file else {
            return Ok(());
        };

        // Serialized inside the lock so the last rename holds the newest state
        let _guard = self.save_lock.lock().await;
        let json = {
            let state = self.state.read().await;
            serde_json::to_string(&*state)?
        };

        if let Some(parent) = state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling temp file first so a crash never leaves a torn file
        let tmp = state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, state_file).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            match serde_json::from_str::<PersistentState>(&content) {
                Ok(persistent) => return persistent,
                Err(e) => tracing::warn!("[store] Ignoring unreadable state file: {}", e),
            }
        }
        PersistentState::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SourceKind;

    fn video(id: &str) -> CatalogItem {
        CatalogItem {
            id: id.to_string(),
            source: SourceKind::Channel {
                channel_id: "UC1".into(),
            },
            title: format!("video {}", id),
            artist: "channel".into(),
            year: None,
            cover_url: None,
            detail_url: None,
            media_ids: vec![id.to_string()],
            collection_id: None,
        }
    }

    #[test]
    fn test_probe_freshness() {
        let now = Utc::now();
        let entry = ProbeEntry {
            total_items: 10,
            total_pages: 1,
            fetched_at: now - Duration::hours(2),
        };
        assert!(entry.is_fresh(Duration::hours(24), now));
        assert!(!entry.is_fresh(Duration::hours(1), now));
    }

    #[test]
    fn test_archive_merge_skips_known_ids() {
        let mut archive = ChannelArchive::default();
        assert_eq!(archive.merge(vec![video("a"), video("b")]), 2);
        assert_eq!(archive.merge(vec![video("b"), video("c")]), 1);
        let ids: Vec<_> = archive.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(archive.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FeedStore::open(path.clone());
        store
            .set_probe(
                "catalog:genre=jazz",
                ProbeEntry {
                    total_items: 1234,
                    total_pages: 25,
                    fetched_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store
            .set_seen("catalog", vec!["1".into(), "2".into()])
            .await
            .unwrap();
        let mut archive = ChannelArchive::default();
        archive.merge(vec![video("v1")]);
        archive.exhausted = true;
        store.set_archive("UC1", archive).await.unwrap();

        let reopened = FeedStore::open(path);
        assert_eq!(
            reopened.probe("catalog:genre=jazz").await.map(|p| p.total_pages),
            Some(25)
        );
        assert_eq!(reopened.seen("catalog").await, vec!["1", "2"]);
        let archive = reopened.archive("UC1").await.unwrap();
        assert!(archive.exhausted);
        assert_eq!(archive.items.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_saves_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = std::sync::Arc::new(FeedStore::open(path.clone()));

        let handles: Vec<_> = (0..40)
            .map(|n| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .set_seen(&format!("scope-{}", n), vec![n.to_string()])
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reopened = FeedStore::open(path.clone());
        for n in 0..40 {
            assert_eq!(
                reopened.seen(&format!("scope-{}", n)).await,
                vec![n.to_string()]
            );
        }
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = FeedStore::open(path);
        assert!(store.probe("anything").await.is_none());
        assert!(store.seen("catalog").await.is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store_never_writes() {
        let store = FeedStore::in_memory();
        store.set_seen("channels", vec!["x".into()]).await.unwrap();
        assert_eq!(store.seen("channels").await, vec!["x"]);
    }
}
