//! Moving window of live playback resources around the viewed position.
//!
//! Slots are appended as the position approaches the end of the sequence and
//! a single fill task turns them Ready in order from a `RecordSource`. Only
//! slots inside `[position - look_behind, position + look_ahead]` hold a
//! resource; everything else is destroyed as soon as the position moves.

use crate::error::Result;
use crate::pipeline::ContentPipeline;
use async_trait::async_trait;
use digfeed_proto::config::WindowConfig;
use digfeed_proto::protocol::{FeedEvent, ReadyRecord};
use futures_util::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates and tears down the playback resource behind a slot.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    /// Build a suspended (muted) resource for `record` shown at `index`.
    async fn create(&self, index: usize, record: &ReadyRecord) -> Result<Self::Handle>;

    async fn destroy(&self, handle: Self::Handle);

    /// Make the resource audible (`true`) or suspend it.
    async fn set_active(&self, handle: &Self::Handle, active: bool);
}

/// Ordered supply of ready records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// `None` at end of stream.
    async fn next_record(&self) -> Option<ReadyRecord>;
}

#[async_trait]
impl RecordSource for ContentPipeline {
    async fn next_record(&self) -> Option<ReadyRecord> {
        self.consume().await
    }
}

#[derive(Debug, Clone)]
pub struct WindowSettings {
    pub look_behind: usize,
    pub look_ahead: usize,
    pub lookahead_slots: usize,
}

impl WindowSettings {
    pub fn from_config(config: &WindowConfig) -> Self {
        Self {
            look_behind: config.look_behind,
            look_ahead: config.look_ahead,
            lookahead_slots: config.lookahead_slots.max(config.look_ahead),
        }
    }

    /// Inclusive bounds of the live window around `position`.
    pub fn bounds(&self, position: usize) -> (usize, usize) {
        (
            position.saturating_sub(self.look_behind),
            position.saturating_add(self.look_ahead),
        )
    }

    pub fn width(&self) -> usize {
        self.look_behind + self.look_ahead + 1
    }

    fn contains(&self, position: usize, index: usize) -> bool {
        let (lo, hi) = self.bounds(position);
        (lo..=hi).contains(&index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub index: usize,
    pub ready: bool,
    pub live: bool,
    pub active: bool,
    pub creating: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ReadyRecord>,
}

/// Slots from the back of the live window through the lookahead edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSnapshot {
    pub position: Option<usize>,
    pub live: usize,
    pub filling: bool,
    /// Slots allocated so far, including those not listed.
    pub total: usize,
    pub slots: Vec<SlotSnapshot>,
}

/// `set_position` past the last allocated slot plus the lookahead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("position {index} is beyond the feed (at most {limit})")]
pub struct PositionOutOfRange {
    pub index: usize,
    pub limit: usize,
}

struct Slot<H> {
    /// `None` while Pending.
    record: Option<ReadyRecord>,
    handle: Option<H>,
    /// Token of the in-flight creation, if any.
    creating: Option<u64>,
    active: bool,
}

impl<H> Slot<H> {
    fn pending() -> Self {
        Self {
            record: None,
            handle: None,
            creating: None,
            active: false,
        }
    }
}

struct Slots<H> {
    slots: Vec<Slot<H>>,
    position: Option<usize>,
    next_token: u64,
    fill_task: Option<JoinHandle<()>>,
}

impl<H> Slots<H> {
    /// Reserve a creation for `index` if it is Ready, has no resource and
    /// nothing is in flight for it.
    fn claim_creation(&mut self, index: usize) -> Option<(u64, ReadyRecord)> {
        let slot = self.slots.get_mut(index)?;
        if slot.handle.is_some() || slot.creating.is_some() {
            return None;
        }
        let record = slot.record.clone()?;
        let token = self.next_token;
        self.next_token += 1;
        slot.creating = Some(token);
        Some((token, record))
    }

    fn is_filling(&self) -> bool {
        self.fill_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    fn snapshot(&self, settings: &WindowSettings) -> WindowSnapshot {
        let (lo, end) = match self.position {
            Some(p) => (
                settings.bounds(p).0,
                p.saturating_add(settings.lookahead_slots).saturating_add(1),
            ),
            None => (0, 0),
        };
        WindowSnapshot {
            position: self.position,
            live: self.slots.iter().filter(|s| s.handle.is_some()).count(),
            filling: self.is_filling(),
            total: self.slots.len(),
            slots: self
                .slots
                .iter()
                .enumerate()
                .take(end)
                .skip(lo)
                .map(|(index, slot)| SlotSnapshot {
                    index,
                    ready: slot.record.is_some(),
                    live: slot.handle.is_some(),
                    active: slot.active,
                    creating: slot.creating.is_some(),
                    record: slot.record.clone(),
                })
                .collect(),
        }
    }
}

pub struct WindowedResourceCache<F: ResourceFactory> {
    factory: Arc<F>,
    source: Arc<dyn RecordSource>,
    settings: WindowSettings,
    slots: Mutex<Slots<F::Handle>>,
    events: broadcast::Sender<FeedEvent>,
}

impl<F: ResourceFactory> WindowedResourceCache<F> {
    pub fn new(factory: Arc<F>, source: Arc<dyn RecordSource>, settings: WindowSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            factory,
            source,
            settings,
            slots: Mutex::new(Slots {
                slots: Vec::new(),
                position: None,
                next_token: 0,
                fill_task: None,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    pub async fn position(&self) -> Option<usize> {
        self.slots.lock().await.position
    }

    pub async fn live_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .slots
            .iter()
            .filter(|s| s.handle.is_some())
            .count()
    }

    pub async fn snapshot(&self) -> WindowSnapshot {
        self.slots.lock().await.snapshot(&self.settings)
    }

    /// Move the viewed position to `index`: destroy resources that fell out
    /// of the window, activate `index`, create missing in-window resources
    /// and keep the lookahead filled. Repeating the current position only
    /// fills gaps. Positions beyond the allocated slots plus the lookahead
    /// are rejected.
    pub async fn set_position(
        self: &Arc<Self>,
        index: usize,
    ) -> std::result::Result<WindowSnapshot, PositionOutOfRange> {
        let (lo, hi) = self.settings.bounds(index);
        let mut doomed = Vec::new();
        let mut toggles = Vec::new();
        let mut creations = Vec::new();

        let snapshot = {
            let mut state = self.slots.lock().await;
            let limit = state.slots.len().saturating_add(self.settings.lookahead_slots);
            if index > limit {
                warn!("[window] Rejecting position {} (limit {})", index, limit);
                return Err(PositionOutOfRange { index, limit });
            }
            if state.position != Some(index) {
                debug!("[window] Position {:?} -> {}", state.position, index);
            }
            state.position = Some(index);

            let wanted = index
                .saturating_add(self.settings.lookahead_slots)
                .saturating_add(1);
            while state.slots.len() < wanted {
                state.slots.push(Slot::pending());
            }

            for (i, slot) in state.slots.iter_mut().enumerate() {
                if i < lo || i > hi {
                    // Outside the window: any in-flight creation is now stale
                    slot.creating = None;
                    slot.active = false;
                    if let Some(handle) = slot.handle.take() {
                        doomed.push((i, handle));
                    }
                } else if let Some(handle) = &slot.handle {
                    let active = i == index;
                    if slot.active != active {
                        slot.active = active;
                        toggles.push((handle.clone(), active));
                    }
                }
            }

            for i in lo..=hi {
                if let Some((token, record)) = state.claim_creation(i) {
                    creations.push((i, token, record));
                }
            }

            self.ensure_filling(&mut state);
            state.snapshot(&self.settings)
        };

        join_all(doomed.into_iter().map(|(i, handle)| {
            debug!("[window] Destroying slot {}", i);
            self.factory.destroy(handle)
        }))
        .await;
        for (handle, active) in toggles {
            self.factory.set_active(&handle, active).await;
        }
        for (i, token, record) in creations {
            self.spawn_creation(i, token, record);
        }
        Ok(snapshot)
    }

    /// Natural end of playback at `index`. Returns the position to move to.
    pub fn playback_ended(&self, index: usize) -> usize {
        info!("[window] Playback ended at slot {}", index);
        let _ = self.events.send(FeedEvent::ResourceEnded { index });
        index.saturating_add(1)
    }

    /// Drop every slot and resource; used when a new session starts.
    pub async fn clear(&self) {
        let handles: Vec<F::Handle> = {
            let mut state = self.slots.lock().await;
            if let Some(task) = state.fill_task.take() {
                task.abort();
            }
            state.position = None;
            state.slots.drain(..).filter_map(|s| s.handle).collect()
        };
        if !handles.is_empty() {
            debug!("[window] Cleared {} live resources", handles.len());
        }
        join_all(handles.into_iter().map(|h| self.factory.destroy(h))).await;
    }

    fn ensure_filling(self: &Arc<Self>, state: &mut Slots<F::Handle>) {
        if state.is_filling() || state.slots.iter().all(|s| s.record.is_some()) {
            return;
        }
        let cache = Arc::clone(self);
        state.fill_task = Some(tokio::spawn(async move { cache.fill().await }));
    }

    /// Turn Pending slots Ready in order until none are left or the source
    /// ends.
    async fn fill(self: Arc<Self>) {
        loop {
            let target = {
                let state = self.slots.lock().await;
                state.slots.iter().position(|s| s.record.is_none())
            };
            let Some(target) = target else {
                break;
            };
            let Some(record) = self.source.next_record().await else {
                info!("[window] Record source ended at slot {}", target);
                break;
            };

            let creation = {
                let mut state = self.slots.lock().await;
                let Some(slot) = state.slots.get_mut(target) else {
                    break;
                };
                debug!("[window] Slot {} ready: {}", target, record.item.title);
                slot.record = Some(record);
                let in_window = state
                    .position
                    .is_some_and(|p| self.settings.contains(p, target));
                if in_window {
                    state.claim_creation(target)
                } else {
                    None
                }
            };
            if let Some((token, record)) = creation {
                self.spawn_creation(target, token, record);
            }
        }
    }

    fn spawn_creation(self: &Arc<Self>, index: usize, token: u64, record: ReadyRecord) {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.create_slot(index, token, record).await });
    }

    async fn create_slot(&self, index: usize, token: u64, record: ReadyRecord) {
        let handle = match self.factory.create(index, &record).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("[window] Creating slot {} failed: {}", index, e);
                let mut state = self.slots.lock().await;
                if let Some(slot) = state.slots.get_mut(index) {
                    if slot.creating == Some(token) {
                        slot.creating = None;
                    }
                }
                return;
            }
        };

        // Some(active) when the slot still wants this resource
        let kept = {
            let mut state = self.slots.lock().await;
            let position = state.position;
            let in_window = position.is_some_and(|p| self.settings.contains(p, index));
            match state.slots.get_mut(index) {
                Some(slot) if slot.creating == Some(token) => {
                    slot.creating = None;
                    if in_window {
                        slot.active = position == Some(index);
                        slot.handle = Some(handle.clone());
                        Some(slot.active)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        match kept {
            Some(active) => {
                if active {
                    self.factory.set_active(&handle, true).await;
                }
                debug!("[window] Slot {} live (active: {})", index, active);
                let _ = self.events.send(FeedEvent::ResourceReady { index });
            }
            None => {
                debug!("[window] Slot {} left the window while creating, tearing down", index);
                self.factory.destroy(handle).await;
            }
        }
    }
}
