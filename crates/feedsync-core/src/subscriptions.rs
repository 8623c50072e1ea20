//! Live-subscription registry
//!
//! Keeps at most `max_concurrent` live channels open, driven by visibility
//! edges. Per content id the lifecycle is:
//!
//! ```text
//! Unsubscribed --Enter (under capacity)--> Subscribed
//! Subscribed   --Leave-------------------> PendingTeardown (debounce armed)
//! PendingTeardown --Enter----------------> Subscribed (timer cancelled, no re-open)
//! PendingTeardown --debounce elapsed-----> Unsubscribed (slot freed)
//! any          --Remove------------------> Unsubscribed (immediately)
//! ```
//!
//! Every transition runs on the manager's own event loop (`run`), which is the
//! only place the registry is touched. Timers, channel snapshots and channel
//! failures are all delivered back into that loop as `SubscriptionEvent`s.
//! Row `live_state` is written only from this loop as well; code that adds or
//! removes rows asks for a `SyncLiveState` through a `RegistryLink`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::FeedError;
use crate::models::{ChildRecord, LiveState, SubscriptionHandle};
use crate::source::{ChannelSink, LiveChannel, QuerySource};
use crate::stats::SharedSubscriptionStats;
use crate::store::FeedStore;
use crate::visibility::{VisibilityEvent, VisibilityTracker};

pub enum SubscriptionEvent {
    Visibility(VisibilityEvent),
    /// Content left the feed; close without debounce
    Remove(String),
    /// Rows for the content were added or removed; re-mark which row carries
    /// the channel from the registry
    SyncLiveState(String),
    TeardownDue {
        content_id: String,
        generation: u64,
    },
    ChannelUpdate {
        content_id: String,
        handle: SubscriptionHandle,
        records: Vec<ChildRecord>,
    },
    ChannelFailed {
        content_id: String,
        handle: SubscriptionHandle,
        error: FeedError,
    },
    Inspect(oneshot::Sender<RegistrySnapshot>),
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for SubscriptionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Visibility(v) => f.debug_tuple("Visibility").field(v).finish(),
            Self::Remove(id) => f.debug_tuple("Remove").field(id).finish(),
            Self::SyncLiveState(id) => f.debug_tuple("SyncLiveState").field(id).finish(),
            Self::TeardownDue {
                content_id,
                generation,
            } => f
                .debug_struct("TeardownDue")
                .field("content_id", content_id)
                .field("generation", generation)
                .finish(),
            Self::ChannelUpdate {
                content_id, handle, ..
            } => f
                .debug_struct("ChannelUpdate")
                .field("content_id", content_id)
                .field("handle", handle)
                .finish(),
            Self::ChannelFailed {
                content_id, error, ..
            } => f
                .debug_struct("ChannelFailed")
                .field("content_id", content_id)
                .field("error", error)
                .finish(),
            Self::Inspect(_) => f.write_str("Inspect"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Sender side used by everything outside the loop that changes which rows
/// exist for a content id.
#[derive(Clone)]
pub struct RegistryLink {
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    visibility: Arc<VisibilityTracker>,
}

impl RegistryLink {
    pub fn new(events: mpsc::UnboundedSender<SubscriptionEvent>, visibility: Arc<VisibilityTracker>) -> Self {
        Self { events, visibility }
    }

    /// Content is gone from the feed. It stops being tracked for visibility
    /// and its channel closes without debounce.
    pub fn evict(&self, content_id: &str) {
        self.visibility.forget(content_id);
        let _ = self
            .events
            .send(SubscriptionEvent::Remove(content_id.to_string()));
    }

    pub fn resync(&self, content_id: &str) {
        let _ = self
            .events
            .send(SubscriptionEvent::SyncLiveState(content_id.to_string()));
    }
}

/// Public view of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub content_id: String,
    pub handle: SubscriptionHandle,
    pub opened_at: Instant,
    pub pending_teardown_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub max_concurrent: usize,
    /// Sorted by content id
    pub active: Vec<Subscription>,
    /// Currently visible ids, in the order they became visible
    pub visible: Vec<String>,
}

impl RegistrySnapshot {
    pub fn is_subscribed(&self, content_id: &str) -> bool {
        self.active.iter().any(|s| s.content_id == content_id)
    }

    pub fn is_pending_teardown(&self, content_id: &str) -> bool {
        self.active
            .iter()
            .any(|s| s.content_id == content_id && s.pending_teardown_at.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub max_concurrent: usize,
    pub debounce: Duration,
    pub open_timeout: Duration,
}

struct PendingTeardown {
    due_at: Instant,
    generation: u64,
    timer: JoinHandle<()>,
}

struct Registration {
    handle: SubscriptionHandle,
    channel: Box<dyn LiveChannel>,
    opened_at: Instant,
    pending: Option<PendingTeardown>,
}

pub struct SubscriptionManager {
    config: SubscriptionConfig,
    viewer_id: String,
    source: Arc<dyn QuerySource>,
    store: FeedStore,
    stats: SharedSubscriptionStats,
    /// Loopback for timers and channel sinks
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    registry: HashMap<String, Registration>,
    /// content id -> order in which it became visible
    visible: HashMap<String, u64>,
    next_visible_seq: u64,
    next_handle: u64,
    next_generation: u64,
}

impl SubscriptionManager {
    pub fn new(
        config: SubscriptionConfig,
        viewer_id: impl Into<String>,
        source: Arc<dyn QuerySource>,
        store: FeedStore,
        stats: SharedSubscriptionStats,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        Self {
            config,
            viewer_id: viewer_id.into(),
            source,
            store,
            stats,
            events,
            registry: HashMap::new(),
            visible: HashMap::new(),
            next_visible_seq: 0,
            next_handle: 1,
            next_generation: 1,
        }
    }

    /// Drive the registry until `Shutdown`. All live channels are closed on exit.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<SubscriptionEvent>) {
        debug!(max = self.config.max_concurrent, "subscription loop started");
        while let Some(event) = events.recv().await {
            if !self.handle_event(event).await {
                break;
            }
        }
        debug!("subscription loop stopped");
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Apply one event. Returns false once the loop should stop.
    pub async fn handle_event(&mut self, event: SubscriptionEvent) -> bool {
        match event {
            SubscriptionEvent::Visibility(VisibilityEvent::Enter(id)) => self.on_enter(id).await,
            SubscriptionEvent::Visibility(VisibilityEvent::Leave(id)) => self.on_leave(id),
            SubscriptionEvent::Remove(id) => {
                self.visible.remove(&id);
                if self.registry.contains_key(&id) {
                    self.close(&id, "removed").await;
                    self.rescan().await;
                }
            }
            SubscriptionEvent::SyncLiveState(id) => {
                let state = self
                    .registry
                    .get(&id)
                    .map_or(LiveState::Unsubscribed, |r| LiveState::Subscribed(r.handle));
                self.store.set_live_state(&id, state);
            }
            SubscriptionEvent::TeardownDue {
                content_id,
                generation,
            } => {
                let due = self
                    .registry
                    .get(&content_id)
                    .and_then(|r| r.pending.as_ref())
                    .is_some_and(|p| p.generation == generation);
                // A re-entry may have cancelled the timer after it already fired
                if due {
                    self.close(&content_id, "debounce elapsed").await;
                    self.rescan().await;
                }
            }
            SubscriptionEvent::ChannelUpdate {
                content_id,
                handle,
                records,
            } => self.on_update(&content_id, handle, &records),
            SubscriptionEvent::ChannelFailed {
                content_id,
                handle,
                error,
            } => {
                if self.is_current(&content_id, handle) {
                    warn!(content_id = %content_id, error = %error, "live channel failed");
                    self.stats.update(|s| s.channel_failures += 1);
                    // Forget visibility so the rescan doesn't immediately reopen it
                    self.visible.remove(&content_id);
                    self.close(&content_id, "channel failed").await;
                    self.rescan().await;
                }
            }
            SubscriptionEvent::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SubscriptionEvent::Shutdown(done) => {
                self.close_all().await;
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn on_enter(&mut self, content_id: String) {
        if !self.visible.contains_key(&content_id) {
            self.visible.insert(content_id.clone(), self.next_visible_seq);
            self.next_visible_seq += 1;
        }

        if let Some(registration) = self.registry.get_mut(&content_id) {
            if let Some(pending) = registration.pending.take() {
                pending.timer.abort();
                self.stats.update(|s| s.debounce_cancels += 1);
                debug!(content_id = %content_id, "teardown cancelled by re-entry");
            }
            return;
        }

        self.try_open(&content_id).await;
    }

    fn on_leave(&mut self, content_id: String) {
        self.visible.remove(&content_id);

        let debounce = self.config.debounce;
        let generation = self.next_generation;
        let Some(registration) = self.registry.get_mut(&content_id) else {
            return;
        };
        if registration.pending.is_some() {
            return;
        }

        self.next_generation += 1;
        let events = self.events.clone();
        let id = content_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let _ = events.send(SubscriptionEvent::TeardownDue {
                content_id: id,
                generation,
            });
        });
        registration.pending = Some(PendingTeardown {
            due_at: Instant::now() + debounce,
            generation,
            timer,
        });
        debug!(content_id = %content_id, debounce_ms = debounce.as_millis() as u64, "teardown armed");
    }

    fn on_update(&mut self, content_id: &str, handle: SubscriptionHandle, records: &[ChildRecord]) {
        if !self.is_current(content_id, handle) {
            self.stats.update(|s| s.stale_updates += 1);
            return;
        }
        let outcome = self.store.apply_snapshot(content_id, records, &self.viewer_id);
        self.stats.update(|s| s.updates_applied += 1);
        debug!(
            content_id,
            rows = outcome.matched,
            added = outcome.rows_added,
            resorted = outcome.resorted,
            "live update applied"
        );
    }

    fn is_current(&self, content_id: &str, handle: SubscriptionHandle) -> bool {
        self.registry
            .get(content_id)
            .is_some_and(|r| r.handle == handle)
    }

    /// Open a channel if there is room. Returns true if a channel was opened.
    async fn try_open(&mut self, content_id: &str) -> bool {
        if self.registry.len() >= self.config.max_concurrent {
            self.stats.update(|s| s.capacity_skips += 1);
            debug!(
                content_id,
                active = self.registry.len(),
                max = self.config.max_concurrent,
                "at capacity, open skipped"
            );
            return false;
        }

        let handle = SubscriptionHandle(self.next_handle);
        self.next_handle += 1;
        let sink = ChannelSink::new(content_id.to_string(), handle, self.events.clone());

        let opened = match tokio::time::timeout(
            self.config.open_timeout,
            self.source.subscribe(content_id, sink),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.config.open_timeout)),
        };

        match opened {
            Ok(channel) => {
                self.registry.insert(
                    content_id.to_string(),
                    Registration {
                        handle,
                        channel,
                        opened_at: Instant::now(),
                        pending: None,
                    },
                );
                self.store
                    .set_live_state(content_id, LiveState::Subscribed(handle));
                self.stats.record_open(self.registry.len());
                info!(
                    content_id,
                    active = self.registry.len(),
                    max = self.config.max_concurrent,
                    "live channel opened"
                );
                true
            }
            Err(e) => {
                self.stats.update(|s| s.open_failures += 1);
                warn!(content_id, error = %e, "failed to open live channel");
                false
            }
        }
    }

    async fn close(&mut self, content_id: &str, reason: &str) {
        let Some(registration) = self.registry.remove(content_id) else {
            return;
        };
        if let Some(pending) = registration.pending {
            pending.timer.abort();
        }
        registration.channel.close().await;
        self.store
            .set_live_state(content_id, LiveState::Unsubscribed);
        self.stats.update(|s| s.closed += 1);
        info!(
            content_id,
            reason,
            active = self.registry.len(),
            max = self.config.max_concurrent,
            "live channel closed"
        );
    }

    /// Fill freed slots with rows that are visible but were skipped at capacity,
    /// oldest visibility first.
    async fn rescan(&mut self) {
        let mut waiting: Vec<(u64, String)> = self
            .visible
            .iter()
            .filter(|(id, _)| !self.registry.contains_key(*id))
            .map(|(id, seq)| (*seq, id.clone()))
            .collect();
        waiting.sort();

        let mut attempted = HashSet::new();
        for (_, content_id) in waiting {
            if self.registry.len() >= self.config.max_concurrent {
                break;
            }
            if attempted.insert(content_id.clone()) {
                self.try_open(&content_id).await;
            }
        }
    }

    async fn close_all(&mut self) {
        let ids: Vec<String> = self.registry.keys().cloned().collect();
        for id in ids {
            self.close(&id, "session unmounted").await;
        }
        self.visible.clear();
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut active: Vec<Subscription> = self
            .registry
            .iter()
            .map(|(id, r)| Subscription {
                content_id: id.clone(),
                handle: r.handle,
                opened_at: r.opened_at,
                pending_teardown_at: r.pending.as_ref().map(|p| p.due_at),
            })
            .collect();
        active.sort_by(|a, b| a.content_id.cmp(&b.content_id));

        let mut visible: Vec<(u64, String)> = self
            .visible
            .iter()
            .map(|(id, seq)| (*seq, id.clone()))
            .collect();
        visible.sort();

        RegistrySnapshot {
            max_concurrent: self.config.max_concurrent,
            active,
            visible: visible.into_iter().map(|(_, id)| id).collect(),
        }
    }
}
