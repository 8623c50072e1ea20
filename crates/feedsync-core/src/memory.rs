//! In-process collaborator.
//!
//! Implements the query source, both mutation tiers and the notification sink
//! over plain in-memory collections. Used by the `feed_replay` diagnostic and
//! by the tests, so it also records call counts and accepts scripted failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{FeedError, FeedResult};
use crate::models::{
    ChildKind, ChildRecord, Content, NotificationIntent, RemoteOp, SubscriptionHandle,
};
use crate::source::{
    ChannelSink, ContentFilter, FetchOrder, LiveChannel, MutationPath, NotificationSink,
    QuerySource,
};
use crate::timestamp::RawTimestamp;

/// Which remote mutation path a call went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Trusted,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub owner_id: Option<String>,
    pub filter: Option<ContentFilter>,
    pub order: FetchOrder,
    pub limit: Option<usize>,
}

#[derive(Default)]
struct MemoryState {
    contents: Vec<Content>,
    children: HashMap<String, Vec<ChildRecord>>,
    missing_index_owners: HashSet<String>,
    failing_owners: HashMap<String, FeedError>,
    stalled_owners: HashSet<String>,
    fetch_log: Vec<FetchCall>,
    channels: HashMap<String, Vec<ChannelSink>>,
    failing_subscribes: HashSet<String>,
    subscribe_calls: usize,
    close_calls: usize,
    mutation_failures: HashMap<Tier, VecDeque<FeedError>>,
    mutation_log: Vec<(Tier, RemoteOp)>,
    mutation_delay: Option<Duration>,
    notifications: Vec<NotificationIntent>,
    notify_failure: Option<FeedError>,
}

#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    notified: Arc<watch::Sender<usize>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (notified, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            notified: Arc::new(notified),
        }
    }

    pub fn with_contents(contents: impl IntoIterator<Item = Content>) -> Self {
        let store = Self::new();
        store.state.lock().contents.extend(contents);
        store
    }

    pub fn insert_content(&self, content: Content) {
        self.state.lock().contents.push(content);
    }

    // ===== Scripted behavior =====

    /// Filtered + ordered queries for this owner fail with `IndexUnavailable`.
    pub fn drop_index_for(&self, owner_id: &str) {
        self.state
            .lock()
            .missing_index_owners
            .insert(owner_id.to_string());
    }

    pub fn fail_owner(&self, owner_id: &str, error: FeedError) {
        self.state
            .lock()
            .failing_owners
            .insert(owner_id.to_string(), error);
    }

    /// Fetches for this owner never resolve on their own.
    pub fn stall_owner(&self, owner_id: &str) {
        self.state.lock().stalled_owners.insert(owner_id.to_string());
    }

    pub fn fail_subscribe(&self, content_id: &str) {
        self.state
            .lock()
            .failing_subscribes
            .insert(content_id.to_string());
    }

    /// Queue a failure for the next mutation on `tier`.
    pub fn fail_next_mutation(&self, tier: Tier, error: FeedError) {
        self.state
            .lock()
            .mutation_failures
            .entry(tier)
            .or_default()
            .push_back(error);
    }

    pub fn delay_mutations(&self, delay: Duration) {
        self.state.lock().mutation_delay = Some(delay);
    }

    pub fn fail_notifications(&self, error: FeedError) {
        self.state.lock().notify_failure = Some(error);
    }

    /// Seed child records; new channels receive them as their first snapshot.
    pub fn seed_records(&self, content_id: &str, records: Vec<ChildRecord>) {
        self.state
            .lock()
            .children
            .insert(content_id.to_string(), records);
    }

    /// Replace the child records and push the snapshot to open channels.
    pub fn push_records(&self, content_id: &str, records: Vec<ChildRecord>) {
        let sinks = {
            let mut state = self.state.lock();
            state
                .children
                .insert(content_id.to_string(), records.clone());
            state.channels.get(content_id).cloned().unwrap_or_default()
        };
        for sink in sinks {
            sink.push(records.clone());
        }
    }

    pub fn fail_channel(&self, content_id: &str, error: FeedError) {
        let sinks = self
            .state
            .lock()
            .channels
            .get(content_id)
            .cloned()
            .unwrap_or_default();
        for sink in sinks {
            sink.fail(error.clone());
        }
    }

    // ===== Inspection =====

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().channels.values().map(Vec::len).sum()
    }

    pub fn fetch_log(&self) -> Vec<FetchCall> {
        self.state.lock().fetch_log.clone()
    }

    pub fn mutations(&self) -> Vec<(Tier, RemoteOp)> {
        self.state.lock().mutation_log.clone()
    }

    pub fn mutation_calls(&self, tier: Tier) -> usize {
        self.state
            .lock()
            .mutation_log
            .iter()
            .filter(|(t, _)| *t == tier)
            .count()
    }

    pub fn records(&self, content_id: &str) -> Vec<ChildRecord> {
        self.state
            .lock()
            .children
            .get(content_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn notifications(&self) -> Vec<NotificationIntent> {
        self.state.lock().notifications.clone()
    }

    /// Wait until at least `count` notification deliveries were attempted.
    pub async fn wait_for_notifications(&self, count: usize) {
        let mut rx = self.notified.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    pub fn trusted_path(&self) -> MemoryMutationPath {
        MemoryMutationPath {
            store: self.clone(),
            tier: Tier::Trusted,
        }
    }

    pub fn direct_path(&self) -> MemoryMutationPath {
        MemoryMutationPath {
            store: self.clone(),
            tier: Tier::Direct,
        }
    }

    fn apply_op(&self, op: &RemoteOp) {
        let (content_id, snapshot, sinks) = {
            let mut state = self.state.lock();
            let content_id = op.content_id().to_string();
            let records = state.children.entry(content_id.clone()).or_default();
            match op {
                RemoteOp::SetLike {
                    actor_id, active, ..
                } => toggle_record(
                    records,
                    format!("like:{}", actor_id),
                    actor_id,
                    ChildKind::Like,
                    *active,
                ),
                RemoteOp::SetReaction {
                    actor_id,
                    emoji,
                    active,
                    ..
                } => toggle_record(
                    records,
                    format!("reaction:{}:{}", actor_id, emoji),
                    actor_id,
                    ChildKind::Reaction {
                        emoji: emoji.clone(),
                    },
                    *active,
                ),
                RemoteOp::SetRepost {
                    actor_id, active, ..
                } => toggle_record(
                    records,
                    format!("repost:{}", actor_id),
                    actor_id,
                    ChildKind::Repost,
                    *active,
                ),
                RemoteOp::AddComment {
                    actor_id,
                    comment_id,
                    text,
                    ..
                } => {
                    if !records.iter().any(|r| &r.id == comment_id) {
                        records.push(
                            ChildRecord::new(
                                comment_id.clone(),
                                actor_id.clone(),
                                ChildKind::Comment { text: text.clone() },
                            )
                            .at(RawTimestamp::Native(Utc::now())),
                        );
                    }
                }
            }
            let snapshot = records.clone();
            let sinks = state.channels.get(&content_id).cloned().unwrap_or_default();
            (content_id, snapshot, sinks)
        };

        if !sinks.is_empty() {
            tracing::trace!(content_id = %content_id, records = snapshot.len(), "broadcast snapshot");
        }
        for sink in sinks {
            sink.push(snapshot.clone());
        }
    }
}

/// Toggle-by-existence: bring the record to the requested state. Replaying the
/// same request is harmless.
fn toggle_record(
    records: &mut Vec<ChildRecord>,
    id: String,
    actor_id: &str,
    kind: ChildKind,
    active: bool,
) {
    let present = records.iter().any(|r| r.id == id);
    if active && !present {
        records.push(ChildRecord::new(id, actor_id, kind).at(RawTimestamp::Native(Utc::now())));
    } else if !active {
        records.retain(|r| r.id != id);
    }
}

fn sort_desc(contents: &mut [Content]) {
    contents.sort_by(|a, b| {
        b.created_at
            .resolve_or_epoch()
            .cmp(&a.created_at.resolve_or_epoch())
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[async_trait]
impl QuerySource for MemoryStore {
    async fn fetch_by_owner(
        &self,
        owner_id: Option<&str>,
        filter: Option<ContentFilter>,
        order: FetchOrder,
        limit: Option<usize>,
    ) -> FeedResult<Vec<Content>> {
        let stalled = {
            let mut state = self.state.lock();
            state.fetch_log.push(FetchCall {
                owner_id: owner_id.map(str::to_string),
                filter,
                order,
                limit,
            });
            owner_id.is_some_and(|o| state.stalled_owners.contains(o))
        };
        if stalled {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
        }

        let state = self.state.lock();
        if let Some(owner) = owner_id {
            if let Some(error) = state.failing_owners.get(owner) {
                return Err(error.clone());
            }
            if filter.is_some()
                && order == FetchOrder::CreatedAtDesc
                && state.missing_index_owners.contains(owner)
            {
                return Err(FeedError::IndexUnavailable(format!(
                    "visibility + createdAt for owner {}",
                    owner
                )));
            }
        }

        let mut found: Vec<Content> = state
            .contents
            .iter()
            .filter(|c| owner_id.map_or(true, |o| c.owner_id == o))
            .filter(|c| match filter {
                Some(ContentFilter::PublicOnly) => c.is_public(),
                None => true,
            })
            .cloned()
            .collect();

        if order == FetchOrder::CreatedAtDesc {
            sort_desc(&mut found);
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn subscribe(
        &self,
        content_id: &str,
        sink: ChannelSink,
    ) -> FeedResult<Box<dyn LiveChannel>> {
        let initial = {
            let mut state = self.state.lock();
            state.subscribe_calls += 1;
            if state.failing_subscribes.contains(content_id) {
                return Err(FeedError::NetworkFailure(format!(
                    "listen on {} refused",
                    content_id
                )));
            }
            state
                .channels
                .entry(content_id.to_string())
                .or_default()
                .push(sink.clone());
            state.children.get(content_id).cloned()
        };

        if let Some(records) = initial {
            sink.push(records);
        }

        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            content_id: content_id.to_string(),
            handle: sink.handle(),
        }))
    }
}

struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
    content_id: String,
    handle: SubscriptionHandle,
}

#[async_trait]
impl LiveChannel for MemoryChannel {
    async fn close(self: Box<Self>) {
        let mut state = self.state.lock();
        state.close_calls += 1;
        if let Some(sinks) = state.channels.get_mut(&self.content_id) {
            sinks.retain(|s| s.handle() != self.handle);
            if sinks.is_empty() {
                state.channels.remove(&self.content_id);
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryMutationPath {
    store: MemoryStore,
    tier: Tier,
}

#[async_trait]
impl MutationPath for MemoryMutationPath {
    fn name(&self) -> &'static str {
        match self.tier {
            Tier::Trusted => "trusted-api",
            Tier::Direct => "direct-write",
        }
    }

    async fn mutate(&self, op: &RemoteOp) -> FeedResult<()> {
        let (delay, failure) = {
            let mut state = self.store.state.lock();
            state.mutation_log.push((self.tier, op.clone()));
            let failure = state
                .mutation_failures
                .get_mut(&self.tier)
                .and_then(VecDeque::pop_front);
            (state.mutation_delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        self.store.apply_op(op);
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for MemoryStore {
    async fn notify(&self, intent: NotificationIntent) -> FeedResult<()> {
        let result = {
            let mut state = self.state.lock();
            match state.notify_failure.clone() {
                Some(error) => Err(error),
                None => {
                    state.notifications.push(intent);
                    Ok(())
                }
            }
        };
        self.notified.send_modify(|seen| *seen += 1);
        result
    }
}
