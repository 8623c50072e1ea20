//! Feed session
//!
//! Owns everything that lives for one mounted feed: the feed window, the
//! live-subscription loop, the mutation engine, the visibility tracker and the
//! user cache. Nothing here is global; unmounting closes every live channel
//! and the session refuses further work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::aggregator::{FeedAggregator, FeedScope, PageCursor};
use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};
use crate::memory::MemoryStore;
use crate::models::{FeedItem, UserInfo};
use crate::mutation::{
    CommentReceipt, MutationEngine, MutationLimits, MutationPaths, RepostRemoval, RepostToggle,
};
use crate::notify::NotificationDispatcher;
use crate::source::{MutationPath, NotificationSink, QuerySource};
use crate::stats::{SharedSubscriptionStats, SubscriptionStats};
use crate::store::FeedStore;
use crate::subscriptions::{
    RegistryLink, RegistrySnapshot, SubscriptionConfig, SubscriptionEvent, SubscriptionManager,
};
use crate::users::UserCache;
use crate::visibility::VisibilityTracker;

/// External services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn QuerySource>,
    pub trusted: Arc<dyn MutationPath>,
    pub direct: Arc<dyn MutationPath>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl Collaborators {
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self {
            source: Arc::new(store.clone()),
            trusted: Arc::new(store.trusted_path()),
            direct: Arc::new(store.direct_path()),
            notifications: Arc::new(store.clone()),
        }
    }
}

#[derive(Default)]
struct PageState {
    scope: Option<FeedScope>,
    cursor: PageCursor,
}

pub struct FeedSession {
    config: FeedConfig,
    viewer_id: String,
    store: FeedStore,
    users: UserCache,
    stats: SharedSubscriptionStats,
    aggregator: FeedAggregator,
    engine: MutationEngine,
    visibility: Arc<VisibilityTracker>,
    registry: RegistryLink,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
    page: Mutex<PageState>,
    closed: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl FeedSession {
    /// Start a session. Must be called inside a tokio runtime.
    pub fn mount(
        config: FeedConfig,
        viewer_id: impl Into<String>,
        collaborators: Collaborators,
    ) -> Self {
        let viewer_id = viewer_id.into();
        let store = FeedStore::new();
        let users = UserCache::new();
        let stats = SharedSubscriptionStats::new();
        let (events, rx) = mpsc::unbounded_channel();

        let manager = SubscriptionManager::new(
            SubscriptionConfig {
                max_concurrent: config.max_concurrent,
                debounce: config.debounce(),
                open_timeout: config.fetch_timeout(),
            },
            viewer_id.clone(),
            collaborators.source.clone(),
            store.clone(),
            stats.clone(),
            events.clone(),
        );
        let event_loop = tokio::spawn(manager.run(rx));
        let visibility = Arc::new(VisibilityTracker::new(&config.visibility, events.clone()));
        let registry = RegistryLink::new(events.clone(), visibility.clone());

        let engine = MutationEngine::new(
            viewer_id.clone(),
            store.clone(),
            users.clone(),
            MutationPaths {
                trusted: collaborators.trusted,
                direct: collaborators.direct,
            },
            NotificationDispatcher::new(collaborators.notifications, config.mutation_timeout()),
            registry.clone(),
            MutationLimits {
                timeout: config.mutation_timeout(),
                comment_max_len: config.comment_max_len,
            },
        );

        info!(
            viewer_id = %viewer_id,
            max_concurrent = config.max_concurrent,
            debounce_ms = config.debounce_ms,
            "feed session mounted"
        );

        Self {
            aggregator: FeedAggregator::new(collaborators.source, config.fetch_timeout()),
            visibility,
            registry,
            config,
            viewer_id,
            store,
            users,
            stats,
            engine,
            events,
            page: Mutex::new(PageState::default()),
            closed: AtomicBool::new(false),
            event_loop: Mutex::new(Some(event_loop)),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> FeedResult<()> {
        if self.is_closed() {
            return Err(FeedError::SessionClosed);
        }
        Ok(())
    }

    /// Replace the feed with the first page for `scope`. Content that dropped
    /// out of the window has its live channel closed right away.
    pub async fn load(&self, scope: FeedScope) -> FeedResult<usize> {
        self.ensure_open()?;
        let page = self
            .aggregator
            .fetch_page(&scope, self.config.target_size, self.config.per_owner_cap)
            .await?;
        self.ensure_open()?;

        let count = page.items.len();
        let dropped = self.store.replace(page.items);
        for content_id in &dropped {
            self.registry.evict(content_id);
        }
        *self.page.lock() = PageState {
            scope: Some(scope),
            cursor: page.cursor,
        };
        debug!(items = count, dropped = dropped.len(), "feed loaded");
        Ok(count)
    }

    /// Append the next slice of the current scope. Returns the number of new rows.
    pub async fn load_more(&self) -> FeedResult<usize> {
        self.ensure_open()?;
        let (scope, cursor) = {
            let page = self.page.lock();
            match &page.scope {
                Some(scope) => (scope.clone(), page.cursor.clone()),
                None => return Ok(0),
            }
        };

        let existing = self.store.content_ids();
        let more = self
            .aggregator
            .load_more(&scope, &cursor, self.config.load_more_step, &existing)
            .await?;
        self.ensure_open()?;

        let added = self.store.append(more.items);
        let mut page = self.page.lock();
        // A reload while this was in flight wins
        if page.scope.as_ref() == Some(&scope) {
            page.cursor = more.cursor;
        }
        Ok(added)
    }

    /// True once every owner in the current scope has no more content.
    pub fn is_exhausted(&self) -> bool {
        self.page.lock().cursor.is_complete()
    }

    /// Content was deleted. Its rows go away and its channel closes without debounce.
    pub fn remove_content(&self, content_id: &str) -> FeedResult<usize> {
        self.ensure_open()?;
        let removed = self.store.remove_content(content_id);
        self.registry.evict(content_id);
        Ok(removed)
    }

    pub fn items(&self) -> Vec<FeedItem> {
        self.store.snapshot()
    }

    pub fn visibility(&self) -> &VisibilityTracker {
        &self.visibility
    }

    /// Registry state as seen by the event loop, after every event queued so far.
    pub async fn registry(&self) -> FeedResult<RegistrySnapshot> {
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        self.events
            .send(SubscriptionEvent::Inspect(tx))
            .map_err(|_| FeedError::SessionClosed)?;
        rx.await.map_err(|_| FeedError::SessionClosed)
    }

    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }

    pub fn remember_user(&self, info: UserInfo) {
        self.users.remember(info);
    }

    pub fn users(&self) -> &UserCache {
        &self.users
    }

    // ===== Mutations =====

    pub async fn toggle_like(&self, content_id: &str) -> FeedResult<()> {
        self.ensure_open()?;
        self.engine.toggle_like(content_id).await
    }

    pub async fn toggle_reaction(&self, content_id: &str, emoji: &str) -> FeedResult<()> {
        self.ensure_open()?;
        self.engine.toggle_reaction(content_id, emoji).await
    }

    pub async fn toggle_repost(&self, content_id: &str) -> FeedResult<RepostToggle> {
        self.ensure_open()?;
        self.engine.toggle_repost(content_id).await
    }

    pub async fn confirm_repost_removal(&self, removal: RepostRemoval) -> FeedResult<()> {
        self.ensure_open()?;
        self.engine.confirm_repost_removal(removal).await
    }

    pub async fn submit_comment(&self, content_id: &str, text: &str) -> FeedResult<CommentReceipt> {
        self.ensure_open()?;
        self.engine.submit_comment(content_id, text).await
    }

    /// Close every live channel and stop the event loop. Idempotent.
    pub async fn unmount(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.events.send(SubscriptionEvent::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let event_loop = self.event_loop.lock().take();
        if let Some(handle) = event_loop {
            let _ = handle.await;
        }
        self.users.clear();
        info!(viewer_id = %self.viewer_id, "feed session unmounted");
    }
}

impl Drop for FeedSession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let (tx, _) = oneshot::channel();
            let _ = self.events.send(SubscriptionEvent::Shutdown(tx));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::OwnerScope;
    use crate::models::Content;
    use crate::timestamp::RawTimestamp;

    fn scope(owners: &[&str]) -> FeedScope {
        FeedScope::Owners(
            owners
                .iter()
                .map(|o| OwnerScope {
                    owner_id: o.to_string(),
                    trusted: true,
                })
                .collect(),
        )
    }

    fn mount(memory: &MemoryStore) -> FeedSession {
        FeedSession::mount(
            FeedConfig::default().with_max_concurrent(2),
            "me",
            Collaborators::in_memory(memory),
        )
    }

    #[tokio::test]
    async fn test_unmount_closes_channels_and_rejects_calls() {
        let memory = MemoryStore::with_contents([
            Content::new("a", "alice", RawTimestamp::EpochSeconds(10)),
            Content::new("b", "alice", RawTimestamp::EpochSeconds(20)),
        ]);
        let session = mount(&memory);
        session.load(scope(&["alice"])).await.unwrap();

        for id in ["a", "b"] {
            session.visibility().observe(id);
            session.visibility().report(id, 1.0);
        }
        let registry = session.registry().await.unwrap();
        assert_eq!(registry.active.len(), 2);
        assert_eq!(memory.open_channels(), 2);

        session.unmount().await;
        assert_eq!(memory.open_channels(), 0);
        assert_eq!(memory.close_calls(), 2);
        assert!(session.is_closed());
        assert_eq!(session.toggle_like("a").await, Err(FeedError::SessionClosed));
        assert_eq!(session.registry().await, Err(FeedError::SessionClosed));
        assert_eq!(session.load(scope(&["alice"])).await, Err(FeedError::SessionClosed));

        // Second unmount is a no-op
        session.unmount().await;
        assert_eq!(memory.close_calls(), 2);
    }

    #[tokio::test]
    async fn test_reload_closes_channels_for_dropped_content() {
        let memory = MemoryStore::with_contents([
            Content::new("a", "alice", RawTimestamp::EpochSeconds(10)),
            Content::new("b", "bob", RawTimestamp::EpochSeconds(20)),
        ]);
        let session = mount(&memory);
        session.load(scope(&["alice", "bob"])).await.unwrap();
        session.visibility().observe("b");
        session.visibility().report("b", 1.0);
        assert!(session.registry().await.unwrap().is_subscribed("b"));

        session.load(scope(&["alice"])).await.unwrap();
        let registry = session.registry().await.unwrap();
        assert!(!registry.is_subscribed("b"));
        assert_eq!(memory.close_calls(), 1);
        assert!(!session.visibility().is_visible("b"));
    }

    #[tokio::test]
    async fn test_load_more_without_scope_is_empty() {
        let session = mount(&MemoryStore::new());
        assert_eq!(session.load_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_content_drops_rows() {
        let memory = MemoryStore::with_contents([Content::new(
            "a",
            "alice",
            RawTimestamp::EpochSeconds(10),
        )]);
        let session = mount(&memory);
        session.load(scope(&["alice"])).await.unwrap();
        session.visibility().observe("a");
        session.visibility().report("a", 1.0);

        assert_eq!(session.remove_content("a").unwrap(), 1);
        assert!(session.items().is_empty());
        let registry = session.registry().await.unwrap();
        assert!(registry.active.is_empty());
        assert_eq!(memory.close_calls(), 1);
    }
}
