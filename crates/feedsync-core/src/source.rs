//! Collaborator contracts
//!
//! The engine never talks to storage, the mutation API or the notification
//! transport directly. It only sees these traits, so the document store, the
//! privileged API and the direct data-layer write path can be swapped out
//! (see `memory::MemoryStore` for the in-process implementation).

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::FeedResult;
use crate::models::{ChildRecord, Content, NotificationIntent, RemoteOp, SubscriptionHandle};
use crate::subscriptions::SubscriptionEvent;
use crate::FeedError;

/// Equality filter the query source must be able to apply server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFilter {
    PublicOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchOrder {
    CreatedAtDesc,
    /// No server-side ordering. Never needs a composite index.
    Unordered,
}

#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Fetch content for one owner, or across all owners when `owner_id` is `None`.
    /// Fails with `FeedError::IndexUnavailable` when the filter + order combination
    /// has no backing index.
    async fn fetch_by_owner(
        &self,
        owner_id: Option<&str>,
        filter: Option<ContentFilter>,
        order: FetchOrder,
        limit: Option<usize>,
    ) -> FeedResult<Vec<Content>>;

    /// Open a live channel for one content id. Every change to the content's
    /// child records must be pushed into `sink` as a full snapshot.
    async fn subscribe(&self, content_id: &str, sink: ChannelSink)
        -> FeedResult<Box<dyn LiveChannel>>;
}

#[async_trait]
pub trait LiveChannel: Send {
    async fn close(self: Box<Self>);
}

/// One tier of the remote mutation path.
#[async_trait]
pub trait MutationPath: Send + Sync {
    fn name(&self) -> &'static str;

    async fn mutate(&self, op: &RemoteOp) -> FeedResult<()>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, intent: NotificationIntent) -> FeedResult<()>;
}

/// Where a live channel delivers its snapshots. Everything lands on the
/// subscription manager's event loop, tagged with the channel handle so that
/// late deliveries from an already-closed channel can be dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    content_id: String,
    handle: SubscriptionHandle,
    events: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelSink {
    pub(crate) fn new(
        content_id: String,
        handle: SubscriptionHandle,
        events: mpsc::UnboundedSender<SubscriptionEvent>,
    ) -> Self {
        Self {
            content_id,
            handle,
            events,
        }
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Push a full snapshot. Returns false once the session is gone.
    pub fn push(&self, records: Vec<ChildRecord>) -> bool {
        self.events
            .send(SubscriptionEvent::ChannelUpdate {
                content_id: self.content_id.clone(),
                handle: self.handle,
                records,
            })
            .is_ok()
    }

    pub fn fail(&self, error: FeedError) -> bool {
        self.events
            .send(SubscriptionEvent::ChannelFailed {
                content_id: self.content_id.clone(),
                handle: self.handle,
                error,
            })
            .is_ok()
    }
}
