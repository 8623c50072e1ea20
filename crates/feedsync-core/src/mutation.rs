//! Optimistic mutations
//!
//! Every user action becomes a `MutationIntent`: the forward transform, its
//! exact inverse (both computed once, from the same local state), the remote op,
//! and the notifications to send if the remote op succeeds. The forward
//! transform is applied before the first await. Transforms are consumed when
//! applied, so neither can run twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FeedError, FeedResult};
use crate::models::feed_item::repost_row_key;
use crate::models::{
    Counters, FeedItem, LiveState, MutationKind, NotificationIntent, NotificationKind,
    ReactionTally, RemoteOp,
};
use crate::notify::NotificationDispatcher;
use crate::resort::resort_in_place;
use crate::source::MutationPath;
use crate::store::{insert_row, remove_row, FeedStore};
use crate::subscriptions::RegistryLink;
use crate::users::UserCache;

/// Field-level counter change. Each variant only touches its own fields so a
/// rollback cannot clobber unrelated fields a live update wrote in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterPatch {
    Like { liked: bool, count: u64 },
    Reaction { emoji: String, tally: Option<ReactionTally> },
    Repost { reposted: bool, count: u64 },
    Comments { count: u64 },
}

impl CounterPatch {
    fn apply(self, counters: &mut Counters) {
        match self {
            CounterPatch::Like { liked, count } => {
                counters.liked_by_me = liked;
                counters.like_count = count;
            }
            CounterPatch::Reaction { emoji, tally } => match tally {
                Some(tally) => {
                    counters.reactions.insert(emoji, tally);
                }
                None => {
                    counters.reactions.remove(&emoji);
                }
            },
            CounterPatch::Repost { reposted, count } => {
                counters.reposted_by_me = reposted;
                counters.repost_count = count;
            }
            CounterPatch::Comments { count } => counters.comment_count = count,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Patch { row_key: String, patch: CounterPatch },
    InsertRow { index: usize, item: Box<FeedItem> },
    RemoveRow { row_key: String },
    Batch(Vec<Transform>),
}

impl Transform {
    /// Apply to the rows. Returns true if rows were added or removed.
    pub fn apply(self, items: &mut Vec<FeedItem>) -> bool {
        match self {
            Transform::Patch { row_key, patch } => {
                if let Some(row) = items.iter_mut().find(|i| i.row_key == row_key) {
                    patch.apply(&mut row.counters);
                }
                false
            }
            Transform::InsertRow { index, item } => insert_row(items, index, *item),
            Transform::RemoveRow { row_key } => remove_row(items, &row_key).is_some(),
            Transform::Batch(steps) => steps
                .into_iter()
                .fold(false, |reshaped, step| step.apply(items) | reshaped),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Apply the inverse transform
    Rollback,
    /// Additive ops keep their local effect
    KeepLocal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationIntent {
    pub content_id: String,
    pub kind: MutationKind,
    pub forward: Transform,
    pub inverse: Transform,
    pub remote: RemoteOp,
    /// Sent only after the remote op is confirmed
    pub notifications: Vec<NotificationIntent>,
    pub on_failure: FailurePolicy,
}

/// Inputs every intent builder needs besides the rows.
#[derive(Debug, Clone)]
pub struct IntentContext {
    pub viewer_id: String,
    pub viewer_name: Option<String>,
    pub now: DateTime<Utc>,
}

impl IntentContext {
    fn notify_owner(&self, owner_id: &str, content_id: &str, kind: NotificationKind) -> Vec<NotificationIntent> {
        if owner_id == self.viewer_id {
            return Vec::new();
        }
        vec![NotificationIntent {
            recipient_id: owner_id.to_string(),
            actor_id: self.viewer_id.clone(),
            actor_name: self.viewer_name.clone(),
            content_id: content_id.to_string(),
            kind,
        }]
    }
}

fn rows_for<'a>(items: &'a [FeedItem], content_id: &str) -> FeedResult<Vec<&'a FeedItem>> {
    let rows: Vec<&FeedItem> = items.iter().filter(|i| i.id == content_id).collect();
    if rows.is_empty() {
        return Err(FeedError::NotInFeed(content_id.to_string()));
    }
    Ok(rows)
}

/// Per-row (forward, inverse) patches for every row of the content.
fn patch_rows(
    rows: &[&FeedItem],
    f: impl Fn(&Counters) -> (CounterPatch, CounterPatch),
) -> (Vec<Transform>, Vec<Transform>) {
    rows.iter()
        .map(|row| {
            let (next, prior) = f(&row.counters);
            (
                Transform::Patch {
                    row_key: row.row_key.clone(),
                    patch: next,
                },
                Transform::Patch {
                    row_key: row.row_key.clone(),
                    patch: prior,
                },
            )
        })
        .unzip()
}

pub fn like_intent(
    items: &[FeedItem],
    content_id: &str,
    ctx: &IntentContext,
) -> FeedResult<MutationIntent> {
    let rows = rows_for(items, content_id)?;
    let liking = !rows[0].counters.liked_by_me;

    let (forward, inverse) = patch_rows(&rows, |c| {
        let count = match (liking, c.liked_by_me) {
            (true, false) => c.like_count + 1,
            (false, true) => c.like_count.saturating_sub(1),
            _ => c.like_count,
        };
        (
            CounterPatch::Like {
                liked: liking,
                count,
            },
            CounterPatch::Like {
                liked: c.liked_by_me,
                count: c.like_count,
            },
        )
    });

    let notifications = if liking {
        ctx.notify_owner(&rows[0].owner_id, content_id, NotificationKind::Like)
    } else {
        Vec::new()
    };

    Ok(MutationIntent {
        content_id: content_id.to_string(),
        kind: MutationKind::Like,
        forward: Transform::Batch(forward),
        inverse: Transform::Batch(inverse),
        remote: RemoteOp::SetLike {
            content_id: content_id.to_string(),
            actor_id: ctx.viewer_id.clone(),
            active: liking,
        },
        notifications,
        on_failure: FailurePolicy::Rollback,
    })
}

pub fn reaction_intent(
    items: &[FeedItem],
    content_id: &str,
    emoji: &str,
    ctx: &IntentContext,
) -> FeedResult<MutationIntent> {
    let rows = rows_for(items, content_id)?;
    let adding = !rows[0]
        .counters
        .reactions
        .get(emoji)
        .is_some_and(|t| t.mine);

    let (forward, inverse) = patch_rows(&rows, |c| {
        let prior = c.reactions.get(emoji).cloned();
        let next = match (&prior, adding) {
            (Some(t), true) if t.mine => Some(t.clone()),
            (Some(t), true) => Some(ReactionTally {
                count: t.count + 1,
                mine: true,
            }),
            (None, true) => Some(ReactionTally {
                count: 1,
                mine: true,
            }),
            (Some(t), false) if !t.mine => Some(t.clone()),
            (Some(t), false) if t.count > 1 => Some(ReactionTally {
                count: t.count - 1,
                mine: false,
            }),
            (_, false) => None,
        };
        (
            CounterPatch::Reaction {
                emoji: emoji.to_string(),
                tally: next,
            },
            CounterPatch::Reaction {
                emoji: emoji.to_string(),
                tally: prior,
            },
        )
    });

    let notifications = if adding {
        ctx.notify_owner(
            &rows[0].owner_id,
            content_id,
            NotificationKind::Reaction {
                emoji: emoji.to_string(),
            },
        )
    } else {
        Vec::new()
    };

    Ok(MutationIntent {
        content_id: content_id.to_string(),
        kind: MutationKind::Reaction,
        forward: Transform::Batch(forward),
        inverse: Transform::Batch(inverse),
        remote: RemoteOp::SetReaction {
            content_id: content_id.to_string(),
            actor_id: ctx.viewer_id.clone(),
            emoji: emoji.to_string(),
            active: adding,
        },
        notifications,
        on_failure: FailurePolicy::Rollback,
    })
}

fn repost_patches(rows: &[&FeedItem], reposting: bool) -> (Vec<Transform>, Vec<Transform>) {
    patch_rows(rows, |c| {
        let count = match (reposting, c.reposted_by_me) {
            (true, false) => c.repost_count + 1,
            (false, true) => c.repost_count.saturating_sub(1),
            _ => c.repost_count,
        };
        (
            CounterPatch::Repost {
                reposted: reposting,
                count,
            },
            CounterPatch::Repost {
                reposted: c.reposted_by_me,
                count: c.repost_count,
            },
        )
    })
}

/// Adding a repost inserts the viewer's repost row at the top of the feed.
pub fn repost_intent(
    items: &[FeedItem],
    content_id: &str,
    ctx: &IntentContext,
) -> FeedResult<MutationIntent> {
    let rows = rows_for(items, content_id)?;
    let (mut forward, mut inverse) = repost_patches(&rows, true);

    let row_key = repost_row_key(content_id, &ctx.viewer_id);
    if !items.iter().any(|i| i.row_key == row_key) {
        let source = rows
            .iter()
            .find(|r| !r.is_repost_row())
            .copied()
            .unwrap_or(rows[0]);
        let mut row = FeedItem::repost_of(source, &ctx.viewer_id, ctx.now);
        row.counters.reposted_by_me = true;
        if !source.counters.reposted_by_me {
            row.counters.repost_count = source.counters.repost_count + 1;
        }
        forward.push(Transform::InsertRow {
            index: 0,
            item: Box::new(row),
        });
        inverse.insert(0, Transform::RemoveRow { row_key });
    }

    let owner_id = rows[0].owner_id.clone();
    Ok(MutationIntent {
        content_id: content_id.to_string(),
        kind: MutationKind::Repost,
        forward: Transform::Batch(forward),
        inverse: Transform::Batch(inverse),
        remote: RemoteOp::SetRepost {
            content_id: content_id.to_string(),
            actor_id: ctx.viewer_id.clone(),
            active: true,
        },
        notifications: ctx.notify_owner(&owner_id, content_id, NotificationKind::Repost),
        on_failure: FailurePolicy::Rollback,
    })
}

/// Removing a repost drops the viewer's repost row. The inverse puts the row
/// back where it was, minus its live state.
pub fn unrepost_intent(
    items: &[FeedItem],
    content_id: &str,
    ctx: &IntentContext,
) -> FeedResult<MutationIntent> {
    let rows = rows_for(items, content_id)?;
    let (mut forward, inverse_patches) = repost_patches(&rows, false);
    let mut inverse = Vec::new();

    let row_key = repost_row_key(content_id, &ctx.viewer_id);
    if let Some(index) = items.iter().position(|i| i.row_key == row_key) {
        forward.push(Transform::RemoveRow {
            row_key: row_key.clone(),
        });
        let mut saved = items[index].clone();
        saved.live_state = LiveState::Unsubscribed;
        inverse.push(Transform::InsertRow {
            index,
            item: Box::new(saved),
        });
    }
    inverse.extend(inverse_patches);

    Ok(MutationIntent {
        content_id: content_id.to_string(),
        kind: MutationKind::Repost,
        forward: Transform::Batch(forward),
        inverse: Transform::Batch(inverse),
        remote: RemoteOp::SetRepost {
            content_id: content_id.to_string(),
            actor_id: ctx.viewer_id.clone(),
            active: false,
        },
        notifications: Vec::new(),
        on_failure: FailurePolicy::Rollback,
    })
}

pub fn comment_intent(
    items: &[FeedItem],
    content_id: &str,
    comment_id: &str,
    text: &str,
    ctx: &IntentContext,
) -> FeedResult<MutationIntent> {
    let rows = rows_for(items, content_id)?;
    let (forward, inverse) = patch_rows(&rows, |c| {
        (
            CounterPatch::Comments {
                count: c.comment_count + 1,
            },
            CounterPatch::Comments {
                count: c.comment_count,
            },
        )
    });

    let preview: String = text.chars().take(80).collect();
    Ok(MutationIntent {
        content_id: content_id.to_string(),
        kind: MutationKind::Comment,
        forward: Transform::Batch(forward),
        inverse: Transform::Batch(inverse),
        remote: RemoteOp::AddComment {
            content_id: content_id.to_string(),
            actor_id: ctx.viewer_id.clone(),
            comment_id: comment_id.to_string(),
            text: text.to_string(),
        },
        notifications: ctx.notify_owner(
            &rows[0].owner_id,
            content_id,
            NotificationKind::Comment {
                comment_id: comment_id.to_string(),
                preview,
            },
        ),
        on_failure: FailurePolicy::KeepLocal,
    })
}

/// Result of asking to toggle a repost.
#[derive(Debug, PartialEq, Eq)]
pub enum RepostToggle {
    Reposted,
    /// Already reposted. Removal needs an explicit confirmation step.
    ConfirmRemoval(RepostRemoval),
}

/// Only obtainable from `toggle_repost`, so a removal always went through the
/// confirmation prompt.
#[derive(Debug, PartialEq, Eq)]
pub struct RepostRemoval {
    content_id: String,
}

impl RepostRemoval {
    pub fn content_id(&self) -> &str {
        &self.content_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentReceipt {
    pub comment_id: String,
}

/// Outstanding (content id, kind) pairs.
type BusySet = Mutex<HashSet<(String, MutationKind)>>;

struct BusyGuard {
    busy: Arc<BusySet>,
    key: (String, MutationKind),
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.key);
    }
}

/// The part of an intent still needed after the forward transform ran.
struct InFlight {
    content_id: String,
    kind: MutationKind,
    inverse: Transform,
    remote: RemoteOp,
    notifications: Vec<NotificationIntent>,
    on_failure: FailurePolicy,
}

#[derive(Clone)]
pub struct MutationEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    viewer_id: String,
    store: FeedStore,
    users: UserCache,
    trusted: Arc<dyn MutationPath>,
    direct: Arc<dyn MutationPath>,
    dispatcher: NotificationDispatcher,
    registry: RegistryLink,
    timeout: Duration,
    comment_max_len: usize,
    busy: Arc<BusySet>,
}

pub struct MutationPaths {
    /// Privileged API, tried first
    pub trusted: Arc<dyn MutationPath>,
    /// Direct data-layer write, used when the trusted path fails
    pub direct: Arc<dyn MutationPath>,
}

#[derive(Debug, Clone, Copy)]
pub struct MutationLimits {
    /// Per remote call
    pub timeout: Duration,
    pub comment_max_len: usize,
}

impl MutationEngine {
    pub fn new(
        viewer_id: impl Into<String>,
        store: FeedStore,
        users: UserCache,
        paths: MutationPaths,
        dispatcher: NotificationDispatcher,
        registry: RegistryLink,
        limits: MutationLimits,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                viewer_id: viewer_id.into(),
                store,
                users,
                trusted: paths.trusted,
                direct: paths.direct,
                dispatcher,
                registry,
                timeout: limits.timeout,
                comment_max_len: limits.comment_max_len,
                busy: Arc::new(Mutex::new(HashSet::new())),
            }),
        }
    }

    pub fn is_busy(&self, content_id: &str, kind: MutationKind) -> bool {
        self.inner
            .busy
            .lock()
            .contains(&(content_id.to_string(), kind))
    }

    pub async fn toggle_like(&self, content_id: &str) -> FeedResult<()> {
        self.run(content_id, MutationKind::Like, |items, ctx| {
            like_intent(items, content_id, ctx)
        })
        .await
    }

    pub async fn toggle_reaction(&self, content_id: &str, emoji: &str) -> FeedResult<()> {
        self.run(content_id, MutationKind::Reaction, |items, ctx| {
            reaction_intent(items, content_id, emoji, ctx)
        })
        .await
    }

    /// Repost if not yet reposted. If already reposted nothing changes and a
    /// `RepostRemoval` is handed back for the caller to confirm.
    pub async fn toggle_repost(&self, content_id: &str) -> FeedResult<RepostToggle> {
        let row = self
            .inner
            .store
            .primary_row(content_id)
            .ok_or_else(|| FeedError::NotInFeed(content_id.to_string()))?;
        if row.counters.reposted_by_me {
            return Ok(RepostToggle::ConfirmRemoval(RepostRemoval {
                content_id: content_id.to_string(),
            }));
        }

        self.run(content_id, MutationKind::Repost, |items, ctx| {
            repost_intent(items, content_id, ctx)
        })
        .await?;
        Ok(RepostToggle::Reposted)
    }

    pub async fn confirm_repost_removal(&self, removal: RepostRemoval) -> FeedResult<()> {
        let content_id = removal.content_id;
        self.run(&content_id, MutationKind::Repost, |items, ctx| {
            unrepost_intent(items, &content_id, ctx)
        })
        .await
    }

    /// Comments are additive: the local count stays even if delivery fails.
    pub async fn submit_comment(&self, content_id: &str, text: &str) -> FeedResult<CommentReceipt> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FeedError::InvalidComment(
                "Comment cannot be empty.".to_string(),
            ));
        }
        if text.chars().count() > self.inner.comment_max_len {
            return Err(FeedError::InvalidComment(format!(
                "Comment is too long (max {} characters).",
                self.inner.comment_max_len
            )));
        }

        let comment_id = Uuid::new_v4().to_string();
        self.run(content_id, MutationKind::Comment, |items, ctx| {
            comment_intent(items, content_id, &comment_id, text, ctx)
        })
        .await?;
        Ok(CommentReceipt { comment_id })
    }

    fn context(&self) -> IntentContext {
        IntentContext {
            viewer_id: self.inner.viewer_id.clone(),
            viewer_name: self.inner.users.display_name(&self.inner.viewer_id),
            now: Utc::now(),
        }
    }

    /// Claim the busy flag, build the intent and apply its forward transform in
    /// one synchronous step, then settle on a separate task. Dropping the
    /// caller's future does not cancel the settle.
    async fn run(
        &self,
        content_id: &str,
        kind: MutationKind,
        build: impl FnOnce(&[FeedItem], &IntentContext) -> FeedResult<MutationIntent>,
    ) -> FeedResult<()> {
        let key = (content_id.to_string(), kind);
        if !self.inner.busy.lock().insert(key.clone()) {
            return Err(FeedError::Busy {
                content_id: content_id.to_string(),
                kind,
            });
        }
        let guard = BusyGuard {
            busy: self.inner.busy.clone(),
            key,
        };

        let ctx = self.context();
        let (in_flight, reshaped) = self.inner.store.with_items_mut(|items| {
            let intent = build(items, &ctx)?;
            let MutationIntent {
                content_id,
                kind,
                forward,
                inverse,
                remote,
                notifications,
                on_failure,
            } = intent;
            let reshaped = forward.apply(items);
            if reshaped {
                resort_in_place(items);
            }
            let in_flight = InFlight {
                content_id,
                kind,
                inverse,
                remote,
                notifications,
                on_failure,
            };
            Ok::<_, FeedError>((in_flight, reshaped))
        })?;
        debug!(content_id, op = %kind, "optimistic change applied");
        if reshaped {
            self.inner.sync_rows(content_id);
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.settle(in_flight, guard).await })
            .await
            .map_err(|e| FeedError::NetworkFailure(format!("mutation task failed: {}", e)))?
    }
}

impl EngineInner {
    /// Rows for the content were added or removed. Content with no rows left
    /// is out of the feed; otherwise the registry re-marks its channel row.
    fn sync_rows(&self, content_id: &str) {
        if self.store.contains_content(content_id) {
            self.registry.resync(content_id);
        } else {
            self.registry.evict(content_id);
        }
    }

    async fn settle(&self, in_flight: InFlight, guard: BusyGuard) -> FeedResult<()> {
        let InFlight {
            content_id,
            kind,
            inverse,
            remote,
            notifications,
            on_failure,
        } = in_flight;

        let result = match on_failure {
            FailurePolicy::Rollback => self.execute(&remote).await,
            FailurePolicy::KeepLocal => self.execute_additive(&remote).await,
        };

        match result {
            Ok(()) => {
                self.dispatcher.dispatch_all(notifications);
                drop(guard);
                Ok(())
            }
            Err(e) => {
                warn!(op = %kind, content_id = %content_id, error = %e, "mutation failed");
                if on_failure == FailurePolicy::Rollback {
                    let reshaped = self.store.with_items_mut(|items| {
                        let reshaped = inverse.apply(items);
                        if reshaped {
                            resort_in_place(items);
                        }
                        reshaped
                    });
                    if reshaped {
                        self.sync_rows(&content_id);
                    }
                    info!(op = %kind, content_id = %content_id, "optimistic change rolled back");
                }
                // Released only after the rollback landed
                drop(guard);
                Err(e)
            }
        }
    }

    /// Trusted path first; any failure other than a rate limit falls back to
    /// the direct write.
    async fn execute(&self, op: &RemoteOp) -> FeedResult<()> {
        match self.call(self.trusted.as_ref(), op).await {
            Ok(()) => Ok(()),
            Err(e @ FeedError::RateLimited { .. }) => Err(e),
            Err(e) => {
                debug!(
                    path = self.trusted.name(),
                    op = %op.kind(),
                    error = %e,
                    "falling back to direct write"
                );
                self.call(self.direct.as_ref(), op).await
            }
        }
    }

    /// Like `execute`, plus one more direct attempt on a transient failure.
    async fn execute_additive(&self, op: &RemoteOp) -> FeedResult<()> {
        match self.execute(op).await {
            Err(e) if e.is_transient() => {
                debug!(op = %op.kind(), error = %e, "retrying direct write once");
                self.call(self.direct.as_ref(), op).await
            }
            other => other,
        }
    }

    async fn call(&self, path: &dyn MutationPath, op: &RemoteOp) -> FeedResult<()> {
        match tokio::time::timeout(self.timeout, path.mutate(op)).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VisibilityConfig;
    use crate::memory::{MemoryStore, Tier};
    use crate::models::{ActivityBanner, Content, SubscriptionHandle};
    use crate::subscriptions::SubscriptionEvent;
    use crate::timestamp::RawTimestamp;
    use crate::visibility::VisibilityTracker;
    use tokio::sync::mpsc;

    fn ctx() -> IntentContext {
        IntentContext {
            viewer_id: "me".into(),
            viewer_name: Some("Me".into()),
            now: DateTime::from_timestamp(10_000, 0).unwrap(),
        }
    }

    fn liked_item(id: &str, owner: &str, secs: i64, likes: u64) -> FeedItem {
        let mut content = Content::new(id, owner, RawTimestamp::EpochSeconds(secs));
        content.counters.like_count = likes;
        FeedItem::from_content(content)
    }

    fn linked_engine(
        store: &FeedStore,
        memory: &MemoryStore,
    ) -> (MutationEngine, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let visibility = Arc::new(VisibilityTracker::new(&VisibilityConfig::default(), tx.clone()));
        let engine = MutationEngine::new(
            "me",
            store.clone(),
            UserCache::new(),
            MutationPaths {
                trusted: Arc::new(memory.trusted_path()),
                direct: Arc::new(memory.direct_path()),
            },
            NotificationDispatcher::new(Arc::new(memory.clone()), Duration::from_secs(5)),
            RegistryLink::new(tx, visibility),
            MutationLimits {
                timeout: Duration::from_secs(10),
                comment_max_len: 20,
            },
        );
        (engine, rx)
    }

    fn engine(store: &FeedStore, memory: &MemoryStore) -> MutationEngine {
        linked_engine(store, memory).0
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SubscriptionEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(format!("{:?}", event));
        }
        out
    }

    #[test]
    fn test_like_forward_then_inverse_restores_rows_exactly() {
        let mut items = vec![liked_item("x", "alice", 100, 5), liked_item("y", "bob", 50, 1)];
        let before = items.clone();

        let intent = like_intent(&items, "x", &ctx()).unwrap();
        assert_eq!(intent.notifications.len(), 1);
        intent.forward.apply(&mut items);
        assert!(items[0].counters.liked_by_me);
        assert_eq!(items[0].counters.like_count, 6);

        intent.inverse.apply(&mut items);
        assert_eq!(items, before);
    }

    #[test]
    fn test_repost_forward_then_inverse_restores_rows_exactly() {
        let mut items = vec![liked_item("x", "alice", 300, 0), liked_item("y", "bob", 200, 0)];
        let before = items.clone();

        let intent = repost_intent(&items, "y", &ctx()).unwrap();
        assert!(intent.forward.apply(&mut items));
        resort_in_place(&mut items);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].row_key, "y:repost:me");
        assert!(matches!(
            items[0].activity_banner,
            ActivityBanner::Repost { ref actor_id, .. } if actor_id == "me"
        ));
        assert_eq!(items[0].counters.repost_count, 1);

        intent.inverse.apply(&mut items);
        assert_eq!(items, before);
    }

    #[test]
    fn test_unrepost_inverse_puts_row_back_in_place() {
        let original = liked_item("y", "bob", 200, 0);
        let mut repost = FeedItem::repost_of(&original, "me", DateTime::from_timestamp(500, 0).unwrap());
        repost.counters.reposted_by_me = true;
        repost.counters.repost_count = 1;
        let mut original = original;
        original.counters.reposted_by_me = true;
        original.counters.repost_count = 1;
        let mut items = vec![repost, liked_item("x", "alice", 300, 0), original];
        let before = items.clone();

        let intent = unrepost_intent(&items, "y", &ctx()).unwrap();
        intent.forward.apply(&mut items);
        assert_eq!(items.len(), 2);
        assert!(!items[1].counters.reposted_by_me);
        assert_eq!(items[1].counters.repost_count, 0);

        intent.inverse.apply(&mut items);
        assert_eq!(items, before);
    }

    #[test]
    fn test_reaction_toggle_counts() {
        let mut items = vec![liked_item("x", "alice", 1, 0)];
        items[0].counters.reactions.insert(
            "🔥".into(),
            ReactionTally {
                count: 2,
                mine: false,
            },
        );

        let add = reaction_intent(&items, "x", "🔥", &ctx()).unwrap();
        add.forward.apply(&mut items);
        assert_eq!(
            items[0].counters.reactions["🔥"],
            ReactionTally { count: 3, mine: true }
        );

        let remove = reaction_intent(&items, "x", "🔥", &ctx()).unwrap();
        assert!(remove.notifications.is_empty());
        remove.forward.apply(&mut items);
        assert_eq!(
            items[0].counters.reactions["🔥"],
            ReactionTally { count: 2, mine: false }
        );

        let solo = reaction_intent(&items, "x", "🎉", &ctx()).unwrap();
        solo.forward.apply(&mut items);
        let undo = reaction_intent(&items, "x", "🎉", &ctx()).unwrap();
        undo.forward.apply(&mut items);
        assert!(!items[0].counters.reactions.contains_key("🎉"));
    }

    #[test]
    fn test_no_self_notification() {
        let items = vec![liked_item("x", "me", 1, 0)];
        let intent = like_intent(&items, "x", &ctx()).unwrap();
        assert!(intent.notifications.is_empty());
    }

    #[test]
    fn test_missing_content_is_reported() {
        let err = like_intent(&[], "nope", &ctx()).unwrap_err();
        assert_eq!(err, FeedError::NotInFeed("nope".into()));
    }

    #[tokio::test]
    async fn test_toggle_like_twice_returns_to_original() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let memory = MemoryStore::new();
        let engine = engine(&store, &memory);

        engine.toggle_like("x").await.unwrap();
        assert_eq!(store.primary_row("x").unwrap().counters.like_count, 6);
        engine.toggle_like("x").await.unwrap();

        let row = store.primary_row("x").unwrap();
        assert!(!row.counters.liked_by_me);
        assert_eq!(row.counters.like_count, 5);
        assert_eq!(memory.mutation_calls(Tier::Trusted), 2);
        assert_eq!(memory.mutation_calls(Tier::Direct), 0);
    }

    #[tokio::test]
    async fn test_trusted_failure_falls_back_to_direct() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let memory = MemoryStore::new();
        memory.fail_next_mutation(Tier::Trusted, FeedError::RemoteRejected {
            reason: "500".into(),
        });
        let engine = engine(&store, &memory);

        engine.toggle_like("x").await.unwrap();
        assert_eq!(memory.mutation_calls(Tier::Direct), 1);
        assert_eq!(store.primary_row("x").unwrap().counters.like_count, 6);
    }

    #[tokio::test]
    async fn test_rate_limit_skips_fallback_and_rolls_back() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let before = store.snapshot();
        let memory = MemoryStore::new();
        memory.fail_next_mutation(
            Tier::Trusted,
            FeedError::RateLimited {
                retry_after: Some(Duration::from_secs(30)),
            },
        );
        let engine = engine(&store, &memory);

        let err = engine.toggle_like("x").await.unwrap_err();
        assert!(matches!(err, FeedError::RateLimited { .. }));
        assert!(err.user_message().contains("30"));
        assert_eq!(memory.mutation_calls(Tier::Direct), 0);
        assert_eq!(store.snapshot(), before);
        assert!(!engine.is_busy("x", MutationKind::Like));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_mutation_of_same_kind_is_rejected_while_in_flight() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let memory = MemoryStore::new();
        memory.delay_mutations(Duration::from_millis(500));
        let engine = engine(&store, &memory);

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.toggle_like("x").await })
        };
        tokio::task::yield_now().await;
        assert!(engine.is_busy("x", MutationKind::Like));

        let err = engine.toggle_like("x").await.unwrap_err();
        assert!(matches!(err, FeedError::Busy { kind: MutationKind::Like, .. }));
        // A different kind on the same content is fine
        engine.toggle_reaction("x", "🔥").await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(store.primary_row("x").unwrap().counters.like_count, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutation_timeout_is_distinct_and_rolls_back() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let before = store.snapshot();
        let memory = MemoryStore::new();
        memory.delay_mutations(Duration::from_secs(60));
        let engine = engine(&store, &memory);

        let err = engine.toggle_like("x").await.unwrap_err();
        assert!(matches!(err, FeedError::Timeout(_)));
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_dropped_caller_still_settles() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 5)]);
        let memory = MemoryStore::new();
        memory.fail_next_mutation(Tier::Trusted, FeedError::NetworkFailure("a".into()));
        memory.fail_next_mutation(Tier::Direct, FeedError::NetworkFailure("b".into()));
        memory.delay_mutations(Duration::from_millis(20));
        let engine = engine(&store, &memory);

        let fut = engine.toggle_like("x");
        // Poll once so the forward transform lands, then drop the future
        let _ = tokio::time::timeout(Duration::from_millis(1), fut).await;
        assert_eq!(store.primary_row("x").unwrap().counters.like_count, 6);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let row = store.primary_row("x").unwrap();
        assert_eq!(row.counters.like_count, 5);
        assert!(!row.counters.liked_by_me);
        assert!(!engine.is_busy("x", MutationKind::Like));
    }

    #[tokio::test]
    async fn test_comment_validation_happens_before_any_change() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        let engine = engine(&store, &memory);

        assert!(matches!(
            engine.submit_comment("x", "   ").await,
            Err(FeedError::InvalidComment(_))
        ));
        assert!(matches!(
            engine.submit_comment("x", &"a".repeat(21)).await,
            Err(FeedError::InvalidComment(_))
        ));
        assert_eq!(store.primary_row("x").unwrap().counters.comment_count, 0);
        assert!(memory.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_comment_survives_remote_failure_after_retry() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        memory.fail_next_mutation(Tier::Trusted, FeedError::NetworkFailure("a".into()));
        memory.fail_next_mutation(Tier::Direct, FeedError::NetworkFailure("b".into()));
        memory.fail_next_mutation(Tier::Direct, FeedError::NetworkFailure("c".into()));
        let engine = engine(&store, &memory);

        let err = engine.submit_comment("x", "hello").await.unwrap_err();
        assert!(err.is_transient());
        // trusted + direct + one retry of direct
        assert_eq!(memory.mutation_calls(Tier::Trusted), 1);
        assert_eq!(memory.mutation_calls(Tier::Direct), 2);
        assert_eq!(store.primary_row("x").unwrap().counters.comment_count, 1);
    }

    #[tokio::test]
    async fn test_comment_retry_recovers() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        memory.fail_next_mutation(Tier::Trusted, FeedError::NetworkFailure("a".into()));
        memory.fail_next_mutation(Tier::Direct, FeedError::Timeout(Duration::from_secs(1)));
        let engine = engine(&store, &memory);

        let receipt = engine.submit_comment("x", "hello").await.unwrap();
        let records = memory.records("x");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, receipt.comment_id);
    }

    #[tokio::test]
    async fn test_repost_needs_confirmation_to_remove() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        let engine = engine(&store, &memory);

        assert_eq!(engine.toggle_repost("x").await.unwrap(), RepostToggle::Reposted);
        assert_eq!(store.len(), 2);

        let removal = match engine.toggle_repost("x").await.unwrap() {
            RepostToggle::ConfirmRemoval(removal) => removal,
            other => panic!("expected confirmation, got {:?}", other),
        };
        // Nothing changed yet
        assert_eq!(store.len(), 2);
        assert_eq!(removal.content_id(), "x");

        engine.confirm_repost_removal(removal).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(!store.primary_row("x").unwrap().counters.reposted_by_me);
    }

    #[tokio::test]
    async fn test_notification_failure_does_not_fail_mutation() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        memory.fail_notifications(FeedError::NetworkFailure("push down".into()));
        let engine = engine(&store, &memory);

        engine.toggle_reaction("x", "🔥").await.unwrap();
        memory.wait_for_notifications(1).await;
        assert!(memory.notifications().is_empty());
        assert!(store.primary_row("x").unwrap().counters.reactions["🔥"].mine);
    }

    #[test]
    fn test_unrepost_inverse_never_restores_a_channel() {
        let original = liked_item("y", "bob", 200, 0);
        let mut repost = FeedItem::repost_of(&original, "me", DateTime::from_timestamp(500, 0).unwrap());
        repost.counters.reposted_by_me = true;
        repost.live_state = LiveState::Subscribed(SubscriptionHandle(3));
        let mut items = vec![repost, original];

        let intent = unrepost_intent(&items, "y", &ctx()).unwrap();
        assert!(intent.forward.apply(&mut items));
        assert!(intent.inverse.apply(&mut items));
        assert_eq!(items[0].row_key, "y:repost:me");
        assert!(items.iter().all(|i| !i.is_subscribed()));
    }

    #[tokio::test]
    async fn test_row_changes_are_reported_to_registry() {
        let store = FeedStore::new();
        store.replace(vec![liked_item("x", "alice", 1, 0)]);
        let memory = MemoryStore::new();
        let (engine, mut rx) = linked_engine(&store, &memory);

        engine.toggle_like("x").await.unwrap();
        assert!(drain(&mut rx).is_empty());

        engine.toggle_repost("x").await.unwrap();
        assert_eq!(drain(&mut rx), vec![r#"SyncLiveState("x")"#.to_string()]);
    }

    #[tokio::test]
    async fn test_removing_last_row_evicts_content() {
        let store = FeedStore::new();
        let content = Content::new("x", "alice", RawTimestamp::EpochSeconds(1)).with_activity(
            crate::models::ContentActivity::Repost {
                actor_id: "me".into(),
                at: RawTimestamp::EpochSeconds(50),
            },
        );
        let mut row = FeedItem::from_content(content);
        row.counters.reposted_by_me = true;
        row.counters.repost_count = 1;
        store.replace(vec![row]);
        let memory = MemoryStore::new();
        memory.fail_next_mutation(Tier::Trusted, FeedError::NetworkFailure("a".into()));
        memory.fail_next_mutation(Tier::Direct, FeedError::NetworkFailure("b".into()));
        let (engine, mut rx) = linked_engine(&store, &memory);

        let removal = match engine.toggle_repost("x").await.unwrap() {
            RepostToggle::ConfirmRemoval(removal) => removal,
            other => panic!("expected confirmation, got {:?}", other),
        };
        assert!(engine.confirm_repost_removal(removal).await.is_err());

        // Gone, then back after the rollback
        assert_eq!(
            drain(&mut rx),
            vec![r#"Remove("x")"#.to_string(), r#"SyncLiveState("x")"#.to_string()]
        );
        assert_eq!(store.len(), 1);
        assert!(!store.primary_row("x").unwrap().is_subscribed());
    }
}
