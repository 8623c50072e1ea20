use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::records::{latest_addition, latest_reposts};
use crate::models::feed_item::repost_row_key;
use crate::models::{ActivityBanner, ChildRecord, Counters, FeedItem, LiveState};
use crate::resort::resort_in_place;

/// The session's feed window - the ordered list of rows the user scrolls through.
///
/// Shared between the subscription manager (live updates, live state) and the
/// mutation engine (optimistic transforms). The lock is only ever held for a
/// synchronous edit, never across an await, so every edit is atomic with respect
/// to the event loop.
#[derive(Debug, Clone, Default)]
pub struct FeedStore {
    items: Arc<Mutex<Vec<FeedItem>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotOutcome {
    /// Rows sharing the content id that were updated
    pub matched: usize,
    /// Repost rows surfaced for reposts the window did not show yet
    pub rows_added: usize,
    pub resorted: bool,
}

impl FeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn contains_content(&self, content_id: &str) -> bool {
        self.items.lock().iter().any(|i| i.id == content_id)
    }

    pub fn content_ids(&self) -> HashSet<String> {
        self.items.lock().iter().map(|i| i.id.clone()).collect()
    }

    /// First row (in feed order) for a content id.
    pub fn primary_row(&self, content_id: &str) -> Option<FeedItem> {
        self.items
            .lock()
            .iter()
            .find(|i| i.id == content_id)
            .cloned()
    }

    /// Run a synchronous edit against the rows.
    pub fn with_items_mut<R>(&self, f: impl FnOnce(&mut Vec<FeedItem>) -> R) -> R {
        let mut items = self.items.lock();
        f(&mut items)
    }

    /// Replace the whole window (initial load). Returns content ids that were
    /// present before but are gone now.
    pub fn replace(&self, mut next: Vec<FeedItem>) -> Vec<String> {
        resort_in_place(&mut next);
        let mut items = self.items.lock();
        let next_ids: HashSet<&str> = next.iter().map(|i| i.id.as_str()).collect();
        let mut seen = HashSet::new();
        let dropped: Vec<String> = items
            .iter()
            .filter(|i| !next_ids.contains(i.id.as_str()) && seen.insert(i.id.as_str()))
            .map(|i| i.id.clone())
            .collect();

        // Carry live state over for content that survives the reload
        for item in next.iter_mut() {
            if let Some(prev) = items
                .iter()
                .find(|p| p.row_key == item.row_key && p.is_subscribed())
            {
                item.live_state = prev.live_state;
            }
        }

        *items = next;
        dropped
    }

    /// Append rows (load more), skipping row keys already present. Returns how
    /// many rows were added.
    pub fn append(&self, more: Vec<FeedItem>) -> usize {
        let mut items = self.items.lock();
        let mut keys: HashSet<String> = items.iter().map(|i| i.row_key.clone()).collect();
        let before = items.len();
        for item in more {
            if keys.insert(item.row_key.clone()) {
                items.push(item);
            }
        }
        let added = items.len() - before;
        if added > 0 {
            resort_in_place(&mut items);
        }
        added
    }

    /// Drop every row for a content id.
    pub fn remove_content(&self, content_id: &str) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|i| i.id != content_id);
        before - items.len()
    }

    /// Mark exactly one row for the content id with `state`; all sibling rows
    /// are left unsubscribed so only one row ever carries a channel.
    pub fn set_live_state(&self, content_id: &str, state: LiveState) {
        let mut items = self.items.lock();
        let mut first = true;
        for item in items.iter_mut().filter(|i| i.id == content_id) {
            item.live_state = if first { state } else { LiveState::Unsubscribed };
            first = false;
        }
    }

    /// Recompute counters and activity for every row of `content_id` from a
    /// live snapshot. Other fields are left alone. A timed repost by someone
    /// other than the viewer that has no row yet gets one. Resorts only if an
    /// effective timestamp moved or a row was added.
    pub fn apply_snapshot(
        &self,
        content_id: &str,
        records: &[ChildRecord],
        viewer_id: &str,
    ) -> SnapshotOutcome {
        let counters = Counters::from_records(records, viewer_id);
        let addition = latest_addition(records);
        let reposts = latest_reposts(records);

        let mut items = self.items.lock();
        let mut outcome = SnapshotOutcome::default();
        let mut moved = false;

        for item in items.iter_mut().filter(|i| i.id == content_id) {
            outcome.matched += 1;
            item.counters = counters.clone();

            if let Some((actor_id, at)) = &addition {
                if item.last_addition.map_or(true, |prev| *at > prev) {
                    item.last_addition = Some(*at);
                }
                // Repost rows keep their banner; creation rows surface the addition
                let newer = item.activity_banner.at().map_or(true, |prev| *at > prev);
                if !item.is_repost_row() && newer {
                    item.activity_banner = ActivityBanner::ContentAdded {
                        actor_id: actor_id.clone(),
                        at: *at,
                    };
                }
            }

            moved |= item.refresh_effective_timestamp();
        }

        // The viewer's own repost row is managed by the mutation engine
        let template = items
            .iter()
            .filter(|i| i.id == content_id)
            .min_by_key(|i| i.is_repost_row())
            .cloned();
        if let Some(template) = template {
            for (actor_id, at) in reposts.iter().filter(|(actor, _)| *actor != viewer_id) {
                let row_key = repost_row_key(content_id, actor_id);
                if items.iter().any(|i| i.row_key == row_key) {
                    continue;
                }
                items.push(FeedItem::repost_of(&template, actor_id, *at));
                outcome.rows_added += 1;
                moved = true;
            }
        }

        if moved {
            outcome.resorted = resort_in_place(&mut items);
        }
        outcome
    }
}

/// Insert a row at `index` (clamped). The row always lands unsubscribed and
/// a row key already present is left alone. Returns true if the row went in.
///
/// Neither this nor `remove_row` touches live state on other rows; the
/// subscription manager re-marks the content afterwards.
pub fn insert_row(items: &mut Vec<FeedItem>, index: usize, mut item: FeedItem) -> bool {
    if items.iter().any(|i| i.row_key == item.row_key) {
        return false;
    }
    item.live_state = LiveState::Unsubscribed;
    let index = index.min(items.len());
    items.insert(index, item);
    true
}

/// Remove a row by key. Returns the removed row and where it was.
pub fn remove_row(items: &mut Vec<FeedItem>, row_key: &str) -> Option<(usize, FeedItem)> {
    let index = items.iter().position(|i| i.row_key == row_key)?;
    Some((index, items.remove(index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChildKind, Content, SubscriptionHandle};
    use crate::timestamp::RawTimestamp;
    use chrono::DateTime;

    fn item(id: &str, secs: i64) -> FeedItem {
        FeedItem::from_content(Content::new(id, "alice", RawTimestamp::EpochSeconds(secs)))
    }

    #[test]
    fn test_append_skips_existing_rows_and_resorts() {
        let store = FeedStore::new();
        store.replace(vec![item("a", 10), item("b", 30)]);
        let added = store.append(vec![item("a", 10), item("c", 20)]);
        assert_eq!(added, 1);
        let ids: Vec<_> = store.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_replace_reports_dropped_content() {
        let store = FeedStore::new();
        store.replace(vec![item("a", 10), item("b", 20)]);
        store.set_live_state("a", LiveState::Subscribed(SubscriptionHandle(1)));

        let dropped = store.replace(vec![item("a", 10), item("c", 30)]);
        assert_eq!(dropped, vec!["b".to_string()]);
        assert!(store.primary_row("a").unwrap().is_subscribed());
    }

    #[test]
    fn test_live_state_marks_only_one_row() {
        let store = FeedStore::new();
        let original = item("a", 10);
        let at = DateTime::from_timestamp(50, 0).unwrap();
        let repost = FeedItem::repost_of(&original, "bob", at);
        store.replace(vec![original, repost]);

        store.set_live_state("a", LiveState::Subscribed(SubscriptionHandle(3)));
        let subscribed = store.snapshot().iter().filter(|i| i.is_subscribed()).count();
        assert_eq!(subscribed, 1);
    }

    #[test]
    fn test_snapshot_updates_counters_without_resort() {
        let store = FeedStore::new();
        store.replace(vec![item("a", 30), item("b", 20)]);

        let outcome = store.apply_snapshot(
            "b",
            &[ChildRecord::new("l1", "me", ChildKind::Like)],
            "me",
        );
        assert_eq!(outcome.matched, 1);
        assert!(!outcome.resorted);

        let rows = store.snapshot();
        assert_eq!(rows[1].counters.like_count, 1);
        assert!(rows[1].counters.liked_by_me);
        assert_eq!(rows[0].counters, Counters::default());
    }

    #[test]
    fn test_snapshot_with_content_addition_moves_row_to_top() {
        let store = FeedStore::new();
        store.replace(vec![item("a", 30), item("b", 20)]);

        let outcome = store.apply_snapshot(
            "b",
            &[ChildRecord::new("add1", "alice", ChildKind::ContentAdded)
                .at(RawTimestamp::EpochSeconds(99))],
            "me",
        );
        assert!(outcome.resorted);

        let rows = store.snapshot();
        assert_eq!(rows[0].id, "b");
        assert!(matches!(
            rows[0].activity_banner,
            ActivityBanner::ContentAdded { ref actor_id, .. } if actor_id == "alice"
        ));
    }

    #[test]
    fn test_row_edits_never_move_a_channel() {
        let mut original = item("a", 10);
        original.live_state = LiveState::Subscribed(SubscriptionHandle(4));
        let at = DateTime::from_timestamp(50, 0).unwrap();
        let mut repost = FeedItem::repost_of(&original, "me", at);
        repost.live_state = LiveState::Subscribed(SubscriptionHandle(9));
        let repost_key = repost.row_key.clone();
        let mut rows = vec![original];

        assert!(insert_row(&mut rows, 0, repost.clone()));
        assert!(!insert_row(&mut rows, 0, repost));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].live_state, LiveState::Unsubscribed);
        assert_eq!(rows[1].live_state, LiveState::Subscribed(SubscriptionHandle(4)));

        rows[1].live_state = LiveState::Unsubscribed;
        rows[0].live_state = LiveState::Subscribed(SubscriptionHandle(9));
        let (index, removed) = remove_row(&mut rows, &repost_key).unwrap();
        assert_eq!(index, 0);
        assert!(removed.is_subscribed());
        assert!(!rows[0].is_subscribed());
    }

    #[test]
    fn test_snapshot_repost_by_other_surfaces_row() {
        let store = FeedStore::new();
        store.replace(vec![item("top", 300), item("low", 100)]);
        store.set_live_state("low", LiveState::Subscribed(SubscriptionHandle(2)));

        let records = [
            ChildRecord::new("p1", "bob", ChildKind::Repost).at(RawTimestamp::EpochSeconds(900)),
            ChildRecord::new("p2", "me", ChildKind::Repost).at(RawTimestamp::EpochSeconds(950)),
        ];
        let outcome = store.apply_snapshot("low", &records, "me");
        assert_eq!(outcome.rows_added, 1);
        assert!(outcome.resorted);

        let rows = store.snapshot();
        let keys: Vec<_> = rows.iter().map(|i| i.row_key.as_str()).collect();
        assert_eq!(keys, vec!["low:repost:bob", "top", "low"]);
        assert_eq!(rows[0].effective_timestamp.timestamp(), 900);
        assert_eq!(rows[0].counters.repost_count, 2);
        assert!(rows[0].counters.reposted_by_me);
        assert!(!rows[0].is_subscribed());
        assert!(rows[2].is_subscribed());

        // Same snapshot again adds nothing
        let outcome = store.apply_snapshot("low", &records, "me");
        assert_eq!(outcome.rows_added, 0);
        assert!(!outcome.resorted);
        assert_eq!(store.len(), 3);
    }
}
