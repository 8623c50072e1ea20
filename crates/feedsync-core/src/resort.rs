//! Global feed ordering.
//!
//! Rows are ordered by effective timestamp, newest first. The sort is stable, so
//! rows with equal timestamps keep the relative order they had before.
//! Counter-only updates never come through here.

use crate::models::FeedItem;

pub fn resort(mut items: Vec<FeedItem>) -> Vec<FeedItem> {
    resort_in_place(&mut items);
    items
}

/// Sort in place. Returns false (and touches nothing) if already ordered.
pub fn resort_in_place(items: &mut [FeedItem]) -> bool {
    if is_ordered(items) {
        return false;
    }
    items.sort_by(|a, b| b.effective_timestamp.cmp(&a.effective_timestamp));
    true
}

pub fn is_ordered(items: &[FeedItem]) -> bool {
    items
        .windows(2)
        .all(|w| w[0].effective_timestamp >= w[1].effective_timestamp)
}
