use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content::{Content, ContentActivity};
use crate::constants::REPOST_ROW_MARKER;
use crate::timestamp::latest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTally {
    pub count: u64,
    /// Whether the viewer is one of the reactors
    pub mine: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Counters {
    pub like_count: u64,
    pub liked_by_me: bool,
    pub repost_count: u64,
    pub reposted_by_me: bool,
    pub comment_count: u64,
    /// emoji -> tally. BTreeMap keeps the rendering order stable.
    pub reactions: BTreeMap<String, ReactionTally>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActivityBanner {
    None,
    #[serde(rename_all = "camelCase")]
    Repost {
        actor_id: String,
        at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ContentAdded {
        actor_id: String,
        at: DateTime<Utc>,
    },
}

impl ActivityBanner {
    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            ActivityBanner::None => None,
            ActivityBanner::Repost { at, .. } | ActivityBanner::ContentAdded { at, .. } => {
                Some(*at)
            }
        }
    }

    pub fn is_repost(&self) -> bool {
        matches!(self, ActivityBanner::Repost { .. })
    }
}

/// Opaque id of an open live channel. The channel itself lives in the
/// subscription registry; rows only carry this marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiveState {
    Unsubscribed,
    Subscribed(SubscriptionHandle),
}

/// One row in the feed. A content id can back several rows (its own creation
/// row plus repost rows); `row_key` is unique per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedItem {
    pub id: String,
    pub row_key: String,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub activity_banner: ActivityBanner,
    /// Most recent content-addition seen on a live channel
    pub last_addition: Option<DateTime<Utc>>,
    /// Sort key: max(banner time, last addition, creation). Kept in sync by
    /// `refresh_effective_timestamp`.
    pub effective_timestamp: DateTime<Utc>,
    pub counters: Counters,
    /// Owned by the subscription manager
    pub live_state: LiveState,
}

pub fn repost_row_key(content_id: &str, actor_id: &str) -> String {
    format!("{}:{}:{}", content_id, REPOST_ROW_MARKER, actor_id)
}

impl FeedItem {
    pub fn from_content(content: Content) -> Self {
        let created_at = content.created_at.resolve_or_epoch();
        let (activity_banner, row_key) = match content.activity {
            Some(ContentActivity::Repost { actor_id, at }) => (
                ActivityBanner::Repost {
                    at: at.resolve_or_epoch(),
                    actor_id: actor_id.clone(),
                },
                repost_row_key(&content.id, &actor_id),
            ),
            Some(ContentActivity::ContentAdded { actor_id, at }) => (
                ActivityBanner::ContentAdded {
                    actor_id,
                    at: at.resolve_or_epoch(),
                },
                content.id.clone(),
            ),
            None => (ActivityBanner::None, content.id.clone()),
        };

        let mut item = Self {
            id: content.id,
            row_key,
            owner_id: content.owner_id,
            title: content.title,
            created_at,
            activity_banner,
            last_addition: None,
            effective_timestamp: created_at,
            counters: content.counters,
            live_state: LiveState::Unsubscribed,
        };
        item.refresh_effective_timestamp();
        item
    }

    /// Build the activity row a repost by `actor_id` adds to the feed.
    pub fn repost_of(original: &FeedItem, actor_id: &str, at: DateTime<Utc>) -> Self {
        let mut row = Self {
            id: original.id.clone(),
            row_key: repost_row_key(&original.id, actor_id),
            owner_id: original.owner_id.clone(),
            title: original.title.clone(),
            created_at: original.created_at,
            activity_banner: ActivityBanner::Repost {
                actor_id: actor_id.to_string(),
                at,
            },
            last_addition: original.last_addition,
            effective_timestamp: original.created_at,
            counters: original.counters.clone(),
            live_state: LiveState::Unsubscribed,
        };
        row.refresh_effective_timestamp();
        row
    }

    pub fn is_repost_row(&self) -> bool {
        self.activity_banner.is_repost()
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(self.live_state, LiveState::Subscribed(_))
    }

    /// Recompute the sort key. Returns true if it moved.
    pub fn refresh_effective_timestamp(&mut self) -> bool {
        let next = latest([
            Some(self.created_at),
            self.activity_banner.at(),
            self.last_addition,
        ])
        .unwrap_or(self.created_at);
        let changed = next != self.effective_timestamp;
        self.effective_timestamp = next;
        changed
    }
}
