use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::feed_item::{Counters, ReactionTally};
use crate::timestamp::RawTimestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChildKind {
    Like,
    Reaction { emoji: String },
    Repost,
    Comment { text: String },
    ContentAdded,
}

/// One child record under a content id, as pushed by a live channel.
/// Channels always deliver the full current list, never deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRecord {
    pub id: String,
    pub author_id: String,
    #[serde(flatten)]
    pub kind: ChildKind,
    #[serde(default)]
    pub at: Option<RawTimestamp>,
}

impl ChildRecord {
    pub fn new(id: impl Into<String>, author_id: impl Into<String>, kind: ChildKind) -> Self {
        Self {
            id: id.into(),
            author_id: author_id.into(),
            kind,
            at: None,
        }
    }

    pub fn at(mut self, at: impl Into<RawTimestamp>) -> Self {
        self.at = Some(at.into());
        self
    }
}

impl Counters {
    /// Derive counters from a full child-record snapshot. `viewer_id` decides
    /// the `mine` flags.
    pub fn from_records(records: &[ChildRecord], viewer_id: &str) -> Self {
        let mut counters = Counters::default();
        let mut reactions: BTreeMap<String, ReactionTally> = BTreeMap::new();

        for record in records {
            let mine = record.author_id == viewer_id;
            match &record.kind {
                ChildKind::Like => {
                    counters.like_count += 1;
                    counters.liked_by_me |= mine;
                }
                ChildKind::Reaction { emoji } => {
                    let tally = reactions.entry(emoji.clone()).or_default();
                    tally.count += 1;
                    tally.mine |= mine;
                }
                ChildKind::Repost => {
                    counters.repost_count += 1;
                    counters.reposted_by_me |= mine;
                }
                ChildKind::Comment { .. } => counters.comment_count += 1,
                ChildKind::ContentAdded => {}
            }
        }

        counters.reactions = reactions;
        counters
    }
}

/// Most recent content-addition in a snapshot, as (actor, instant).
pub fn latest_addition(records: &[ChildRecord]) -> Option<(String, DateTime<Utc>)> {
    records
        .iter()
        .filter(|r| matches!(r.kind, ChildKind::ContentAdded))
        .filter_map(|r| Some((r.author_id.clone(), r.at.as_ref()?.resolve()?)))
        .max_by_key(|(_, at)| *at)
}

/// Latest timed repost per actor. Reposts without a usable timestamp are
/// left out since they cannot be placed in the feed.
pub fn latest_reposts(records: &[ChildRecord]) -> BTreeMap<String, DateTime<Utc>> {
    let mut latest: BTreeMap<String, DateTime<Utc>> = BTreeMap::new();
    for record in records.iter().filter(|r| matches!(r.kind, ChildKind::Repost)) {
        let Some(at) = record.at.as_ref().and_then(|at| at.resolve()) else {
            continue;
        };
        latest
            .entry(record.author_id.clone())
            .and_modify(|prev| *prev = (*prev).max(at))
            .or_insert(at);
    }
    latest
}
