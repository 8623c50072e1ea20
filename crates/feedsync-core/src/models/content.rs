use serde::{Deserialize, Serialize};

use super::feed_item::Counters;
use crate::timestamp::RawTimestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentVisibility {
    Public,
    /// Only visible to accepted connections of the owner
    Connections,
}

/// Why a piece of content is being surfaced through an activity channel
/// rather than its own creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentActivity {
    #[serde(rename_all = "camelCase")]
    Repost { actor_id: String, at: RawTimestamp },
    #[serde(rename_all = "camelCase")]
    ContentAdded { actor_id: String, at: RawTimestamp },
}

/// One document as returned by the query source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub title: String,
    pub visibility: ContentVisibility,
    pub created_at: RawTimestamp,
    #[serde(default)]
    pub activity: Option<ContentActivity>,
    /// Counters as denormalized on the document at fetch time
    #[serde(default)]
    pub counters: Counters,
}

impl Content {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        created_at: impl Into<RawTimestamp>,
    ) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            title: String::new(),
            visibility: ContentVisibility::Public,
            created_at: created_at.into(),
            activity: None,
            counters: Counters::default(),
        }
    }

    pub fn with_visibility(mut self, visibility: ContentVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_activity(mut self, activity: ContentActivity) -> Self {
        self.activity = Some(activity);
        self
    }

    pub fn is_public(&self) -> bool {
        self.visibility == ContentVisibility::Public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_document_with_tagged_timestamp() {
        let doc = json!({
            "id": "album-1",
            "ownerId": "alice",
            "visibility": "public",
            "createdAt": {"_seconds": 1_700_000_000, "_nanoseconds": 0},
            "activity": {"type": "contentAdded", "actorId": "alice", "at": 1_700_000_500}
        });
        let content: Content = serde_json::from_value(doc).unwrap();
        assert_eq!(content.owner_id, "alice");
        assert!(content.is_public());
        assert!(matches!(
            content.activity,
            Some(ContentActivity::ContentAdded { ref actor_id, .. }) if actor_id == "alice"
        ));
        assert_eq!(content.counters, Counters::default());
    }
}
