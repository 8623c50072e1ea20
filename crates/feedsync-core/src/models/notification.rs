use serde::{Deserialize, Serialize};

/// Cached profile data for users that show up in the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationKind {
    Like,
    Reaction { emoji: String },
    Repost,
    #[serde(rename_all = "camelCase")]
    Comment { comment_id: String, preview: String },
}

/// Side-effect notification derived from a confirmed mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationIntent {
    pub recipient_id: String,
    pub actor_id: String,
    pub actor_name: Option<String>,
    pub content_id: String,
    pub kind: NotificationKind,
}
