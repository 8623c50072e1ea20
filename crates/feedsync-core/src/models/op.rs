use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationKind {
    Like,
    Reaction,
    Repost,
    Comment,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MutationKind::Like => "like",
            MutationKind::Reaction => "reaction",
            MutationKind::Repost => "repost",
            MutationKind::Comment => "comment",
        };
        f.write_str(label)
    }
}

/// Payload handed to the remote mutation paths. Toggle ops carry the desired
/// end state so that replaying one is harmless at the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum RemoteOp {
    #[serde(rename_all = "camelCase")]
    SetLike {
        content_id: String,
        actor_id: String,
        active: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetReaction {
        content_id: String,
        actor_id: String,
        emoji: String,
        active: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetRepost {
        content_id: String,
        actor_id: String,
        active: bool,
    },
    /// `comment_id` is assigned client-side at creation and is what the store
    /// uses to suppress duplicates.
    #[serde(rename_all = "camelCase")]
    AddComment {
        content_id: String,
        actor_id: String,
        comment_id: String,
        text: String,
    },
}

impl RemoteOp {
    pub fn kind(&self) -> MutationKind {
        match self {
            RemoteOp::SetLike { .. } => MutationKind::Like,
            RemoteOp::SetReaction { .. } => MutationKind::Reaction,
            RemoteOp::SetRepost { .. } => MutationKind::Repost,
            RemoteOp::AddComment { .. } => MutationKind::Comment,
        }
    }

    pub fn content_id(&self) -> &str {
        match self {
            RemoteOp::SetLike { content_id, .. }
            | RemoteOp::SetReaction { content_id, .. }
            | RemoteOp::SetRepost { content_id, .. }
            | RemoteOp::AddComment { content_id, .. } => content_id,
        }
    }
}
