use std::time::Duration;

use crate::models::MutationKind;

pub type FeedResult<T> = Result<T, FeedError>;

/// Failures surfaced by collaborators and by the engine itself.
///
/// Capacity pressure on the live-subscription registry is not an error.
/// Skipped opens only show up in `SubscriptionStats`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    /// Filter + order combination has no backing index. Recovered per owner.
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),
    #[error("Network failure: {0}")]
    NetworkFailure(String),
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Rate limited{}", retry_hint(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    #[error("Remote rejected: {reason}")]
    RemoteRejected { reason: String },
    #[error("Invalid comment: {0}")]
    InvalidComment(String),
    #[error("A {kind} mutation is already in flight for {content_id}")]
    Busy {
        content_id: String,
        kind: MutationKind,
    },
    #[error("Content {0} is not in the feed")]
    NotInFeed(String),
    #[error("Feed session closed")]
    SessionClosed,
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs().max(1)),
        None => String::new(),
    }
}

impl FeedError {
    /// Network failures and timeouts are safe to retry on the next user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::NetworkFailure(_) | FeedError::Timeout(_))
    }

    /// Text shown to the user when a mutation or fetch fails.
    pub fn user_message(&self) -> String {
        match self {
            FeedError::Timeout(_) => {
                "This is taking longer than expected. Please try again.".to_string()
            }
            FeedError::RateLimited {
                retry_after: Some(d),
            } => format!(
                "You're doing that too often. Try again in {} seconds.",
                d.as_secs().max(1)
            ),
            FeedError::RateLimited { retry_after: None } => {
                "You're doing that too often. Try again later.".to_string()
            }
            FeedError::InvalidComment(reason) => reason.clone(),
            FeedError::Busy { .. } => "Still working on your last action.".to_string(),
            FeedError::SessionClosed => "The feed is no longer active.".to_string(),
            _ => "Something went wrong. The action failed.".to_string(),
        }
    }
}
