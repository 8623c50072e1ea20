pub mod content;
pub mod feed_item;
pub mod notification;
pub mod op;
pub mod records;

pub use content::{Content, ContentActivity, ContentVisibility};
pub use feed_item::{ActivityBanner, Counters, FeedItem, LiveState, ReactionTally, SubscriptionHandle};
pub use notification::{NotificationIntent, NotificationKind, UserInfo};
pub use op::{MutationKind, RemoteOp};
pub use records::{ChildKind, ChildRecord};
