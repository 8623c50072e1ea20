pub mod aggregator;
pub mod config;
pub mod constants;
pub mod error;
pub mod memory;
pub mod models;
pub mod mutation;
pub mod notify;
pub mod resort;
pub mod session;
pub mod source;
pub mod stats;
pub mod store;
pub mod subscriptions;
pub mod timestamp;
pub mod tracing_setup;
pub mod users;
pub mod visibility;

// Re-export the session surface at crate root for convenience
pub use config::FeedConfig;
pub use error::{FeedError, FeedResult};
pub use models::{ActivityBanner, Counters, FeedItem, LiveState};
pub use session::{Collaborators, FeedSession};
