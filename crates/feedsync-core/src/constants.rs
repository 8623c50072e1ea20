//! Engine-wide constants
//!
//! Centralized location for defaults and tuning values that are used
//! across multiple modules.

/// Hard ceiling on concurrently open live channels
pub const MAX_CONCURRENT_SUBSCRIPTIONS: usize = 10;

/// Delay between a visibility leave and channel teardown
pub const TEARDOWN_DEBOUNCE_MS: u64 = 2_000;

/// Per-owner fetch limit for the first page
pub const PER_OWNER_CAP: usize = 10;

/// Default size of the merged first page
pub const TARGET_PAGE_SIZE: usize = 20;

/// How much each owner's limit grows on "load more"
pub const LOAD_MORE_STEP: usize = 10;

/// Remote fetch deadline - past this the fetch counts as a timeout
pub const FETCH_TIMEOUT_MS: u64 = 12_000;

/// Remote mutation deadline
pub const MUTATION_TIMEOUT_MS: u64 = 12_000;

/// Longest comment body accepted locally (in chars)
pub const COMMENT_MAX_LEN: usize = 1_000;

/// Pre-load margin handed to the viewport collaborator
pub const VISIBILITY_ROOT_MARGIN_PX: u32 = 200;

/// Row suffix used to build row keys for repost activity entries
pub const REPOST_ROW_MARKER: &str = "repost";
