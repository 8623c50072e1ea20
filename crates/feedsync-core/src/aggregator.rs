//! Feed aggregation
//!
//! Fans out one bounded query per owner, recovers from missing indexes per
//! owner, and merges everything into one deduplicated page ordered by creation
//! time. The page cursor remembers each owner's last limit so "load more" can
//! grow the window without refetching owners that are already exhausted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::models::{Content, FeedItem};
use crate::source::{ContentFilter, FetchOrder, QuerySource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerScope {
    pub owner_id: String,
    /// Trusted owners (accepted connections, the viewer) show all content;
    /// everyone else is restricted to public content.
    pub trusted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedScope {
    Owners(Vec<OwnerScope>),
    /// Unscoped query across all owners, public content only
    Global,
}

impl FeedScope {
    /// The viewer plus their accepted connections (trusted) and anyone else
    /// they follow (public only). Duplicates keep the most trusted entry.
    pub fn for_viewer<I, J>(viewer_id: &str, connections: I, followed: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        let mut owners = vec![OwnerScope {
            owner_id: viewer_id.to_string(),
            trusted: true,
        }];
        let mut seen: HashSet<String> = HashSet::from([viewer_id.to_string()]);

        for owner_id in connections {
            if seen.insert(owner_id.clone()) {
                owners.push(OwnerScope {
                    owner_id,
                    trusted: true,
                });
            }
        }
        for owner_id in followed {
            if seen.insert(owner_id.clone()) {
                owners.push(OwnerScope {
                    owner_id,
                    trusted: false,
                });
            }
        }
        FeedScope::Owners(owners)
    }

    fn queries(&self) -> Vec<OwnerQuery> {
        match self {
            FeedScope::Owners(owners) => owners
                .iter()
                .map(|o| OwnerQuery {
                    owner_id: Some(o.owner_id.clone()),
                    filter: (!o.trusted).then_some(ContentFilter::PublicOnly),
                })
                .collect(),
            FeedScope::Global => vec![OwnerQuery {
                owner_id: None,
                filter: Some(ContentFilter::PublicOnly),
            }],
        }
    }
}

#[derive(Debug, Clone)]
struct OwnerQuery {
    owner_id: Option<String>,
    filter: Option<ContentFilter>,
}

impl OwnerQuery {
    fn label(&self) -> &str {
        self.owner_id.as_deref().unwrap_or("*")
    }
}

/// Per-owner pagination state. `None` keys the global query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCursor {
    limits: HashMap<Option<String>, usize>,
    exhausted: HashSet<Option<String>>,
}

impl PageCursor {
    pub fn limit_for(&self, owner_id: Option<&str>) -> Option<usize> {
        self.limits.get(&owner_id.map(str::to_string)).copied()
    }

    pub fn is_exhausted(&self, owner_id: Option<&str>) -> bool {
        self.exhausted.contains(&owner_id.map(str::to_string))
    }

    /// True once every owner returned fewer rows than it was asked for.
    pub fn is_complete(&self) -> bool {
        !self.limits.is_empty() && self.limits.keys().all(|k| self.exhausted.contains(k))
    }

    fn record(&mut self, owner_id: Option<String>, limit: usize, returned: usize) {
        if returned < limit {
            self.exhausted.insert(owner_id.clone());
        }
        self.limits.insert(owner_id, limit);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<FeedItem>,
    pub cursor: PageCursor,
    /// Owners whose fetch failed and were left out of this page
    pub failed_owners: Vec<String>,
}

#[derive(Clone)]
pub struct FeedAggregator {
    source: Arc<dyn QuerySource>,
    fetch_timeout: Duration,
}

impl FeedAggregator {
    pub fn new(source: Arc<dyn QuerySource>, fetch_timeout: Duration) -> Self {
        Self {
            source,
            fetch_timeout,
        }
    }

    /// First page: up to `per_owner_cap` rows per owner, merged and cut to
    /// `target_size`. Fails only if every owner failed.
    pub async fn fetch_page(
        &self,
        scope: &FeedScope,
        target_size: usize,
        per_owner_cap: usize,
    ) -> FeedResult<Page> {
        let queries = scope.queries();
        let results = join_all(
            queries
                .iter()
                .map(|q| self.fetch_owner(q, per_owner_cap)),
        )
        .await;

        let mut cursor = PageCursor::default();
        let mut contents = Vec::new();
        let mut failed_owners = Vec::new();
        let mut first_error = None;

        for (query, result) in queries.iter().zip(results) {
            match result {
                Ok(found) => {
                    cursor.record(query.owner_id.clone(), per_owner_cap, found.len());
                    contents.extend(found);
                }
                Err(e) => {
                    failed_owners.push(query.label().to_string());
                    first_error.get_or_insert(e);
                }
            }
        }

        if failed_owners.len() == queries.len() {
            if let Some(e) = first_error {
                warn!(owners = queries.len(), error = %e, "every owner fetch failed");
                return Err(e);
            }
        }

        let items = merge(contents, Some(target_size));
        info!(
            owners = queries.len(),
            failed = failed_owners.len(),
            items = items.len(),
            "feed page fetched"
        );
        Ok(Page {
            items,
            cursor,
            failed_owners,
        })
    }

    /// Grow every non-exhausted owner's limit by `step` and return only rows
    /// whose content id is not in `existing`.
    pub async fn load_more(
        &self,
        scope: &FeedScope,
        cursor: &PageCursor,
        step: usize,
        existing: &HashSet<String>,
    ) -> FeedResult<Page> {
        let mut cursor = cursor.clone();
        let pending: Vec<(OwnerQuery, usize)> = scope
            .queries()
            .into_iter()
            .filter(|q| !cursor.exhausted.contains(&q.owner_id))
            .map(|q| {
                let limit = cursor.limits.get(&q.owner_id).copied().unwrap_or(0) + step;
                (q, limit)
            })
            .collect();

        if pending.is_empty() {
            debug!("every owner exhausted, nothing more to load");
            return Ok(Page {
                items: Vec::new(),
                cursor,
                failed_owners: Vec::new(),
            });
        }

        let results = join_all(
            pending
                .iter()
                .map(|(q, limit)| self.fetch_owner(q, *limit)),
        )
        .await;

        let mut contents = Vec::new();
        let mut failed_owners = Vec::new();
        let mut first_error = None;

        for ((query, limit), result) in pending.iter().zip(results) {
            match result {
                Ok(found) => {
                    cursor.record(query.owner_id.clone(), *limit, found.len());
                    contents.extend(found.into_iter().filter(|c| !existing.contains(&c.id)));
                }
                // The owner keeps its previous limit and is retried next time
                Err(e) => {
                    failed_owners.push(query.label().to_string());
                    first_error.get_or_insert(e);
                }
            }
        }

        if failed_owners.len() == pending.len() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let items = merge(contents, None);
        debug!(new_items = items.len(), "load more fetched");
        Ok(Page {
            items,
            cursor,
            failed_owners,
        })
    }

    async fn fetch_owner(&self, query: &OwnerQuery, limit: usize) -> FeedResult<Vec<Content>> {
        let owner_id = query.owner_id.as_deref();
        let primary = self
            .timed(self.source.fetch_by_owner(
                owner_id,
                query.filter,
                FetchOrder::CreatedAtDesc,
                Some(limit),
            ))
            .await;

        let result = match primary {
            Err(FeedError::IndexUnavailable(detail)) => {
                info!(
                    owner_id = query.label(),
                    detail = %detail,
                    "index unavailable, falling back to local sort"
                );
                self.timed(self.source.fetch_by_owner(
                    owner_id,
                    query.filter,
                    FetchOrder::Unordered,
                    None,
                ))
                .await
                .map(|mut found| {
                    sort_by_creation(&mut found);
                    found.truncate(limit);
                    found
                })
            }
            other => other,
        };

        if let Err(e) = &result {
            warn!(owner_id = query.label(), error = %e, "owner fetch failed");
        }
        result
    }

    async fn timed<F>(&self, fut: F) -> FeedResult<Vec<Content>>
    where
        F: std::future::Future<Output = FeedResult<Vec<Content>>>,
    {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FeedError::Timeout(self.fetch_timeout)),
        }
    }
}

/// Newest first; equal creation times fall back to content id.
fn sort_by_creation(contents: &mut [Content]) {
    contents.sort_by(|a, b| {
        b.created_at
            .resolve_or_epoch()
            .cmp(&a.created_at.resolve_or_epoch())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Sort, drop repeated content ids (first occurrence wins) and truncate.
pub fn merge(mut contents: Vec<Content>, target_size: Option<usize>) -> Vec<FeedItem> {
    sort_by_creation(&mut contents);
    let mut seen = HashSet::new();
    let mut items: Vec<FeedItem> = contents
        .into_iter()
        .filter(|c| seen.insert(c.id.clone()))
        .map(FeedItem::from_content)
        .collect();
    if let Some(target) = target_size {
        items.truncate(target);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::ContentVisibility;
    use crate::timestamp::RawTimestamp;

    fn content(id: &str, owner: &str, secs: i64) -> Content {
        Content::new(id, owner, RawTimestamp::EpochSeconds(secs))
    }

    fn ids(items: &[FeedItem]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    fn trusted(ids: &[&str]) -> FeedScope {
        FeedScope::Owners(
            ids.iter()
                .map(|id| OwnerScope {
                    owner_id: id.to_string(),
                    trusted: true,
                })
                .collect(),
        )
    }

    fn aggregator(store: &MemoryStore) -> FeedAggregator {
        FeedAggregator::new(Arc::new(store.clone()), Duration::from_secs(12))
    }

    fn two_owner_store() -> MemoryStore {
        MemoryStore::with_contents([
            content("a1", "A", 10),
            content("a2", "A", 30),
            content("a3", "A", 50),
            content("b1", "B", 20),
            content("b2", "B", 40),
            content("b3", "B", 60),
            content("b4", "B", 70),
        ])
    }

    #[tokio::test]
    async fn test_page_is_newest_across_owners() {
        let store = two_owner_store();
        let page = aggregator(&store)
            .fetch_page(&trusted(&["A", "B"]), 5, 10)
            .await
            .unwrap();

        assert_eq!(ids(&page.items), vec!["b4", "b3", "a3", "b2", "a2"]);
        assert!(page.failed_owners.is_empty());
        assert!(page.cursor.is_complete());
    }

    #[tokio::test]
    async fn test_untrusted_owner_gets_public_filter() {
        let store = MemoryStore::with_contents([
            content("a1", "A", 10),
            content("b1", "B", 20).with_visibility(ContentVisibility::Connections),
            content("b2", "B", 30),
        ]);
        let scope = FeedScope::for_viewer("A", Vec::new(), vec!["B".to_string()]);
        let page = aggregator(&store).fetch_page(&scope, 10, 10).await.unwrap();

        assert_eq!(ids(&page.items), vec!["b2", "a1"]);
        let log = store.fetch_log();
        let b = log.iter().find(|c| c.owner_id.as_deref() == Some("B")).unwrap();
        assert_eq!(b.filter, Some(ContentFilter::PublicOnly));
        let a = log.iter().find(|c| c.owner_id.as_deref() == Some("A")).unwrap();
        assert_eq!(a.filter, None);
    }

    #[tokio::test]
    async fn test_missing_index_falls_back_to_local_sort() {
        let store = MemoryStore::with_contents([
            content("b1", "B", 20),
            content("b3", "B", 60),
            content("b2", "B", 40),
        ]);
        store.drop_index_for("B");
        let scope = FeedScope::Owners(vec![OwnerScope {
            owner_id: "B".into(),
            trusted: false,
        }]);

        let page = aggregator(&store).fetch_page(&scope, 10, 2).await.unwrap();
        assert_eq!(ids(&page.items), vec!["b3", "b2"]);

        let log = store.fetch_log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].order, FetchOrder::Unordered);
        assert_eq!(log[1].limit, None);
    }

    #[tokio::test]
    async fn test_one_owner_failure_does_not_fail_the_page() {
        let store = two_owner_store();
        store.fail_owner("A", FeedError::NetworkFailure("reset".into()));

        let page = aggregator(&store)
            .fetch_page(&trusted(&["A", "B"]), 10, 10)
            .await
            .unwrap();
        assert_eq!(ids(&page.items), vec!["b4", "b3", "b2", "b1"]);
        assert_eq!(page.failed_owners, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_all_owners_failing_is_an_error() {
        let store = two_owner_store();
        store.fail_owner("A", FeedError::NetworkFailure("a".into()));
        store.fail_owner("B", FeedError::NetworkFailure("b".into()));

        let err = aggregator(&store)
            .fetch_page(&trusted(&["A", "B"]), 10, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::NetworkFailure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_owner_times_out() {
        let store = two_owner_store();
        store.stall_owner("A");

        let page = aggregator(&store)
            .fetch_page(&trusted(&["A", "B"]), 10, 10)
            .await
            .unwrap();
        assert_eq!(page.failed_owners, vec!["A".to_string()]);
        assert_eq!(page.items.len(), 4);
    }

    #[tokio::test]
    async fn test_load_more_only_returns_new_ids() {
        let store = two_owner_store();
        let agg = aggregator(&store);
        let scope = trusted(&["A", "B"]);

        let first = agg.fetch_page(&scope, 3, 2).await.unwrap();
        assert_eq!(ids(&first.items), vec!["b4", "b3", "a3"]);
        assert_eq!(first.cursor.limit_for(Some("A")), Some(2));

        let existing: HashSet<String> = first.items.iter().map(|i| i.id.clone()).collect();
        let more = agg
            .load_more(&scope, &first.cursor, 2, &existing)
            .await
            .unwrap();
        assert_eq!(ids(&more.items), vec!["b2", "a2", "b1", "a1"]);
        assert!(more.cursor.is_exhausted(Some("A")));
        assert!(!more.cursor.is_exhausted(Some("B")));

        let existing: HashSet<String> = existing
            .into_iter()
            .chain(more.items.iter().map(|i| i.id.clone()))
            .collect();
        let calls_before = store.fetch_log().len();
        let last = agg
            .load_more(&scope, &more.cursor, 2, &existing)
            .await
            .unwrap();
        assert!(last.items.is_empty());
        // Only B was asked again
        let log = store.fetch_log();
        assert_eq!(log.len(), calls_before + 1);
        assert_eq!(log[calls_before].owner_id.as_deref(), Some("B"));
        assert!(last.cursor.is_complete());
    }

    #[test]
    fn test_merge_dedupes_and_breaks_ties_by_id() {
        let merged = merge(
            vec![
                content("b", "B", 10),
                content("a", "A", 10),
                content("c", "A", 20),
                content("a", "A", 10),
            ],
            Some(10),
        );
        assert_eq!(ids(&merged), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_for_viewer_keeps_most_trusted_entry() {
        let scope = FeedScope::for_viewer(
            "me",
            vec!["ann".to_string()],
            vec!["ann".to_string(), "bo".to_string(), "me".to_string()],
        );
        let FeedScope::Owners(owners) = scope else {
            panic!("expected owner scope");
        };
        let flags: Vec<(&str, bool)> = owners
            .iter()
            .map(|o| (o.owner_id.as_str(), o.trusted))
            .collect();
        assert_eq!(flags, vec![("me", true), ("ann", true), ("bo", false)]);
    }
}
