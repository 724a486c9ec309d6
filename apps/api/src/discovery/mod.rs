use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::github::{RepositorySearch, PER_PAGE, SEARCH_WINDOW_CAP};
use crate::messaging::{Bus, BusError, CRAWL_QUEUE};
use crate::models::DiscoveryMessage;

pub const DEFAULT_MIN_STARS: u64 = 50;
pub const DEFAULT_MAX_STARS: u64 = 1_000_000;
/// One full sweep per day.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Where discovered repositories go; production publishes to the crawl
/// queue.
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn publish(&self, message: &DiscoveryMessage) -> Result<(), BusError>;
}

#[async_trait]
impl DiscoverySink for Bus {
    async fn publish(&self, message: &DiscoveryMessage) -> Result<(), BusError> {
        self.publish_json(CRAWL_QUEUE, message).await
    }
}

/// Runs a sweep at startup and then once per day, forever.
pub async fn run<S: RepositorySearch, P: DiscoverySink>(search: &S, sink: &P) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        info!(
            "Starting discovery sweep over stars {}..{}",
            DEFAULT_MIN_STARS, DEFAULT_MAX_STARS
        );
        sweep(search, sink, DEFAULT_MIN_STARS, DEFAULT_MAX_STARS).await;
        info!("Discovery sweep finished");
    }
}

/// One full sweep of the inclusive star range.
///
/// The upstream search only exposes the first 1000 results of any query, so
/// ranges whose `total_count` exceeds that window are split at the midpoint
/// and both halves are swept. A range collapsed to a single star count is
/// paginated as-is; whatever exceeds the window there is lost (and logged),
/// since stars cannot be subdivided further.
pub async fn sweep<S: RepositorySearch, P: DiscoverySink>(
    search: &S,
    sink: &P,
    min_stars: u64,
    max_stars: u64,
) {
    // Iterative subdivision: the stack depth is bounded by
    // log2(max - min + 1) because every split halves the span.
    let mut ranges = vec![(min_stars, max_stars)];

    while let Some((min, max)) = ranges.pop() {
        if min > max {
            continue;
        }

        if min == max {
            fetch_all_and_publish(search, sink, &format!("stars:{min}")).await;
            continue;
        }

        let query = format!("stars:{min}..{max}");
        let first_page = match search.search_repositories(&query, 1).await {
            Ok(page) => page,
            Err(e) => {
                error!("Search for '{query}' failed: {e}");
                continue;
            }
        };

        if first_page.total_count > SEARCH_WINDOW_CAP {
            let mid = min + (max - min) / 2;
            ranges.push((mid + 1, max));
            ranges.push((min, mid));
        } else {
            fetch_all_and_publish(search, sink, &query).await;
        }
    }
}

/// Paginates a query to exhaustion (or to the API window cap) and publishes
/// one DiscoveryMessage per item, stamped at publish time.
async fn fetch_all_and_publish<S: RepositorySearch, P: DiscoverySink>(
    search: &S,
    sink: &P,
    query: &str,
) {
    let max_pages = SEARCH_WINDOW_CAP / PER_PAGE;
    let mut page = 1;
    loop {
        let result = match search.search_repositories(query, page).await {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to fetch page {page} for '{query}': {e}");
                return;
            }
        };

        if result.items.is_empty() {
            return;
        }

        let count = result.items.len();
        for repository in result.items {
            let full_name = repository.full_name.clone();
            let message = DiscoveryMessage {
                repository,
                discovered_at: Utc::now(),
            };
            match sink.publish(&message).await {
                Ok(()) => info!("Published repository to crawl: {full_name}"),
                Err(e) => error!("Failed to publish {full_name}: {e}"),
            }
        }

        if count < PER_PAGE {
            return;
        }
        if page >= max_pages {
            if result.total_count > SEARCH_WINDOW_CAP {
                warn!(
                    "Query '{query}' has {} results beyond the search window; they are skipped \
                     until a later sweep",
                    result.total_count - SEARCH_WINDOW_CAP
                );
            }
            return;
        }
        page += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::github::{GithubError, SearchPage};
    use crate::models::{Owner, Repository};

    fn repo(id: i64) -> Repository {
        let now = Utc::now();
        Repository {
            id,
            node_id: None,
            name: format!("repo-{id}"),
            full_name: format!("owner/repo-{id}"),
            owner: Owner {
                id: 1,
                login: "owner".into(),
                node_id: None,
                avatar_url: String::new(),
                html_url: String::new(),
                kind: "User".into(),
            },
            html_url: String::new(),
            description: None,
            homepage: None,
            default_branch: "main".into(),
            created_at: now,
            updated_at: now,
            pushed_at: now,
            fork: false,
            is_template: false,
            archived: false,
            disabled: false,
            has_issues: true,
            has_projects: false,
            has_wiki: false,
            has_pages: false,
            has_downloads: false,
            has_discussions: false,
            stargazers_count: 50,
            watchers_count: 50,
            forks_count: 1,
            open_issues_count: 0,
            score: 1.0,
            license: None,
            readme_url: None,
            topics: Vec::new(),
            tags: Vec::new(),
            languages: HashMap::new(),
            last_crawled_at: None,
        }
    }

    /// Canned search results keyed by (query, page), recording every query
    /// it serves.
    struct FakeSearch {
        pages: HashMap<(String, usize), (usize, Vec<i64>)>,
        queries: Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn new(pages: Vec<(&str, usize, usize, Vec<i64>)>) -> Self {
            Self {
                pages: pages
                    .into_iter()
                    .map(|(q, page, total, ids)| ((q.to_string(), page), (total, ids)))
                    .collect(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RepositorySearch for FakeSearch {
        async fn search_repositories(
            &self,
            query: &str,
            page: usize,
        ) -> Result<SearchPage, GithubError> {
            self.queries
                .lock()
                .unwrap()
                .push(format!("{query}#{page}"));
            let (total_count, ids) = self
                .pages
                .get(&(query.to_string(), page))
                .cloned()
                .unwrap_or((0, Vec::new()));
            Ok(SearchPage {
                total_count,
                items: ids.into_iter().map(repo).collect(),
            })
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        published: Mutex<Vec<DiscoveryMessage>>,
    }

    #[async_trait]
    impl DiscoverySink for CollectingSink {
        async fn publish(&self, message: &DiscoveryMessage) -> Result<(), BusError> {
            self.published.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_collapsed_range_issues_single_star_query() {
        let search = FakeSearch::new(vec![("stars:50", 1, 2, vec![10, 11])]);
        let sink = CollectingSink::default();

        sweep(&search, &sink, 50, 50).await;

        let queries = search.queries.lock().unwrap().clone();
        assert_eq!(queries, vec!["stars:50#1"]);
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|m| m.discovered_at <= Utc::now()));
    }

    #[tokio::test]
    async fn test_oversized_range_splits_at_midpoint() {
        let search = FakeSearch::new(vec![
            ("stars:50..100", 1, 5000, vec![]),
            ("stars:50..75", 1, 400, vec![1]),
            ("stars:76..100", 1, 300, vec![2]),
        ]);
        let sink = CollectingSink::default();

        sweep(&search, &sink, 50, 100).await;

        let published = sink.published.lock().unwrap();
        let ids: Vec<i64> = published.iter().map(|m| m.repository.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[tokio::test]
    async fn test_sweep_emits_no_duplicates_for_small_subranges() {
        let search = FakeSearch::new(vec![
            ("stars:1..4", 1, 2000, vec![]),
            ("stars:1..2", 1, 900, vec![1, 2]),
            ("stars:3..4", 1, 900, vec![3, 4]),
        ]);
        let sink = CollectingSink::default();

        sweep(&search, &sink, 1, 4).await;

        let published = sink.published.lock().unwrap();
        let mut ids: Vec<i64> = published.iter().map(|m| m.repository.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), published.len());
    }

    #[tokio::test]
    async fn test_pagination_stops_on_short_page() {
        // 100 items on page 1 forces a second fetch; 3 items there end it.
        let page1: Vec<i64> = (0..100).collect();
        let search = FakeSearch::new(vec![
            ("stars:7", 1, 103, page1),
            ("stars:7", 2, 103, vec![200, 201, 202]),
        ]);
        let sink = CollectingSink::default();

        sweep(&search, &sink, 7, 7).await;

        assert_eq!(sink.published.lock().unwrap().len(), 103);
        let queries = search.queries.lock().unwrap().clone();
        assert_eq!(queries, vec!["stars:7#1", "stars:7#2"]);
    }
}
