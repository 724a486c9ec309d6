use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::Disposition;
use crate::github::GithubClient;
use crate::messaging::{self, Bus, CRAWL_QUEUE, PROCESS_QUEUE, RECONNECT_DELAY};
use crate::models::{CrawlResult, DiscoveryMessage};
use crate::store::PgStore;

pub const RAW_CONTENT_BASE_URL: &str = "https://raw.githubusercontent.com";
const README_CANDIDATES: [&str; 2] = ["README.md", "README.txt"];

pub struct Crawler {
    pub store: PgStore,
    pub github: GithubClient,
    pub http: reqwest::Client,
    pub raw_content_base_url: String,
}

impl Crawler {
    pub fn new(store: PgStore, github: GithubClient) -> Self {
        Self {
            store,
            github,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            raw_content_base_url: RAW_CONTENT_BASE_URL.to_string(),
        }
    }

    /// Consume loop. Rebuilds the consumer stream whenever the bus reports
    /// closure and retries the broker indefinitely; never returns.
    pub async fn run(&self, config: &Config) -> anyhow::Result<()> {
        loop {
            let bus = match Bus::connect_with_retry(&config.rabbitmq_url).await {
                Ok(bus) => bus,
                Err(e) => {
                    error!("Broker unavailable: {e}. Retrying...");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            let mut consumer = match bus.consume(CRAWL_QUEUE, "crawler").await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to start consuming from {CRAWL_QUEUE}: {e}. Reconnecting...");
                    bus.close().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            info!("Crawler started. Waiting for messages on queue: {CRAWL_QUEUE}");

            loop {
                tokio::select! {
                    delivery = consumer.next() => {
                        let Some(Ok(delivery)) = delivery else {
                            warn!("Consume stream ended. Reconnecting...");
                            break;
                        };
                        let disposition = self.handle_delivery(&bus, &delivery.data).await;
                        messaging::settle(&delivery, disposition).await;
                    }
                    _ = bus.closed() => {
                        warn!("Bus connection lost. Reconnecting...");
                        break;
                    }
                }
            }

            bus.close().await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn handle_delivery(&self, bus: &Bus, payload: &[u8]) -> Disposition {
        let message: DiscoveryMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to decode discovery message: {e}");
                return Disposition::Discard;
            }
        };
        self.crawl(bus, message).await
    }

    async fn crawl(&self, bus: &Bus, message: DiscoveryMessage) -> Disposition {
        let mut repo = message.repository;
        info!("Received a repository to crawl: {}", repo.full_name);

        let last_crawled_at = match self.store.get_last_crawl_time(repo.id).await {
            Ok(last) => last,
            Err(e) => {
                // Unknown freshness is treated as stale; a duplicate crawl
                // is absorbed downstream.
                warn!("Failed to get last crawl time for {}: {e}", repo.full_name);
                None
            }
        };

        if should_skip(repo.pushed_at, last_crawled_at) {
            info!("Skipping {}, no new updates since last crawl", repo.full_name);
            return Disposition::Ack;
        }

        repo.readme_url = self
            .find_readme_url(&repo.full_name, &repo.default_branch)
            .await;

        repo.tags = match self.github.get_tags(&repo.full_name).await {
            Ok(tags) => tags,
            Err(e) => {
                error!("Failed to get tags for {}: {e}", repo.full_name);
                return Disposition::Requeue;
            }
        };

        repo.languages = match self.github.get_languages(&repo.full_name).await {
            Ok(languages) => languages,
            Err(e) => {
                error!("Failed to get languages for {}: {e}", repo.full_name);
                return Disposition::Requeue;
            }
        };

        let full_name = repo.full_name.clone();
        let result = CrawlResult {
            repository: repo,
            discovered_at: message.discovered_at,
            crawled_at: Utc::now(),
        };

        if let Err(e) = bus.publish_json(PROCESS_QUEUE, &result).await {
            error!("Failed to publish crawl result for {full_name}: {e}");
            return Disposition::Requeue;
        }

        info!("Successfully crawled and published data for: {full_name}");
        Disposition::Ack
    }

    /// Probes the raw content host for well-known README names; the first
    /// HEAD that answers 200 wins.
    async fn find_readme_url(&self, full_name: &str, default_branch: &str) -> Option<String> {
        for name in README_CANDIDATES {
            let url = readme_probe_url(&self.raw_content_base_url, full_name, default_branch, name);
            match self.http.head(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Found README for {full_name} at {url}");
                    return Some(url);
                }
                Ok(response) => {
                    info!("Checked for README at {url}, status: {}", response.status());
                }
                Err(e) => {
                    warn!("Error checking for README at {url}: {e}");
                }
            }
        }
        info!("README not found for {full_name}");
        None
    }
}

fn readme_probe_url(base: &str, full_name: &str, branch: &str, file_name: &str) -> String {
    format!("{base}/{full_name}/{branch}/{file_name}")
}

/// A repository is skipped when the observed push is strictly older than
/// the last completed crawl.
fn should_skip(pushed_at: DateTime<Utc>, last_crawled_at: Option<DateTime<Utc>>) -> bool {
    match last_crawled_at {
        Some(last) => pushed_at < last,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readme_probe_url_shape() {
        assert_eq!(
            readme_probe_url(
                RAW_CONTENT_BASE_URL,
                "eugeneware/gifencoder",
                "master",
                "README.md"
            ),
            "https://raw.githubusercontent.com/eugeneware/gifencoder/master/README.md"
        );
    }

    #[test]
    fn test_skip_when_push_predates_last_crawl() {
        let pushed: DateTime<Utc> = "2025-06-06T07:09:34Z".parse().unwrap();
        let crawled: DateTime<Utc> = "2025-06-07T00:00:00Z".parse().unwrap();
        assert!(should_skip(pushed, Some(crawled)));
    }

    #[test]
    fn test_crawl_when_push_is_newer() {
        let pushed: DateTime<Utc> = "2025-06-06T07:09:34Z".parse().unwrap();
        let crawled: DateTime<Utc> = "2025-06-01T00:00:00Z".parse().unwrap();
        assert!(!should_skip(pushed, Some(crawled)));
    }

    #[test]
    fn test_crawl_when_never_crawled() {
        let pushed: DateTime<Utc> = "2025-06-06T07:09:34Z".parse().unwrap();
        assert!(!should_skip(pushed, None));
    }

    #[test]
    fn test_equal_timestamps_are_not_skipped() {
        let t: DateTime<Utc> = "2025-06-06T07:09:34Z".parse().unwrap();
        assert!(!should_skip(t, Some(t)));
    }
}
