use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::Disposition;
use crate::github::GithubClient;
use crate::messaging::{self, Bus, EMBED_QUEUE, PROCESS_QUEUE, RECONNECT_DELAY};
use crate::models::{CrawlResult, EmbedRequest, Repository, RepositoryStat};
use crate::object_store::{readme_key, ObjectStore};
use crate::store::{PgStore, StatsStore};

pub struct Processor {
    pub store: PgStore,
    pub stats: StatsStore,
    pub objects: ObjectStore,
    pub github: GithubClient,
    pub http: reqwest::Client,
}

impl Processor {
    pub fn new(
        store: PgStore,
        stats: StatsStore,
        objects: ObjectStore,
        github: GithubClient,
    ) -> Self {
        Self {
            store,
            stats,
            objects,
            github,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Consume loop; retries the broker indefinitely and never returns.
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
            let mut consumer = match bus.consume(PROCESS_QUEUE, "processor").await {
                Ok(consumer) => consumer,
                Err(e) => {
                    error!("Failed to start consuming from {PROCESS_QUEUE}: {e}. Reconnecting...");
                    bus.close().await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            info!("Processor started. Waiting for messages on queue: {PROCESS_QUEUE}");

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
        let result: CrawlResult = match serde_json::from_slice(payload) {
            Ok(result) => result,
            Err(e) => {
                error!("Failed to decode crawl result: {e}");
                return Disposition::Discard;
            }
        };
        self.process(bus, result).await
    }

    async fn process(&self, bus: &Bus, mut result: CrawlResult) -> Disposition {
        let full_name = result.repository.full_name.clone();
        info!("Processing data for repository: {full_name}");

        if result.repository.readme_url.is_none() {
            match self
                .github
                .get_readme_download_url(&result.repository.full_name)
                .await
            {
                Ok(url) => result.repository.readme_url = url,
                Err(e) => warn!("Failed to resolve README for {full_name}: {e}"),
            }
        }

        if let Err(e) = self
            .store
            .upsert_repository(&result.repository, result.crawled_at)
            .await
        {
            return match persistence_disposition(&e) {
                Disposition::Requeue => {
                    error!("Transient persistence failure for {full_name}: {e}");
                    Disposition::Requeue
                }
                other => {
                    error!("Dropping {full_name} after non-retriable persistence failure: {e}");
                    other
                }
            };
        }

        let stat = RepositoryStat::from_repository(&result.repository, result.crawled_at);
        match self.stats.append_stat(&stat).await {
            Ok(true) => info!("Appended stat snapshot for {full_name}"),
            Ok(false) => {}
            Err(e) => {
                // The repository row is already durable; a replay only
                // retries the hash-gated stat append.
                error!("Failed to append stats for {full_name}: {e}");
                return Disposition::Requeue;
            }
        }

        if let Some(url) = result.repository.readme_url.clone() {
            self.store_readme_and_request_embedding(bus, &result.repository, &url)
                .await;
        }

        info!("Successfully processed data for: {full_name}");
        Disposition::Ack
    }

    /// Downloads the README, caches it in the object store, and asks for an
    /// embedding. Each step is best-effort: a miss here only delays the
    /// vector, which the similarity engine re-requests on demand.
    async fn store_readme_and_request_embedding(
        &self,
        bus: &Bus,
        repo: &Repository,
        readme_url: &str,
    ) {
        let content = match self.download_readme(readme_url).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Failed to download README for {}: {e}", repo.full_name);
                return;
            }
        };

        let key = readme_key(repo.id);
        if let Err(e) = self
            .objects
            .upload(&key, content, "text/markdown")
            .await
        {
            warn!("Failed to upload README for {}: {e}", repo.full_name);
            return;
        }

        let request = embed_request_for(repo);
        if let Err(e) = bus.publish_json(EMBED_QUEUE, &request).await {
            warn!("Failed to publish embed request for {}: {e}", repo.full_name);
        }
    }

    async fn download_readme(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("README download returned status {}", response.status());
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Classifies a persistence failure: transport and pool problems are worth
/// a retry, while constraint or data errors will fail identically on every
/// redelivery and are dropped.
fn persistence_disposition(error: &anyhow::Error) -> Disposition {
    match error.downcast_ref::<sqlx::Error>() {
        Some(sqlx::Error::Database(_)) | Some(sqlx::Error::ColumnDecode { .. }) => {
            Disposition::Ack
        }
        Some(_) => Disposition::Requeue,
        // Without a typed cause, assume transient; duplicate side effects
        // are absorbed by the conditional upserts.
        None => Disposition::Requeue,
    }
}

fn embed_request_for(repo: &Repository) -> EmbedRequest {
    EmbedRequest {
        repository_id: repo.id,
        minio_path: readme_key(repo.id),
        download_url: repo.readme_url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_requeue() {
        let error = anyhow::Error::from(sqlx::Error::PoolTimedOut);
        assert_eq!(persistence_disposition(&error), Disposition::Requeue);
    }

    #[test]
    fn test_untyped_errors_requeue() {
        let error = anyhow::anyhow!("connection reset");
        assert_eq!(persistence_disposition(&error), Disposition::Requeue);
    }

    #[test]
    fn test_embed_request_carries_object_path_and_fallback() {
        use crate::models::Owner;
        use std::collections::HashMap;

        let now = chrono::Utc::now();
        let repo = Repository {
            id: 13329152,
            node_id: None,
            name: "gifencoder".into(),
            full_name: "eugeneware/gifencoder".into(),
            owner: Owner {
                id: 481,
                login: "eugeneware".into(),
                node_id: None,
                avatar_url: String::new(),
                html_url: String::new(),
                kind: "User".into(),
            },
            html_url: String::new(),
            description: None,
            homepage: None,
            default_branch: "master".into(),
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
            stargazers_count: 520,
            watchers_count: 520,
            forks_count: 91,
            open_issues_count: 12,
            score: 1.0,
            license: None,
            readme_url: Some(
                "https://raw.githubusercontent.com/eugeneware/gifencoder/master/README.md".into(),
            ),
            topics: Vec::new(),
            tags: Vec::new(),
            languages: HashMap::new(),
            last_crawled_at: None,
        };

        let request = embed_request_for(&repo);
        assert_eq!(request.repository_id, 13329152);
        assert_eq!(request.minio_path, "readmes/13329152.md");
        assert_eq!(request.download_url, repo.readme_url);
    }
}
