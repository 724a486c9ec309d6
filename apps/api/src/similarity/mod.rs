use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tracing::{error, info, warn};

use crate::cache::Cache;
use crate::messaging::{Bus, EMBED_QUEUE};
use crate::models::{EmbedRequest, Repository, SimilarityEntry};
use crate::object_store::readme_key;
use crate::store::{PgStore, StatsStore, VectorStore};

/// Recomputation cadence.
pub const ENGINE_INTERVAL: Duration = Duration::from_secs(6 * 3600);
/// Concurrent per-repository computations.
const NUM_WORKERS: usize = 10;

/// Weights fusing the vector score with the categorical signals.
const VECTOR_WEIGHT: f64 = 0.6;
const TOPIC_WEIGHT: f64 = 0.3;
const LANGUAGE_WEIGHT: f64 = 0.1;

pub struct SimilarityEngine {
    pub store: PgStore,
    pub stats: StatsStore,
    pub vectors: Arc<VectorStore>,
    pub cache: Cache,
    pub list_size: usize,
    pub last_update_cut: Duration,
}

impl SimilarityEngine {
    /// Runs one computation at startup and then every six hours.
    pub async fn run(self: Arc<Self>, bus: Arc<Bus>) {
        let mut interval = tokio::time::interval(ENGINE_INTERVAL);
        loop {
            interval.tick().await;
            self.compute_all(&bus).await;
        }
    }

    /// One full pass over every repository pushed within the recency window.
    pub async fn compute_all(&self, bus: &Bus) {
        info!("Starting similarity calculation...");
        let candidate_ids = match self.stats.repository_ids_pushed_since(self.last_update_cut).await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to enumerate similarity candidates: {e}");
                return;
            }
        };
        info!("Computing similarity for {} repositories", candidate_ids.len());

        futures_util::stream::iter(candidate_ids)
            .for_each_concurrent(NUM_WORKERS, |repo_id| async move {
                self.process_repository(bus, repo_id).await;
            })
            .await;

        info!("Similarity calculation completed");
    }

    async fn process_repository(&self, bus: &Bus, repo_id: i64) {
        let vector = match self.vectors.get_vector(repo_id).await {
            Ok(Some(vector)) => vector,
            Ok(None) => {
                // No embedding yet; request one and pick the repository up
                // on a later round.
                let request = EmbedRequest {
                    repository_id: repo_id,
                    minio_path: readme_key(repo_id),
                    download_url: None,
                };
                if let Err(e) = bus.publish_json(EMBED_QUEUE, &request).await {
                    error!("Failed to request embedding for repository {repo_id}: {e}");
                }
                return;
            }
            Err(e) => {
                error!("Failed to fetch vector for repository {repo_id}: {e}");
                return;
            }
        };

        let neighbors = match self
            .vectors
            .search_neighbors(vector, self.list_size as u64, repo_id)
            .await
        {
            Ok(neighbors) => neighbors,
            Err(e) => {
                error!("Neighbor search failed for repository {repo_id}: {e}");
                return;
            }
        };

        let source = match self.store.get_repository_by_id(repo_id).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                warn!("Repository {repo_id} has a vector but no relational row, skipping");
                return;
            }
            Err(e) => {
                error!("Failed to load repository {repo_id}: {e}");
                return;
            }
        };

        let mut scored = Vec::with_capacity(neighbors.len());
        for (neighbor_id, vector_score) in neighbors {
            let candidate = match self.store.get_repository_by_id(neighbor_id).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Failed to load neighbor {neighbor_id}: {e}");
                    continue;
                }
            };
            scored.push(SimilarityEntry {
                member: neighbor_id,
                score: fused_score(&source, &candidate, vector_score as f64),
            });
        }

        let entries = rank_neighbors(scored, self.list_size);
        if entries.is_empty() {
            return;
        }

        if let Err(e) = self
            .store
            .upsert_repository_similarity(repo_id, &entries)
            .await
        {
            error!("Failed to persist similarity for repository {repo_id}: {e}");
            return;
        }

        // The hot copy is only refreshed in place; creating it here would
        // give it an unbounded lifetime, so the online path owns creation.
        let key = format!("similar:{repo_id}");
        let zset: Vec<(f64, i64)> = entries.iter().map(|e| (e.score, e.member)).collect();
        match self.cache.update_sorted_set_if_exists(&key, &zset).await {
            Ok(true) => info!("Refreshed cached neighborhood for repository {repo_id}"),
            Ok(false) => {}
            Err(e) => warn!("Failed to refresh cached neighborhood for {repo_id}: {e}"),
        }
    }
}

/// Jaccard similarity over string sets; 0 when both are empty.
fn jaccard(a: impl IntoIterator<Item = String>, b: impl IntoIterator<Item = String>) -> f64 {
    let a: HashSet<String> = a.into_iter().collect();
    let b: HashSet<String> = b.into_iter().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Final neighbor score: vector similarity dominates, topic overlap
/// refines, language overlap nudges.
fn fused_score(source: &Repository, candidate: &Repository, vector_score: f64) -> f64 {
    let topic_overlap = jaccard(source.topics.iter().cloned(), candidate.topics.iter().cloned());
    let language_overlap = jaccard(
        source.languages.keys().cloned(),
        candidate.languages.keys().cloned(),
    );
    VECTOR_WEIGHT * vector_score + TOPIC_WEIGHT * topic_overlap + LANGUAGE_WEIGHT * language_overlap
}

/// Sorts by score descending and truncates to the configured list size.
fn rank_neighbors(mut entries: Vec<SimilarityEntry>, list_size: usize) -> Vec<SimilarityEntry> {
    entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    entries.truncate(list_size);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_jaccard_half_overlap() {
        let a = strings(&["a", "b", "c"]);
        let b = strings(&["b", "c", "d"]);
        assert_eq!(jaccard(a, b), 0.5);
    }

    #[test]
    fn test_jaccard_both_empty_is_zero() {
        assert_eq!(jaccard(Vec::new(), Vec::new()), 0.0);
    }

    #[test]
    fn test_jaccard_disjoint_is_zero() {
        assert_eq!(jaccard(strings(&["a"]), strings(&["b"])), 0.0);
    }

    #[test]
    fn test_jaccard_identical_is_one() {
        let a = strings(&["rust", "cli"]);
        assert_eq!(jaccard(a.clone(), a), 1.0);
    }

    #[test]
    fn test_score_fusion_weights() {
        use crate::models::Owner;
        use std::collections::HashMap;

        let now = chrono::Utc::now();
        let base = Repository {
            id: 1,
            node_id: None,
            name: "a".into(),
            full_name: "o/a".into(),
            owner: Owner {
                id: 1,
                login: "o".into(),
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
            has_issues: false,
            has_projects: false,
            has_wiki: false,
            has_pages: false,
            has_downloads: false,
            has_discussions: false,
            stargazers_count: 0,
            watchers_count: 0,
            forks_count: 0,
            open_issues_count: 0,
            score: 0.0,
            license: None,
            readme_url: None,
            topics: strings(&["a", "b", "c"]),
            tags: Vec::new(),
            languages: HashMap::from([("Rust".to_string(), 10)]),
            last_crawled_at: None,
        };
        let mut candidate = base.clone();
        candidate.id = 2;
        candidate.topics = strings(&["b", "c", "d"]);
        candidate.languages = HashMap::from([("Rust".to_string(), 5)]);

        // 0.6 * 0.8 + 0.3 * 0.5 + 0.1 * 1.0
        let score = fused_score(&base, &candidate, 0.8);
        assert!((score - 0.73).abs() < 1e-9);
    }

    #[test]
    fn test_rank_neighbors_sorts_and_truncates() {
        let entries = vec![
            SimilarityEntry { member: 1, score: 0.2 },
            SimilarityEntry { member: 2, score: 0.9 },
            SimilarityEntry { member: 3, score: 0.5 },
        ];
        let ranked = rank_neighbors(entries, 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].member, 2);
        assert_eq!(ranked[1].member, 3);
    }
}
