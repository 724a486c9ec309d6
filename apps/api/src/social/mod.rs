use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::models::Repository;
use crate::store::{PgStore, StatsStore};

/// One posting attempt every four hours, plus one at startup.
pub const POST_INTERVAL: Duration = Duration::from_secs(4 * 3600);
/// Growth window used to pick the candidate.
pub const TRENDING_WINDOW_DAYS: u32 = 7;

/// Character budget for a post, held under the platform's 280 to leave
/// room for link expansion.
const MESSAGE_BUDGET: usize = 270;
const MAX_HASHTAGS: usize = 4;
const MAX_TOPIC_LEN: usize = 15;

const CANONICAL_URL_BASE: &str = "https://app.gitpulse.dev/repository";

/// Seam for the actual social network client, which lives outside this
/// system.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn post(&self, text: &str) -> anyhow::Result<()>;
}

/// Publishes by POSTing `{"text": ...}` to a configured endpoint with
/// bearer auth.
pub struct WebhookPublisher {
    http: reqwest::Client,
    url: String,
    token: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn post(&self, text: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("Social endpoint returned status {}", response.status());
        }
        Ok(())
    }
}

pub struct SocialPoster {
    pub store: PgStore,
    pub stats: StatsStore,
    pub publisher: Box<dyn Publisher>,
}

impl SocialPoster {
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(POST_INTERVAL);
        loop {
            interval.tick().await;
            self.post_once().await;
        }
    }

    /// Walks the weekly trending list and posts the first repository that
    /// has not been posted before; at most one post per cycle.
    pub async fn post_once(&self) {
        info!("Starting social posting cycle...");

        let trending = match self
            .stats
            .trending_repository_ids_by_growth(TRENDING_WINDOW_DAYS)
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to get trending repositories: {e}");
                return;
            }
        };

        if trending.is_empty() {
            info!("No trending repositories found to post");
            return;
        }

        for repo_id in trending {
            match self.store.is_repository_posted(repo_id).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to check posted state for {repo_id}: {e}");
                    return;
                }
            }

            let repo = match self.store.get_repository_by_id(repo_id).await {
                Ok(Some(repo)) => repo,
                Ok(None) => {
                    warn!("Trending repository {repo_id} has no stored data, skipping");
                    continue;
                }
                Err(e) => {
                    error!("Failed to load repository {repo_id}: {e}");
                    return;
                }
            };

            let message = format_post(&repo);
            if let Err(e) = self.publisher.post(&message).await {
                error!("Failed to post {}: {e}", repo.full_name);
                return;
            }

            if let Err(e) = self.store.mark_repository_as_posted(repo_id).await {
                error!("Posted {} but failed to mark it: {e}", repo.full_name);
            } else {
                info!("Posted trending repository {}", repo.full_name);
            }
            return;
        }

        info!("Every trending repository has already been posted");
    }
}

/// Builds the post body: headline, description truncated to the character
/// budget, canonical link, and up to four hashtags (languages first, then
/// short topics).
pub fn format_post(repo: &Repository) -> String {
    let link = format!("{CANONICAL_URL_BASE}/{}", repo.id);
    let hashtags = hashtags_for(repo).join(" ");

    let skeleton = format!(
        "\u{1F680} Trending on GitHub: {}\n\n\n\n\u{1F517} {}\n\n{}",
        repo.full_name, link, hashtags
    );

    let budget = MESSAGE_BUDGET.saturating_sub(skeleton.chars().count());
    let summary = truncate_chars(repo.description.as_deref().unwrap_or_default(), budget);

    format!(
        "\u{1F680} Trending on GitHub: {}\n\n{}\n\n\u{1F517} {}\n\n{}",
        repo.full_name, summary, link, hashtags
    )
}

fn hashtags_for(repo: &Repository) -> Vec<String> {
    let mut hashtags: Vec<String> = Vec::new();

    let mut languages: Vec<&String> = repo.languages.keys().collect();
    languages.sort();
    for language in languages {
        if hashtags.len() >= MAX_HASHTAGS {
            return hashtags;
        }
        hashtags.push(format!("#{}", language.replace(' ', "")));
    }

    for topic in &repo.topics {
        if hashtags.len() >= MAX_HASHTAGS {
            break;
        }
        if topic.len() > MAX_TOPIC_LEN {
            continue;
        }
        hashtags.push(format!("#{}", topic.replace('-', "")));
    }

    hashtags
}

fn truncate_chars(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }
    if budget <= 3 {
        return String::new();
    }
    let kept: String = text.chars().take(budget - 3).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::Utc;

    use super::*;
    use crate::models::Owner;

    fn repo_with(description: &str, languages: &[&str], topics: &[&str]) -> Repository {
        let now = Utc::now();
        Repository {
            id: 42,
            node_id: None,
            name: "demo".into(),
            full_name: "owner/demo".into(),
            owner: Owner {
                id: 1,
                login: "owner".into(),
                node_id: None,
                avatar_url: String::new(),
                html_url: String::new(),
                kind: "User".into(),
            },
            html_url: String::new(),
            description: (!description.is_empty()).then(|| description.to_string()),
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
            topics: topics.iter().map(|s| s.to_string()).collect(),
            tags: Vec::new(),
            languages: languages.iter().map(|l| (l.to_string(), 100)).collect(),
            last_crawled_at: None,
        }
    }

    #[test]
    fn test_hashtags_languages_before_topics() {
        let repo = repo_with("", &["Rust"], &["cli", "terminal"]);
        assert_eq!(hashtags_for(&repo), vec!["#Rust", "#cli", "#terminal"]);
    }

    #[test]
    fn test_hashtags_capped_at_four() {
        let repo = repo_with("", &["C", "Go", "Rust"], &["cli", "tools"]);
        assert_eq!(hashtags_for(&repo).len(), 4);
    }

    #[test]
    fn test_hashtags_skip_long_topics_and_strip_dashes() {
        let repo = repo_with("", &[], &["a-very-long-topic-name", "web-dev"]);
        assert_eq!(hashtags_for(&repo), vec!["#webdev"]);
    }

    #[test]
    fn test_hashtags_strip_spaces_from_languages() {
        let repo = repo_with("", &["Jupyter Notebook"], &[]);
        assert_eq!(hashtags_for(&repo), vec!["#JupyterNotebook"]);
    }

    #[test]
    fn test_format_post_contains_name_and_link() {
        let repo = repo_with("A demo project", &["Rust"], &[]);
        let post = format_post(&repo);
        assert!(post.contains("owner/demo"));
        assert!(post.contains("https://app.gitpulse.dev/repository/42"));
        assert!(post.contains("A demo project"));
    }

    #[test]
    fn test_format_post_truncates_long_descriptions() {
        let long = "x".repeat(500);
        let repo = repo_with(&long, &["Rust"], &[]);
        let post = format_post(&repo);
        assert!(post.chars().count() <= MESSAGE_BUDGET);
        assert!(post.contains("..."));
    }

    #[test]
    fn test_truncate_chars_short_text_untouched() {
        assert_eq!(truncate_chars("hello", 10), "hello");
    }
}
