use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::models::{License, Owner, Repository};

const DEFAULT_API_URL: &str = "https://api.github.com";
const ACCEPT_HEADER: &str = "application/vnd.github.v3+json";
/// Search results per page; the API caps the visible window at 1000 items.
pub const PER_PAGE: usize = 100;
/// The upstream search never exposes more than this many results per query.
pub const SEARCH_WINDOW_CAP: usize = 1000;

const INTER_CALL_PAUSE: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Response parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One page of search results, already converted to domain repositories.
#[derive(Debug)]
pub struct SearchPage {
    pub total_count: usize,
    pub items: Vec<Repository>,
}

/// Seam for the discovery controller; production code uses [`GithubClient`].
#[async_trait]
pub trait RepositorySearch: Send + Sync {
    async fn search_repositories(&self, query: &str, page: usize)
        -> Result<SearchPage, GithubError>;
}

/// Client for the upstream code-host REST API.
///
/// Every call paces itself: 2 s after a success, and on a 403 (rate limit)
/// an exponentially doubling sleep starting at 5 s until the call goes
/// through.
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    base_url: String,
}

impl GithubClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
            token: token.into(),
            base_url: DEFAULT_API_URL.to_string(),
        }
    }

    /// Overrides the API base URL. Useful for tests.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Performs a GET with the rate-limit policy and returns the body.
    async fn get_with_backoff(&self, url: &str) -> Result<Vec<u8>, GithubError> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let mut request = self.http.get(url).header("Accept", ACCEPT_HEADER);
            if !self.token.is_empty() {
                request = request.header("Authorization", format!("token {}", self.token));
            }

            let response = request.send().await?;
            let status = response.status();

            if status.as_u16() == 403 {
                warn!("Rate limit hit for {url}. Waiting {backoff:?} before retrying...");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GithubError::Api {
                    status: status.as_u16(),
                    body,
                });
            }

            let body = response.bytes().await?.to_vec();
            tokio::time::sleep(INTER_CALL_PAUSE).await;
            return Ok(body);
        }
    }

    pub async fn get_tags(&self, full_name: &str) -> Result<Vec<String>, GithubError> {
        let url = format!("{}/repos/{}/tags", self.base_url, full_name);
        let body = self.get_with_backoff(&url).await?;
        let tags: Vec<ApiTag> = serde_json::from_slice(&body)?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }

    pub async fn get_languages(&self, full_name: &str) -> Result<HashMap<String, i64>, GithubError> {
        let url = format!("{}/repos/{}/languages", self.base_url, full_name);
        let body = self.get_with_backoff(&url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Resolves the raw download URL of the repository's README, if the
    /// upstream knows one.
    pub async fn get_readme_download_url(
        &self,
        full_name: &str,
    ) -> Result<Option<String>, GithubError> {
        let url = format!("{}/repos/{}/readme", self.base_url, full_name);
        let body = match self.get_with_backoff(&url).await {
            Ok(body) => body,
            Err(GithubError::Api { status: 404, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let readme: ApiReadme = serde_json::from_slice(&body)?;
        Ok(readme.download_url)
    }
}

#[async_trait]
impl RepositorySearch for GithubClient {
    async fn search_repositories(
        &self,
        query: &str,
        page: usize,
    ) -> Result<SearchPage, GithubError> {
        let url = format!(
            "{}/search/repositories?q={}&page={}&per_page={}",
            self.base_url, query, page, PER_PAGE
        );
        let body = self.get_with_backoff(&url).await?;
        let response: ApiSearchResponse = serde_json::from_slice(&body)?;
        Ok(SearchPage {
            total_count: response.total_count,
            items: response.items.into_iter().map(Repository::from).collect(),
        })
    }
}

// ── API wire types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiSearchResponse {
    total_count: usize,
    items: Vec<ApiRepository>,
}

#[derive(Debug, Deserialize)]
struct ApiTag {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiReadme {
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOwner {
    pub id: i64,
    pub login: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiLicense {
    pub key: Option<String>,
    pub name: Option<String>,
    pub spdx_id: Option<String>,
    pub url: Option<String>,
    pub node_id: Option<String>,
}

/// A repository as the upstream API returns it; optional fields come back
/// as JSON null and must not fail deserialization.
#[derive(Debug, Deserialize)]
pub struct ApiRepository {
    pub id: i64,
    pub node_id: Option<String>,
    pub name: String,
    pub full_name: String,
    pub owner: ApiOwner,
    pub html_url: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pushed_at: DateTime<Utc>,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub has_issues: bool,
    #[serde(default)]
    pub has_projects: bool,
    #[serde(default)]
    pub has_wiki: bool,
    #[serde(default)]
    pub has_pages: bool,
    #[serde(default)]
    pub has_downloads: bool,
    #[serde(default)]
    pub has_discussions: bool,
    pub stargazers_count: i64,
    pub watchers_count: i64,
    pub forks_count: i64,
    pub open_issues_count: i64,
    #[serde(default)]
    pub score: f64,
    pub license: Option<ApiLicense>,
    #[serde(default)]
    pub topics: Vec<String>,
}

impl From<ApiRepository> for Repository {
    fn from(api: ApiRepository) -> Self {
        Repository {
            id: api.id,
            node_id: api.node_id,
            name: api.name,
            full_name: api.full_name,
            owner: Owner {
                id: api.owner.id,
                login: api.owner.login,
                node_id: api.owner.node_id,
                avatar_url: api.owner.avatar_url,
                html_url: api.owner.html_url,
                kind: api.owner.kind,
            },
            html_url: api.html_url,
            description: api.description,
            homepage: api.homepage,
            default_branch: api.default_branch,
            created_at: api.created_at,
            updated_at: api.updated_at,
            pushed_at: api.pushed_at,
            fork: api.fork,
            is_template: api.is_template,
            archived: api.archived,
            disabled: api.disabled,
            has_issues: api.has_issues,
            has_projects: api.has_projects,
            has_wiki: api.has_wiki,
            has_pages: api.has_pages,
            has_downloads: api.has_downloads,
            has_discussions: api.has_discussions,
            stargazers_count: api.stargazers_count,
            watchers_count: api.watchers_count,
            forks_count: api.forks_count,
            open_issues_count: api.open_issues_count,
            score: api.score,
            // Licenses with a null key carry nothing worth persisting.
            license: api.license.and_then(|l| {
                l.key.map(|key| License {
                    key,
                    name: l.name,
                    spdx_id: l.spdx_id,
                    url: l.url,
                    node_id: l.node_id,
                })
            }),
            readme_url: None,
            topics: api.topics,
            tags: Vec::new(),
            languages: HashMap::new(),
            last_crawled_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM: &str = r#"{
        "id": 13329152,
        "node_id": "MDEwOlJlcG9zaXRvcnkxMzMyOTE1Mg==",
        "name": "gifencoder",
        "full_name": "eugeneware/gifencoder",
        "owner": {"id": 481, "login": "eugeneware", "node_id": null,
                  "avatar_url": "https://avatars.example/481", "html_url": "https://github.com/eugeneware",
                  "type": "User"},
        "html_url": "https://github.com/eugeneware/gifencoder",
        "description": null,
        "homepage": null,
        "default_branch": "master",
        "created_at": "2013-10-04T01:33:03Z",
        "updated_at": "2025-06-06T07:09:34Z",
        "pushed_at": "2025-06-06T07:09:34Z",
        "fork": false,
        "archived": false,
        "disabled": false,
        "stargazers_count": 520,
        "watchers_count": 520,
        "forks_count": 91,
        "open_issues_count": 12,
        "score": 1.0,
        "license": {"key": null, "name": null, "spdx_id": null, "url": null, "node_id": null},
        "topics": ["gif", "encoder"]
    }"#;

    #[test]
    fn test_api_repository_tolerates_nulls() {
        let api: ApiRepository = serde_json::from_str(ITEM).unwrap();
        let repo = Repository::from(api);
        assert_eq!(repo.id, 13329152);
        assert!(repo.description.is_none());
        // A license whose key is null is dropped entirely.
        assert!(repo.license.is_none());
        assert_eq!(repo.topics, vec!["gif", "encoder"]);
        assert!(repo.tags.is_empty());
        assert!(repo.last_crawled_at.is_none());
    }

    #[test]
    fn test_search_response_shape() {
        let raw = format!(r#"{{"total_count": 2, "incomplete_results": false, "items": [{ITEM}]}}"#);
        let response: ApiSearchResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(response.total_count, 2);
        assert_eq!(response.items.len(), 1);
    }
}
