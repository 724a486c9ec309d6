use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A public repository as tracked by the pipeline.
///
/// The id is the code host's numeric id and is the primary key everywhere:
/// relational rows, object keys, vector points, and cache keys all derive
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    #[serde(default)]
    pub node_id: Option<String>,
    pub name: String,
    pub full_name: String,
    pub owner: Owner,
    pub html_url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
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
    #[serde(default)]
    pub license: Option<License>,
    #[serde(default)]
    pub readme_url: Option<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub languages: HashMap<String, i64>,
    #[serde(default)]
    pub last_crawled_at: Option<DateTime<Utc>>,
}

/// Repository owner. Shared by many repositories; persisted once by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Owner {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub avatar_url: String,
    pub html_url: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Normalized license metadata keyed by the license key string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub spdx_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
}

/// A repository materialized for the feed, with its owner split out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryData {
    pub repository: Repository,
    pub owner: Owner,
}

/// One append-only stat snapshot for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStat {
    pub repository_id: i64,
    pub event_time: DateTime<Utc>,
    pub stargazers_count: i64,
    pub watchers_count: i64,
    pub forks_count: i64,
    pub open_issues_count: i64,
    pub pushed_at: DateTime<Utc>,
    pub score: f64,
}

impl RepositoryStat {
    /// Content hash over the stat-relevant fields. Two consecutive crawls
    /// that observed identical numbers hash identically, and the second
    /// row is suppressed.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}|{}|{}|{}",
            self.stargazers_count,
            self.watchers_count,
            self.forks_count,
            self.open_issues_count,
            self.pushed_at.to_rfc3339(),
            self.score,
        ));
        format!("{:x}", hasher.finalize())
    }

    pub fn from_repository(repo: &Repository, event_time: DateTime<Utc>) -> Self {
        Self {
            repository_id: repo.id,
            event_time,
            stargazers_count: repo.stargazers_count,
            watchers_count: repo.watchers_count,
            forks_count: repo.forks_count,
            open_issues_count: repo.open_issues_count,
            pushed_at: repo.pushed_at,
            score: repo.score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(stars: i64, forks: i64) -> RepositoryStat {
        RepositoryStat {
            repository_id: 1,
            event_time: Utc::now(),
            stargazers_count: stars,
            watchers_count: stars,
            forks_count: forks,
            open_issues_count: 3,
            pushed_at: "2025-06-06T07:09:34Z".parse().unwrap(),
            score: 1.0,
        }
    }

    #[test]
    fn test_content_hash_ignores_event_time() {
        let a = stat(100, 10);
        let mut b = stat(100, 10);
        b.event_time = a.event_time + chrono::Duration::hours(6);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_changes_with_stars() {
        assert_ne!(stat(100, 10).content_hash(), stat(101, 10).content_hash());
    }
}
