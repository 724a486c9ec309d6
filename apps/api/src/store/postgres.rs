use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::info;

use crate::cache::Cache;
use crate::models::{License, Owner, Repository, RepositoryData, SimilarityEntry};

const REPOSITORY_TTL: Duration = Duration::from_secs(12 * 3600);
const REPOSITORY_DATA_TTL: Duration = Duration::from_secs(12 * 3600);
const LAST_CRAWL_TTL: Duration = Duration::from_secs(3600);
const RECENT_CLICKS_TTL: Duration = Duration::from_secs(5 * 60);
const SIMILARITY_TTL: Duration = Duration::from_secs(24 * 3600);

/// Relational store adapter. Owns the upsert transaction and every query
/// the online path needs; hot queries are read-through cached.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    cache: Cache,
}

impl PgStore {
    pub fn new(pool: PgPool, cache: Cache) -> Self {
        Self { pool, cache }
    }

    /// Last successful crawl of a repository, or `None` if it has never
    /// been processed.
    pub async fn get_last_crawl_time(&self, repo_id: i64) -> Result<Option<DateTime<Utc>>> {
        let key = format!("last_crawl_time:{repo_id}");
        if let Some(t) = self.cache.get_json::<DateTime<Utc>>(&key).await {
            return Ok(Some(t));
        }

        let row: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_crawled_at FROM repositories WHERE id = $1")
                .bind(repo_id)
                .fetch_optional(&self.pool)
                .await?;

        let last = row.flatten();
        if let Some(t) = last {
            self.cache.set_json(&key, &t, LAST_CRAWL_TTL).await;
        }
        Ok(last)
    }

    /// Persists a repository with its owner, license, and taxonomy joins in
    /// one transaction. The repository row itself is only rewritten when a
    /// descriptive field changed or the crawl is newer; join rows are
    /// insert-or-keep. Cached derived keys are invalidated after commit.
    pub async fn upsert_repository(
        &self,
        repo: &Repository,
        last_crawled_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO owners (id, login, node_id, avatar_url, html_url, type)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(repo.owner.id)
        .bind(&repo.owner.login)
        .bind(&repo.owner.node_id)
        .bind(&repo.owner.avatar_url)
        .bind(&repo.owner.html_url)
        .bind(&repo.owner.kind)
        .execute(&mut *tx)
        .await
        .context("Failed to insert owner")?;

        if let Some(license) = &repo.license {
            sqlx::query(
                r#"
                INSERT INTO licenses (key, name, spdx_id, url, node_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (key) DO UPDATE SET
                    name = EXCLUDED.name,
                    spdx_id = EXCLUDED.spdx_id,
                    url = EXCLUDED.url,
                    node_id = EXCLUDED.node_id
                WHERE licenses.name IS DISTINCT FROM EXCLUDED.name
                   OR licenses.spdx_id IS DISTINCT FROM EXCLUDED.spdx_id
                   OR licenses.url IS DISTINCT FROM EXCLUDED.url
                "#,
            )
            .bind(&license.key)
            .bind(&license.name)
            .bind(&license.spdx_id)
            .bind(&license.url)
            .bind(&license.node_id)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert license")?;
        }

        // The WHERE clause suppresses empty updates: identical descriptive
        // fields with a non-newer crawl leave the row untouched.
        sqlx::query(
            r#"
            INSERT INTO repositories
                (id, node_id, name, full_name, owner_id, description, html_url, homepage,
                 default_branch, license_key, readme_url, created_at, updated_at, pushed_at,
                 is_fork, is_template, is_archived, is_disabled, last_crawled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                node_id = EXCLUDED.node_id,
                name = EXCLUDED.name,
                full_name = EXCLUDED.full_name,
                owner_id = EXCLUDED.owner_id,
                description = EXCLUDED.description,
                html_url = EXCLUDED.html_url,
                homepage = EXCLUDED.homepage,
                default_branch = EXCLUDED.default_branch,
                license_key = EXCLUDED.license_key,
                readme_url = EXCLUDED.readme_url,
                updated_at = EXCLUDED.updated_at,
                pushed_at = EXCLUDED.pushed_at,
                is_fork = EXCLUDED.is_fork,
                is_template = EXCLUDED.is_template,
                is_archived = EXCLUDED.is_archived,
                is_disabled = EXCLUDED.is_disabled,
                last_crawled_at = EXCLUDED.last_crawled_at
            WHERE repositories.description IS DISTINCT FROM EXCLUDED.description
               OR repositories.homepage IS DISTINCT FROM EXCLUDED.homepage
               OR repositories.license_key IS DISTINCT FROM EXCLUDED.license_key
               OR repositories.is_archived IS DISTINCT FROM EXCLUDED.is_archived
               OR repositories.is_disabled IS DISTINCT FROM EXCLUDED.is_disabled
               OR repositories.last_crawled_at < EXCLUDED.last_crawled_at
            "#,
        )
        .bind(repo.id)
        .bind(&repo.node_id)
        .bind(&repo.name)
        .bind(&repo.full_name)
        .bind(repo.owner.id)
        .bind(&repo.description)
        .bind(&repo.html_url)
        .bind(&repo.homepage)
        .bind(&repo.default_branch)
        .bind(repo.license.as_ref().map(|l| l.key.clone()))
        .bind(&repo.readme_url)
        .bind(repo.created_at)
        .bind(repo.updated_at)
        .bind(repo.pushed_at)
        .bind(repo.fork)
        .bind(repo.is_template)
        .bind(repo.archived)
        .bind(repo.disabled)
        .bind(last_crawled_at)
        .execute(&mut *tx)
        .await
        .context("Failed to upsert repository")?;

        // Insert-or-return-id for every taxonomy name, then link. The DO
        // UPDATE is what makes RETURNING yield the id on conflict.
        for tag in &repo.tags {
            let tag_id: i64 = sqlx::query_scalar(
                "INSERT INTO tags (name) VALUES ($1)
                 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
            )
            .bind(tag)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to upsert tag")?;
            sqlx::query(
                "INSERT INTO repository_tags (repository_id, tag_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(repo.id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
        }

        for topic in &repo.topics {
            let topic_id: i64 = sqlx::query_scalar(
                "INSERT INTO topics (name) VALUES ($1)
                 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
            )
            .bind(topic)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to upsert topic")?;
            sqlx::query(
                "INSERT INTO repository_topics (repository_id, topic_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(repo.id)
            .bind(topic_id)
            .execute(&mut *tx)
            .await?;
        }

        for (language, size) in &repo.languages {
            let language_id: i64 = sqlx::query_scalar(
                "INSERT INTO languages (name) VALUES ($1)
                 ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
            )
            .bind(language)
            .fetch_one(&mut *tx)
            .await
            .context("Failed to upsert language")?;
            // Byte counts move between crawls, so the join row is a full upsert.
            sqlx::query(
                "INSERT INTO repository_languages (repository_id, language_id, size)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (repository_id, language_id) DO UPDATE SET size = EXCLUDED.size",
            )
            .bind(repo.id)
            .bind(language_id)
            .bind(size)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.cache
            .delete(&[
                format!("repository:{}", repo.id),
                format!("last_crawl_time:{}", repo.id),
                format!("repository_data_by_id:{}", repo.id),
            ])
            .await;

        Ok(())
    }

    pub async fn get_repository_by_id(&self, repo_id: i64) -> Result<Option<Repository>> {
        let key = format!("repository:{repo_id}");
        if let Some(repo) = self.cache.get_json::<Repository>(&key).await {
            return Ok(Some(repo));
        }

        let rows = self.fetch_repositories(&[repo_id]).await?;
        let repo = rows.into_iter().next().map(|d| {
            let mut repo = d.repository;
            repo.owner = d.owner;
            repo
        });

        if let Some(repo) = &repo {
            self.cache.set_json(&key, repo, REPOSITORY_TTL).await;
        }
        Ok(repo)
    }

    /// Batched materialization. Results come back in store order, not input
    /// order; the resolver has already fixed ranking by the time it calls
    /// this.
    pub async fn get_repositories_data_by_ids(
        &self,
        repo_ids: &[i64],
    ) -> Result<Vec<RepositoryData>> {
        if repo_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = repo_ids
            .iter()
            .map(|id| format!("repository_data_by_id:{id}"))
            .collect();
        let cached = self.cache.mget_json::<RepositoryData>(&keys).await;

        let mut results = Vec::with_capacity(repo_ids.len());
        let mut missed = Vec::new();
        for (i, entry) in cached.into_iter().enumerate() {
            match entry {
                Some(data) => results.push(data),
                None => missed.push(repo_ids[i]),
            }
        }
        if missed.is_empty() {
            return Ok(results);
        }

        let fetched = self.fetch_repositories(&missed).await?;
        for data in fetched {
            let key = format!("repository_data_by_id:{}", data.repository.id);
            self.cache.set_json(&key, &data, REPOSITORY_DATA_TTL).await;
            results.push(data);
        }
        Ok(results)
    }

    async fn fetch_repositories(&self, repo_ids: &[i64]) -> Result<Vec<RepositoryData>> {
        if repo_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT
                r.id, r.node_id, r.name, r.full_name, r.description, r.html_url, r.homepage,
                r.default_branch, r.license_key, r.readme_url, r.created_at, r.updated_at,
                r.pushed_at, r.is_fork, r.is_template, r.is_archived, r.is_disabled,
                r.last_crawled_at,
                o.id AS owner_id, o.login, o.node_id AS owner_node_id, o.avatar_url,
                o.html_url AS owner_html_url, o.type AS owner_type,
                l.name AS license_name, l.spdx_id, l.url AS license_url,
                l.node_id AS license_node_id,
                COALESCE(tags.data, '[]'::jsonb) AS tags,
                COALESCE(topics.data, '[]'::jsonb) AS topics,
                COALESCE(languages.data, '{}'::jsonb) AS languages
            FROM repositories r
            JOIN owners o ON r.owner_id = o.id
            LEFT JOIN licenses l ON r.license_key = l.key
            LEFT JOIN (
                SELECT repository_id, jsonb_agg(t.name) AS data
                FROM repository_tags rt JOIN tags t ON rt.tag_id = t.id
                GROUP BY repository_id
            ) AS tags ON r.id = tags.repository_id
            LEFT JOIN (
                SELECT repository_id, jsonb_agg(t.name) AS data
                FROM repository_topics rt JOIN topics t ON rt.topic_id = t.id
                GROUP BY repository_id
            ) AS topics ON r.id = topics.repository_id
            LEFT JOIN (
                SELECT repository_id, jsonb_object_agg(l.name, rl.size) AS data
                FROM repository_languages rl JOIN languages l ON rl.language_id = l.id
                GROUP BY repository_id
            ) AS languages ON r.id = languages.repository_id
            WHERE r.id = ANY($1)
            "#,
        )
        .bind(repo_ids)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query repositories by ids")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let owner = Owner {
                id: row.try_get("owner_id")?,
                login: row.try_get("login")?,
                node_id: row.try_get("owner_node_id")?,
                avatar_url: row.try_get("avatar_url")?,
                html_url: row.try_get("owner_html_url")?,
                kind: row.try_get("owner_type")?,
            };

            let license_key: Option<String> = row.try_get("license_key")?;
            let license = license_key.map(|key| License {
                key,
                name: row.try_get("license_name").ok().flatten(),
                spdx_id: row.try_get("spdx_id").ok().flatten(),
                url: row.try_get("license_url").ok().flatten(),
                node_id: row.try_get("license_node_id").ok().flatten(),
            });

            let tags: Vec<String> =
                serde_json::from_value(row.try_get::<serde_json::Value, _>("tags")?)?;
            let topics: Vec<String> =
                serde_json::from_value(row.try_get::<serde_json::Value, _>("topics")?)?;
            let languages: HashMap<String, i64> =
                serde_json::from_value(row.try_get::<serde_json::Value, _>("languages")?)?;

            let repository = Repository {
                id: row.try_get("id")?,
                node_id: row.try_get("node_id")?,
                name: row.try_get("name")?,
                full_name: row.try_get("full_name")?,
                owner: owner.clone(),
                html_url: row.try_get("html_url")?,
                description: row.try_get("description")?,
                homepage: row.try_get("homepage")?,
                default_branch: row.try_get("default_branch")?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
                pushed_at: row.try_get("pushed_at")?,
                fork: row.try_get("is_fork")?,
                is_template: row.try_get("is_template")?,
                archived: row.try_get("is_archived")?,
                disabled: row.try_get("is_disabled")?,
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
                license,
                readme_url: row.try_get("readme_url")?,
                topics,
                tags,
                languages,
                last_crawled_at: row.try_get("last_crawled_at")?,
            };

            out.push(RepositoryData { repository, owner });
        }
        Ok(out)
    }

    pub async fn get_recent_clicked_repository_ids(
        &self,
        session_id: &str,
        limit: i64,
    ) -> Result<Vec<i64>> {
        let key = format!("recent_clicks:{session_id}:{limit}");
        if let Some(ids) = self.cache.get_json::<Vec<i64>>(&key).await {
            return Ok(ids);
        }

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT repository_id FROM repository_views
             WHERE session_id = $1 ORDER BY viewed_at DESC LIMIT $2",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        self.cache.set_json(&key, &ids, RECENT_CLICKS_TTL).await;
        Ok(ids)
    }

    pub async fn get_repository_ids_updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM repositories WHERE last_crawled_at >= $1")
                .bind(since)
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Keeps only ids matching every non-empty facet, preserving the order
    /// of the input list.
    pub async fn filter_repository_ids(
        &self,
        repo_ids: &[i64],
        languages: &[String],
        tags: &[String],
        topics: &[String],
    ) -> Result<Vec<i64>> {
        if repo_ids.is_empty() || (languages.is_empty() && tags.is_empty() && topics.is_empty()) {
            return Ok(repo_ids.to_vec());
        }

        // Empty facet arrays collapse their clause to TRUE, which keeps the
        // statement static regardless of which facets were supplied.
        let query = r#"
            SELECT id FROM repositories
            WHERE id = ANY($1)
              AND (cardinality($2::text[]) = 0 OR id IN (
                  SELECT repository_id FROM repository_languages rl
                  JOIN languages l ON rl.language_id = l.id WHERE l.name = ANY($2)))
              AND (cardinality($3::text[]) = 0 OR id IN (
                  SELECT repository_id FROM repository_tags rt
                  JOIN tags t ON rt.tag_id = t.id WHERE t.name = ANY($3)))
              AND (cardinality($4::text[]) = 0 OR id IN (
                  SELECT repository_id FROM repository_topics rt
                  JOIN topics t ON rt.topic_id = t.id WHERE t.name = ANY($4)))
            "#;

        let matched: Vec<i64> = sqlx::query_scalar(query)
            .bind(repo_ids)
            .bind(languages)
            .bind(tags)
            .bind(topics)
            .fetch_all(&self.pool)
            .await?;

        info!(
            "Facet filter kept {} of {} repository ids",
            matched.len(),
            repo_ids.len()
        );
        Ok(retain_order(repo_ids, &matched.into_iter().collect()))
    }

    pub async fn get_repository_similarity(
        &self,
        repo_id: i64,
    ) -> Result<Option<Vec<SimilarityEntry>>> {
        let key = format!("similarity:{repo_id}");
        if let Some(entries) = self.cache.get_json::<Vec<SimilarityEntry>>(&key).await {
            return Ok(Some(entries));
        }

        let blob: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT data FROM repository_similarity WHERE id = $1")
                .bind(repo_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(blob) = blob else {
            return Ok(None);
        };
        let entries: Vec<SimilarityEntry> =
            serde_json::from_value(blob).context("Corrupt similarity blob")?;
        self.cache.set_json(&key, &entries, SIMILARITY_TTL).await;
        Ok(Some(entries))
    }

    /// Overwrites the similarity blob only when the stored data actually
    /// differs, so replays and unchanged recomputations are write-free.
    pub async fn upsert_repository_similarity(
        &self,
        repo_id: i64,
        entries: &[SimilarityEntry],
    ) -> Result<()> {
        let blob = serde_json::to_value(entries)?;
        sqlx::query(
            r#"
            INSERT INTO repository_similarity (id, data)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET data = EXCLUDED.data
            WHERE repository_similarity.data IS DISTINCT FROM EXCLUDED.data
            "#,
        )
        .bind(repo_id)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn track_repository_view(&self, session_id: &str, repository_id: i64) -> Result<()> {
        sqlx::query("INSERT INTO repository_views (session_id, repository_id) VALUES ($1, $2)")
            .bind(session_id)
            .bind(repository_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn is_repository_posted(&self, repo_id: i64) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM posted_repositories WHERE repository_id = $1)",
        )
        .bind(repo_id)
        .fetch_one(&self.pool)
        .await?)
    }

    pub async fn mark_repository_as_posted(&self, repo_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO posted_repositories (repository_id) VALUES ($1)
             ON CONFLICT (repository_id) DO NOTHING",
        )
        .bind(repo_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Filters `original` down to the members of `matched`, keeping the
/// original ordering.
fn retain_order(original: &[i64], matched: &HashSet<i64>) -> Vec<i64> {
    original
        .iter()
        .copied()
        .filter(|id| matched.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_order_preserves_input_ranking() {
        let original = vec![9, 3, 7, 1];
        let matched: HashSet<i64> = [1, 7, 9].into_iter().collect();
        assert_eq!(retain_order(&original, &matched), vec![9, 7, 1]);
    }

    #[test]
    fn test_retain_order_empty_match() {
        assert_eq!(retain_order(&[1, 2, 3], &HashSet::new()), Vec::<i64>::new());
    }
}
