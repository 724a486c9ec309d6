use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clickhouse::{Client, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;
use crate::models::RepositoryStat;

/// Maximum ids returned by a trending query.
const TRENDING_LIMIT: usize = 200;

/// One row of the append-only `repository_stats` table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct StatRow {
    pub repository_id: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub event_time: DateTime<Utc>,
    pub stargazers_count: i64,
    pub watchers_count: i64,
    pub forks_count: i64,
    pub open_issues_count: i64,
    #[serde(with = "clickhouse::serde::chrono::datetime64::millis")]
    pub pushed_at: DateTime<Utc>,
    pub score: f64,
    pub stat_hash: String,
}

impl From<StatRow> for RepositoryStat {
    fn from(row: StatRow) -> Self {
        RepositoryStat {
            repository_id: row.repository_id,
            event_time: row.event_time,
            stargazers_count: row.stargazers_count,
            watchers_count: row.watchers_count,
            forks_count: row.forks_count,
            open_issues_count: row.open_issues_count,
            pushed_at: row.pushed_at,
            score: row.score,
        }
    }
}

/// Time-series store adapter over ClickHouse.
#[derive(Clone)]
pub struct StatsStore {
    client: Client,
}

impl StatsStore {
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = Client::default()
            .with_url(&config.clickhouse_url)
            .with_user(&config.clickhouse_user)
            .with_password(&config.clickhouse_password)
            .with_database(&config.clickhouse_db);

        // The client is lazy; issue a probe so startup fails fast when the
        // store is unreachable.
        client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .context("ClickHouse is unreachable")?;
        info!("ClickHouse connection established");
        Ok(Self { client })
    }

    /// Appends one stat snapshot unless it is identical (by content hash)
    /// to the newest row already stored for the repository. Returns whether
    /// a row was written.
    pub async fn append_stat(&self, stat: &RepositoryStat) -> Result<bool> {
        let hash = stat.content_hash();
        if let Some(latest) = self.latest_stat_hash(stat.repository_id).await? {
            if latest == hash {
                debug!(
                    "Stats for repository {} unchanged, skipping append",
                    stat.repository_id
                );
                return Ok(false);
            }
        }

        let row = StatRow {
            repository_id: stat.repository_id,
            event_time: stat.event_time,
            stargazers_count: stat.stargazers_count,
            watchers_count: stat.watchers_count,
            forks_count: stat.forks_count,
            open_issues_count: stat.open_issues_count,
            pushed_at: stat.pushed_at,
            score: stat.score,
            stat_hash: hash,
        };

        let mut insert = self.client.insert("repository_stats")?;
        insert.write(&row).await?;
        insert.end().await?;
        Ok(true)
    }

    async fn latest_stat_hash(&self, repository_id: i64) -> Result<Option<String>> {
        let hash = self
            .client
            .query(
                "SELECT stat_hash FROM repository_stats
                 WHERE repository_id = ? ORDER BY event_time DESC LIMIT 1",
            )
            .bind(repository_id)
            .fetch_optional::<String>()
            .await?;
        Ok(hash)
    }

    /// Newest snapshot for a repository, if any.
    pub async fn latest_stat(&self, repository_id: i64) -> Result<Option<RepositoryStat>> {
        let row = self
            .client
            .query(
                "SELECT ?fields FROM repository_stats
                 WHERE repository_id = ? ORDER BY event_time DESC LIMIT 1",
            )
            .bind(repository_id)
            .fetch_optional::<StatRow>()
            .await?;
        Ok(row.map(RepositoryStat::from))
    }

    /// Ids ranked by combined star and fork growth over the window.
    ///
    /// `latest_*` is the value at each series' newest snapshot; `past_*` the
    /// value at the newest snapshot at or before `now - days`. Series
    /// without a snapshot on both sides of the cutoff are excluded, as are
    /// series that did not strictly grow in either dimension — a cold store
    /// legitimately yields an empty list.
    pub async fn trending_repository_ids_by_growth(&self, days: u32) -> Result<Vec<i64>> {
        let ids = self
            .client
            .query(
                r#"
                SELECT repository_id FROM (
                    SELECT
                        repository_id,
                        argMax(stargazers_count, event_time) AS latest_stars,
                        argMax(forks_count, event_time) AS latest_forks,
                        argMaxIf(stargazers_count, event_time,
                                 event_time <= now() - INTERVAL ? DAY) AS past_stars,
                        argMaxIf(forks_count, event_time,
                                 event_time <= now() - INTERVAL ? DAY) AS past_forks,
                        countIf(event_time <= now() - INTERVAL ? DAY) AS past_snapshots,
                        countIf(event_time > now() - INTERVAL ? DAY) AS recent_snapshots
                    FROM repository_stats
                    GROUP BY repository_id
                    HAVING past_snapshots >= 1 AND recent_snapshots >= 1
                       AND (latest_stars > past_stars OR latest_forks > past_forks)
                    ORDER BY (latest_stars - past_stars) + (latest_forks - past_forks) DESC
                    LIMIT ?
                )
                "#,
            )
            .bind(days)
            .bind(days)
            .bind(days)
            .bind(days)
            .bind(TRENDING_LIMIT as u64)
            .fetch_all::<i64>()
            .await?;
        Ok(ids)
    }

    /// Ids whose most recent observed push lies within the recency window.
    /// This is the similarity engine's candidate set.
    pub async fn repository_ids_pushed_since(&self, cut: std::time::Duration) -> Result<Vec<i64>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(cut).unwrap_or_else(|_| ChronoDuration::days(365));
        let ids = self
            .client
            .query(
                "SELECT repository_id FROM repository_stats
                 GROUP BY repository_id
                 HAVING max(pushed_at) >= fromUnixTimestamp64Milli(?)",
            )
            .bind(cutoff.timestamp_millis())
            .fetch_all::<i64>()
            .await?;
        Ok(ids)
    }
}
