use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Required variables fail the process at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub database_url: String,
    pub clickhouse_url: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub clickhouse_db: String,
    pub redis_url: String,
    pub s3_endpoint: String,
    pub s3_bucket: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub qdrant_url: String,
    pub github_token: String,
    /// Recency window for similarity recomputation; accepts `months`/`years`
    /// suffixes (e.g. `6months`, `1year`).
    pub last_update_cut: Duration,
    pub similarity_list_size: usize,
    pub embedding_api_url: String,
    pub embedding_max_instances: usize,
    pub embedding_idle_timeout: Duration,
    pub embedding_instance_addrs: Vec<String>,
    pub markup_service_url: String,
    pub social_post_url: String,
    pub social_post_token: String,
    pub debug: bool,
    pub port: u16,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            rabbitmq_url: require_env("RABBITMQ_URL")?,
            database_url: require_env("DATABASE_URL")?,
            clickhouse_url: require_env("CLICKHOUSE_URL")?,
            clickhouse_user: env_or("CLICKHOUSE_USER", "default"),
            clickhouse_password: env_or("CLICKHOUSE_PASSWORD", ""),
            clickhouse_db: env_or("CLICKHOUSE_DB", "gitpulse"),
            redis_url: require_env("REDIS_URL")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            s3_bucket: env_or("S3_BUCKET", "readmes"),
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            qdrant_url: require_env("QDRANT_URL")?,
            github_token: env_or("GITHUB_TOKEN", ""),
            last_update_cut: parse_duration_env("LAST_UPDATE_CUT", "6months")?,
            similarity_list_size: env_or("SIMILARITY_LIST_SIZE", "50")
                .parse::<usize>()
                .context("SIMILARITY_LIST_SIZE must be an integer")?,
            embedding_api_url: env_or("EMBEDDING_API_URL", "http://embedding-autoscaler:80"),
            embedding_max_instances: env_or("EMBEDDING_API_MAX_INSTANCES", "3")
                .parse::<usize>()
                .context("EMBEDDING_API_MAX_INSTANCES must be an integer")?,
            embedding_idle_timeout: Duration::from_secs(
                env_or("EMBEDDING_API_IDLE_TIMEOUT", "600")
                    .parse::<u64>()
                    .context("EMBEDDING_API_IDLE_TIMEOUT must be seconds")?,
            ),
            embedding_instance_addrs: env_or("EMBEDDING_INSTANCE_ADDRS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            markup_service_url: env_or("MARKUP_SERVICE_URL", "http://markup-service:80"),
            social_post_url: env_or("SOCIAL_POST_URL", ""),
            social_post_token: env_or("SOCIAL_POST_TOKEN", ""),
            debug: env_or("DEBUG", "false") == "true",
            port: env_or("PORT", "8080")
                .parse::<u16>()
                .context("PORT must be a valid port number")?,
            rust_log: env_or("RUST_LOG", "info"),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn env_or(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn parse_duration_env(key: &str, fallback: &str) -> Result<Duration> {
    let raw = env_or(key, fallback);
    humantime::parse_duration(&raw)
        .with_context(|| format!("{key} must be a duration (e.g. '90days', '6months', '1year')"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_supports_month_suffix() {
        std::env::set_var("TEST_CUT_MONTHS", "2months");
        let d = parse_duration_env("TEST_CUT_MONTHS", "1day").unwrap();
        // humantime months are 30.44 days
        assert!(d > Duration::from_secs(59 * 24 * 3600));
        assert!(d < Duration::from_secs(62 * 24 * 3600));
    }

    #[test]
    fn test_parse_duration_supports_year_suffix() {
        std::env::set_var("TEST_CUT_YEARS", "1year");
        let d = parse_duration_env("TEST_CUT_YEARS", "1day").unwrap();
        assert!(d > Duration::from_secs(364 * 24 * 3600));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        std::env::set_var("TEST_CUT_BAD", "soon");
        assert!(parse_duration_env("TEST_CUT_BAD", "1day").is_err());
    }
}
