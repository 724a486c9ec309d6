use anyhow::Result;

use gitpulse::cache::Cache;
use gitpulse::config::Config;
use gitpulse::crawler::Crawler;
use gitpulse::db::create_pool;
use gitpulse::github::GithubClient;
use gitpulse::store::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let cache = Cache::connect(&config.redis_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool, cache);
    let github = GithubClient::new(config.github_token.clone());

    Crawler::new(store, github).run(&config).await
}
