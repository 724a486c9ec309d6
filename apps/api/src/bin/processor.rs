use anyhow::Result;

use gitpulse::cache::Cache;
use gitpulse::config::Config;
use gitpulse::db::create_pool;
use gitpulse::github::GithubClient;
use gitpulse::object_store::ObjectStore;
use gitpulse::processor::Processor;
use gitpulse::store::{PgStore, StatsStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let cache = Cache::connect(&config.redis_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool, cache);
    let stats = StatsStore::connect(&config).await?;
    let objects = ObjectStore::connect(&config).await?;
    let github = GithubClient::new(config.github_token.clone());

    Processor::new(store, stats, objects, github).run(&config).await
}
