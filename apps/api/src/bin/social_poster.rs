use anyhow::Result;
use tracing::info;

use gitpulse::cache::Cache;
use gitpulse::config::Config;
use gitpulse::db::create_pool;
use gitpulse::social::{SocialPoster, WebhookPublisher};
use gitpulse::store::{PgStore, StatsStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let cache = Cache::connect(&config.redis_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool, cache);
    let stats = StatsStore::connect(&config).await?;

    let publisher = Box::new(WebhookPublisher::new(
        config.social_post_url.clone(),
        config.social_post_token.clone(),
    ));

    let poster = SocialPoster {
        store,
        stats,
        publisher,
    };

    info!("Social poster service started");
    poster.run().await;

    Ok(())
}
