use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use gitpulse::cache::Cache;
use gitpulse::config::Config;
use gitpulse::db::create_pool;
use gitpulse::messaging::Bus;
use gitpulse::similarity::SimilarityEngine;
use gitpulse::store::{PgStore, StatsStore, VectorStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let cache = Cache::connect(&config.redis_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool, cache.clone());
    let stats = StatsStore::connect(&config).await?;
    let vectors = Arc::new(VectorStore::connect(&config.qdrant_url).await?);
    let bus = Arc::new(Bus::connect_with_retry(&config.rabbitmq_url).await?);

    let engine = Arc::new(SimilarityEngine {
        store,
        stats,
        vectors,
        cache,
        list_size: config.similarity_list_size,
        last_update_cut: config.last_update_cut,
    });

    info!("Similarity engine started");
    engine.run(bus).await;

    Ok(())
}
