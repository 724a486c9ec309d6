use std::net::SocketAddr;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use gitpulse::cache::Cache;
use gitpulse::config::Config;
use gitpulse::db::create_pool;
use gitpulse::object_store::ObjectStore;
use gitpulse::routes::build_router;
use gitpulse::state::AppState;
use gitpulse::store::{PgStore, StatsStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    info!("Starting gitpulse API v{}", env!("CARGO_PKG_VERSION"));

    let cache = Cache::connect(&config.redis_url).await?;
    let pool = create_pool(&config.database_url).await?;
    let store = PgStore::new(pool, cache.clone());
    let stats = StatsStore::connect(&config).await?;
    let objects = ObjectStore::connect(&config).await?;

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(10))
        .build()?;

    let state = AppState {
        store,
        stats,
        cache,
        objects,
        http,
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
