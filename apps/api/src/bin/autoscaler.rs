use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tracing::info;

use gitpulse::autoscaler::{proxy_handler, AddressPoolController, Autoscaler};
use gitpulse::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    gitpulse::init_tracing(&config.rust_log);

    let controller = AddressPoolController::new(config.embedding_instance_addrs.clone());
    let scaler = Arc::new(Autoscaler::new(
        controller,
        config.embedding_max_instances,
        config.embedding_idle_timeout,
    ));

    tokio::spawn(Arc::clone(&scaler).run_reaper());

    let app = Router::new()
        .fallback(proxy_handler::<AddressPoolController>)
        .with_state(scaler);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Embedding autoscaler listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
