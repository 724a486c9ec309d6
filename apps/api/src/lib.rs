pub mod autoscaler;
pub mod cache;
pub mod config;
pub mod crawler;
pub mod db;
pub mod discovery;
pub mod embedder;
pub mod embedding;
pub mod errors;
pub mod github;
pub mod messaging;
pub mod models;
pub mod object_store;
pub mod processor;
pub mod recommend;
pub mod routes;
pub mod similarity;
pub mod social;
pub mod state;
pub mod store;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes structured logging; `RUST_LOG` wins over the configured
/// default level. Called first thing by every service binary.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
