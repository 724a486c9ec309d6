use crate::cache::Cache;
use crate::config::Config;
use crate::object_store::ObjectStore;
use crate::store::{PgStore, StatsStore};

/// Shared application state injected into all route handlers via Axum
/// extractors.
#[derive(Clone)]
pub struct AppState {
    pub store: PgStore,
    pub stats: StatsStore,
    pub cache: Cache,
    pub objects: ObjectStore,
    pub http: reqwest::Client,
    pub config: Config,
}
