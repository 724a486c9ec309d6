pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::recommend::handlers as feed;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/retrieveList", get(feed::handle_retrieve_list))
        .route("/trackOpenRepository", post(feed::handle_track_open_repository))
        .route("/getReadme", get(feed::handle_get_readme))
        .with_state(state)
}
