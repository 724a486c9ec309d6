use std::collections::HashMap;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Owner, Repository, RepositoryStat, SimilarityEntry};
use crate::object_store::readme_key;
use crate::recommend::resolver::{
    accumulate_scores, filter_cache_key, normalize_facets, paginate, response_cache_key,
    HISTORY_LIMIT, PAGE_SIZE, TRENDING_WINDOW_DAYS,
};
use crate::state::AppState;

const RESPONSE_TTL: Duration = Duration::from_secs(5 * 60);
const TRENDING_TTL: Duration = Duration::from_secs(10 * 60);
const FILTER_TTL: Duration = Duration::from_secs(10 * 60);
const STATS_TTL: Duration = Duration::from_secs(3600);
const SIMILAR_WARM_TTL: Duration = Duration::from_secs(24 * 3600);
const README_HTML_TTL: Duration = Duration::from_secs(24 * 3600);

const TRENDING_CACHE_KEY: &str = "trending_repo_ids_by_growth:30";

#[derive(Debug, Deserialize)]
pub struct FeedParams {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
    pub languages: Option<String>,
    pub tags: Option<String>,
    pub topics: Option<String>,
    pub page: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub repository: Repository,
    pub owner: Owner,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RepositoryStat>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeedResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub repositories: Vec<RepositoryEntry>,
}

/// GET /retrieveList
pub async fn handle_retrieve_list(
    State(state): State<AppState>,
    Query(params): Query<FeedParams>,
) -> Response {
    let debug = state.config.debug;
    match retrieve_list(state, params).await {
        Ok(response) => response,
        Err(e) => e.into_response_with_debug(debug),
    }
}

async fn retrieve_list(state: AppState, params: FeedParams) -> Result<Response, AppError> {
    let original_session_id = params.session_id.clone().unwrap_or_default();
    let is_new_session = original_session_id.is_empty();
    let session_id = if is_new_session {
        Uuid::new_v4().to_string()
    } else {
        original_session_id.clone()
    };

    let languages = normalize_facets(params.languages.as_deref());
    let tags = normalize_facets(params.tags.as_deref());
    let topics = normalize_facets(params.topics.as_deref());
    let page: usize = params
        .page
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);

    // Whole-response cache, keyed by the session id the client actually
    // sent. First-time clients all share the empty-session key; on a hit
    // the freshly generated id is stitched into the served body.
    let request_key = response_cache_key(&original_session_id, &languages, &tags, &topics, page);
    if let Some(mut cached) = state.cache.get_json::<serde_json::Value>(&request_key).await {
        if is_new_session {
            cached["sessionId"] = serde_json::Value::String(session_id.clone());
        }
        return Ok(Json(cached).into_response());
    }

    let history_ids = state
        .store
        .get_recent_clicked_repository_ids(&session_id, HISTORY_LIMIT)
        .await
        .unwrap_or_else(|e| {
            warn!("Failed to get click history: {e}");
            Vec::new()
        });

    let mut recommended_ids = if history_ids.is_empty() {
        trending_ids(&state).await?
    } else {
        personalized_ids(&state, &history_ids).await
    };

    if !languages.is_empty() || !tags.is_empty() || !topics.is_empty() {
        recommended_ids =
            filtered_ids(&state, recommended_ids, &languages, &tags, &topics).await?;
    }

    let seen = state.cache.seen_repository_ids(&session_id).await;
    recommended_ids.retain(|id| !seen.contains(id));

    let final_ids = paginate(&recommended_ids, page);
    let repositories = materialize(&state, &final_ids).await?;

    let response = FeedResponse {
        session_id: session_id.clone(),
        repositories,
    };

    let session_key = response_cache_key(&session_id, &languages, &tags, &topics, page);
    state
        .cache
        .set_json(&session_key, &response, RESPONSE_TTL)
        .await;
    if is_new_session {
        state
            .cache
            .set_json(&request_key, &response, RESPONSE_TTL)
            .await;
    }

    Ok(Json(response).into_response())
}

/// Global trending feed for sessions without history, cached for ten
/// minutes. A cold time-series store yields an empty (but valid) feed.
async fn trending_ids(state: &AppState) -> Result<Vec<i64>, AppError> {
    if let Some(ids) = state.cache.get_json::<Vec<i64>>(TRENDING_CACHE_KEY).await {
        if !ids.is_empty() {
            return Ok(ids);
        }
    }

    let ids = state
        .stats
        .trending_repository_ids_by_growth(TRENDING_WINDOW_DAYS)
        .await?;
    state
        .cache
        .set_json(TRENDING_CACHE_KEY, &ids, TRENDING_TTL)
        .await;
    Ok(ids)
}

/// Fuses the precomputed neighborhoods of every history entry into one
/// ranked candidate list. Hot path reads the cached sorted set; cold path
/// decodes the persisted blob and warms the cache for a day.
async fn personalized_ids(state: &AppState, history_ids: &[i64]) -> Vec<i64> {
    let mut neighborhoods = Vec::with_capacity(history_ids.len());
    for history_id in history_ids {
        let key = format!("similar:{history_id}");

        let hot = state.cache.sorted_set_top(&key, PAGE_SIZE).await;
        if !hot.is_empty() {
            neighborhoods.push(
                hot.into_iter()
                    .map(|(member, score)| SimilarityEntry { member, score })
                    .collect(),
            );
            continue;
        }

        match state.store.get_repository_similarity(*history_id).await {
            Ok(Some(entries)) if !entries.is_empty() => {
                let zset: Vec<(f64, i64)> =
                    entries.iter().map(|e| (e.score, e.member)).collect();
                if let Err(e) = state
                    .cache
                    .warm_sorted_set(&key, &zset, SIMILAR_WARM_TTL)
                    .await
                {
                    warn!("Failed to warm neighborhood cache for {history_id}: {e}");
                }
                neighborhoods.push(entries);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load similarity for {history_id}: {e}"),
        }
    }
    accumulate_scores(neighborhoods)
}

async fn filtered_ids(
    state: &AppState,
    ids: Vec<i64>,
    languages: &[String],
    tags: &[String],
    topics: &[String],
) -> Result<Vec<i64>, AppError> {
    let key = filter_cache_key(&ids, languages, tags, topics);
    if let Some(cached) = state.cache.get_json::<Vec<i64>>(&key).await {
        return Ok(cached);
    }

    let filtered = state
        .store
        .filter_repository_ids(&ids, languages, tags, topics)
        .await
        .map_err(AppError::Internal)?;
    state.cache.set_json(&key, &filtered, FILTER_TTL).await;
    Ok(filtered)
}

/// Loads full repository data for the page and attaches each repository's
/// newest stat snapshot, preserving the ranked order of `final_ids`.
async fn materialize(
    state: &AppState,
    final_ids: &[i64],
) -> Result<Vec<RepositoryEntry>, AppError> {
    let data = state
        .store
        .get_repositories_data_by_ids(final_ids)
        .await
        .map_err(AppError::Internal)?;

    let mut by_id: HashMap<i64, _> = data
        .into_iter()
        .map(|d| (d.repository.id, d))
        .collect();

    let mut entries = Vec::with_capacity(final_ids.len());
    for id in final_ids {
        let Some(data) = by_id.remove(id) else {
            continue;
        };
        let stats = latest_stat(state, *id).await;
        entries.push(RepositoryEntry {
            repository: data.repository,
            owner: data.owner,
            stats,
        });
    }
    Ok(entries)
}

async fn latest_stat(state: &AppState, repo_id: i64) -> Option<RepositoryStat> {
    let key = format!("repo_stats:{repo_id}");
    if let Some(stat) = state.cache.get_json::<RepositoryStat>(&key).await {
        return Some(stat);
    }

    match state.stats.latest_stat(repo_id).await {
        Ok(Some(stat)) => {
            state.cache.set_json(&key, &stat, STATS_TTL).await;
            Some(stat)
        }
        Ok(None) => None,
        Err(e) => {
            warn!("Failed to get stats for repository {repo_id}: {e}");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TrackRequest {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "repositoryId")]
    pub repository_id: i64,
}

/// POST /trackOpenRepository
pub async fn handle_track_open_repository(
    State(state): State<AppState>,
    body: Result<Json<TrackRequest>, JsonRejection>,
) -> Response {
    let debug = state.config.debug;
    let Ok(Json(request)) = body else {
        return AppError::Validation("Invalid request body".into())
            .into_response_with_debug(debug);
    };

    if let Err(e) = state
        .store
        .track_repository_view(&request.session_id, request.repository_id)
        .await
    {
        return AppError::Internal(e).into_response_with_debug(debug);
    }

    if let Err(e) = state
        .cache
        .add_seen(&request.session_id, request.repository_id)
        .await
    {
        warn!("Failed to update seen-set for {}: {e}", request.session_id);
    }

    Json(serde_json::json!({ "status": "success" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ReadmeParams {
    #[serde(rename = "repoId")]
    pub repo_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MarkupResponse {
    html: String,
}

/// GET /getReadme
///
/// Serves the stored raw Markdown through the external markup renderer,
/// caching the rendered HTML for a day.
pub async fn handle_get_readme(
    State(state): State<AppState>,
    Query(params): Query<ReadmeParams>,
) -> Response {
    let debug = state.config.debug;
    match get_readme(state, params).await {
        Ok(response) => response,
        Err(e) => e.into_response_with_debug(debug),
    }
}

async fn get_readme(state: AppState, params: ReadmeParams) -> Result<Response, AppError> {
    let repo_id: i64 = params
        .repo_id
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| AppError::Validation("repoId query parameter is required".into()))?;

    let cache_key = format!("readme_html:{repo_id}");
    if let Some(html) = state.cache.get_bytes(&cache_key).await {
        return Ok(html_response(html));
    }

    let markdown = state
        .objects
        .get_optional(&readme_key(repo_id))
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound("README not found".into()))?;

    let response = state
        .http
        .post(format!("{}/markup", state.config.markup_service_url))
        .json(&serde_json::json!({ "text": String::from_utf8_lossy(&markdown) }))
        .send()
        .await
        .map_err(|e| AppError::Storage(format!("Markup service call failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Storage(format!(
            "Markup service returned status {}",
            response.status()
        )));
    }

    let rendered: MarkupResponse = response
        .json()
        .await
        .map_err(|e| AppError::Storage(format!("Markup service response invalid: {e}")))?;

    let html = rendered.html.into_bytes();
    state.cache.set_bytes(&cache_key, &html, README_HTML_TTL).await;
    Ok(html_response(html))
}

fn html_response(html: Vec<u8>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}
