use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::errors::AppError;

/// How often the idle reaper wakes up.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);
/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Orchestration seam: something that can run 0..=max replicas of the
/// embedding backend and report which are live.
#[async_trait]
pub trait ReplicaController: Send + Sync {
    /// Requests the given replica count; best-effort.
    async fn set_replicas(&self, replicas: usize) -> anyhow::Result<()>;

    /// Blocks until the requested number of instances is running.
    async fn wait_ready(&self, replicas: usize) -> anyhow::Result<()>;

    /// Addresses of the currently running instances.
    async fn running_instances(&self) -> anyhow::Result<Vec<String>>;
}

/// Controller over a fixed, pre-provisioned address list: "scaling to n"
/// makes the first n addresses routable. Swapping in a real orchestrator
/// is a trait impl away.
pub struct AddressPoolController {
    addresses: Vec<String>,
    desired: Mutex<usize>,
}

impl AddressPoolController {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            desired: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ReplicaController for AddressPoolController {
    async fn set_replicas(&self, replicas: usize) -> anyhow::Result<()> {
        let mut desired = self.desired.lock().await;
        *desired = replicas.min(self.addresses.len());
        Ok(())
    }

    async fn wait_ready(&self, _replicas: usize) -> anyhow::Result<()> {
        // Pre-provisioned addresses are ready as soon as they are routable.
        Ok(())
    }

    async fn running_instances(&self) -> anyhow::Result<Vec<String>> {
        let desired = *self.desired.lock().await;
        Ok(self.addresses.iter().take(desired).cloned().collect())
    }
}

/// Mutable scaling state; one mutex guards all of it, shared by the proxy
/// handler and the idle reaper.
struct ScalerState {
    in_flight: usize,
    replicas: usize,
    last_request: Option<Instant>,
    next_index: usize,
}

pub struct Autoscaler<C: ReplicaController> {
    state: Mutex<ScalerState>,
    controller: C,
    max_replicas: usize,
    idle_timeout: Duration,
    http: reqwest::Client,
}

impl<C: ReplicaController> Autoscaler<C> {
    pub fn new(controller: C, max_replicas: usize, idle_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(ScalerState {
                in_flight: 0,
                replicas: 0,
                last_request: None,
                next_index: 0,
            }),
            controller,
            max_replicas,
            idle_timeout,
            http: reqwest::Client::new(),
        }
    }

    /// Admits one request: stamps activity, bumps in-flight, scales up when
    /// the backend is cold or under pressure, and picks a target address
    /// round-robin. Returns `None` when no instance resolves.
    async fn admit(&self) -> Option<String> {
        let mut state = self.state.lock().await;
        state.last_request = Some(Instant::now());
        state.in_flight += 1;

        if let Some(target) = scale_decision(state.in_flight, state.replicas, self.max_replicas) {
            info!("Scaling embedding backend to {target} instance(s)");
            if let Err(e) = self.controller.set_replicas(target).await {
                error!("Scale to {target} failed: {e}");
            } else {
                if let Err(e) = self.controller.wait_ready(target).await {
                    error!("Waiting for {target} instance(s) failed: {e}");
                }
                state.replicas = target;
            }
        }

        let instances = match self.controller.running_instances().await {
            Ok(instances) if !instances.is_empty() => instances,
            Ok(_) => {
                warn!("No running embedding instances");
                state.in_flight -= 1;
                return None;
            }
            Err(e) => {
                error!("Failed to list embedding instances: {e}");
                state.in_flight -= 1;
                return None;
            }
        };

        let target = instances[state.next_index % instances.len()].clone();
        state.next_index = state.next_index.wrapping_add(1);
        Some(target)
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Periodic scale-to-zero check. The in-flight re-check happens under
    /// the same lock the handler holds, so a request admitted concurrently
    /// can never be stranded against zero replicas.
    pub async fn run_reaper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(REAPER_INTERVAL);
        loop {
            interval.tick().await;
            let mut state = self.state.lock().await;
            let idle_for = state.last_request.map(|t| t.elapsed());
            if should_scale_down(idle_for, self.idle_timeout, state.replicas, state.in_flight) {
                info!("Scaling embedding backend down to 0 due to inactivity");
                if let Err(e) = self.controller.set_replicas(0).await {
                    error!("Scale down failed: {e}");
                } else {
                    state.replicas = 0;
                    state.last_request = None;
                }
            }
        }
    }
}

/// Scale-up rule: one extra replica per admitted request while demand
/// exceeds capacity, and always at least one replica once a request
/// arrives.
fn scale_decision(in_flight: usize, replicas: usize, max_replicas: usize) -> Option<usize> {
    if in_flight > replicas && replicas < max_replicas {
        Some(replicas + 1)
    } else if replicas == 0 {
        Some(1)
    } else {
        None
    }
}

/// Scale-down rule: only after the idle timeout has strictly elapsed, and
/// only when nothing is in flight.
fn should_scale_down(
    idle_for: Option<Duration>,
    idle_timeout: Duration,
    replicas: usize,
    in_flight: usize,
) -> bool {
    match idle_for {
        Some(idle) => idle > idle_timeout && replicas > 0 && in_flight == 0,
        None => false,
    }
}

/// Fallback axum handler that forwards any request to a live embedding
/// instance.
pub async fn proxy_handler<C: ReplicaController + 'static>(
    State(scaler): State<Arc<Autoscaler<C>>>,
    request: Request,
) -> Response {
    let Some(target) = scaler.admit().await else {
        return AppError::NoInstances.into_response();
    };

    let response = forward(&scaler.http, &target, request).await;
    scaler.release().await;

    match response {
        Ok(response) => response,
        Err(e) => {
            error!("Proxying to {target} failed: {e}");
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}

async fn forward(
    http: &reqwest::Client,
    target: &str,
    request: Request,
) -> anyhow::Result<Response> {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://{target}{path_and_query}");
    let method = request.method().clone();
    let headers = request.headers().clone();

    let body = axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await?;

    let mut upstream = http.request(method, &url).body(body.to_vec());
    for (name, value) in &headers {
        if name != axum::http::header::HOST {
            upstream = upstream.header(name, value);
        }
    }

    let upstream_response = upstream.send().await?;
    let status = upstream_response.status();
    let response_headers = upstream_response.headers().clone();
    let bytes = upstream_response.bytes().await?;

    let mut response = Response::builder().status(status);
    for (name, value) in &response_headers {
        response = response.header(name, value);
    }
    Ok(response.body(Body::from(bytes))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cold_start_scales_to_one() {
        assert_eq!(scale_decision(1, 0, 3), Some(1));
    }

    #[test]
    fn test_pressure_scales_up_by_one() {
        assert_eq!(scale_decision(3, 2, 3), Some(3));
    }

    #[test]
    fn test_at_max_no_scale_up() {
        assert_eq!(scale_decision(10, 3, 3), None);
    }

    #[test]
    fn test_capacity_headroom_no_scale() {
        assert_eq!(scale_decision(1, 2, 3), None);
    }

    #[test]
    fn test_no_scale_down_at_exact_timeout() {
        let timeout = Duration::from_secs(600);
        assert!(!should_scale_down(Some(timeout), timeout, 1, 0));
    }

    #[test]
    fn test_scale_down_past_timeout() {
        let timeout = Duration::from_secs(600);
        assert!(should_scale_down(
            Some(timeout + Duration::from_millis(1)),
            timeout,
            1,
            0
        ));
    }

    #[test]
    fn test_no_scale_down_with_in_flight_requests() {
        let timeout = Duration::from_secs(600);
        assert!(!should_scale_down(
            Some(timeout + Duration::from_secs(5)),
            timeout,
            1,
            1
        ));
    }

    #[test]
    fn test_no_scale_down_when_never_requested() {
        assert!(!should_scale_down(None, Duration::from_secs(600), 1, 0));
    }

    #[tokio::test]
    async fn test_address_pool_routes_prefix() {
        let controller = AddressPoolController::new(vec![
            "10.0.0.1:80".to_string(),
            "10.0.0.2:80".to_string(),
            "10.0.0.3:80".to_string(),
        ]);
        assert!(controller.running_instances().await.unwrap().is_empty());

        controller.set_replicas(2).await.unwrap();
        assert_eq!(
            controller.running_instances().await.unwrap(),
            vec!["10.0.0.1:80", "10.0.0.2:80"]
        );

        // Requests past the pool size clamp to what exists.
        controller.set_replicas(9).await.unwrap();
        assert_eq!(controller.running_instances().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_admit_round_robins_and_counts_in_flight() {
        let controller = AddressPoolController::new(vec![
            "a:80".to_string(),
            "b:80".to_string(),
        ]);
        let scaler = Autoscaler::new(controller, 2, Duration::from_secs(600));

        let first = scaler.admit().await.unwrap();
        let second = scaler.admit().await.unwrap();
        assert_ne!(first, second);

        {
            let state = scaler.state.lock().await;
            assert_eq!(state.in_flight, 2);
            assert_eq!(state.replicas, 2);
        }

        scaler.release().await;
        scaler.release().await;
        let state = scaler.state.lock().await;
        assert_eq!(state.in_flight, 0);
    }

    #[tokio::test]
    async fn test_admit_with_empty_pool_yields_none() {
        let scaler = Autoscaler::new(
            AddressPoolController::new(Vec::new()),
            3,
            Duration::from_secs(600),
        );
        assert!(scaler.admit().await.is_none());
        let state = scaler.state.lock().await;
        assert_eq!(state.in_flight, 0);
    }
}
