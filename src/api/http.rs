//! HTTP API Server
//!
//! REST control surface of one host's election coordinator: status query,
//! election requests, kill, operating modes and read-only attributes.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::topology::{Attributes, ElectionHandle, OperatingMode, RingTopology, StatusReport};

/// Shared application state
pub struct AppState {
    /// Label of the served host
    pub host: String,
    /// Coordinator of the served host
    pub election: ElectionHandle,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, host: String, election: ElectionHandle) -> Self {
        Self {
            config,
            state: Arc::new(AppState { host, election }),
        }
    }

    /// Create the router
    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // Status and info
            .route("/status", get(handle_status))
            .route("/attributes", get(handle_attributes))
            .route("/topology", get(handle_topology))
            .route("/health", get(handle_health))
            // Control operations
            .route("/election", post(handle_request_election))
            .route("/election/kill", post(handle_kill))
            .route("/mode", post(handle_set_mode))
            .route("/single-node", post(handle_single_node))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Start the HTTP server, returning once `shutdown` resolves
    pub async fn start(&self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API for {} listening on {}", self.state.host, self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Operating mode request
#[derive(Debug, Deserialize, Serialize)]
pub struct ModeRequest {
    pub mode: OperatingMode,
}

/// Error body
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub errno: i32,
}

/// Health response
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub host: String,
}

/// Coordinator error as an HTTP response
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotReady(_) | Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Error::Busy | Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Unsupported(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
            code: self.0.code().to_string(),
            errno: self.0.errno(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

// ============ Handlers ============

async fn handle_status(State(state): State<Arc<AppState>>) -> ApiResult<StatusReport> {
    Ok(Json(state.election.status().await?))
}

async fn handle_attributes(State(state): State<Arc<AppState>>) -> ApiResult<Attributes> {
    Ok(Json(state.election.attributes().await?))
}

async fn handle_topology(State(state): State<Arc<AppState>>) -> ApiResult<Option<RingTopology>> {
    Ok(Json(state.election.topology().await?))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.election.status().await.is_ok();
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            healthy,
            host: state.host.clone(),
        }),
    )
}

async fn handle_request_election(State(state): State<Arc<AppState>>) -> ApiResult<StatusReport> {
    let report = state.election.request_election().await?;
    tracing::info!("Election requested over HTTP: {}", report.state);
    Ok(Json(report))
}

async fn handle_kill(State(state): State<Arc<AppState>>) -> ApiResult<StatusReport> {
    tracing::info!("Election kill requested over HTTP");
    Ok(Json(state.election.kill().await?))
}

async fn handle_set_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeRequest>,
) -> ApiResult<StatusReport> {
    Ok(Json(state.election.set_mode(request.mode).await?))
}

async fn handle_single_node(State(state): State<Arc<AppState>>) -> ApiResult<StatusReport> {
    Ok(Json(state.election.request_single_node().await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::config::{ElectionFlags, ElectionSettings};
    use crate::hal::SimFabric;
    use crate::topology::{ControlState, ElectionCoordinator};

    fn settings(flags: u32) -> ElectionSettings {
        ElectionSettings {
            timeout_secs: 5,
            poll_interval_ms: 2,
            dma_timeout_ms: 20,
            dma_retries: 2,
            flags: ElectionFlags(flags),
            ..ElectionSettings::default()
        }
    }

    fn app(fabric: &SimFabric, host: usize, flags: u32) -> Router {
        let (handle, _) = ElectionCoordinator::spawn(fabric.host(host), settings(flags)).unwrap();
        HttpServer::router(Arc::new(AppState {
            host: format!("sim-host{}", host),
            election: handle,
        }))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_status_and_kill() {
        let fabric = SimFabric::builder().hosts(2).seed(31).build().unwrap();
        let app = app(&fabric, 0, ElectionFlags::SKIP_AT_LOAD);

        let (status, body) = call(&app, "GET", "/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "BUSY");
        assert!(body["node_id"].is_null());

        let (status, body) = call(&app, "POST", "/election/kill", None).await;
        assert_eq!(status, StatusCode::OK);
        let report: StatusReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.state, ControlState::Failure);

        let (_, body) = call(&app, "GET", "/attributes", None).await;
        assert_eq!(body["node_id"], -1);
        assert_eq!(body["supported_modes"], "SINGLE");
    }

    #[tokio::test]
    async fn test_mode_errors_carry_errno() {
        let fabric = SimFabric::builder().hosts(2).seed(32).build().unwrap();
        fabric.acquire_cores(0, 1);
        let app = app(&fabric, 0, ElectionFlags::SKIP_AT_LOAD);

        let (status, body) = call(&app, "POST", "/election", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["errno"], crate::error::errno::EAGAIN);

        let (status, body) = call(&app, "POST", "/mode", Some(r#"{"mode":"FULL_RING"}"#)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "EBUSY");
    }

    #[tokio::test]
    async fn test_elect_over_http() {
        let fabric = SimFabric::builder().hosts(2).seed(33).build().unwrap();
        let apps: Vec<_> = (0..2).map(|h| app(&fabric, h, 0)).collect();

        let started = std::time::Instant::now();
        loop {
            let (_, body) = call(&apps[0], "GET", "/status", None).await;
            if body["state"] == "SUCCESS" {
                break;
            }
            assert!(started.elapsed() < Duration::from_secs(10));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (status, body) = call(&apps[0], "POST", "/single-node", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "SINGLE_NODE");

        let (_, body) = call(&apps[0], "GET", "/health", None).await;
        assert_eq!(body["healthy"], true);
    }
}
