//! HTTP API Server
//!
//! REST API for volume status, replica membership, snapshots and rebuilds.

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::chain::PrepareRemoveAction;
use crate::config::ApiConfig;
use crate::controller::{Controller, ReplicaAction};
use crate::error::{Error, Result};

/// Shared application state
pub struct AppState {
    pub controller: Arc<Controller>,
    pub started_at: std::time::Instant,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: ApiConfig, controller: Arc<Controller>) -> Self {
        let state = Arc::new(AppState {
            controller,
            started_at: std::time::Instant::now(),
        });
        Self { config, state }
    }

    /// Create the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/ping", get(handle_ping))
            .route("/v1/volume", get(handle_volume))
            .route("/v1/stats", get(handle_stats))
            .route("/v1/layers", get(handle_layers))
            // Membership
            .route("/v1/replicas", get(handle_ls_replicas).post(handle_add_replica))
            .route("/v1/replicas/:address", delete(handle_rm_replica))
            .route("/v1/replicas/:address/action", post(handle_replica_action))
            // Rebuilds
            .route("/v1/rebuildinfo", get(handle_rebuild_info))
            .route("/v1/rebuild/:address/cancel", post(handle_cancel_rebuild))
            // Chain actions
            .route("/v1/snapshot", post(handle_snapshot))
            .route("/v1/revert", post(handle_revert))
            .route("/v1/checkpoint", post(handle_checkpoint))
            .route("/v1/resize", post(handle_resize))
            .route("/v1/removesnapshot", post(handle_remove_snapshot))
            .with_state(Arc::clone(&self.state))
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Request/Response Types ============

/// Replica attach request
#[derive(Debug, Deserialize, Serialize)]
pub struct AddReplicaRequest {
    pub address: String,
}

/// Snapshot request; the name is generated when absent
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SnapshotRequest {
    pub name: Option<String>,
}

/// Request naming an existing snapshot
#[derive(Debug, Deserialize, Serialize)]
pub struct NamedRequest {
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResizeRequest {
    pub size: u64,
}

#[derive(Debug, Deserialize)]
pub struct RebuildQuery {
    pub address: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub name: String,
    pub revision: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveSnapshotResponse {
    pub actions: Vec<PrepareRemoveAction>,
}

/// Acknowledgement for actions without a payload
#[derive(Debug, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: Option<String>,
}

impl ActionResponse {
    fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub volume: String,
    pub revision: u64,
    pub uptime_seconds: u64,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Typed error carried to the HTTP status line
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidState(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::ChainBusy(_) | Error::Dependency(_) => StatusCode::CONFLICT,
        Error::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        Error::QuorumLost { .. } => StatusCode::SERVICE_UNAVAILABLE,
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::ConnectionFailed { .. } | Error::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!("API request failed: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: format!("{:?}", self.0.code()),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

async fn handle_ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(PingResponse {
        volume: state.controller.name().to_string(),
        revision: state.controller.revision(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

async fn handle_volume(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.info().await)
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.stats().await)
}

async fn handle_layers(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.controller.layers().await?))
}

async fn handle_ls_replicas(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.ls_replicas().await)
}

async fn handle_add_replica(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddReplicaRequest>,
) -> ApiResult<impl IntoResponse> {
    state.controller.add_replica(&req.address).await?;
    Ok((
        StatusCode::CREATED,
        ActionResponse::ok(format!("Replica {} added", req.address)),
    ))
}

async fn handle_rm_replica(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.controller.rm_replica(&address).await?;
    Ok(ActionResponse::ok(format!("Replica {} removed", address)))
}

async fn handle_replica_action(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Json(action): Json<ReplicaAction>,
) -> ApiResult<impl IntoResponse> {
    let name = action.name();
    state.controller.replica_action(&address, action).await?;
    Ok(ActionResponse::ok(format!("Replica {} {} done", address, name)))
}

async fn handle_rebuild_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RebuildQuery>,
) -> ApiResult<Response> {
    match query.address {
        Some(address) => Ok(Json(state.controller.rebuild_info(&address).await?).into_response()),
        None => Ok(Json(state.controller.rebuilds().await).into_response()),
    }
}

async fn handle_cancel_rebuild(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.controller.cancel_rebuild(&address).await?;
    Ok(ActionResponse::ok(format!("Rebuild of {} cancelled", address)))
}

async fn handle_snapshot(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SnapshotRequest>>,
) -> ApiResult<impl IntoResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let name = state.controller.snapshot(req.name).await?;
    Ok(Json(SnapshotResponse {
        name,
        revision: state.controller.revision(),
    }))
}

async fn handle_revert(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NamedRequest>,
) -> ApiResult<impl IntoResponse> {
    state.controller.revert(&req.name).await?;
    Ok(ActionResponse::ok(format!("Reverted to {}", req.name)))
}

async fn handle_checkpoint(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NamedRequest>,
) -> ApiResult<impl IntoResponse> {
    state.controller.set_checkpoint(&req.name).await?;
    Ok(ActionResponse::ok(format!("Checkpoint set to {}", req.name)))
}

async fn handle_resize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResizeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.controller.resize(req.size).await?;
    Ok(ActionResponse::ok(format!("Resized to {} bytes", req.size)))
}

async fn handle_remove_snapshot(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NamedRequest>,
) -> ApiResult<impl IntoResponse> {
    let actions = state.controller.remove_snapshot(&req.name).await?;
    Ok(Json(RemoveSnapshotResponse { actions }))
}
