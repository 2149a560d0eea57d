//! REST API Handlers
//!
//! Exposes the controller operations over HTTP. Volume IDs travel in the
//! path, so treeq IDs must be percent-encoded (`#` as `%23`).

use crate::controlplane::Orchestrator;
use crate::domain::ports::{
    CapacityRange, CreateSnapshotRequest, CreateVolumeRequest, DeleteVolumeRequest,
    ExpandVolumeRequest, PublishVolumeRequest, StorageProtocol,
};
use crate::error::{Code, Error};
use axum::{
    extract::{DefaultBodyLimit, Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Optional protocol override carried in the query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProtocolQuery {
    pub protocol: Option<StorageProtocol>,
}

/// Expand request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandVolumeBody {
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

/// Publish/unpublish request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishVolumeBody {
    pub node_id: String,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// HTTP status for a transport code
pub fn status_for(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(operation: &str, e: Error) -> Response {
    let code = e.code();
    if code == Code::Internal {
        error!("{} failed: {}", operation, e);
    } else {
        warn!("{} rejected: {}", operation, e);
    }

    let details = match &e {
        Error::MissingParameters { missing, .. } => Some(missing.join(",")),
        _ => None,
    };

    (
        status_for(code),
        Json(ApiErrorResponse {
            error: code.as_str().into(),
            message: e.to_string(),
            details,
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
    max_body_size: usize,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            max_body_size: 1024 * 1024,
        }
    }

    /// Limit request bodies to the given size
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(create_volume).get(list_volumes))
            .route("/v1/volumes/:id", delete(delete_volume))
            .route("/v1/volumes/:id/expand", post(expand_volume))
            .route("/v1/volumes/:id/publish", post(publish_volume))
            .route("/v1/volumes/:id/unpublish", post(unpublish_volume))
            .route("/v1/volumes/:id/capabilities", get(validate_capabilities))
            // Snapshot endpoints
            .route("/v1/snapshots", post(create_snapshot))
            .route("/v1/snapshots/:id", delete(delete_snapshot))
            // Controller endpoints
            .route("/v1/capabilities", get(get_capabilities))
            .route("/v1/capacity", get(get_capacity))
            .route("/v1/status", get(get_status))
            // Health endpoint
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(DefaultBodyLimit::max(self.max_body_size))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Create a volume
async fn create_volume(
    State(state): State<AppState>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    info!("Create volume request: {}", request.name);

    match state.orchestrator.create_volume(request).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => error_response("create_volume", e),
    }
}

/// Delete a volume
async fn delete_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    info!("Delete volume request: {}", id);

    let request = DeleteVolumeRequest { volume_id: id };
    match state.orchestrator.delete_volume(request, query.protocol).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("delete_volume", e),
    }
}

/// Expand a volume
async fn expand_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
    Json(body): Json<ExpandVolumeBody>,
) -> Response {
    info!("Expand volume request: {}", id);

    let request = ExpandVolumeRequest {
        volume_id: id,
        capacity_range: body.capacity_range,
    };
    match state.orchestrator.expand_volume(request, query.protocol).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response("expand_volume", e),
    }
}

async fn publish_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
    Json(body): Json<PublishVolumeBody>,
) -> Response {
    let request = PublishVolumeRequest {
        volume_id: id,
        node_id: body.node_id,
    };
    match state
        .orchestrator
        .controller_publish_volume(request, query.protocol)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response("controller_publish_volume", e),
    }
}

async fn unpublish_volume(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
    Json(body): Json<PublishVolumeBody>,
) -> Response {
    let request = PublishVolumeRequest {
        volume_id: id,
        node_id: body.node_id,
    };
    match state
        .orchestrator
        .controller_unpublish_volume(request, query.protocol)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("controller_unpublish_volume", e),
    }
}

async fn validate_capabilities(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    match state
        .orchestrator
        .validate_volume_capabilities(&id, query.protocol)
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response("validate_volume_capabilities", e),
    }
}

async fn list_volumes(
    State(state): State<AppState>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    match state.orchestrator.list_volumes(query.protocol).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response("list_volumes", e),
    }
}

async fn create_snapshot(
    State(state): State<AppState>,
    Query(query): Query<ProtocolQuery>,
    Json(request): Json<CreateSnapshotRequest>,
) -> Response {
    match state.orchestrator.create_snapshot(request, query.protocol).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => error_response("create_snapshot", e),
    }
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    match state.orchestrator.delete_snapshot(&id, query.protocol).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response("delete_snapshot", e),
    }
}

/// Controller capabilities
async fn get_capabilities(
    State(state): State<AppState>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    match state.orchestrator.capabilities(query.protocol) {
        Ok(capabilities) => (StatusCode::OK, Json(capabilities)).into_response(),
        Err(e) => error_response("controller_get_capabilities", e),
    }
}

async fn get_capacity(
    State(state): State<AppState>,
    Query(query): Query<ProtocolQuery>,
) -> Response {
    match state.orchestrator.get_capacity(query.protocol).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => error_response("get_capacity", e),
    }
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(state.orchestrator.status()))
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.orchestrator.status().healthy {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no provisioners registered")
    }
}
