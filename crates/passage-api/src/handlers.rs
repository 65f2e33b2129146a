use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use passage_proto::{
    validate_create_request, CreateTunnelRequest, CreateTunnelResponse, ErrorResponse,
    HealthResponse, TunnelRecord, ValidationErrorResponse,
};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::AppState;

/// Create a new tunnel
#[utoipa::path(
    post,
    path = "/api/tunnels",
    request_body = CreateTunnelRequest,
    responses(
        (status = 201, description = "Tunnel created", body = CreateTunnelResponse),
        (status = 400, description = "Malformed request", body = ValidationErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn create_tunnel(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateTunnelRequest>,
) -> Response {
    let issues = validate_create_request(&request);
    if !issues.is_empty() {
        debug!(?issues, "Rejecting malformed tunnel request");
        return (
            StatusCode::BAD_REQUEST,
            Json(ValidationErrorResponse { errors: issues }),
        )
            .into_response();
    }

    match state.manager.create_tunnel().await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(CreateTunnelResponse {
                record,
                max_connections: state.max_connections,
                cached_url: None,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Error creating tunnel: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Get a tunnel by id
#[utoipa::path(
    get,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Tunnel record", body = TunnelRecord),
        (status = 404, description = "Tunnel not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn get_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TunnelRecord>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Getting tunnel: {}", id);

    match state.manager.get_tunnel(&id).await {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Tunnel not found".to_string(),
            }),
        )),
        Err(e) => {
            error!("Error getting tunnel: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

/// Delete a tunnel
///
/// Idempotent: deleting an unknown id succeeds without touching the registry.
#[utoipa::path(
    delete,
    path = "/api/tunnels/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 204, description = "Tunnel deleted"),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn delete_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    info!("Deleting tunnel: {}", id);

    match state.manager.delete_tunnel(&id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            error!("Error deleting tunnel: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            ))
        }
    }
}

/// Liveness probe, independent of registry reachability
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
