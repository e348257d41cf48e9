//! Axum Handlers for the REST API
//!
//! This module contains the logic for handling HTTP requests for health checks,
//! agent discovery, and session management. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{
        AgentSummary, AgentsResponse, EndSessionResponse, ErrorResponse, HealthResponse,
        RegistryStats,
    },
    state::AppState,
};

pub enum ApiError {
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Liveness probe reporting the number of live sessions.
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        active_sessions: state.registry.active_count().await,
    })
}

/// List the selectable agent presets.
#[utoipa::path(
    get,
    path = "/api/agents",
    responses(
        (status = 200, description = "Available agents", body = AgentsResponse)
    )
)]
pub async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentsResponse> {
    let agents = state
        .presets
        .list()
        .into_iter()
        .map(AgentSummary::from)
        .collect();
    Json(AgentsResponse { agents })
}

/// Snapshot of every live session.
#[utoipa::path(
    get,
    path = "/api/sessions",
    responses(
        (status = 200, description = "Live session statistics", body = RegistryStats)
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}

/// Force-end a live session and close its upstream connection.
#[utoipa::path(
    post,
    path = "/api/sessions/{id}/end",
    responses(
        (status = 200, description = "Session ended", body = EndSessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Session ID")
    )
)]
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<EndSessionResponse>, ApiError> {
    if !state.registry.remove(&id).await {
        return Err(ApiError::NotFound(format!("Session {} not found", id)));
    }
    info!(session_id = %id, "Session ended via API");
    Ok(Json(EndSessionResponse {
        status: "ended".to_string(),
        session_id: id,
    }))
}
