//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the REST API, WebSocket endpoints, and OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AgentSummary, AgentsResponse, EndSessionResponse, ErrorResponse, HealthResponse,
        RegistryStats, SessionStats,
    },
    state::AppState,
    ws::{ws_handler, ws_handler_with_id},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_agents,
        handlers::list_sessions,
        handlers::end_session,
    ),
    components(
        schemas(HealthResponse, AgentSummary, AgentsResponse, SessionStats, RegistryStats, EndSessionResponse, ErrorResponse)
    ),
    tags(
        (name = "Live Agent API", description = "Session management for the live voice agent relay")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/agents", get(handlers::list_agents))
        .route("/api/sessions", get(handlers::list_sessions))
        .route("/api/sessions/{id}/end", post(handlers::end_session))
        .route("/ws", get(ws_handler))
        .route("/ws/session/{session_id}", get(ws_handler_with_id))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
