//! Main Entrypoint for the Live Agent API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the telemetry queue, backed by Postgres when configured.
//! 3. Starting the session registry and its idle sweeper.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use axum::http::HeaderValue;
use gemini_realtime::GeminiConnector;
use live_agent_api::{
    config::Config, db::PgTelemetry, registry::SessionRegistry, router::create_router,
    state::AppState,
};
use live_agent_core::{
    preset::PresetCatalog,
    telemetry::{DEFAULT_QUEUE_CAPACITY, Telemetry, TelemetrySink, TracingTelemetry},
};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn cors_layer(allowed_origins: &[String]) -> anyhow::Result<CorsLayer> {
    let origins = if allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        let origins = allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin)
                    .with_context(|| format!("Invalid origin in ALLOWED_ORIGINS: {origin}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        AllowOrigin::list(origins)
    };
    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Telemetry ---
    let sink: Arc<dyn TelemetrySink> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let telemetry = PgTelemetry::new(pool);
            telemetry.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(telemetry)
        }
        None => {
            info!("DATABASE_URL not set; telemetry is written to the log only.");
            Arc::new(TracingTelemetry)
        }
    };
    let telemetry = Telemetry::spawn(sink, DEFAULT_QUEUE_CAPACITY);

    // --- 4. Initialize Shared Services ---
    let registry = SessionRegistry::new(config.max_sessions);
    registry
        .start_sweeper(config.sweep_interval, config.session_timeout)
        .await;
    let connector =
        GeminiConnector::new(config.gemini_api_key.clone(), config.gemini_model.clone());

    let app_state = Arc::new(AppState {
        registry: registry.clone(),
        presets: Arc::new(PresetCatalog::builtin()),
        connector: Arc::new(connector),
        telemetry: telemetry.clone(),
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let app = create_router(app_state).layer(cors_layer(&config.allowed_origins)?);

    // --- 6. Start Server ---
    info!(
        model = %config.gemini_model,
        max_sessions = config.max_sessions,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    registry.shutdown_all().await;
    telemetry.shutdown().await;
    info!("Server has shut down.");
    Ok(())
}
