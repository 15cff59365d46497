use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use epitaph_client::{ProviderConfig, build_orchestrator};
use epitaph_core::control::BatchManager;
use epitaph_db::{Database, DatabaseConfig};
use epitaph_server::routes;
use epitaph_server::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("epitaph=info".parse()?))
        .with_target(false)
        .init();

    let admin_token = std::env::var("EPITAPH_ADMIN_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty());
    if admin_token.is_none() {
        tracing::warn!("EPITAPH_ADMIN_TOKEN not set; /v1 routes will answer 403");
    }
    let port = std::env::var("EPITAPH_SERVER_PORT").unwrap_or_else(|_| "3000".to_string());
    let addr = format!("0.0.0.0:{port}");

    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let orchestrator = build_orchestrator(&ProviderConfig::from_env()?)
        .await
        .context("Failed to build provider registry")?;
    let runs = BatchManager::new(db.clone(), orchestrator);

    let state = Arc::new(AppState {
        db,
        runs,
        admin_token,
    });

    // Applied innermost-first: Trace wraps Cors wraps the body limit.
    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install CTRL+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
