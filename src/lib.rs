pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod rate_limit;
pub mod store;
pub mod telemetry;
pub mod uploads;
pub mod validation;

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::http::{build_router, AppState};
use std::net::SocketAddr;

/// Binds `PORT` on all interfaces and serves until ctrl-c.
pub async fn serve(config: AppConfig) -> AppResult<()> {
    let port = config.port;
    let environment = config.environment;
    let state = AppState::initialize(config).await?;
    let data_file = state.store.path().display().to_string();

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!(
        port,
        environment = environment.as_str(),
        data_file = %data_file,
        "server listening"
    );

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
