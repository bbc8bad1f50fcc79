//! HTTP surface of both services.

mod affiche;
mod expo;
mod requests_logging;
mod schemas;
mod state;

pub use affiche::make_affiche_router;
pub use expo::make_expo_router;
pub use requests_logging::{log_requests, RequestsLoggingLevel};
pub use state::{AfficheState, ExpoState};

use anyhow::Result;
use std::net::SocketAddr;
use tracing::info;

pub async fn run_expo_server(
    state: ExpoState,
    port: u16,
    logging_level: RequestsLoggingLevel,
) -> Result<()> {
    let router = make_expo_router(state, logging_level);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Curator listening on port {}", port);
    axum::serve(listener, router).await?;
    Ok(())
}

pub async fn run_affiche_server(
    state: AfficheState,
    port: u16,
    logging_level: RequestsLoggingLevel,
) -> Result<()> {
    let router = make_affiche_router(state, logging_level);
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    info!("Display agent listening on port {}", port);
    axum::serve(listener, router).await?;
    Ok(())
}
