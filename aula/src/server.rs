//! Server lifecycle management
//!
//! Binds the HTTP/WebSocket listener and runs until a shutdown signal.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use aula_sfu::{Config, SfuManager};

pub async fn serve(config: Config, manager: Arc<SfuManager>) -> Result<()> {
    let router = aula_api::http::create_router(manager);

    let address = config.http_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(address = %address, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
        return;
    }
    info!("shutdown signal received");
}
