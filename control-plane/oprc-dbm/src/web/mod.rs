use std::net::SocketAddr;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router() -> Router {
    // Expose both /health (preferred) and /healthz (legacy)
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
}

pub async fn run_http_server(addr: SocketAddr) -> anyhow::Result<()> {
    info!("DBM HTTP listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(addr).await?, router()).await?;
    Ok(())
}
