//! HTTP status endpoint — exposes transport state as JSON.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, extract::State};
use tokio::net::TcpListener;

use talus_transport::DtlsTransport;
use talus_transport::stats::TransportStats;

async fn handle_status(State(transport): State<Arc<DtlsTransport>>) -> Json<TransportStats> {
    Json(transport.stats())
}

pub async fn serve(transport: Arc<DtlsTransport>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/status", get(handle_status))
        .with_state(transport);

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}
