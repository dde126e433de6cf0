use axum::{routing::get, Router};
use dpa_core::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Prometheus scrape endpoint
pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    dpa_metrics::gather_metrics()
}

/// Serve `/metrics` on `addr` until `shutdown` fires
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Metrics available on http://{}/metrics", local);

    tokio::spawn(async move {
        let server = axum::serve(listener, router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = server.await {
            warn!(error = %e, "Metrics server failed");
        }
    });
    Ok(local)
}
