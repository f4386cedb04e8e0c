//! # Metrics Endpoint
//!
//! Serves the telemetry registry over HTTP:
//!
//! - `GET /metrics` - Prometheus text format
//! - `GET /health` - liveness

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use swap_telemetry::{gather_metrics, register_metrics};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Routes of the metrics listener.
pub fn router() -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
}

async fn metrics() -> Response {
    match gather_metrics() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            warn!("[metrics] render failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Running `/metrics` listener.
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Register the metrics and start serving on `addr` (port 0 picks a free one).
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        register_metrics().context("failed to register metrics")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener on {addr}"))?;
        let addr = listener.local_addr()?;
        let (shutdown, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, router()).with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = server.await {
                warn!("[metrics] server error: {}", e);
            }
        });
        info!(addr = %addr, "[metrics] serving /metrics");
        Ok(Self { addr, shutdown, handle })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for open requests.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!("[metrics] server task ended abnormally: {}", e);
        }
        info!("[metrics] stopped");
    }
}
