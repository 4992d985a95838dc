//! Prometheus metrics endpoint
//!
//! A small HTTP server exposing `GET /metrics` in the text format, plus a
//! background task that refreshes the provider health gauges once per
//! second from the router's snapshots.

use crate::error::{Error, Result};
use crate::prometheus::MetricsRegistry;
use axum::extract::State;
use axum::http::header;
use axum::routing::get;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Content type of the Prometheus text exposition format
const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// How often the health gauges are refreshed
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running metrics endpoint.
pub(crate) struct MetricsServer {
    shutdown: watch::Sender<bool>,
    server_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
    port: u16,
}

impl MetricsServer {
    /// Bind the port and start serving.
    ///
    /// `health_snapshot` is polled once per second and must return the
    /// current `(provider, gauge value)` pairs.
    pub(crate) async fn start<F>(
        registry: Arc<MetricsRegistry>,
        health_snapshot: F,
        port: u16,
    ) -> Result<Self>
    where
        F: Fn() -> Vec<(String, f64)> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(("0.0.0.0", port)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::PortInUse(port)
            } else {
                Error::Provider(format!("failed to bind metrics port {port}: {e}"))
            }
        })?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(port);

        let app = axum::Router::new()
            .route("/metrics", get(serve_metrics))
            .with_state(registry.clone());

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await;
            if let Err(err) = result {
                warn!(error = %err, "metrics server terminated abnormally");
            }
        });

        let refresh_registry = registry;
        let refresh_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                ticker.tick().await;
                for (provider, value) in health_snapshot() {
                    refresh_registry.set_health(&provider, value);
                }
            }
        });

        debug!(port, "metrics server started");
        Ok(Self {
            shutdown,
            server_task,
            refresh_task,
            port,
        })
    }

    /// Port the server is actually bound to (resolves port 0).
    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Cancel the background task and release the port.
    pub(crate) async fn stop(self) {
        self.refresh_task.abort();
        let _ = self.shutdown.send(true);
        if let Err(err) = self.server_task.await {
            if !err.is_cancelled() {
                warn!(error = %err, "metrics server task panicked");
            }
        }
        debug!(port = self.port, "metrics server stopped");
    }
}

async fn serve_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl axum::response::IntoResponse {
    (
        [(header::CONTENT_TYPE, METRICS_CONTENT_TYPE)],
        registry.export_prometheus(),
    )
}
