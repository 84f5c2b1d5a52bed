//! Metrics and status HTTP server
//!
//! Exposes Prometheus metrics and the dispatcher's health and backend
//! listings over HTTP.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_video_orchestrator::{metrics_server, BackendRegistry, Dispatcher};
//!
//! #[tokio::main]
//! async fn main() {
//!     let dispatcher = Arc::new(Dispatcher::new(Arc::new(BackendRegistry::new())));
//!     let handle = tokio::spawn(metrics_server::start_server("0.0.0.0:9090", dispatcher));
//!
//!     // Your application code...
//!
//!     handle.abort();
//! }
//! ```
//!
//! ## Endpoints
//!
//! - `GET /metrics` - Prometheus metrics in text format
//! - `GET /health` - Health snapshot as JSON (503 when every backend is down)
//! - `GET /backends` - Registered backends with live state as JSON

use crate::dispatcher::{Dispatcher, OverallHealth};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the router without binding a socket.
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/backends", get(backends_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Start the metrics HTTP server.
///
/// Returns a future that runs until the listener fails.
///
/// # Errors
///
/// Returns an error if `addr` does not parse or the socket cannot be bound.
pub async fn start_server(
    addr: &str,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = addr.parse()?;

    info!(%addr, "starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("metrics server ready at http://{}/metrics", addr);

    axum::serve(listener, router(dispatcher)).await?;

    Ok(())
}

async fn metrics_handler() -> Response {
    let metrics = crate::metrics::gather_metrics();

    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response()
}

async fn health_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    let snapshot = dispatcher.health_snapshot();
    let status = match snapshot.overall {
        OverallHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        OverallHealth::Healthy | OverallHealth::Degraded => StatusCode::OK,
    };

    (
        status,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&snapshot)
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

async fn backends_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "application/json")],
        serde_json::to_string_pretty(&dispatcher.list_backends())
            .unwrap_or_else(|_| r#"{"error":"serialization failed"}"#.to_string()),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::registry::{BackendRegistry, Priority};

    fn dispatcher(healthy: bool) -> Arc<Dispatcher> {
        let mut registry = BackendRegistry::new();
        registry
            .register("a", Priority::Primary, true, 1, Arc::new(MockBackend::new("a")))
            .expect("test: register");
        registry.get(0).expect("test: slot").set_healthy(healthy);
        Arc::new(Dispatcher::new(Arc::new(registry)))
    }

    #[tokio::test]
    async fn test_health_endpoint_ok_when_backend_healthy() {
        let response = health_handler(State(dispatcher(true))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_endpoint_503_when_all_down() {
        let response = health_handler(State(dispatcher(false))).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_backends_endpoint_ok() {
        let response = backends_handler(State(dispatcher(true))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
