//! Axum HTTP server for the REST API

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::controller::ControllerState;
use crate::{Error, Result};

use super::handlers;

fn router(state: Arc<ControllerState>) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/readyz", get(handlers::ready))
        .route("/api/v1/pipelines", get(handlers::list_pipelines))
        .route("/api/v1/telemetry", get(handlers::get_telemetry));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Run the REST API server until the process exits
pub async fn run_server(state: Arc<ControllerState>, addr: SocketAddr) -> Result<()> {
    let app = router(state);

    info!("REST API server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("Server error: {}", e)))?;

    Ok(())
}
