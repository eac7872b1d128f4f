//! HTTP server setup

use std::future::Future;
use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::AgentError;
use crate::server::allowlist::allowlist_middleware;
use crate::server::handlers::{callback_handler, cancel_handler, health_handler, update_handler};
use crate::server::state::ServerState;

/// Bind and serve the intake API until the shutdown signal resolves.
pub async fn serve(
    addr: &str,
    state: ServerState,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    let guarded = Router::new()
        .route("/update", post(update_handler))
        .route("/callback", post(callback_handler))
        .route("/api/task/cancel", post(cancel_handler))
        .layer(middleware::from_fn_with_state(
            state.allowlist.clone(),
            allowlist_middleware,
        ));

    let app = Router::new()
        .merge(guarded)
        // liveness stays reachable without allow-list membership
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!("starting HTTP server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::ConfigError(format!("failed to bind {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .map_err(|e| AgentError::Internal(format!("server error: {}", e)))
}
