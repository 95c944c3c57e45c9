//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID propagation
//! 2. Request/response tracing
//! 3. Timeout enforcement
//! 4. API key check (ingest only)
//! 5. Handler execution

use std::{future::Future, net::SocketAddr, time::Duration};

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    handlers::{self, ingest::MAX_PAYLOAD_SIZE},
    middleware::{inject_request_id, require_api_key},
    state::AppState,
};

/// Builds the router.
///
/// `POST /ingest` is only routed when `state` carries a push queue.
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
///
/// use conduit_api::{create_router, AppState};
/// use conduit_delivery::Dispatcher;
///
/// fn routes(dispatcher: Arc<Dispatcher>) -> axum::Router {
///     create_router(AppState::new(dispatcher), Duration::from_secs(30))
/// }
/// ```
pub fn create_router(state: AppState, request_timeout: Duration) -> Router {
    let health_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check));

    let operator_routes = Router::new()
        .route("/dlq/retry", post(handlers::retry_bulk))
        .route("/dlq/{id}/retry", post(handlers::retry_entry))
        .route("/dlq/{id}/abandon", post(handlers::abandon_entry))
        .route("/circuits", get(handlers::list_circuits))
        .route("/circuits/{rule_id}/reset", post(handlers::reset_circuit));

    let mut router = Router::new().merge(health_routes).merge(operator_routes);

    if state.ingest.is_some() {
        let ingest_routes = Router::new()
            .route("/ingest", post(handlers::ingest_event))
            .layer(DefaultBodyLimit::max(MAX_PAYLOAD_SIZE))
            .layer(middleware::from_fn_with_state(state.clone(), require_api_key));
        router = router.merge(ingest_routes);
    }

    router
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Serves `router` on `addr` until `shutdown` resolves, then drains
/// in-flight requests.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or serving fails.
pub async fn start_server<F>(router: Router, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router).with_graceful_shutdown(shutdown).await?;

    info!("HTTP server stopped");
    Ok(())
}

/// Waits for CTRL+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
