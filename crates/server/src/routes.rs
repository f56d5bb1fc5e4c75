//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/query", post(handlers::submit_query))
        .route("/v1/query/{query_id}", get(handlers::get_query_status))
        .route("/v1/query/{query_id}/manifest", get(handlers::get_manifest))
        .route("/v1/query/{query_id}/chunk/{part}", get(handlers::get_chunk))
        .route("/v1/query/{query_id}/stream", get(handlers::stream_query))
        // Health check (intentionally unauthenticated for load balancers/k8s probes)
        .route("/healthz", get(handlers::health_check));

    // Conditionally add metrics endpoint based on config. When enabled it
    // must be network-restricted to authorized scrapers.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
