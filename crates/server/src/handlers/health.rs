//! Health check endpoint.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// GET /healthz - liveness and storage connectivity.
///
/// Unauthenticated by design so load balancers and probes can hit it.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.storage.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "backend": state.storage.backend_name(),
            })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "storage health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unavailable",
                    "backend": state.storage.backend_name(),
                    "error": e.to_string(),
                })),
            )
        }
    }
}
