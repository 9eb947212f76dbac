use axum::{extract::State, http::StatusCode, Json};
use crate::models::{ErrorResponse, HealthResponse, ReadyResponse};
use crate::AppState;
use tracing::{debug, warn};

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint. Not ready once the session registry has shut down.
pub async fn ready_check(
    State(app_state): State<AppState>,
) -> Result<Json<ReadyResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Readiness check requested");
    if app_state.registry.is_shut_down() {
        warn!("Readiness check failed: session registry is shut down");
        let status = StatusCode::SERVICE_UNAVAILABLE;
        return Err((status, Json(ErrorResponse::new(status, "Session registry is shut down"))));
    }
    Ok(Json(ReadyResponse {
        status: "ok".to_string(),
        message: "Service is ready".to_string(),
        sessions: app_state.registry.session_count().await,
    }))
}
