use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// API response for the liveness check
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// API response for the readiness check
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReadyResponse {
    pub status: String,
    pub message: String,
    /// Documents with a live session
    pub sessions: usize,
}
