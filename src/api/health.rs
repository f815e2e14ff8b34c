use crate::api::AppState;
use crate::health::HealthState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = match status.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (code, Json(status))
}
