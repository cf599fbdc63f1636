/*
 * Responsibility
 * - GET /health (liveness + loaded rule count)
 */
use axum::Json;
use axum::extract::State;

use crate::api::dto::{ApiResponse, HealthStatus};
use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthStatus>> {
    Json(ApiResponse::ok(HealthStatus {
        status: "ok",
        permission_rules: state.reloader.table().rule_count(),
    }))
}
