/*
 * Responsibility
 * - URL structure of the endpoints the gateway serves itself
 * - Everything else falls through to the admission layer and the upstream proxy
 */
use axum::{
    Router,
    routing::{get, post},
};

use crate::api::handlers::{
    auth::{login, logout, refresh},
    health::health,
};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/health", get(health))
}
