/*
 * Responsibility
 * - POST /login, /refresh, /logout
 * - Thin: parse, call TokenService, wrap in the success envelope
 */
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use tracing::debug;

use crate::api::dto::{ApiResponse, LoginRequest, LogoutRequest, RefreshRequest};
use crate::error::AppError;
use crate::services::auth::IssuedTokenPair;
use crate::services::pipeline::stages::bearer_token;
use crate::state::AppState;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AppError::invalid_request(e.body_text()))
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<IssuedTokenPair>>, AppError> {
    let req = json_body(payload)?;
    if req.username.trim().is_empty() || req.password.is_empty() {
        return Err(AppError::invalid_request("username and password are required"));
    }

    let pair = state.tokens.login(req.username.trim(), &req.password).await?;
    Ok(Json(ApiResponse::ok(pair)))
}

pub async fn refresh(
    State(state): State<AppState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<IssuedTokenPair>>, AppError> {
    let req = json_body(payload)?;
    if req.refresh_token.trim().is_empty() {
        return Err(AppError::invalid_request("refreshToken is required"));
    }

    let pair = state.tokens.refresh(req.refresh_token.trim()).await?;
    Ok(Json(ApiResponse::ok(pair)))
}

/// Always answers 200 once the revocations are durable; unusable tokens are ignored.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ApiResponse<Option<()>>>, AppError> {
    if let Some(token) = bearer_token(&headers) {
        state.tokens.revoke(token).await?;
    } else {
        debug!("logout without bearer token");
    }

    let extra: LogoutRequest = if body.is_empty() {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };
    if let Some(refresh_token) = extra.refresh_token.as_deref().map(str::trim) {
        state.tokens.revoke_refresh(refresh_token).await?;
    }

    Ok(Json(ApiResponse::ok(None)))
}
