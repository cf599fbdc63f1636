/*
 * Responsibility
 * - The rejection taxonomy shared by the pipeline, token service and HTTP handlers
 * - IntoResponse: HTTP status + `{code, message, data: null}` body
 * - No internal identifiers or error sources ever reach the body
 */
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    pub data: Option<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    #[error("authentication required")]
    NoToken,

    #[error("invalid token")]
    TokenInvalid,

    #[error("token expired")]
    TokenExpired,

    #[error("refresh token has already been used")]
    TokenReused,

    #[error("session expired, please sign in again")]
    SessionExpired,

    #[error("account signed in from another location")]
    SessionSuperseded,

    #[error("access denied")]
    Forbidden,

    #[error("service temporarily unavailable")]
    StoreUnavailable,

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("account disabled")]
    AccountDisabled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no route for request")]
    NoRoute,

    #[error("upstream service unavailable")]
    UpstreamUnavailable,

    #[error("internal server error")]
    Internal,
}

impl AppError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NoToken
            | AppError::TokenInvalid
            | AppError::TokenExpired
            | AppError::TokenReused
            | AppError::SessionExpired
            | AppError::SessionSuperseded
            | AppError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            AppError::Forbidden | AppError::AccountDisabled => StatusCode::FORBIDDEN,
            AppError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NoRoute => StatusCode::NOT_FOUND,
            AppError::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code carried in the body. Generic failures reuse the HTTP status; token and
    /// account failures get their own codes so clients can tell "refresh" from "sign in".
    pub fn code(&self) -> u16 {
        match self {
            AppError::InvalidCredentials => 1002,
            AppError::AccountDisabled => 1003,
            AppError::TokenInvalid => 2001,
            AppError::TokenExpired => 2002,
            AppError::TokenReused => 2003,
            AppError::SessionExpired => 2004,
            AppError::SessionSuperseded => 2005,
            other => other.status().as_u16(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            data: None,
        };

        (self.status(), Json(body)).into_response()
    }
}
