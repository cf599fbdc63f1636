//! Gateway ingress: run the admission pipeline, then hand the request on with
//! the identity headers downstream services trust.
//!
//! Rejections short-circuit with the `AppError` body; nothing reaches the upstream.

use axum::{
    Router,
    body::Body,
    extract::State,
    http::Request,
    middleware::{self, Next},
    response::Response,
};

use crate::error::AppError;
use crate::services::identity::attach_identity_headers;
use crate::services::pipeline::{Admission, RequestCtx};
use crate::services::request_path::ensure_canonical;
use crate::state::AppState;

/// Put every route of `router` behind the admission pipeline.
pub fn apply(router: Router<AppState>, state: AppState) -> Router<AppState> {
    router.layer(middleware::from_fn_with_state(state, admission_middleware))
}

async fn admission_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let (mut parts, body) = req.into_parts();
    ensure_canonical(parts.uri.path())?;

    let admission = {
        let mut ctx = RequestCtx::new(
            &parts.method,
            parts.uri.path(),
            parts.uri.query(),
            &parts.headers,
        );
        state.pipeline.admit(&mut ctx).await?
    };

    let principal = match admission {
        Admission::Public => None,
        Admission::Authenticated(principal) => Some(principal),
    };
    attach_identity_headers(
        &mut parts.headers,
        principal.as_ref(),
        &state.internal_secret,
    );
    if let Some(principal) = principal {
        parts.extensions.insert(principal);
    }

    Ok(next.run(Request::from_parts(parts, body)).await)
}

/// Fallback handler behind the admission layer.
pub async fn forward_upstream(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response, AppError> {
    state.proxy.forward(req).await
}
