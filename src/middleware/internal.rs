//! Downstream trust layer, for services that sit behind the gateway.
//!
//! A request is accepted only if it carries the shared `X-Internal-Token`; the identity
//! headers it carries are then turned into a request-scoped [`Principal`] that handlers
//! receive through [`CurrentUser`].

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{FromRequestParts, State},
    http::{HeaderMap, Request, request::Parts},
    middleware::{self, Next},
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::AppError;
use crate::services::identity::{Principal, X_INTERNAL_TOKEN};

#[derive(Clone)]
pub struct InternalTrust {
    secret: Arc<[u8]>,
}

impl std::fmt::Debug for InternalTrust {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InternalTrust").finish_non_exhaustive()
    }
}

impl InternalTrust {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Constant-time check of `X-Internal-Token`. An empty configured secret trusts nothing.
    pub fn verify(&self, headers: &HeaderMap) -> bool {
        if self.secret.is_empty() {
            return false;
        }
        match headers.get(X_INTERNAL_TOKEN) {
            Some(value) => bool::from(value.as_bytes().ct_eq(&self.secret)),
            None => false,
        }
    }
}

/// Require gateway transit on every route of `router`.
pub fn apply<S>(router: Router<S>, trust: InternalTrust) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(trust, trust_middleware))
}

async fn trust_middleware(
    State(trust): State<InternalTrust>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    if !trust.verify(req.headers()) {
        warn!(path = %req.uri().path(), "request did not transit the gateway");
        return Err(AppError::Forbidden);
    }

    if let Some(principal) = Principal::from_headers(req.headers()) {
        req.extensions_mut().insert(principal);
    }
    Ok(next.run(req).await)
}

/// The caller placed in request extensions by the trust layer (or the admission layer).
/// Rejects with 401 when the request carries no identity.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Principal);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .map(CurrentUser)
            .ok_or(AppError::NoToken)
    }
}
