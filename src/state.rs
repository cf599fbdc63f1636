/*
 * Responsibility
 * - Shared context attached to the Router (AppState)
 * - Cheap to Clone (everything inside is Arc or Arc-backed)
 */
use axum::http::HeaderValue;
use std::sync::Arc;

use crate::services::auth::TokenService;
use crate::services::permission::PermissionReloader;
use crate::services::pipeline::AuthPipeline;
use crate::services::proxy::UpstreamProxy;

#[derive(Clone, Debug)]
pub struct AppState {
    pub tokens: Arc<TokenService>,
    pub pipeline: AuthPipeline,
    pub proxy: Arc<UpstreamProxy>,
    pub reloader: Arc<PermissionReloader>,
    /// Value of `X-Internal-Token` attached to every forwarded request.
    pub internal_secret: HeaderValue,
}

impl AppState {
    pub fn new(
        tokens: Arc<TokenService>,
        pipeline: AuthPipeline,
        proxy: Arc<UpstreamProxy>,
        reloader: Arc<PermissionReloader>,
        internal_secret: HeaderValue,
    ) -> Self {
        Self {
            tokens,
            pipeline,
            proxy,
            reloader,
            internal_secret,
        }
    }
}
