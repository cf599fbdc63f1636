//! Per-request admission pipeline.
//!
//! An explicit, ordered list of stages. Each stage sees the request context, may advance
//! its admission state, and either hands over to the next stage, short-circuits to
//! forwarding, or rejects.
//!
//! States: `Unauthenticated -> TokenParsed -> SessionVerified -> Authorized`.
pub mod stages;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::AppError;
use crate::services::auth::{TokenClaims, TokenCodec};
use crate::services::identity::Principal;
use crate::services::permission::PermissionTable;
use crate::services::session::SessionStore;
use crate::services::whitelist::WhitelistMatcher;

pub use stages::{BearerStage, PermissionStage, SessionStage, WhitelistStage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionState {
    Unauthenticated,
    TokenParsed {
        claims: TokenClaims,
        fingerprint: String,
    },
    SessionVerified(Principal),
    Authorized(Principal),
}

/// What the pipeline knows about one request.
#[derive(Debug)]
pub struct RequestCtx<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub state: AdmissionState,
}

impl<'a> RequestCtx<'a> {
    pub fn new(
        method: &'a Method,
        path: &'a str,
        query: Option<&'a str>,
        headers: &'a HeaderMap,
    ) -> Self {
        Self {
            method,
            path,
            query,
            headers,
            state: AdmissionState::Unauthenticated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Hand over to the next stage.
    Continue,
    /// Stop evaluating and forward the request.
    Forward,
}

#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut RequestCtx<'_>) -> Result<Outcome, AppError>;
}

/// Result of a successful admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Whitelisted; forwarded without identity.
    Public,
    Authenticated(Principal),
}

#[derive(Clone)]
pub struct AuthPipeline {
    stages: Arc<[Box<dyn Stage>]>,
}

impl std::fmt::Debug for AuthPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("AuthPipeline").field("stages", &names).finish()
    }
}

impl AuthPipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            stages: stages.into(),
        }
    }

    /// Whitelist -> bearer token -> session liveness -> permission.
    pub fn standard(
        whitelist: Arc<WhitelistMatcher>,
        codec: TokenCodec,
        sessions: SessionStore,
        table: Arc<PermissionTable>,
    ) -> Self {
        Self::new(vec![
            Box::new(WhitelistStage::new(whitelist)),
            Box::new(BearerStage::new(codec)),
            Box::new(SessionStage::new(sessions)),
            Box::new(PermissionStage::new(table)),
        ])
    }

    pub async fn admit(&self, ctx: &mut RequestCtx<'_>) -> Result<Admission, AppError> {
        for stage in self.stages.iter() {
            let outcome = stage.handle(ctx).await.inspect_err(|e| {
                debug!(
                    stage = stage.name(),
                    method = %ctx.method,
                    path = %ctx.path,
                    reason = %e,
                    "request rejected"
                );
            })?;

            if outcome == Outcome::Forward {
                return match &ctx.state {
                    AdmissionState::Unauthenticated => Ok(Admission::Public),
                    state => Self::settle(state),
                };
            }
        }
        Self::settle(&ctx.state)
    }

    /// Only an authorized request may leave the pipeline with an identity.
    fn settle(state: &AdmissionState) -> Result<Admission, AppError> {
        match state {
            AdmissionState::Authorized(principal) => Ok(Admission::Authenticated(principal.clone())),
            _ => {
                error!("pipeline finished without an authorization decision");
                Err(AppError::Internal)
            }
        }
    }
}
