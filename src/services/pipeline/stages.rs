use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::AppError;
use crate::services::auth::codec::short_fingerprint;
use crate::services::auth::{TokenCodec, TokenType, fingerprint, token_error};
use crate::services::identity::Principal;
use crate::services::permission::PermissionTable;
use crate::services::pipeline::{AdmissionState, Outcome, RequestCtx, Stage};
use crate::services::session::SessionStore;
use crate::services::whitelist::WhitelistMatcher;

pub const TOKEN_QUERY_PARAM: &str = "token";

/// Public paths skip everything else.
#[derive(Debug)]
pub struct WhitelistStage {
    whitelist: Arc<WhitelistMatcher>,
}

impl WhitelistStage {
    pub fn new(whitelist: Arc<WhitelistMatcher>) -> Self {
        Self { whitelist }
    }
}

#[async_trait]
impl Stage for WhitelistStage {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    async fn handle(&self, ctx: &mut RequestCtx<'_>) -> Result<Outcome, AppError> {
        if self.whitelist.is_whitelisted(ctx.path) {
            return Ok(Outcome::Forward);
        }
        Ok(Outcome::Continue)
    }
}

/// Extract and verify the access token.
#[derive(Debug)]
pub struct BearerStage {
    codec: TokenCodec,
}

impl BearerStage {
    pub fn new(codec: TokenCodec) -> Self {
        Self { codec }
    }
}

/// The credential of an `Authorization: Bearer <token>` header; the scheme is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("Bearer").then(|| token.trim())
        })
        .filter(|t| !t.is_empty())
}

/// Bearer header, falling back to `?token=<token>` for transports that cannot set headers.
pub fn extract_token(ctx: &RequestCtx<'_>) -> Option<String> {
    bearer_token(ctx.headers).map(str::to_string).or_else(|| {
        url::form_urlencoded::parse(ctx.query?.as_bytes())
            .find(|(k, _)| k == TOKEN_QUERY_PARAM)
            .map(|(_, v)| v.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

#[async_trait]
impl Stage for BearerStage {
    fn name(&self) -> &'static str {
        "bearer"
    }

    async fn handle(&self, ctx: &mut RequestCtx<'_>) -> Result<Outcome, AppError> {
        let token = extract_token(ctx).ok_or(AppError::NoToken)?;
        let claims = self.codec.decode(&token).map_err(token_error)?;
        if claims.token_type != TokenType::Access {
            return Err(AppError::TokenInvalid);
        }

        ctx.state = AdmissionState::TokenParsed {
            fingerprint: fingerprint(&token),
            claims,
        };
        Ok(Outcome::Continue)
    }
}

/// Confirm the token is the user's current session and not revoked.
#[derive(Debug)]
pub struct SessionStage {
    sessions: SessionStore,
}

impl SessionStage {
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Stage for SessionStage {
    fn name(&self) -> &'static str {
        "session"
    }

    async fn handle(&self, ctx: &mut RequestCtx<'_>) -> Result<Outcome, AppError> {
        let AdmissionState::TokenParsed {
            claims,
            fingerprint,
        } = &ctx.state
        else {
            error!("session stage reached without a parsed token");
            return Err(AppError::Internal);
        };

        let (current, revoked, permissions) = tokio::try_join!(
            self.sessions.current(&claims.user_id),
            self.sessions.is_revoked(fingerprint),
            self.sessions.permissions(&claims.user_id),
        )?;

        if revoked {
            return Err(AppError::TokenInvalid);
        }
        match current {
            None => return Err(AppError::SessionExpired),
            Some(current) if current != *fingerprint => {
                warn!(
                    user_id = %claims.user_id,
                    fingerprint = %short_fingerprint(fingerprint),
                    "superseded session presented"
                );
                return Err(AppError::SessionSuperseded);
            }
            Some(_) => {}
        }

        let principal = Principal {
            user_id: claims.user_id.clone(),
            username: claims.username.clone(),
            roles: claims.roles.iter().flatten().cloned().collect(),
            permissions: permissions.into_iter().collect::<BTreeSet<_>>(),
        };
        ctx.state = AdmissionState::SessionVerified(principal);
        Ok(Outcome::Continue)
    }
}

/// Role check against the permission table.
#[derive(Debug)]
pub struct PermissionStage {
    table: Arc<PermissionTable>,
}

impl PermissionStage {
    pub fn new(table: Arc<PermissionTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage for PermissionStage {
    fn name(&self) -> &'static str {
        "permission"
    }

    async fn handle(&self, ctx: &mut RequestCtx<'_>) -> Result<Outcome, AppError> {
        let AdmissionState::SessionVerified(principal) = &ctx.state else {
            error!("permission stage reached without a verified session");
            return Err(AppError::Internal);
        };

        if !self
            .table
            .is_allowed(&principal.roles, ctx.method.as_str(), ctx.path)
        {
            return Err(AppError::Forbidden);
        }

        ctx.state = AdmissionState::Authorized(principal.clone());
        Ok(Outcome::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::ApiRule;
    use crate::services::cache::{CacheClient, MemoryCache};
    use crate::services::pipeline::{Admission, AuthPipeline};
    use axum::http::{HeaderMap, HeaderValue, Method};
    use std::time::Duration;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct Fixture {
        pipeline: AuthPipeline,
        codec: TokenCodec,
        sessions: SessionStore,
    }

    fn fixture() -> Fixture {
        let cache: Arc<dyn CacheClient> = Arc::new(MemoryCache::new());
        let codec = TokenCodec::new(SECRET, 7200, 604_800, 0).unwrap();
        let sessions = SessionStore::new(cache, Duration::from_millis(500));
        let table = Arc::new(PermissionTable::new("ADMIN", 100, Duration::from_secs(60)));
        table.reload(vec![ApiRule::parse("GET:/api/user/**", "ADMIN,USER").unwrap()]);
        let whitelist = Arc::new(WhitelistMatcher::new(["/login", "/public/**"]).unwrap());

        Fixture {
            pipeline: AuthPipeline::standard(whitelist, codec.clone(), sessions.clone(), table),
            codec,
            sessions,
        }
    }

    impl Fixture {
        /// Mint an access token and make it the user's live session.
        async fn login(&self, user_id: &str, roles: &[&str]) -> String {
            let roles: Vec<String> = roles.iter().map(|r| r.to_string()).collect();
            let now = chrono::Utc::now().timestamp();
            let token = self
                .codec
                .encode(&self.codec.access_claims(user_id, "someone", &roles, now))
                .unwrap();
            let ttl = Duration::from_secs(60);
            self.sessions
                .put_current(user_id, &fingerprint(&token), ttl)
                .await
                .unwrap();
            self.sessions
                .put_permissions(user_id, &["user:read".to_string()], ttl)
                .await
                .unwrap();
            token
        }

        async fn admit(&self, method: Method, uri: &str, token: Option<&str>) -> Result<Admission, AppError> {
            let mut headers = HeaderMap::new();
            if let Some(t) = token {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {t}")).unwrap(),
                );
            }
            let (path, query) = match uri.split_once('?') {
                Some((p, q)) => (p, Some(q)),
                None => (uri, None),
            };
            let mut ctx = RequestCtx::new(&method, path, query, &headers);
            self.pipeline.admit(&mut ctx).await
        }
    }

    #[tokio::test]
    async fn test_whitelisted_paths_need_no_token_even_if_garbage() {
        let f = fixture();
        assert_eq!(f.admit(Method::POST, "/login", None).await, Ok(Admission::Public));
        assert_eq!(
            f.admit(Method::GET, "/public/a.css", Some("%%%garbage")).await,
            Ok(Admission::Public)
        );
    }

    #[tokio::test]
    async fn test_protected_paths_require_a_token() {
        let f = fixture();
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", None).await,
            Err(AppError::NoToken)
        );
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some("garbage")).await,
            Err(AppError::TokenInvalid)
        );
    }

    #[tokio::test]
    async fn test_authorized_request_carries_principal() {
        let f = fixture();
        let token = f.login("7", &["USER"]).await;

        let Ok(Admission::Authenticated(p)) =
            f.admit(Method::GET, "/api/user/1", Some(&token)).await
        else {
            panic!("expected authenticated admission");
        };
        assert_eq!(p.user_id, "7");
        assert!(p.has_role("USER"));
        assert!(p.has_permission("user:read"));
    }

    #[tokio::test]
    async fn test_query_parameter_fallback() {
        let f = fixture();
        let token = f.login("7", &["USER"]).await;

        let uri = format!("/api/user/1?x=1&token={token}");
        assert!(matches!(
            f.admit(Method::GET, &uri, None).await,
            Ok(Admission::Authenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_guest_is_forbidden_and_admin_bypasses_rules() {
        let f = fixture();
        let guest = f.login("8", &["GUEST"]).await;
        let admin = f.login("9", &["ADMIN"]).await;

        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&guest)).await,
            Err(AppError::Forbidden)
        );
        assert!(matches!(
            f.admit(Method::DELETE, "/api/unlisted", Some(&admin)).await,
            Ok(Admission::Authenticated(_))
        ));
    }

    #[tokio::test]
    async fn test_second_login_supersedes_first() {
        let f = fixture();
        let first = f.login("7", &["USER"]).await;
        let _second = f.login("7", &["USER"]).await;

        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&first)).await,
            Err(AppError::SessionSuperseded)
        );
    }

    #[tokio::test]
    async fn test_missing_session_and_revoked_token() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp();
        let orphan = f
            .codec
            .encode(&f.codec.access_claims("42", "ghost", &[], now))
            .unwrap();
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&orphan)).await,
            Err(AppError::SessionExpired)
        );

        let token = f.login("7", &["USER"]).await;
        f.sessions
            .revoke(&fingerprint(&token), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&token)).await,
            Err(AppError::TokenInvalid)
        );
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let f = fixture();
        let now = chrono::Utc::now().timestamp();
        let refresh = f
            .codec
            .encode(&f.codec.refresh_claims("7", "alice", now))
            .unwrap();
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&refresh)).await,
            Err(AppError::TokenInvalid)
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_reported() {
        let f = fixture();
        let mut claims = f.codec.access_claims("7", "alice", &[], 0);
        claims.exp = chrono::Utc::now().timestamp() - 30;
        let token = f.codec.encode(&claims).unwrap();
        assert_eq!(
            f.admit(Method::GET, "/api/user/1", Some(&token)).await,
            Err(AppError::TokenExpired)
        );
    }

    #[tokio::test]
    async fn test_pipeline_without_authorization_fails_closed() {
        let pipeline = AuthPipeline::new(vec![]);
        let headers = HeaderMap::new();
        let method = Method::GET;
        let mut ctx = RequestCtx::new(&method, "/api/x", None, &headers);
        assert_eq!(pipeline.admit(&mut ctx).await, Err(AppError::Internal));
    }

    #[test]
    fn test_header_token_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  abc "));
        let method = Method::GET;
        let ctx = RequestCtx::new(&method, "/x", Some("token=zzz"), &headers);
        assert_eq!(extract_token(&ctx).as_deref(), Some("abc"));

        let empty = HeaderMap::new();
        let ctx = RequestCtx::new(&method, "/x", Some("token=a%2Bb"), &empty);
        assert_eq!(extract_token(&ctx).as_deref(), Some("a+b"));

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let ctx = RequestCtx::new(&method, "/x", None, &basic);
        assert_eq!(extract_token(&ctx), None);
    }
}
