use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::repos::user_repo::{UserDirectory, UserRecord};
use crate::services::auth::codec::{
    CodecError, TokenClaims, TokenCodec, TokenType, fingerprint, short_fingerprint,
};
use crate::services::auth::password::verify_password;
use crate::services::session::{SessionStore, bounded};

/// Service-level return type to keep handlers thin.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

/// Orchestrates login, issuance, refresh rotation and logout.
///
/// - TokenCodec signs and verifies.
/// - SessionStore holds the authoritative session fingerprint and the revocation ledger.
/// - UserDirectory resolves accounts at login and again at refresh.
#[derive(Clone)]
pub struct TokenService {
    codec: TokenCodec,
    sessions: SessionStore,
    users: Arc<dyn UserDirectory>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("codec", &self.codec)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    pub fn new(codec: TokenCodec, sessions: SessionStore, users: Arc<dyn UserDirectory>) -> Self {
        Self {
            codec,
            sessions,
            users,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Verify credentials and issue a fresh pair.
    ///
    /// Unknown user and wrong password are indistinguishable to the caller.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedTokenPair, AppError> {
        let user = self.lookup_user(username).await?;

        let verified = match user {
            Some(user) => {
                let stored = user.password_hash.clone();
                let password = password.to_string();
                // CPU-bound hash check; run it off the async workers.
                let ok = tokio::task::spawn_blocking(move || verify_password(&stored, &password))
                    .await
                    .map_err(|e| {
                        error!(error = %e, "password verification task failed");
                        AppError::Internal
                    })?;
                ok.then_some(user)
            }
            None => None,
        };
        let Some(user) = verified else {
            debug!(username = %username, "login rejected: bad credentials");
            return Err(AppError::InvalidCredentials);
        };
        if !user.is_enabled() {
            info!(user_id = %user.id, "login rejected: account disabled");
            return Err(AppError::AccountDisabled);
        }

        let pair = self
            .issue(&user.id, &user.username, &user.roles, &user.permissions)
            .await?;
        info!(user_id = %user.id, "login succeeded");
        Ok(pair)
    }

    /// Mint an access/refresh pair and make the access token the user's only session.
    pub async fn issue(
        &self,
        user_id: &str,
        username: &str,
        roles: &[String],
        permissions: &[String],
    ) -> Result<IssuedTokenPair, AppError> {
        let now = chrono::Utc::now().timestamp();

        let access_claims = self.codec.access_claims(user_id, username, roles, now);
        let refresh_claims = self.codec.refresh_claims(user_id, username, now);
        let access_token = self.sign(&access_claims)?;
        let refresh_token = self.sign(&refresh_claims)?;

        let ttl = access_claims
            .remaining_ttl(now)
            .ok_or(AppError::Internal)?;
        let fp = fingerprint(&access_token);

        // Permissions first: a session that is visible must already have its snapshot.
        self.sessions.put_permissions(user_id, permissions, ttl).await?;
        self.sessions.put_current(user_id, &fp, ttl).await?;

        debug!(user_id = %user_id, fingerprint = %short_fingerprint(&fp), "session issued");

        Ok(IssuedTokenPair {
            access_token,
            refresh_token,
            expires_in: self.codec.access_ttl_seconds(),
        })
    }

    /// Exchange a refresh token for a new pair. Each refresh token works exactly once.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedTokenPair, AppError> {
        let claims = self.codec.decode(refresh_token).map_err(token_error)?;
        if claims.token_type != TokenType::Refresh {
            debug!(user_id = %claims.user_id, "refresh rejected: not a refresh token");
            return Err(AppError::TokenInvalid);
        }

        let now = chrono::Utc::now().timestamp();
        let Some(ttl) = claims.remaining_ttl(now) else {
            return Err(AppError::TokenExpired);
        };

        // The conditional write is the reuse check: a second presenter loses here.
        let fp = fingerprint(refresh_token);
        if !self.sessions.revoke(&fp, ttl).await? {
            warn!(
                user_id = %claims.user_id,
                fingerprint = %short_fingerprint(&fp),
                "refresh token reuse detected"
            );
            return Err(AppError::TokenReused);
        }

        // Past this point the presented token is spent; a failure means signing in again.
        let rotated = match self.current_account(&claims).await {
            Ok(user) => self
                .issue(&user.id, &user.username, &user.roles, &user.permissions)
                .await
                .map(|pair| (user, pair)),
            Err(e) => Err(e),
        };
        match rotated {
            Ok((user, pair)) => {
                info!(user_id = %user.id, "token pair rotated");
                Ok(pair)
            }
            Err(e) => {
                if e == AppError::StoreUnavailable {
                    error!(
                        user_id = %claims.user_id,
                        fingerprint = %short_fingerprint(&fp),
                        "refresh token consumed but rotation failed; a retry will be reported as reuse"
                    );
                }
                Err(e)
            }
        }
    }

    /// Logout: revoke an access token for the rest of its lifetime.
    ///
    /// Expired or unreadable tokens are a no-op; there is nothing left to protect.
    pub async fn revoke(&self, access_token: &str) -> Result<(), AppError> {
        self.revoke_token(access_token, TokenType::Access).await
    }

    /// Revoke a refresh token presented at logout.
    pub async fn revoke_refresh(&self, refresh_token: &str) -> Result<(), AppError> {
        self.revoke_token(refresh_token, TokenType::Refresh).await
    }

    async fn revoke_token(&self, token: &str, expected: TokenType) -> Result<(), AppError> {
        let claims = match self.codec.decode(token) {
            Ok(c) if c.token_type == expected => c,
            Ok(_) | Err(_) => {
                debug!(?expected, "revoke skipped: token unusable");
                return Ok(());
            }
        };

        let now = chrono::Utc::now().timestamp();
        let Some(ttl) = claims.remaining_ttl(now) else {
            return Ok(());
        };

        let fp = fingerprint(token);
        self.sessions.revoke(&fp, ttl).await?;
        info!(
            user_id = %claims.user_id,
            ?expected,
            fingerprint = %short_fingerprint(&fp),
            "token revoked"
        );
        Ok(())
    }

    /// Re-read the account behind a refresh token so the new pair carries current grants.
    async fn current_account(&self, claims: &TokenClaims) -> Result<UserRecord, AppError> {
        let user = self.lookup_user(&claims.username).await?;
        let Some(user) = user.filter(|u| u.id == claims.user_id) else {
            warn!(user_id = %claims.user_id, "refresh rejected: account no longer resolves");
            return Err(AppError::TokenInvalid);
        };
        if !user.is_enabled() {
            info!(user_id = %user.id, "refresh rejected: account disabled");
            return Err(AppError::AccountDisabled);
        }
        Ok(user)
    }

    async fn lookup_user(&self, username: &str) -> Result<Option<UserRecord>, AppError> {
        bounded(
            "user.get",
            self.sessions.timeout(),
            self.users.find_by_username(username),
        )
        .await
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, AppError> {
        self.codec.encode(claims).map_err(|e| {
            error!(error = %e, "failed to sign token");
            AppError::Internal
        })
    }
}

/// Map verification failures into the rejection taxonomy.
pub fn token_error(e: CodecError) -> AppError {
    match e {
        CodecError::Expired => AppError::TokenExpired,
        _ => AppError::TokenInvalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repos::ValkeyUserRepo;
    use crate::repos::{RepoError, RepoResult};
    use crate::services::cache::{CacheError, MemoryCache};
    use async_trait::async_trait;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    /// bcrypt at the minimum cost, hashed once for the whole module.
    fn pw_hash() -> &'static str {
        static HASH: OnceLock<String> = OnceLock::new();
        HASH.get_or_init(|| bcrypt::hash("pw", 4).unwrap())
    }

    fn seed_user(cache: &MemoryCache, id: &str, username: &str, status: i32, roles: &[&str]) {
        let record = serde_json::json!({
            "id": id,
            "username": username,
            "passwordHash": pw_hash(),
            "status": status,
            "roles": roles,
            "permissions": ["user:read"],
        });
        cache.put_string(&format!("user:auth:{username}"), &record.to_string());
    }

    fn service() -> (TokenService, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        seed_user(&cache, "7", "alice", 0, &["USER"]);
        seed_user(&cache, "8", "mallory", 1, &["USER"]);

        let codec = TokenCodec::new(SECRET, 7200, 604_800, 0).unwrap();
        let sessions = SessionStore::new(cache.clone(), Duration::from_millis(500));
        let users = Arc::new(ValkeyUserRepo::new(cache.clone()));
        (TokenService::new(codec, sessions, users), cache)
    }

    #[tokio::test]
    async fn test_login_records_session_and_permissions() {
        let (svc, _) = service();
        let pair = svc.login("alice", "pw").await.unwrap();
        assert_eq!(pair.expires_in, 7200);

        let current = svc.sessions().current("7").await.unwrap();
        assert_eq!(current, Some(fingerprint(&pair.access_token)));
        assert_eq!(
            svc.sessions().permissions("7").await.unwrap(),
            vec!["user:read"]
        );

        let claims = svc.codec().decode(&pair.access_token).unwrap();
        assert_eq!(claims.roles, Some(vec!["USER".to_string()]));
    }

    #[tokio::test]
    async fn test_login_failures() {
        let (svc, _) = service();
        assert_eq!(
            svc.login("alice", "wrong").await.unwrap_err(),
            AppError::InvalidCredentials
        );
        assert_eq!(
            svc.login("nobody", "pw").await.unwrap_err(),
            AppError::InvalidCredentials
        );
        assert_eq!(
            svc.login("mallory", "pw").await.unwrap_err(),
            AppError::AccountDisabled
        );
    }

    #[tokio::test]
    async fn test_refresh_token_works_exactly_once() {
        let (svc, _) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        let rotated = svc.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, pair.refresh_token);
        assert_eq!(
            svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::TokenReused
        );

        // The rotated token is still good.
        svc.refresh(&rotated.refresh_token).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_refresh_has_one_winner() {
        let (svc, _) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let svc = svc.clone();
                let token = pair.refresh_token.clone();
                tokio::spawn(async move { svc.refresh(&token).await })
            })
            .collect();

        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(e) => assert_eq!(e, AppError::TokenReused),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_access_tokens_and_garbage() {
        let (svc, _) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        assert_eq!(
            svc.refresh(&pair.access_token).await.unwrap_err(),
            AppError::TokenInvalid
        );
        assert_eq!(
            svc.refresh("garbage").await.unwrap_err(),
            AppError::TokenInvalid
        );
    }

    #[tokio::test]
    async fn test_refresh_picks_up_role_changes_and_disabled_accounts() {
        let (svc, cache) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        seed_user(&cache, "7", "alice", 0, &["USER", "AUDITOR"]);
        let rotated = svc.refresh(&pair.refresh_token).await.unwrap();
        let claims = svc.codec().decode(&rotated.access_token).unwrap();
        assert_eq!(
            claims.roles,
            Some(vec!["USER".to_string(), "AUDITOR".to_string()])
        );

        seed_user(&cache, "7", "alice", 1, &["USER"]);
        assert_eq!(
            svc.refresh(&rotated.refresh_token).await.unwrap_err(),
            AppError::AccountDisabled
        );
    }

    #[tokio::test]
    async fn test_refresh_rejects_when_account_id_changed() {
        let (svc, cache) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        seed_user(&cache, "99", "alice", 0, &["USER"]);
        assert_eq!(
            svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::TokenInvalid
        );
    }

    #[tokio::test]
    async fn test_logout_revokes_access_and_refresh() {
        let (svc, _) = service();
        let pair = svc.login("alice", "pw").await.unwrap();

        svc.revoke(&pair.access_token).await.unwrap();
        svc.revoke_refresh(&pair.refresh_token).await.unwrap();

        assert!(
            svc.sessions()
                .is_revoked(&fingerprint(&pair.access_token))
                .await
                .unwrap()
        );
        assert_eq!(
            svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::TokenReused
        );
    }

    #[tokio::test]
    async fn test_revoking_unusable_tokens_is_a_no_op() {
        let (svc, _) = service();
        svc.revoke("garbage").await.unwrap();

        let codec = svc.codec();
        let mut claims = codec.access_claims("7", "alice", &[], chrono::Utc::now().timestamp());
        claims.exp = chrono::Utc::now().timestamp() - 5;
        let expired = codec.encode(&claims).unwrap();
        svc.revoke(&expired).await.unwrap();

        assert!(
            !svc.sessions()
                .is_revoked(&fingerprint(&expired))
                .await
                .unwrap()
        );
    }

    /// Directory that can be switched off to simulate a store outage.
    struct SwitchableDirectory {
        inner: ValkeyUserRepo,
        down: AtomicBool,
    }

    #[async_trait]
    impl UserDirectory for SwitchableDirectory {
        async fn find_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>> {
            if self.down.load(Ordering::SeqCst) {
                return Err(RepoError::Store(CacheError::BackendConnection(
                    "connection refused".into(),
                )));
            }
            self.inner.find_by_username(username).await
        }
    }

    #[tokio::test]
    async fn test_refresh_during_outage_spends_the_token() {
        let cache = Arc::new(MemoryCache::new());
        seed_user(&cache, "7", "alice", 0, &["USER"]);
        let directory = Arc::new(SwitchableDirectory {
            inner: ValkeyUserRepo::new(cache.clone()),
            down: AtomicBool::new(false),
        });
        let codec = TokenCodec::new(SECRET, 7200, 604_800, 0).unwrap();
        let sessions = SessionStore::new(cache.clone(), Duration::from_millis(500));
        let svc = TokenService::new(codec, sessions, directory.clone());

        let pair = svc.login("alice", "pw").await.unwrap();
        directory.down.store(true, Ordering::SeqCst);
        assert_eq!(
            svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::StoreUnavailable
        );

        // Rotation is single-use even when it could not complete.
        directory.down.store(false, Ordering::SeqCst);
        assert_eq!(
            svc.refresh(&pair.refresh_token).await.unwrap_err(),
            AppError::TokenReused
        );
        svc.login("alice", "pw").await.unwrap();
    }
}
