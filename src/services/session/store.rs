use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::AppError;
use crate::services::cache::CacheClient;

/// Run one store call under `timeout`. Errors and timeouts both surface as
/// `StoreUnavailable`: callers on the request path must fail closed.
pub async fn bounded<T, E, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => {
            warn!(op, error = %e, "session store call failed");
            Err(AppError::StoreUnavailable)
        }
        Err(_) => {
            warn!(op, timeout_ms = timeout.as_millis() as u64, "session store call timed out");
            Err(AppError::StoreUnavailable)
        }
    }
}

/// Shared session state: current access-token fingerprint per user, the revocation ledger
/// and the per-session permission snapshot.
///
/// Keys:
/// - `session:token:<userId>`  -> fingerprint of the authoritative access token
/// - `session:perms:<userId>`  -> set of permission codes
/// - `revoked:<fingerprint>`   -> revocation marker
#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn CacheClient>,
    timeout: Duration,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("backend", &self.cache.backend_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SessionStore {
    pub fn new(cache: Arc<dyn CacheClient>, timeout: Duration) -> Self {
        Self { cache, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Make `fingerprint` the user's only valid access token. Overwrites any prior session.
    pub async fn put_current(
        &self,
        user_id: &str,
        fingerprint: &str,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let key = session_key(user_id);
        bounded(
            "session.put",
            self.timeout,
            self.cache.set_with_ttl(&key, fingerprint, ttl),
        )
        .await
    }

    pub async fn current(&self, user_id: &str) -> Result<Option<String>, AppError> {
        let key = session_key(user_id);
        bounded("session.get", self.timeout, self.cache.get_string(&key)).await
    }

    /// Add `fingerprint` to the revocation ledger.
    ///
    /// Single conditional write: returns `false` when the fingerprint was already revoked,
    /// so of two concurrent callers exactly one sees `true`.
    pub async fn revoke(&self, fingerprint: &str, ttl: Duration) -> Result<bool, AppError> {
        let key = revoked_key(fingerprint);
        bounded(
            "revocation.put",
            self.timeout,
            self.cache.set_if_absent_with_ttl(&key, "1", ttl),
        )
        .await
    }

    pub async fn is_revoked(&self, fingerprint: &str) -> Result<bool, AppError> {
        let key = revoked_key(fingerprint);
        bounded("revocation.get", self.timeout, self.cache.exists(&key)).await
    }

    pub async fn put_permissions(
        &self,
        user_id: &str,
        permissions: &[String],
        ttl: Duration,
    ) -> Result<(), AppError> {
        let key = perms_key(user_id);
        bounded(
            "perms.put",
            self.timeout,
            self.cache.replace_set_with_ttl(&key, permissions, ttl),
        )
        .await
    }

    pub async fn permissions(&self, user_id: &str) -> Result<Vec<String>, AppError> {
        let key = perms_key(user_id);
        bounded("perms.get", self.timeout, self.cache.set_members(&key)).await
    }
}

fn session_key(user_id: &str) -> String {
    format!("session:token:{user_id}")
}

fn perms_key(user_id: &str) -> String {
    format!("session:perms:{user_id}")
}

fn revoked_key(fingerprint: &str) -> String {
    format!("revoked:{fingerprint}")
}
