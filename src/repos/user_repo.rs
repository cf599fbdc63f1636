/*
 * Responsibility
 * - Read-only access to account records owned by the user service
 * - `user:auth:<username>` holds one JSON record per account
 */
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::repos::error::{RepoError, RepoResult};
use crate::services::cache::CacheClient;

/// Account status value meaning "enabled"; anything else is disabled.
pub const STATUS_ENABLED: i32 = 0;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl UserRecord {
    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    async fn find_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>>;
}

#[derive(Clone)]
pub struct ValkeyUserRepo {
    cache: Arc<dyn CacheClient>,
}

impl ValkeyUserRepo {
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self { cache }
    }
}

fn user_key(username: &str) -> String {
    format!("user:auth:{username}")
}

#[async_trait]
impl UserDirectory for ValkeyUserRepo {
    async fn find_by_username(&self, username: &str) -> RepoResult<Option<UserRecord>> {
        let key = user_key(username);
        let Some(raw) = self.cache.get_string(&key).await? else {
            return Ok(None);
        };

        let record: UserRecord =
            serde_json::from_str(&raw).map_err(|e| RepoError::Malformed {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryCache;

    #[tokio::test]
    async fn test_reads_account_record() {
        let cache = Arc::new(MemoryCache::new());
        cache.put_string(
            "user:auth:alice",
            r#"{"id":"7","username":"alice","passwordHash":"$2b$04$abcdefghijklmnopqrstuu","status":0,
                "roles":["USER"],"permissions":["user:read"],"nickname":"ignored"}"#,
        );
        let repo = ValkeyUserRepo::new(cache);

        let user = repo.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(user.id, "7");
        assert!(user.is_enabled());
        assert_eq!(user.roles, vec!["USER"]);
        assert_eq!(user.permissions, vec!["user:read"]);

        assert!(repo.find_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_is_an_error() {
        let cache = Arc::new(MemoryCache::new());
        cache.put_string("user:auth:eve", "{not json");
        let repo = ValkeyUserRepo::new(cache);

        assert!(matches!(
            repo.find_by_username("eve").await,
            Err(RepoError::Malformed { .. })
        ));
    }
}
