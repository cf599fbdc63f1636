use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::services::cache::client::{CacheClient, CacheError, CacheResult, ttl_seconds};

/// Valkey/Redis-backend cache client.
///
/// Holds the raw `redis::Client` next to the multiplexed connection manager: commands go
/// through the manager, pub/sub needs a dedicated connection opened from the client.
#[derive(Clone)]
pub struct ValkeyClient {
    client: redis::Client,
    manager: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for ValkeyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The connection info may carry a password.
        f.debug_struct("ValkeyClient").finish_non_exhaustive()
    }
}

impl ValkeyClient {
    // Create a Valkey client from a URL like `redis://localhost:6379`
    pub async fn new(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::BackendConnection(e.to_string()))?;

        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::BackendConnection(e.to_string()))?;

        Ok(Self { client, manager })
    }

    /// Open a dedicated pub/sub connection already subscribed to `channel`.
    pub async fn subscribe(&self, channel: &str) -> Result<redis::aio::PubSub, CacheError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| CacheError::BackendConnection(e.to_string()))?;

        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| CacheError::BackendCommand(e.to_string()))?;

        Ok(pubsub)
    }
}

fn command_error(e: redis::RedisError) -> CacheError {
    CacheError::BackendCommand(e.to_string())
}

#[async_trait]
impl CacheClient for ValkeyClient {
    fn backend_name(&self) -> &'static str {
        "valkey"
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        // Use a clone of the connection manager
        let mut conn = self.manager.clone();

        let resp: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(resp)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();

        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CacheResult<bool> {
        // Redis/Valkey: `SET key value NX EX <seconds>`
        // returns:
        // - `OK` if set
        // - Nil if not set
        let mut conn = self.manager.clone();

        let resp: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(resp.is_some())
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.manager.clone();

        let n: u64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(n > 0)
    }

    async fn replace_set_with_ttl(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut conn = self.manager.clone();

        // MULTI/EXEC so readers never observe a half-written set.
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        if !members.is_empty() {
            pipe.cmd("SADD").arg(key).arg(members).ignore();
            pipe.cmd("EXPIRE").arg(key).arg(ttl_seconds(ttl)).ignore();
        }

        let _: () = pipe.query_async(&mut conn).await.map_err(command_error)?;

        Ok(())
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.manager.clone();

        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(members)
    }

    async fn hash_entries(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();

        let entries: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(entries)
    }
}
