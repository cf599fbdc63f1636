//! Cache client interface used by higher-level services (sessions, revocation, rule source).
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-layer errors (transport/command/serialization).
///
/// Note:
/// - We keep this independent from `AppError` so callers can decide how to fail
///   (fail-closed on the request path, log-and-retry for permission reloads).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    BackendConnection(String),
    #[error("cache command error: {0}")]
    BackendCommand(String),
    #[error("cache value error: {0}")]
    InvalidValue(String),
}

/// A small, string-based key-value interface over the shared store.
///
/// - Sessions need `SET EX` / `GET`.
/// - Revocation needs `SET NX EX` (the single conditional write that makes rotation race-free).
/// - Permission snapshots need set and hash reads.
///
/// Implementations must be cheap to share (`Arc<dyn CacheClient>`).
#[async_trait]
pub trait CacheClient: Send + Sync + 'static {
    // Returns the cache backend name (for logging).
    fn backend_name(&self) -> &'static str;

    // Get UTF-8 string value.
    async fn get_string(&self, key: &str) -> CacheResult<Option<String>>;

    // Set (overwrite) a value with TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    // Set value if the key does not exist, with TTL.
    //
    // Returns:
    // - `Ok(true)`  if the key was set (not seen before)
    // - `Ok(false)` if the key already exists
    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CacheResult<bool>;

    async fn exists(&self, key: &str) -> CacheResult<bool>;

    // Replace a set wholesale and give it a TTL. An empty member list just deletes the key.
    async fn replace_set_with_ttl(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>>;

    async fn hash_entries(&self, key: &str) -> CacheResult<HashMap<String, String>>;
}

/// Redis/Valkey `EX` takes whole seconds; sub-second remainders round up so a short but
/// positive TTL never becomes "no expiry".
pub fn ttl_seconds(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 { secs + 1 } else { secs }.max(1)
}
