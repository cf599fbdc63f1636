use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::services::cache::client::{CacheClient, CacheError, CacheResult};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(BTreeSet<String>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Process-local cache backend.
///
/// Used for `VALKEY_URL=memory://` (single gateway instance, nothing shared) and as the
/// store double in tests. `set_if_absent_with_ttl` holds the shard lock for the whole
/// check-and-insert, giving the same atomicity as `SET NX`.
///
/// Expired keys are dropped when read, and by a sweep that runs on the write path every
/// `SWEEP_EVERY_WRITES` writes or after `SWEEP_INTERVAL`, so keys nobody reads again
/// (revocations, sessions of users who never return) do not pile up.
#[derive(Debug)]
pub struct MemoryCache {
    slots: DashMap<String, Slot>,
    writes: AtomicU64,
    last_sweep: Mutex<Instant>,
}

const SWEEP_EVERY_WRITES: u64 = 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            writes: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Number of stored keys, expired ones included until they are swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.is_live(now));
        before.saturating_sub(self.slots.len())
    }

    /// Must not be called while holding a map guard.
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let due = {
            let mut last = self.last_sweep.lock();
            let due = writes % SWEEP_EVERY_WRITES == 0 || now.duration_since(*last) >= SWEEP_INTERVAL;
            if due {
                *last = now;
            }
            due
        };
        if due {
            self.purge_expired();
        }
    }

    /// Seed a hash (the rule source and fixtures use this; the gateway never writes hashes).
    pub fn put_hash(&self, key: &str, entries: HashMap<String, String>) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Hash(entries),
                expires_at: None,
            },
        );
    }

    /// Seed a string without expiry.
    pub fn put_string(&self, key: &str, value: &str) {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: None,
            },
        );
    }

    fn live(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let slot = self.slots.get(key)?;
        if slot.is_live(now) {
            return Some(slot.value.clone());
        }
        drop(slot);
        self.slots.remove_if(key, |_, s| !s.is_live(now));
        None
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::InvalidValue(format!("wrong type for key {key}"))
}

#[async_trait]
impl CacheClient for MemoryCache {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Text(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.after_write();
        Ok(())
    }

    async fn set_if_absent_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> CacheResult<bool> {
        let now = Instant::now();
        let slot = Slot {
            value: Value::Text(value.to_string()),
            expires_at: Some(now + ttl),
        };

        let inserted = match self.slots.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    false
                } else {
                    occupied.insert(slot);
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                true
            }
        };
        if inserted {
            self.after_write();
        }
        Ok(inserted)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        Ok(self.live(key).is_some())
    }

    async fn replace_set_with_ttl(
        &self,
        key: &str,
        members: &[String],
        ttl: Duration,
    ) -> CacheResult<()> {
        if members.is_empty() {
            self.slots.remove(key);
            return Ok(());
        }
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Set(members.iter().cloned().collect()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        self.after_write();
        Ok(())
    }

    async fn set_members(&self, key: &str) -> CacheResult<Vec<String>> {
        match self.live(key) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.into_iter().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hash_entries(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        match self.live(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(entries)) => Ok(entries),
            Some(_) => Err(wrong_type(key)),
        }
    }
}
