use lru::LruCache;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Roles permitted by the first matching rule; `None` when no rule matched.
pub type AllowedRoles = Option<Arc<BTreeSet<String>>>;

#[derive(Debug, Clone)]
struct CachedMatch {
    roles: AllowedRoles,
    inserted_at: Instant,
}

/// Bounded, absolute-TTL memo of `METHOD:path` -> allowed roles.
///
/// Derived data only: every entry can be recomputed from the rule snapshot it belongs to.
/// Negative results are cached too, so unmatched paths do not rescan every rule.
#[derive(Debug)]
pub struct MatchResultCache {
    entries: Mutex<LruCache<String, CachedMatch>>,
    ttl: Duration,
}

impl MatchResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn key(method: &str, path: &str) -> String {
        format!("{}:{path}", method.to_ascii_uppercase())
    }

    pub fn get(&self, key: &str) -> Option<AllowedRoles> {
        let mut entries = self.entries.lock();
        let hit = entries.get(key)?;
        if hit.inserted_at.elapsed() < self.ttl {
            return Some(hit.roles.clone());
        }
        entries.pop(key);
        None
    }

    pub fn insert(&self, key: String, roles: AllowedRoles) {
        self.entries.lock().put(
            key,
            CachedMatch {
                roles,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Look up `key`, computing and memoizing on a miss. `resolve` runs outside the lock.
    pub fn get_or_resolve(&self, key: String, resolve: impl FnOnce() -> AllowedRoles) -> AllowedRoles {
        if let Some(hit) = self.get(&key) {
            return hit;
        }
        let roles = resolve();
        self.insert(key, roles.clone());
        roles
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles(r: &[&str]) -> AllowedRoles {
        Some(Arc::new(r.iter().map(|s| s.to_string()).collect()))
    }

    #[test]
    fn test_key_normalises_method() {
        assert_eq!(MatchResultCache::key("get", "/a"), "GET:/a");
    }

    #[test]
    fn test_resolver_runs_once_per_key() {
        let cache = MatchResultCache::new(10, Duration::from_secs(60));
        let mut calls = 0;
        for _ in 0..3 {
            let got = cache.get_or_resolve("GET:/a".into(), || {
                calls += 1;
                roles(&["USER"])
            });
            assert_eq!(got, roles(&["USER"]));
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_negative_results_are_memoized() {
        let cache = MatchResultCache::new(10, Duration::from_secs(60));
        cache.insert("GET:/none".into(), None);
        assert_eq!(cache.get("GET:/none"), Some(None));
        assert_eq!(cache.get("GET:/other"), None);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = MatchResultCache::new(2, Duration::from_secs(60));
        cache.insert("a".into(), None);
        cache.insert("b".into(), None);
        cache.get("a");
        cache.insert("c".into(), None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = MatchResultCache::new(10, Duration::from_secs(5));
        cache.insert("GET:/a".into(), roles(&["USER"]));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(cache.get("GET:/a").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("GET:/a").is_none());
        assert!(cache.is_empty());
    }
}
