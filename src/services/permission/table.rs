use arc_swap::ArcSwap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::repos::api_rule_repo::{ApiRule, MethodSet};
use crate::services::pattern::PathPattern;
use crate::services::permission::match_cache::{AllowedRoles, MatchResultCache};

#[derive(Debug)]
struct CompiledRule {
    methods: MethodSet,
    pattern: PathPattern,
    roles: Arc<BTreeSet<String>>,
}

/// One immutable generation of the rule table together with its match cache.
///
/// Swapping the snapshot swaps the cache with it, so a reload can never serve matches
/// computed against the previous rules.
#[derive(Debug)]
pub struct PermissionSnapshot {
    exact: HashMap<String, Vec<CompiledRule>>,
    wildcard: Vec<CompiledRule>,
    rule_count: usize,
    cache: MatchResultCache,
}

impl PermissionSnapshot {
    fn compile(rules: Vec<ApiRule>, cache: MatchResultCache) -> Self {
        let mut exact: HashMap<String, Vec<CompiledRule>> = HashMap::new();
        let mut wildcard = Vec::new();
        let mut rule_count = 0;

        for rule in rules {
            let pattern = match PathPattern::compile(&rule.pattern) {
                Ok(p) => p,
                Err(e) => {
                    warn!(pattern = %rule.pattern, error = %e, "skipping api rule with bad pattern");
                    continue;
                }
            };
            let compiled = CompiledRule {
                methods: rule.methods,
                roles: Arc::new(rule.roles),
                pattern,
            };
            rule_count += 1;
            if compiled.pattern.is_exact() {
                exact
                    .entry(compiled.pattern.as_str().to_string())
                    .or_default()
                    .push(compiled);
            } else {
                wildcard.push(compiled);
            }
        }

        Self {
            exact,
            wildcard,
            rule_count,
            cache,
        }
    }

    /// First matching rule wins; fixed paths are looked up before any pattern is tried.
    fn scan(&self, method: &str, path: &str) -> AllowedRoles {
        let exact = self
            .exact
            .get(path)
            .into_iter()
            .flatten()
            .find(|r| r.methods.allows(method));

        exact
            .or_else(|| {
                self.wildcard
                    .iter()
                    .find(|r| r.methods.allows(method) && r.pattern.matches(path))
            })
            .map(|r| r.roles.clone())
    }

    pub fn allowed_roles(&self, method: &str, path: &str) -> AllowedRoles {
        self.cache
            .get_or_resolve(MatchResultCache::key(method, path), || self.scan(method, path))
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    pub fn cached_matches(&self) -> usize {
        self.cache.len()
    }
}

/// Per-instance API permission table.
///
/// Readers load the current snapshot without locking; `reload` builds a complete new
/// snapshot and installs it with a single pointer swap.
#[derive(Debug)]
pub struct PermissionTable {
    current: ArcSwap<PermissionSnapshot>,
    admin_role: String,
    cache_capacity: usize,
    cache_ttl: Duration,
}

impl PermissionTable {
    pub fn new(admin_role: impl Into<String>, cache_capacity: usize, cache_ttl: Duration) -> Self {
        let empty = PermissionSnapshot::compile(
            Vec::new(),
            MatchResultCache::new(cache_capacity, cache_ttl),
        );
        Self {
            current: ArcSwap::from_pointee(empty),
            admin_role: admin_role.into(),
            cache_capacity,
            cache_ttl,
        }
    }

    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    /// Replace the whole table (and drop every cached match). Returns the installed rule count.
    pub fn reload(&self, rules: Vec<ApiRule>) -> usize {
        let snapshot = PermissionSnapshot::compile(
            rules,
            MatchResultCache::new(self.cache_capacity, self.cache_ttl),
        );
        let count = snapshot.rule_count();
        self.current.store(Arc::new(snapshot));
        info!(rules = count, "permission table reloaded");
        count
    }

    pub fn snapshot(&self) -> Arc<PermissionSnapshot> {
        self.current.load_full()
    }

    pub fn allowed_roles(&self, method: &str, path: &str) -> AllowedRoles {
        self.current.load().allowed_roles(method, path)
    }

    /// Admission decision for an authenticated caller.
    ///
    /// The admin role passes before any rule is consulted; everyone else needs a role in
    /// common with the first matching rule.
    pub fn is_allowed(&self, roles: &BTreeSet<String>, method: &str, path: &str) -> bool {
        if roles.contains(&self.admin_role) {
            return true;
        }
        if roles.is_empty() {
            return false;
        }
        match self.allowed_roles(method, path) {
            Some(allowed) => !allowed.is_disjoint(roles),
            None => false,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.current.load().rule_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(field: &str, roles: &str) -> ApiRule {
        ApiRule::parse(field, roles).unwrap()
    }

    fn roles(r: &[&str]) -> BTreeSet<String> {
        r.iter().map(|s| s.to_string()).collect()
    }

    fn table() -> PermissionTable {
        PermissionTable::new("ADMIN", 100, Duration::from_secs(60))
    }

    #[test]
    fn test_user_guest_and_admin_decisions() {
        let table = table();
        table.reload(vec![rule("GET:/api/user/**", "ADMIN,USER")]);

        assert!(table.is_allowed(&roles(&["USER"]), "GET", "/api/user/1"));
        assert!(!table.is_allowed(&roles(&["GUEST"]), "GET", "/api/user/1"));
        assert!(!table.is_allowed(&roles(&["USER"]), "DELETE", "/api/user/1"));

        // Admin passes even where no rule exists.
        assert!(table.is_allowed(&roles(&["ADMIN"]), "DELETE", "/api/anything"));
        assert!(table.is_allowed(&roles(&["GUEST", "ADMIN"]), "GET", "/x"));
    }

    #[test]
    fn test_unmatched_paths_and_roleless_callers_are_denied() {
        let table = table();
        table.reload(vec![rule("GET:/api/user/**", "USER")]);

        assert!(!table.is_allowed(&roles(&["USER"]), "GET", "/api/role/1"));
        assert!(!table.is_allowed(&BTreeSet::new(), "GET", "/api/user/1"));
    }

    #[test]
    fn test_first_match_wins_and_exact_beats_wildcard() {
        let table = table();
        table.reload(vec![
            rule("GET:/api/user/me", "GUEST"),
            rule("GET:/api/user/**", "USER"),
            rule("GET:/api/**", "AUDITOR"),
        ]);

        assert!(table.is_allowed(&roles(&["GUEST"]), "GET", "/api/user/me"));
        assert!(!table.is_allowed(&roles(&["USER"]), "GET", "/api/user/me"));
        assert!(table.is_allowed(&roles(&["USER"]), "GET", "/api/user/2"));
        assert!(!table.is_allowed(&roles(&["AUDITOR"]), "GET", "/api/user/2"));
        assert!(table.is_allowed(&roles(&["AUDITOR"]), "GET", "/api/log/2"));
    }

    #[test]
    fn test_exact_rule_for_other_method_falls_through_to_patterns() {
        let table = table();
        table.reload(vec![
            rule("POST:/api/user/me", "OWNER"),
            rule("*:/api/user/**", "USER"),
        ]);

        assert!(table.is_allowed(&roles(&["USER"]), "get", "/api/user/me"));
        assert!(table.is_allowed(&roles(&["OWNER"]), "POST", "/api/user/me"));
    }

    #[test]
    fn test_reload_replaces_rules_and_clears_cached_matches() {
        let table = table();
        table.reload(vec![rule("GET:/api/user/**", "USER")]);
        assert!(table.is_allowed(&roles(&["USER"]), "GET", "/api/user/1"));
        assert_eq!(table.snapshot().cached_matches(), 1);

        let old = table.snapshot();
        assert_eq!(table.reload(vec![rule("GET:/api/user/**", "STAFF")]), 1);

        assert_eq!(table.snapshot().cached_matches(), 0);
        assert!(!table.is_allowed(&roles(&["USER"]), "GET", "/api/user/1"));
        assert!(table.is_allowed(&roles(&["STAFF"]), "GET", "/api/user/1"));

        // A reader holding the old generation keeps a consistent view.
        assert!(old.allowed_roles("GET", "/api/user/1").unwrap().contains("USER"));
    }
}
