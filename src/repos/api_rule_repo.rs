/*
 * Responsibility
 * - Read the authoritative API rule map (`perm:api:roles`, HASH)
 * - Field `<METHODS>:<pattern>` -> value `ROLE_A,ROLE_B`
 * - Return rules in a deterministic first-match order
 */
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

use crate::repos::error::RepoResult;
use crate::services::cache::CacheClient;
use crate::services::pattern;

pub const DEFAULT_RULES_KEY: &str = "perm:api:roles";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSet {
    Any,
    Only(BTreeSet<String>),
}

impl MethodSet {
    pub fn allows(&self, method: &str) -> bool {
        match self {
            MethodSet::Any => true,
            MethodSet::Only(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
        }
    }
}

/// One row of the rule map, before compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRule {
    pub methods: MethodSet,
    pub pattern: String,
    pub roles: BTreeSet<String>,
}

impl ApiRule {
    /// Parse a `<METHODS>:<pattern>` field and its comma-joined role list.
    pub fn parse(field: &str, roles: &str) -> Option<Self> {
        let (methods, pattern) = field.split_once(':')?;
        let methods = methods.trim();
        let pattern = pattern.trim();
        if !pattern.starts_with('/') {
            return None;
        }

        let methods = if methods == "*" {
            MethodSet::Any
        } else {
            let set: BTreeSet<String> = methods
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_ascii_uppercase)
                .collect();
            if set.is_empty() || !set.iter().all(|m| m.bytes().all(|b| b.is_ascii_alphabetic())) {
                return None;
            }
            MethodSet::Only(set)
        };

        let roles = roles
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();

        Some(Self {
            methods,
            pattern: pattern.to_string(),
            roles,
        })
    }
}

/// Exact patterns first, then more literal characters first, then lexicographic.
pub fn sort_rules(rules: &mut [ApiRule]) {
    rules.sort_by(|a, b| {
        let key = |r: &ApiRule| {
            (
                pattern::has_wildcard(&r.pattern),
                Reverse(pattern::literal_len(&r.pattern)),
            )
        };
        key(a)
            .cmp(&key(b))
            .then_with(|| a.pattern.cmp(&b.pattern))
            .then_with(|| format!("{:?}", a.methods).cmp(&format!("{:?}", b.methods)))
    });
}

#[async_trait]
pub trait RuleSource: Send + Sync + 'static {
    async fn load_rules(&self) -> RepoResult<Vec<ApiRule>>;
}

#[derive(Clone)]
pub struct ValkeyRuleRepo {
    cache: Arc<dyn CacheClient>,
    key: String,
}

impl ValkeyRuleRepo {
    pub fn new(cache: Arc<dyn CacheClient>) -> Self {
        Self {
            cache,
            key: DEFAULT_RULES_KEY.to_string(),
        }
    }
}

#[async_trait]
impl RuleSource for ValkeyRuleRepo {
    async fn load_rules(&self) -> RepoResult<Vec<ApiRule>> {
        let entries = self.cache.hash_entries(&self.key).await?;

        let mut rules: Vec<ApiRule> = entries
            .iter()
            .filter_map(|(field, roles)| {
                let rule = ApiRule::parse(field, roles);
                if rule.is_none() {
                    warn!(field = %field, "skipping unparsable api rule");
                }
                rule
            })
            .collect();

        sort_rules(&mut rules);
        Ok(rules)
    }
}
