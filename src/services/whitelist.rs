use std::collections::HashSet;

use crate::services::pattern::PathPattern;

/// Public paths that bypass authentication.
///
/// Fixed paths go into a hash set; only entries with wildcards are compiled, and those are
/// consulted only when the set misses.
#[derive(Debug, Clone, Default)]
pub struct WhitelistMatcher {
    fixed: HashSet<String>,
    patterns: Vec<PathPattern>,
}

impl WhitelistMatcher {
    pub fn new<I, S>(entries: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match PathPattern::compile(entry)? {
                PathPattern::Exact(path) => {
                    matcher.fixed.insert(path);
                }
                wildcard => matcher.patterns.push(wildcard),
            }
        }
        Ok(matcher)
    }

    pub fn is_whitelisted(&self, path: &str) -> bool {
        if self.fixed.contains(path) {
            return true;
        }
        self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn len(&self) -> usize {
        self.fixed.len() + self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
