//! Host policy (component F)
//!
//! An allow-list of domain patterns. Matching: exact equality, then
//! wildcard match where pattern `*.s` matches any host `h` with `h`
//! strictly longer than `.s` and `h` ending in `.s`. An empty allow-list
//! allows every host. Updates are atomic: installing a new list is one
//! pointer write under an exclusive lock.

use std::sync::Arc;

use parking_lot::RwLock;

/// A single allow-list entry.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Wildcard { suffix: String },
}

impl Pattern {
    fn parse(raw: &str) -> Self {
        match raw.strip_prefix("*.") {
            Some(suffix) => Pattern::Wildcard {
                suffix: suffix.to_string(),
            },
            None => Pattern::Exact(raw.to_string()),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            Pattern::Exact(exact) => host == exact,
            Pattern::Wildcard { suffix } => {
                let dotted_suffix = format!(".{suffix}");
                host.len() > dotted_suffix.len() && host.ends_with(&dotted_suffix)
            }
        }
    }
}

/// Whether a host passed or failed the policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Ok,
    Rejected,
}

impl PolicyDecision {
    pub fn is_ok(self) -> bool {
        matches!(self, PolicyDecision::Ok)
    }
}

/// The host allow-list, swappable atomically under an exclusive lock.
pub struct HostPolicy {
    patterns: RwLock<Arc<Vec<Pattern>>>,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self::new(&[] as &[&str])
    }
}

impl HostPolicy {
    /// Builds a policy from a list of exact or wildcard patterns. An
    /// empty list allows every host.
    pub fn new<S: AsRef<str>>(domains: &[S]) -> Self {
        let patterns = domains.iter().map(|d| Pattern::parse(d.as_ref())).collect();
        Self {
            patterns: RwLock::new(Arc::new(patterns)),
        }
    }

    /// Atomically replaces the allow-list.
    pub fn update<S: AsRef<str>>(&self, domains: &[S]) {
        let patterns = domains.iter().map(|d| Pattern::parse(d.as_ref())).collect();
        *self.patterns.write() = Arc::new(patterns);
    }

    /// Checks `host` against the current allow-list.
    pub fn check(&self, host: &str) -> PolicyDecision {
        let patterns = self.patterns.read().clone();
        if patterns.is_empty() || patterns.iter().any(|p| p.matches(host)) {
            PolicyDecision::Ok
        } else {
            PolicyDecision::Rejected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allow_list_allows_everything() {
        let policy = HostPolicy::default();
        assert!(policy.check("anything.example.com").is_ok());
    }

    #[test]
    fn exact_match() {
        let policy = HostPolicy::new(&["example.com"]);
        assert!(policy.check("example.com").is_ok());
        assert_eq!(policy.check("other.com"), PolicyDecision::Rejected);
    }

    #[test]
    fn wildcard_accepts_strict_subdomains() {
        let policy = HostPolicy::new(&["*.example.com"]);
        assert!(policy.check("a.example.com").is_ok());
        assert!(policy.check("a.b.example.com").is_ok());
        assert_eq!(policy.check("example.com"), PolicyDecision::Rejected);
        assert_eq!(policy.check("notexample.com"), PolicyDecision::Rejected);
    }

    #[test]
    fn wildcard_does_not_match_lookalike_suffix() {
        let policy = HostPolicy::new(&["*.api.example.com"]);
        assert!(policy.check("v1.api.example.com").is_ok());
        assert_eq!(policy.check("api.example.com"), PolicyDecision::Rejected);
    }

    #[test]
    fn update_is_visible_immediately() {
        let policy = HostPolicy::new(&["a.com"]);
        assert_eq!(policy.check("b.com"), PolicyDecision::Rejected);
        policy.update(&["b.com"]);
        assert!(policy.check("b.com").is_ok());
        assert_eq!(policy.check("a.com"), PolicyDecision::Rejected);
    }
}
