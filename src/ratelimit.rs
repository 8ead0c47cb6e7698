//! Rate-limit ledger (component E)
//!
//! Per-domain "do-not-retry-before" timestamps, consulted by the
//! handshake entry point before any issuance attempt. The ACME issuer
//! bans aggressive clients for extended periods; this ledger lets the
//! handshake path fast-fail instead of hammering a rate-limited issuer.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::RwLock;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Per-domain earliest-retry-time ledger.
#[derive(Default)]
pub struct RateLimitLedger {
    entries: RwLock<HashMap<String, SystemTime>>,
}

impl RateLimitLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `domain` must not be retried before `retry_after`.
    pub fn record(&self, domain: &str, retry_after: SystemTime) {
        self.entries.write().insert(domain.to_string(), retry_after);
    }

    /// Whether `domain` is currently rate-limited.
    pub fn is_limited(&self, domain: &str) -> bool {
        match self.entries.read().get(domain) {
            Some(expiry) => *expiry > SystemTime::now(),
            None => false,
        }
    }

    /// The recorded expiry for `domain`, if any entry exists (expired or
    /// not).
    pub fn get_expiry(&self, domain: &str) -> Option<SystemTime> {
        self.entries.read().get(domain).copied()
    }

    /// Removes any ledger entry for `domain`.
    pub fn clear(&self, domain: &str) {
        self.entries.write().remove(domain);
    }

}

/// Resolves a rate-limit expiry from an optional `Retry-After`-style
/// hint, falling back to the 1-hour default when the hint is absent or
/// unparseable. Called from the ACME client's error classification path
/// (`src/acme/mod.rs`) when building `Error::RateLimited`.
pub fn resolve_retry_after(hint: Option<&str>) -> SystemTime {
    hint.and_then(parse_retry_after)
        .unwrap_or_else(|| SystemTime::now() + DEFAULT_RETRY_AFTER)
}

/// Parses a `Retry-After`-style hint. Accepts either the ACME problem
/// document pattern `retry after YYYY-MM-DD HH:MM:SS UTC` or a plain
/// integer number of seconds (as the HTTP `Retry-After` header allows).
/// Returns `None` if nothing recognizable is found. Callers should fall
/// back to the 1-hour default in that case.
pub fn parse_retry_after(hint: &str) -> Option<SystemTime> {
    if let Some(captured) = hint.trim().strip_prefix("retry after ") {
        let captured = captured.trim().trim_end_matches(" UTC").trim();
        if let Ok(naive) = NaiveDateTime::parse_from_str(captured, "%Y-%m-%d %H:%M:%S") {
            let dt: DateTime<Utc> = DateTime::from_naive_utc_and_offset(naive, Utc);
            return Some(SystemTime::from(dt));
        }
    }

    if let Ok(seconds) = hint.trim().parse::<u64>() {
        return Some(SystemTime::now() + Duration::from_secs(seconds));
    }

    None
}
