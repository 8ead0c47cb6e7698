//! In-memory certificate cache (component A)
//!
//! Read on every TLS handshake. Lookups never block on each other;
//! a store is visible to every lookup that happens after it returns.
//! Freshness is enforced by the orchestrator invalidating on renewal.
//! This tier has no TTL of its own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use x509_parser::prelude::{FromDer, X509Certificate};

/// A certificate as installed for the TLS handshake path: the signed
/// key pair plus enough parsed metadata to answer renewal questions
/// without re-parsing DER on every lookup.
#[derive(Clone)]
pub struct ParsedCertificate {
    /// The rustls-ready certified key (DER chain + signing key).
    pub certified_key: Arc<CertifiedKey>,
    /// Leaf `notAfter`, as Unix seconds.
    pub expires_at: i64,
    /// Leaf `notBefore`, as Unix seconds.
    pub issued_at: i64,
}

impl ParsedCertificate {
    /// Builds a `ParsedCertificate` from a DER chain (leaf first) and a
    /// loaded signing key.
    pub fn new(certified_key: Arc<CertifiedKey>) -> Result<Self, String> {
        let leaf = certified_key
            .cert
            .first()
            .ok_or_else(|| "certificate chain is empty".to_string())?;
        let (_, parsed) =
            X509Certificate::from_der(leaf).map_err(|e| format!("failed to parse leaf certificate: {e}"))?;
        let validity = parsed.validity();
        Ok(Self {
            certified_key,
            expires_at: validity.not_after.timestamp(),
            issued_at: validity.not_before.timestamp(),
        })
    }

    /// Whether fewer than `renewal_days` remain before expiry.
    pub fn needs_renewal(&self, renewal_days: u32) -> bool {
        let now = chrono::Utc::now().timestamp();
        self.expires_at - now < i64::from(renewal_days) * 24 * 60 * 60
    }

    /// Whether the leaf's `NotAfter` is still in the future. A
    /// certificate past this point must not be served even if it is
    /// the only one on hand.
    pub fn is_valid_now(&self) -> bool {
        self.expires_at > chrono::Utc::now().timestamp()
    }
}

/// The handshake-path in-memory cache tier.
///
/// Guarded by a single reader/writer lock: readers hold it only long
/// enough to clone an `Arc`, writers only around the map mutation.
#[derive(Default)]
pub struct CertCache {
    entries: RwLock<HashMap<String, Arc<ParsedCertificate>>>,
}

impl CertCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the cached certificate for `domain`, if any.
    pub fn lookup(&self, domain: &str) -> Option<Arc<ParsedCertificate>> {
        self.entries.read().get(domain).cloned()
    }

    /// Installs (or replaces) the certificate for `domain`.
    pub fn store(&self, domain: &str, certificate: Arc<ParsedCertificate>) {
        self.entries.write().insert(domain.to_string(), certificate);
    }

    /// Removes the cached entry for `domain`, if any.
    pub fn evict(&self, domain: &str) {
        self.entries.write().remove(domain);
    }

    /// Removes every cached entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
