//! Handshake entry point (component H)
//!
//! The single function the embedding TLS server calls from its
//! certificate-resolution hook. Ordered as spec.md's decision sequence
//! requires: TLS-ALPN-01 short-circuit first when a matching challenge
//! certificate is published (otherwise falls through to normal
//! resolution), then host policy, then rate limiting, then the cache,
//! then the store, then a bounded issuance attempt as the last resort.
//!
//! Grounded on `pingclair-tls/src/manager.rs`'s `TlsManager::resolve_cert`.

use std::sync::Arc;
use std::time::Duration;

use rustls::sign::CertifiedKey;

use crate::cache::{CertCache, ParsedCertificate};
use crate::challenge::ChallengeResponder;
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::policy::{HostPolicy, PolicyDecision};
use crate::ratelimit::RateLimitLedger;
use crate::store::CertificateStore;

/// Overall budget for a single handshake's certificate resolution,
/// including a possible synchronous issuance attempt.
pub const HANDSHAKE_BUDGET: Duration = Duration::from_secs(90);

/// The minimal information this crate needs out of a TLS `ClientHello`:
/// the requested server name and whether the client is attempting a
/// TLS-ALPN-01 validation handshake.
#[derive(Debug, Clone)]
pub struct ClientHelloInfo {
    pub server_name: String,
    pub is_acme_tls_alpn: bool,
}

/// Everything the handshake path needs, bundled so callers don't have
/// to thread five `Arc`s through their own server code.
pub struct HandshakeResolver {
    pub cache: Arc<CertCache>,
    pub store: Arc<dyn CertificateStore>,
    pub policy: Arc<HostPolicy>,
    pub ratelimit: Arc<RateLimitLedger>,
    pub responder: Arc<ChallengeResponder>,
    pub orchestrator: Arc<Orchestrator>,
    pub renewal_days: u32,
}

impl HandshakeResolver {
    /// Resolves the certificate to present for `hello`, issuing one on
    /// demand if none is cached, none is stored, or the stored one is
    /// due for renewal.
    pub async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>> {
        let result = tokio::time::timeout(HANDSHAKE_BUDGET, self.get_certificate_inner(hello))
            .await
            .map_err(|_| Error::Fatal(format!("certificate resolution for {} timed out", hello.server_name)))?;

        if let Err(err) = &result {
            if err.is_retryable() {
                tracing::warn!(domain = %hello.server_name, error = %err, "certificate resolution failed, retryable");
            } else {
                tracing::error!(domain = %hello.server_name, error = %err, "certificate resolution failed");
            }
        }
        result
    }

    async fn get_certificate_inner(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>> {
        let domain = hello.server_name.as_str();

        if hello.is_acme_tls_alpn {
            if let Some(challenge_cert) = self.responder.lookup_tls_alpn01(domain).await {
                return Ok(challenge_cert);
            }
            // No TLS-ALPN-01 challenge pending for this SNI name: fall
            // through to normal certificate selection rather than
            // failing the handshake outright.
        }

        if self.policy.check(domain) == PolicyDecision::Rejected {
            return Err(Error::HostNotAllowed(domain.to_string()));
        }

        if self.ratelimit.is_limited(domain) {
            let until = self.ratelimit.get_expiry(domain).expect("checked above");
            return Err(Error::RateLimited { until });
        }

        if let Some(cached) = self.cache.lookup(domain) {
            if cached.is_valid_now() {
                if cached.needs_renewal(self.renewal_days) {
                    self.schedule_background_renewal(domain);
                }
                return Ok(cached.certified_key.clone());
            }
        }

        if let Some(parsed) = self.load_from_store(domain).await? {
            if parsed.is_valid_now() {
                let parsed = Arc::new(parsed);
                self.cache.store(domain, parsed.clone());
                if parsed.needs_renewal(self.renewal_days) {
                    self.schedule_background_renewal(domain);
                }
                return Ok(parsed.certified_key.clone());
            }
        }

        match self.orchestrator.obtain(domain).await {
            Ok(issued) => Ok(issued.certified_key.clone()),
            // The certificate was issued and is already sitting in the
            // memory cache (the orchestrator installs it before
            // surfacing this error); the current handshake must still
            // complete; only the next caller through the cold-start
            // path re-attempts persistence.
            Err(Error::PersistenceCritical(msg)) => {
                tracing::error!(domain, error = %msg, "certificate issued but not durably persisted");
                match self.cache.lookup(domain) {
                    Some(cached) => Ok(cached.certified_key.clone()),
                    None => Err(Error::PersistenceCritical(msg)),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Kicks off a renewal for `domain` without blocking the current
    /// handshake. The orchestrator's own in-flight dedup keeps a
    /// concurrent burst of handshakes from starting more than one order.
    fn schedule_background_renewal(&self, domain: &str) {
        let orchestrator = self.orchestrator.clone();
        let domain = domain.to_string();
        tokio::spawn(async move {
            tracing::info!(domain = %domain, "🔄 renewal window reached, renewing in the background");
            if let Err(err) = orchestrator.obtain(&domain).await {
                tracing::warn!(domain = %domain, error = %err, "background renewal failed");
            }
        });
    }

    async fn load_from_store(&self, domain: &str) -> Result<Option<ParsedCertificate>> {
        let Some(record) = self.store.get_by_domain(domain).await? else {
            return Ok(None);
        };
        if record.status != crate::store::CertificateStatus::Active {
            return Ok(None);
        }

        let mut reader = std::io::Cursor::new(record.full_chain_pem().into_bytes());
        let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
        let certs = certs.map_err(|e| Error::Fatal(format!("failed to parse stored certificate chain: {e}")))?;
        if certs.is_empty() {
            return Ok(None);
        }

        let mut key_reader = std::io::Cursor::new(record.key_pem.clone().into_bytes());
        let private_key = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| Error::Fatal(format!("failed to parse stored private key: {e}")))?
            .ok_or_else(|| Error::Fatal("no private key found in stored record".to_string()))?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
            .map_err(|e| Error::Fatal(format!("unsupported stored private key: {e}")))?;

        let certified_key = Arc::new(CertifiedKey::new(certs, signing_key));
        let parsed = ParsedCertificate::new(certified_key).map_err(Error::Fatal)?;
        Ok(Some(parsed))
    }
}
