//! Top-level facade (ambient)
//!
//! `Manager` wires components A–H together behind the small surface an
//! embedding TLS server actually calls: resolve a certificate for a
//! handshake, serve the HTTP-01 endpoint, and drive administrative
//! obtain/renew/revoke/update-domains operations.
//!
//! Grounded on `pingclair-tls/src/manager.rs`'s `TlsManager`, generalized
//! to own the full component list instead of just the cache + ACME client.

use std::sync::Arc;
use std::time::SystemTime;

use crate::acme::{AcmeClient, AcmeOperations};
use crate::cache::CertCache;
use crate::challenge::{ChallengeResponder, HttpResponse};
use crate::config::AcmeManagerConfig;
use crate::error::Result;
use crate::handshake::{ClientHelloInfo, HandshakeResolver};
use crate::orchestrator::Orchestrator;
use crate::policy::HostPolicy;
use crate::ratelimit::RateLimitLedger;
use crate::store::{CertificateStatus, CertificateStore};
use rustls::sign::CertifiedKey;

/// Owns every component and exposes the operations an embedding
/// gateway drives: handshake resolution, the HTTP-01 endpoint, and
/// administrative issuance/renewal/revocation.
pub struct Manager {
    resolver: HandshakeResolver,
    orchestrator: Arc<Orchestrator>,
    responder: Arc<ChallengeResponder>,
    policy: Arc<HostPolicy>,
    ratelimit: Arc<RateLimitLedger>,
}

impl Manager {
    /// Builds a `Manager` from configuration and a caller-supplied
    /// durable store.
    pub fn new(config: AcmeManagerConfig, store: Arc<dyn CertificateStore>) -> Self {
        let acme: Arc<dyn AcmeOperations> = Arc::new(AcmeClient::new(config.resolved_directory_url().to_string()));
        Self::with_acme_operations(config, store, acme)
    }

    /// Builds a `Manager` against a caller-supplied [`AcmeOperations`]
    /// implementation, primarily for tests that want a
    /// [`crate::acme::fake::FakeAcmeOps`] in place of a live server.
    pub fn with_acme_operations(
        config: AcmeManagerConfig,
        store: Arc<dyn CertificateStore>,
        acme: Arc<dyn AcmeOperations>,
    ) -> Self {
        let cache = Arc::new(CertCache::new());
        let responder = Arc::new(ChallengeResponder::new());
        let policy = Arc::new(HostPolicy::new(&config.domains));
        let ratelimit = Arc::new(RateLimitLedger::new());

        let orchestrator = Arc::new(Orchestrator::new(
            acme,
            store.clone(),
            cache.clone(),
            responder.clone(),
            ratelimit.clone(),
            config.contact_email.clone(),
            config.resolved_directory_url(),
        ));

        let resolver = HandshakeResolver {
            cache,
            store,
            policy: policy.clone(),
            ratelimit: ratelimit.clone(),
            responder: responder.clone(),
            orchestrator: orchestrator.clone(),
            renewal_days: config.renewal_days,
        };

        Self {
            resolver,
            orchestrator,
            responder,
            policy,
            ratelimit,
        }
    }

    /// Resolves the certificate to present for a TLS handshake,
    /// issuing one on demand if necessary.
    pub async fn get_certificate(&self, hello: &ClientHelloInfo) -> Result<Arc<CertifiedKey>> {
        self.resolver.get_certificate(hello).await
    }

    /// Serves the HTTP-01 challenge endpoint for a request path,
    /// chaining to `fallback` for any path outside the fixed challenge
    /// prefix so the outer gateway can compose this with its own
    /// routing instead of needing a separate not-found branch.
    pub async fn http_challenge_handler<F, Fut>(&self, path: &str, fallback: F) -> HttpResponse
    where
        F: FnOnce(&str) -> Fut,
        Fut: std::future::Future<Output = HttpResponse>,
    {
        match self.responder.http_challenge_handler(path).await {
            Some(response) => response,
            None => fallback(path).await,
        }
    }

    /// Forces issuance for `domain`, regardless of cache/store state.
    pub async fn obtain(&self, domain: &str) -> Result<()> {
        self.orchestrator.obtain(domain).await.map(|_| ())
    }

    /// Re-issues `domain`'s certificate ahead of its natural renewal
    /// window. Equivalent to `obtain`; kept as a distinct name for the
    /// administrative surface's clarity.
    pub async fn renew(&self, domain: &str) -> Result<()> {
        self.orchestrator.obtain(domain).await.map(|_| ())
    }

    /// Revokes `domain`'s current certificate.
    pub async fn revoke(&self, domain: &str, reason: Option<u8>) -> Result<()> {
        self.orchestrator.revoke(domain, reason).await
    }

    /// Atomically replaces the host allow-list.
    pub fn update_domains<S: AsRef<str>>(&self, domains: &[S]) {
        self.policy.update(domains);
    }

    /// Observability hook: the recorded rate-limit expiry for `domain`
    /// (if any entry exists, expired or not) together with whether it is
    /// currently in effect.
    pub fn get_rate_limit_info(&self, domain: &str) -> (Option<SystemTime>, bool) {
        (self.ratelimit.get_expiry(domain), self.ratelimit.is_limited(domain))
    }

    /// Scheduler hook: whether `domain`'s certificate has fewer than
    /// `days` remaining before expiry. Consults the memory cache first,
    /// falling back to the durable store so a scheduler running after a
    /// cold restart still sees the right answer. Returns `false` if no
    /// active certificate is known for `domain`.
    pub async fn check_renewal(&self, domain: &str, days: u32) -> bool {
        if let Some(cached) = self.resolver.cache.lookup(domain) {
            return cached.needs_renewal(days);
        }

        match self.resolver.store.get_by_domain(domain).await {
            Ok(Some(record)) if record.status == CertificateStatus::Active => {
                let now = chrono::Utc::now().timestamp();
                record.expires_at - now < i64::from(days) * 24 * 60 * 60
            }
            _ => false,
        }
    }
}
