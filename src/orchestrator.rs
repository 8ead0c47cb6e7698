//! Issuance orchestrator (component G)
//!
//! Drives one domain through the full ACME dance: account setup, order
//! creation, challenge selection and publication, validation wait,
//! finalization, then persist-before-cache. Concurrent requests for the
//! same domain are deduplicated so only one issuance is ever in flight
//! at a time; everyone else waits for it to finish and reads its
//! result from the store/cache instead of starting their own order.
//!
//! Challenge cleanup is structural, not disciplinary: [`ChallengeGuard`]
//! removes its published challenge on drop, so a `?` on any step after
//! publication still leaves the responder clean.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, CustomExtension, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use tokio::sync::{Mutex, Notify};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::acme::{AcmeOperations, AuthzStatus, ChallengeKind, ChallengeOffer};
use crate::cache::{CertCache, ParsedCertificate};
use crate::challenge::ChallengeResponder;
use crate::error::{Error, Result};
use crate::ratelimit::RateLimitLedger;
use crate::store::{CertificateRecord, CertificateStatus, CertificateStore, StoreError};

/// ACME's well-known extension OID for the TLS-ALPN-01 identifier,
/// carried as a critical, DER-encoded OCTET STRING of the key
/// authorization's SHA-256 digest.
const ACME_IDENTIFIER_OID: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 1, 31];

/// Maximum time to wait for an authorization to become valid once its
/// challenge has been accepted.
const AUTHORIZATION_WAIT: Duration = Duration::from_secs(90);

/// RAII guard for a published challenge. Schedules the matching
/// cleanup call on drop, regardless of which exit path (`?`, panic
/// unwind, or a clean return) removed the guard from scope.
struct ChallengeGuard {
    responder: Arc<ChallengeResponder>,
    kind: ChallengeKind,
    key: String,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        let responder = self.responder.clone();
        let kind = self.kind;
        let key = self.key.clone();
        tokio::spawn(async move {
            match kind {
                ChallengeKind::Http01 => responder.cleanup_http01(&key).await,
                ChallengeKind::TlsAlpn01 => responder.cleanup_tls_alpn01(&key).await,
            }
        });
    }
}

/// Coordinates ACME issuance for a set of domains, deduplicating
/// concurrent requests and enforcing the at-most-once persistence
/// invariant before a freshly issued certificate reaches the cache.
pub struct Orchestrator {
    acme: Arc<dyn AcmeOperations>,
    store: Arc<dyn CertificateStore>,
    cache: Arc<CertCache>,
    responder: Arc<ChallengeResponder>,
    ratelimit: Arc<RateLimitLedger>,
    contact_email: Option<String>,
    account_cache_key: String,
    inflight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Orchestrator {
    pub fn new(
        acme: Arc<dyn AcmeOperations>,
        store: Arc<dyn CertificateStore>,
        cache: Arc<CertCache>,
        responder: Arc<ChallengeResponder>,
        ratelimit: Arc<RateLimitLedger>,
        contact_email: Option<String>,
        directory_url: &str,
    ) -> Self {
        Self {
            acme,
            store,
            cache,
            responder,
            ratelimit,
            account_cache_key: account_cache_key(contact_email.as_deref(), directory_url),
            contact_email,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Obtains (or waits for a concurrent obtain of) a certificate for
    /// `domain`, persisting it and installing it in the cache.
    ///
    /// Returns `Error::PersistenceCritical` if issuance succeeded but
    /// the store rejected the write; the certificate is still returned
    /// via the cache in that case so the current handshake can proceed.
    pub async fn obtain(&self, domain: &str) -> Result<Arc<ParsedCertificate>> {
        loop {
            let notify = {
                let mut inflight = self.inflight.lock().await;
                if let Some(existing) = inflight.get(domain) {
                    Some(existing.clone())
                } else {
                    inflight.insert(domain.to_string(), Arc::new(Notify::new()));
                    None
                }
            };

            match notify {
                Some(notify) => {
                    notify.notified().await;
                    if let Some(cached) = self.cache.lookup(domain) {
                        return Ok(cached);
                    }
                    // The in-flight attempt failed without populating the
                    // cache; fall through and become the new owner.
                    continue;
                }
                None => break,
            }
        }

        let result = self.issue(domain).await;

        let notify = {
            let mut inflight = self.inflight.lock().await;
            inflight.remove(domain)
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }

        result
    }

    /// Runs the full issuance flow, recording `domain` into the
    /// rate-limit ledger if any ACME step along the way (order
    /// creation, challenge acceptance, authorization wait, or
    /// finalization) comes back `RateLimited`, per §7.
    async fn issue(&self, domain: &str) -> Result<Arc<ParsedCertificate>> {
        self.issue_inner(domain).await.inspect_err(|err| {
            if let Error::RateLimited { until } = err {
                self.ratelimit.record(domain, *until);
            }
        })
    }

    async fn issue_inner(&self, domain: &str) -> Result<Arc<ParsedCertificate>> {
        self.ensure_account().await?;

        tracing::info!(domain, "🔐 starting ACME issuance");
        let order = self.acme.authorize_order(domain).await?;

        let authz_handle = order
            .authz_handles
            .first()
            .ok_or_else(|| Error::Fatal(format!("order for {domain} has no authorizations")))?;

        let authz = self.acme.get_authorization(authz_handle).await?;

        if authz.status != AuthzStatus::Valid {
            self.satisfy_challenge(domain, authz_handle, &authz.challenges).await?;
        }

        let issued = self.acme.finalize_order(&order.finalize_handle).await?;
        tracing::info!(domain, "✅ order finalized");
        let key_pem = issued.key_pem.clone();

        let (cert_pem, chain_pem) = split_chain_pem(&issued.cert_chain_pem);
        let certs = parse_cert_chain(&issued.cert_chain_pem)?;
        let (issuer, serial) = leaf_metadata(&certs[0])?;
        let signing_key = load_signing_key(&key_pem)?;
        let certified_key = Arc::new(CertifiedKey::new(certs, signing_key));
        let parsed = Arc::new(
            ParsedCertificate::new(certified_key).map_err(Error::Fatal)?,
        );

        let now = chrono::Utc::now().timestamp();
        let existing = self.store.get_by_domain(domain).await?;
        let record = CertificateRecord {
            id: existing.as_ref().map(|r| r.id.clone()).unwrap_or_else(|| format!("{domain}-{serial}")),
            domain: domain.to_string(),
            cert_pem,
            chain_pem,
            key_pem,
            issued_at: parsed.issued_at,
            expires_at: parsed.expires_at,
            issuer,
            serial,
            status: CertificateStatus::Active,
            revoked_at: None,
            revoke_reason: None,
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        let persisted = match existing {
            Some(_) => self.store.update(record).await,
            None => match self.store.create(record.clone()).await {
                Err(StoreError::AlreadyExists(_)) => self.store.update(record).await,
                other => other,
            },
        };

        self.cache.store(domain, parsed.clone());

        match persisted {
            Ok(()) => Ok(parsed),
            Err(err) => Err(Error::PersistenceCritical(err.to_string())),
        }
    }

    async fn satisfy_challenge(
        &self,
        domain: &str,
        authz_handle: &str,
        offers: &[ChallengeOffer],
    ) -> Result<()> {
        let challenge = offers
            .iter()
            .find(|c| c.kind == ChallengeKind::TlsAlpn01)
            .or_else(|| offers.iter().find(|c| c.kind == ChallengeKind::Http01))
            .ok_or(Error::NoSupportedChallenge)?;

        let _guard = self.publish_challenge(domain, challenge).await?;

        self.acme.accept_challenge(authz_handle, challenge).await?;
        let status = self
            .acme
            .wait_authorization(authz_handle, AUTHORIZATION_WAIT)
            .await?;

        if status != AuthzStatus::Valid {
            return Err(Error::AcmeInvalid(format!(
                "authorization for {domain} did not reach the valid state"
            )));
        }

        Ok(())
    }

    async fn publish_challenge(&self, domain: &str, challenge: &ChallengeOffer) -> Result<ChallengeGuard> {
        match challenge.kind {
            ChallengeKind::Http01 => {
                self.responder
                    .publish_http01(&challenge.token, &challenge.key_authorization)
                    .await;
                Ok(ChallengeGuard {
                    responder: self.responder.clone(),
                    kind: ChallengeKind::Http01,
                    key: challenge.token.clone(),
                })
            }
            ChallengeKind::TlsAlpn01 => {
                let certified_key = build_tls_alpn01_certified_key(domain, &challenge.key_authorization)?;
                self.responder.publish_tls_alpn01(domain, certified_key).await;
                Ok(ChallengeGuard {
                    responder: self.responder.clone(),
                    kind: ChallengeKind::TlsAlpn01,
                    key: domain.to_string(),
                })
            }
        }
    }

    async fn ensure_account(&self) -> Result<()> {
        if let Some(credentials) = self.store.cache_get(&self.account_cache_key).await? {
            return self.acme.load_account(&credentials).await;
        }
        let credentials = self.acme.ensure_account(self.contact_email.as_deref()).await?;
        self.store.cache_put(&self.account_cache_key, credentials).await?;
        Ok(())
    }

    /// Revokes a previously issued certificate and evicts it from every
    /// cache tier.
    pub async fn revoke(&self, domain: &str, reason: Option<u8>) -> Result<()> {
        let Some(mut record) = self.store.get_by_domain(domain).await? else {
            return Err(Error::Fatal(format!("no certificate on record for {domain}")));
        };
        let certs = parse_cert_chain(&record.full_chain_pem())?;
        self.acme.revoke(&certs[0], reason).await?;

        record.status = CertificateStatus::Revoked;
        record.revoked_at = Some(chrono::Utc::now().timestamp());
        record.revoke_reason = reason.map(|r| r.to_string());
        self.store.update(record).await?;

        self.cache.evict(domain);
        Ok(())
    }
}

fn account_cache_key(contact_email: Option<&str>, directory_url: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    contact_email.unwrap_or("").hash(&mut hasher);
    directory_url.hash(&mut hasher);
    format!("acme_account_{:016x}", hasher.finish())
}

/// Splits a PEM bundle into its first certificate and the remaining
/// chain, without re-parsing and re-encoding DER.
fn split_chain_pem(cert_chain_pem: &str) -> (String, String) {
    const END_MARKER: &str = "-----END CERTIFICATE-----";
    match cert_chain_pem.find(END_MARKER) {
        Some(end_idx) => {
            let split_at = end_idx + END_MARKER.len();
            let (leaf, rest) = cert_chain_pem.split_at(split_at);
            (format!("{leaf}\n"), rest.trim_start_matches('\n').to_string())
        }
        None => (cert_chain_pem.to_string(), String::new()),
    }
}

fn parse_cert_chain(cert_chain_pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::Cursor::new(cert_chain_pem.as_bytes());
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| Error::Fatal(format!("failed to parse issued certificate chain: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Fatal("issuer returned an empty certificate chain".to_string()));
    }
    Ok(certs)
}

fn load_signing_key(key_pem: &str) -> Result<Arc<dyn rustls::sign::SigningKey>> {
    let mut reader = std::io::Cursor::new(key_pem.as_bytes());
    let private_key = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Fatal(format!("failed to parse issuance private key: {e}")))?
        .ok_or_else(|| Error::Fatal("no private key found in issuance key PEM".to_string()))?;
    rustls::crypto::ring::sign::any_supported_type(&private_key)
        .map_err(|e| Error::Fatal(format!("unsupported issuance private key: {e}")))
}

fn leaf_metadata(leaf_der: &CertificateDer<'_>) -> Result<(String, String)> {
    let (_, parsed) = X509Certificate::from_der(leaf_der)
        .map_err(|e| Error::Fatal(format!("failed to parse issued leaf certificate: {e}")))?;
    let issuer = parsed.issuer().to_string();
    let serial = parsed.raw_serial_as_string();
    Ok((issuer, serial))
}

/// Builds a throwaway, self-signed certificate carrying the
/// TLS-ALPN-01 `acmeIdentifier` extension, used only to answer the
/// validation handshake and discarded once the authorization settles.
fn build_tls_alpn01_certified_key(domain: &str, key_authorization: &str) -> Result<Arc<CertifiedKey>> {
    let digest = ring::digest::digest(&ring::digest::SHA256, key_authorization.as_bytes());
    let mut octet_string = vec![0x04u8, digest.as_ref().len() as u8];
    octet_string.extend_from_slice(digest.as_ref());

    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| Error::Fatal(format!("acme-tls/1 certificate parameters invalid: {e}")))?;
    let mut extension = CustomExtension::from_oid_content(ACME_IDENTIFIER_OID, octet_string);
    extension.set_criticality(true);
    params.custom_extensions.push(extension);

    let key_pair = KeyPair::generate().map_err(|e| Error::Fatal(format!("acme-tls/1 key generation failed: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Fatal(format!("acme-tls/1 self-signing failed: {e}")))?;
    let private_key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| Error::Fatal(format!("acme-tls/1 key conversion failed: {e}")))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key)
        .map_err(|e| Error::Fatal(format!("acme-tls/1 signing key unsupported: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::fake::{FakeAcmeOps, Script};
    use crate::store::InMemoryStore;

    fn new_orchestrator(acme: Arc<dyn AcmeOperations>) -> Orchestrator {
        Orchestrator::new(
            acme,
            InMemoryStore::new(),
            Arc::new(CertCache::new()),
            Arc::new(ChallengeResponder::new()),
            Arc::new(RateLimitLedger::new()),
            Some("ops@example.test".to_string()),
            "https://acme.example.test/directory",
        )
    }

    #[tokio::test]
    async fn cold_start_issuance_persists_and_caches() {
        let fake = Arc::new(FakeAcmeOps::new());
        let orchestrator = new_orchestrator(fake.clone());

        let parsed = orchestrator.obtain("issue.example.test").await.unwrap();
        assert!(parsed.expires_at > parsed.issued_at);
        assert_eq!(fake.finalize_calls(), vec!["issue.example.test".to_string()]);

        let record = orchestrator
            .store
            .get_by_domain("issue.example.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, CertificateStatus::Active);
    }

    #[tokio::test]
    async fn challenge_is_cleaned_up_after_success() {
        let fake = Arc::new(FakeAcmeOps::with_offered_challenges(vec![ChallengeKind::Http01]));
        let responder = Arc::new(ChallengeResponder::new());
        let orchestrator = Orchestrator::new(
            fake,
            InMemoryStore::new(),
            Arc::new(CertCache::new()),
            responder.clone(),
            Arc::new(RateLimitLedger::new()),
            None,
            "https://acme.example.test/directory",
        );

        orchestrator.obtain("clean.example.test").await.unwrap();
        // Cleanup is scheduled via `tokio::spawn` from the guard's drop;
        // yield until the spawned task has run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(responder
            .http_challenge_handler("/.well-known/acme-challenge/clean.example.test-token")
            .await
            .map(|r| r.status == 404)
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn challenge_rejection_does_not_persist_a_certificate() {
        let fake = Arc::new(FakeAcmeOps::with_scripts(vec![Script::FailAcceptChallenge(
            "bad.example.test".to_string(),
        )]));
        let orchestrator = new_orchestrator(fake);

        let err = orchestrator.obtain("bad.example.test").await.unwrap_err();
        assert!(matches!(err, Error::AcmeInvalid(_)));
        assert!(orchestrator
            .store
            .get_by_domain("bad.example.test")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_obtain_for_same_domain_is_deduplicated() {
        let fake = Arc::new(FakeAcmeOps::new());
        let orchestrator = Arc::new(new_orchestrator(fake.clone()));

        let a = orchestrator.clone();
        let b = orchestrator.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.obtain("dup.example.test").await }),
            tokio::spawn(async move { b.obtain("dup.example.test").await }),
        );

        first.unwrap().unwrap();
        second.unwrap().unwrap();
        assert_eq!(fake.authorize_calls(), vec!["dup.example.test".to_string()]);
    }

    #[tokio::test]
    async fn revoke_marks_record_revoked_and_evicts_cache() {
        let fake = Arc::new(FakeAcmeOps::new());
        let orchestrator = new_orchestrator(fake.clone());

        orchestrator.obtain("revoke.example.test").await.unwrap();
        orchestrator.revoke("revoke.example.test", Some(1)).await.unwrap();

        assert!(orchestrator.cache.lookup("revoke.example.test").is_none());
        let record = orchestrator
            .store
            .get_by_domain("revoke.example.test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, CertificateStatus::Revoked);
        assert_eq!(fake.revoke_calls().len(), 1);
    }

    #[tokio::test]
    async fn tls_alpn01_is_preferred_when_both_are_offered() {
        let fake = Arc::new(FakeAcmeOps::new());
        let orchestrator = new_orchestrator(fake.clone());

        orchestrator.obtain("both.example.test").await.unwrap();

        assert_eq!(fake.accepted_kinds(), vec![ChallengeKind::TlsAlpn01]);
    }

    #[tokio::test]
    async fn http01_is_used_when_it_is_the_only_offer() {
        let fake = Arc::new(FakeAcmeOps::with_offered_challenges(vec![ChallengeKind::Http01]));
        let orchestrator = new_orchestrator(fake.clone());

        orchestrator.obtain("http-only.example.test").await.unwrap();

        assert_eq!(fake.accepted_kinds(), vec![ChallengeKind::Http01]);
    }

    #[tokio::test]
    async fn no_supported_challenge_when_none_offered() {
        let fake = Arc::new(FakeAcmeOps::with_offered_challenges(vec![]));
        let orchestrator = new_orchestrator(fake);

        let err = orchestrator.obtain("unsupported.example.test").await.unwrap_err();
        assert!(matches!(err, Error::NoSupportedChallenge));
    }
}
