//! End-to-end scenario tests
//!
//! Drives `Manager` through the seed scenarios, using `FakeAcmeOps` in
//! place of a live ACME server so the orchestrator's state machine,
//! cleanup discipline, and persistence invariant can be exercised
//! deterministically. Placed at the workspace `tests/` level, mirroring
//! where the teacher keeps its own end-to-end checks.

use std::sync::Arc;

use acmecore::acme::fake::{FakeAcmeOps, Script};
use acmecore::acme::ChallengeKind;
use acmecore::store::{CertificateRecord, CertificateStore, InMemoryStore, StoreError};
use acmecore::{AcmeManagerConfig, ClientHelloInfo, Error, Manager};
use async_trait::async_trait;

fn config(domains: &[&str]) -> AcmeManagerConfig {
    AcmeManagerConfig {
        contact_email: Some("ops@example.test".to_string()),
        directory_url: "staging".to_string(),
        domains: domains.iter().map(|d| d.to_string()).collect(),
        renewal_days: 30,
    }
}

fn hello(server_name: &str) -> ClientHelloInfo {
    ClientHelloInfo {
        server_name: server_name.to_string(),
        is_acme_tls_alpn: false,
    }
}

/// Cold start: no cache, no store entry, host allowed. A single
/// synchronous issuance must succeed and populate both cache and store.
#[tokio::test]
async fn cold_start_issuance_over_http01() {
    let manager = Manager::with_acme_operations(
        config(&["cold.example.test"]),
        InMemoryStore::new(),
        Arc::new(FakeAcmeOps::with_offered_challenges(vec![ChallengeKind::Http01])),
    );

    manager.get_certificate(&hello("cold.example.test")).await.unwrap();
    assert!(!manager.check_renewal("cold.example.test", 30).await);
}

/// A wildcard allow-list entry must admit any strict subdomain and
/// reject the bare apex and lookalike suffixes.
#[tokio::test]
async fn wildcard_host_policy_match() {
    let manager = Manager::with_acme_operations(
        config(&["*.example.test"]),
        InMemoryStore::new(),
        Arc::new(FakeAcmeOps::new()),
    );

    manager.get_certificate(&hello("svc.example.test")).await.unwrap();

    let err = manager.get_certificate(&hello("example.test")).await.unwrap_err();
    assert!(matches!(err, Error::HostNotAllowed(_)));

    let err = manager
        .get_certificate(&hello("notexample.test"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::HostNotAllowed(_)));
}

/// Once an issuance attempt is rate-limited, subsequent handshakes for
/// the same domain must fail fast without ever reaching the ACME
/// client again.
#[tokio::test]
async fn rate_limit_fast_fail() {
    let fake = Arc::new(FakeAcmeOps::with_scripts(vec![Script::RateLimit(
        "limited.example.test".to_string(),
    )]));
    let manager = Manager::with_acme_operations(
        config(&["limited.example.test"]),
        InMemoryStore::new(),
        fake.clone(),
    );

    let err = manager
        .get_certificate(&hello("limited.example.test"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));
    let (until, active) = manager.get_rate_limit_info("limited.example.test");
    assert!(until.is_some());
    assert!(active);
}

/// When the challenge is rejected mid-flight, no certificate may be
/// persisted or cached, and the published challenge must be cleaned up
/// rather than left dangling.
#[tokio::test]
async fn cleanup_on_challenge_failure() {
    let fake = Arc::new(FakeAcmeOps::with_offered_challenges(vec![ChallengeKind::Http01]));
    fake.script(Script::FailAcceptChallenge("fails.example.test".to_string()));
    let store = InMemoryStore::new();
    let manager = Manager::with_acme_operations(config(&["fails.example.test"]), store.clone(), fake);

    let err = manager.get_certificate(&hello("fails.example.test")).await.unwrap_err();
    assert!(matches!(err, Error::AcmeInvalid(_)));
    assert!(store.get_by_domain("fails.example.test").await.unwrap().is_none());
    assert!(!manager.check_renewal("fails.example.test", 30).await);

    // The HTTP-01 token published before the failure must have been
    // removed by the `ChallengeGuard`'s drop, not left behind.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    let response = manager
        .http_challenge_handler("/.well-known/acme-challenge/fails.example.test-token", |_| async {
            acmecore::HttpResponse {
                status: 404,
                content_type: "text/plain",
                body: "not found".to_string(),
            }
        })
        .await;
    assert_eq!(response.status, 404);
}

/// A store failure after successful issuance must surface
/// `PersistenceCritical` while still returning a usable certificate
/// for the current handshake via the in-memory cache.
#[tokio::test]
async fn persistence_failure_after_issuance_is_non_fatal_to_the_handshake() {
    let store: Arc<dyn CertificateStore> = Arc::new(AlwaysFailingStore);
    let manager = Manager::with_acme_operations(
        config(&["flaky.example.test"]),
        store,
        Arc::new(FakeAcmeOps::new()),
    );

    let err = manager.obtain("flaky.example.test").await.unwrap_err();
    assert!(matches!(err, Error::PersistenceCritical(_)));

    // Cache was still populated despite the persistence failure.
    manager.get_certificate(&hello("flaky.example.test")).await.unwrap();
}

/// Revocation must mark the store record revoked and evict every
/// cache tier so a subsequent handshake re-issues rather than serving
/// the revoked certificate.
#[tokio::test]
async fn revocation_evicts_cache_and_marks_store_record() {
    let store = InMemoryStore::new();
    let fake = Arc::new(FakeAcmeOps::new());
    let manager = Manager::with_acme_operations(config(&["revoke.example.test"]), store.clone(), fake.clone());

    manager.obtain("revoke.example.test").await.unwrap();
    manager.revoke("revoke.example.test", Some(0)).await.unwrap();

    assert_eq!(fake.revoke_calls().len(), 1);
    let record = store.get_by_domain("revoke.example.test").await.unwrap().unwrap();
    assert_eq!(record.status, acmecore::CertificateStatus::Revoked);
    assert!(record.revoked_at.is_some());
    // A fresh handshake re-issues since the cache entry was evicted and
    // the stored record is no longer `Active`.
    manager.get_certificate(&hello("revoke.example.test")).await.unwrap();
    assert_eq!(fake.finalize_calls().len(), 2);
}

/// A `CertificateStore` that always fails writes, used to exercise the
/// `persistence_critical` escape hatch.
struct AlwaysFailingStore;

#[async_trait]
impl CertificateStore for AlwaysFailingStore {
    async fn get_by_domain(&self, _domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(None)
    }

    async fn create(&self, _record: CertificateRecord) -> Result<(), StoreError> {
        Err(StoreError::Backend("simulated backend outage".to_string()))
    }

    async fn update(&self, _record: CertificateRecord) -> Result<(), StoreError> {
        Err(StoreError::Backend("simulated backend outage".to_string()))
    }

    async fn delete_by_id(&self, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::Backend("simulated backend outage".to_string()))
    }

    async fn cache_get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(None)
    }

    async fn cache_put(&self, _key: &str, _value: Vec<u8>) -> Result<(), StoreError> {
        Ok(())
    }

    async fn cache_delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}
