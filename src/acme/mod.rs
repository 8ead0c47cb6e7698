//! ACME protocol client (component C)
//!
//! A thin operation set over [`instant_acme`]: directory discovery,
//! account registration, order/authorization walking, challenge
//! acceptance, finalization, and revocation. This module owns nothing
//! about caching, persistence, host policy, or cleanup discipline; that
//! is the orchestrator's job (`crate::orchestrator`). It only talks to
//! the ACME server and classifies what comes back.
//!
//! Grounded on `pingclair-tls/src/acme.rs` for the `instant_acme`
//! call shape (`Account::builder`, `new_order`, `authorizations`,
//! `challenge`, `set_ready`, `poll_ready`, `finalize`,
//! `poll_certificate`) and on `ferronweb-ferron/ferron/src/acme.rs`
//! for the custom HTTP transport (see `transport`).

pub mod fake;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus as RemoteAuthorizationStatus, ChallengeType,
    Identifier, KeyAuthorization, LetsEncrypt, NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use transport::AcmeTransport;

/// Per-operation timeout budget, per spec.md §4.3.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on how long a single authorization wait may run.
pub const MAX_AUTHORIZATION_WAIT: Duration = Duration::from_secs(120);

/// Directory URL for Let's Encrypt's staging environment, used for
/// development and test issuance so production rate limits are never
/// spent accidentally.
pub const LETSENCRYPT_STAGING: &str = LetsEncrypt::Staging.url();
/// Directory URL for Let's Encrypt's production environment.
pub const LETSENCRYPT_PRODUCTION: &str = LetsEncrypt::Production.url();

/// The challenge mechanisms this crate knows how to fulfil. DNS-01 is
/// intentionally absent (see spec.md's Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    TlsAlpn01,
}

impl ChallengeKind {
    fn from_remote(kind: ChallengeType) -> Option<Self> {
        match kind {
            ChallengeType::Http01 => Some(ChallengeKind::Http01),
            ChallengeType::TlsAlpn01 => Some(ChallengeKind::TlsAlpn01),
            _ => None,
        }
    }

    fn to_remote(self) -> ChallengeType {
        match self {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::TlsAlpn01 => ChallengeType::TlsAlpn01,
        }
    }
}

/// One challenge option offered by the server for a pending
/// authorization.
#[derive(Debug, Clone)]
pub struct ChallengeOffer {
    pub kind: ChallengeKind,
    pub token: String,
    pub key_authorization: String,
}

/// Authorization status as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Revoked,
    Deactivated,
}

impl From<RemoteAuthorizationStatus> for AuthzStatus {
    fn from(status: RemoteAuthorizationStatus) -> Self {
        match status {
            RemoteAuthorizationStatus::Pending => AuthzStatus::Pending,
            RemoteAuthorizationStatus::Valid => AuthzStatus::Valid,
            RemoteAuthorizationStatus::Invalid => AuthzStatus::Invalid,
            RemoteAuthorizationStatus::Expired => AuthzStatus::Expired,
            RemoteAuthorizationStatus::Revoked => AuthzStatus::Revoked,
            RemoteAuthorizationStatus::Deactivated => AuthzStatus::Deactivated,
            _ => AuthzStatus::Invalid,
        }
    }
}

/// One authorization belonging to an order, together with the
/// challenges the server is offering to satisfy it.
#[derive(Debug, Clone)]
pub struct AuthorizationInfo {
    /// Opaque handle used in subsequent `get_authorization`,
    /// `accept_challenge`, and `wait_authorization` calls.
    pub handle: String,
    pub identifier: String,
    pub status: AuthzStatus,
    pub challenges: Vec<ChallengeOffer>,
}

/// The handle returned by `authorize_order`: an opaque finalize handle
/// plus one opaque authorization handle per requested identifier.
#[derive(Debug, Clone)]
pub struct OrderHandle {
    pub finalize_handle: String,
    pub authz_handles: Vec<String>,
}

/// Issued certificate material returned by `finalize_order`. Both the
/// certificate chain and the private key are PEM-encoded, matching what
/// `instant_acme::Order::finalize`/`poll_certificate` hand back. The
/// client library generates and holds the issuance key internally
/// rather than accepting a caller-supplied CSR.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub key_pem: String,
}

/// The operation set the orchestrator drives. Implemented by
/// [`AcmeClient`] against a real ACME server and by
/// [`fake::FakeAcmeOps`] for deterministic state-machine tests.
#[async_trait]
pub trait AcmeOperations: Send + Sync {
    /// Confirms the directory is reachable and registers/loads the
    /// account, if not already done.
    async fn ensure_account(&self, contact_email: Option<&str>) -> Result<Vec<u8>>;

    /// Restores a previously persisted account from its opaque
    /// credential bytes (see spec.md §9's account-key resolution).
    async fn load_account(&self, credentials: &[u8]) -> Result<()>;

    /// Creates a new order for a single domain and returns its handle.
    async fn authorize_order(&self, domain: &str) -> Result<OrderHandle>;

    /// Fetches (or re-fetches) the current state of one authorization.
    async fn get_authorization(&self, authz_handle: &str) -> Result<AuthorizationInfo>;

    /// Deploys and signals readiness for the chosen challenge.
    async fn accept_challenge(&self, authz_handle: &str, challenge: &ChallengeOffer) -> Result<()>;

    /// Polls until the authorization (and thus the order) is ready for
    /// finalization, or the deadline elapses.
    async fn wait_authorization(&self, authz_handle: &str, deadline: Duration) -> Result<AuthzStatus>;

    /// Finalizes the order and polls until the signed chain is
    /// available. `instant_acme` generates the issuance key pair
    /// internally; the returned key PEM is the one certified.
    async fn finalize_order(&self, finalize_handle: &str) -> Result<IssuedCertificate>;

    /// Revokes a previously issued certificate.
    async fn revoke(&self, cert_der: &[u8], reason: Option<u8>) -> Result<()>;
}

/// Coarse classification of a transport-or-protocol failure, used to
/// decide whether the orchestrator retries, backs off under the rate
/// limiter, or gives up immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    RateLimited,
    Invalid,
    Fatal,
}

/// Classifies a failure using the transport's last observed HTTP
/// status first, falling back to matching known substrings in the
/// error's rendered message (ACME problem document "type" values and
/// common timeout wording) when the status is unavailable. Some
/// underlying library error paths don't expose a status code at all.
pub fn classify(observation: &transport::TransportObservation, message: &str) -> ErrorClass {
    if let Some(status) = observation.status {
        return match status {
            429 => ErrorClass::RateLimited,
            500..=599 => ErrorClass::Retryable,
            400 | 403 | 404 => ErrorClass::Invalid,
            _ => ErrorClass::Fatal,
        };
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("ratelimited") || lower.contains("rate limit") {
        ErrorClass::RateLimited
    } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("connection") {
        ErrorClass::Retryable
    } else if lower.contains("malformed")
        || lower.contains("unauthorized")
        || lower.contains("rejectedidentifier")
        || lower.contains("invalid")
    {
        ErrorClass::Invalid
    } else {
        ErrorClass::Fatal
    }
}

fn classify_to_error(observation: &transport::TransportObservation, err: &instant_acme::Error) -> Error {
    let message = err.to_string();
    match classify(observation, &message) {
        ErrorClass::RateLimited => Error::RateLimited {
            until: crate::ratelimit::resolve_retry_after(observation.retry_after.as_deref()),
        },
        ErrorClass::Retryable => Error::AcmeTransient(message),
        ErrorClass::Invalid => Error::AcmeInvalid(message),
        ErrorClass::Fatal => Error::Fatal(message),
    }
}

struct InflightOrder {
    order: instant_acme::Order,
    authorizations: HashMap<String, instant_acme::Authorization>,
}

/// `instant_acme`-backed implementation of [`AcmeOperations`].
pub struct AcmeClient {
    directory_url: String,
    transport: Arc<AcmeTransport>,
    account: Mutex<Option<Account>>,
    inflight: Mutex<HashMap<String, InflightOrder>>,
}

impl AcmeClient {
    /// Builds a client pointed at `directory_url` (typically
    /// [`LETSENCRYPT_STAGING`] or [`LETSENCRYPT_PRODUCTION`]).
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            transport: Arc::new(AcmeTransport::new()),
            account: Mutex::new(None),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    async fn account(&self) -> Result<Account> {
        self.account
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Fatal("ACME account not initialized".to_string()))
    }
}

#[async_trait]
impl AcmeOperations for AcmeClient {
    async fn ensure_account(&self, contact_email: Option<&str>) -> Result<Vec<u8>> {
        if let Some(existing) = self.account.lock().await.as_ref() {
            let credentials = existing.credentials();
            return serde_json::to_vec(&credentials)
                .map_err(|e| Error::Fatal(format!("serialize account credentials: {e}")));
        }

        let contact = contact_email.map(|email| format!("mailto:{email}"));
        let contact_slice = contact.as_deref().map(std::slice::from_ref);

        let new_account = NewAccount {
            contact: contact_slice.unwrap_or(&[]),
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let result = tokio::time::timeout(
            STEP_TIMEOUT,
            Account::builder()
                .map_err(|e| Error::Fatal(format!("build account client: {e}")))?
                .create(&new_account, self.directory_url.clone(), None),
        )
        .await;

        let account = match result {
            Ok(Ok((account, _credentials))) => account,
            Ok(Err(err)) => {
                return Err(classify_to_error(&self.transport.last_observation(), &err));
            }
            Err(_) => return Err(Error::AcmeTransient("account registration timed out".to_string())),
        };

        let credentials = account.credentials();
        let encoded = serde_json::to_vec(&credentials)
            .map_err(|e| Error::Fatal(format!("serialize account credentials: {e}")))?;
        *self.account.lock().await = Some(account);
        Ok(encoded)
    }

    async fn load_account(&self, credentials: &[u8]) -> Result<()> {
        let credentials: AccountCredentials =
            serde_json::from_slice(credentials).map_err(|e| Error::Fatal(format!("decode account credentials: {e}")))?;
        let account = Account::builder()
            .map_err(|e| Error::Fatal(format!("build account client: {e}")))?
            .from_credentials(credentials)
            .await
            .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn authorize_order(&self, domain: &str) -> Result<OrderHandle> {
        let account = self.account().await?;
        let identifier = Identifier::Dns(domain.to_string());

        let mut order = tokio::time::timeout(
            STEP_TIMEOUT,
            account.new_order(&NewOrder::new(std::slice::from_ref(&identifier))),
        )
        .await
        .map_err(|_| Error::AcmeTransient("order creation timed out".to_string()))?
        .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;

        let mut authorizations = order
            .authorizations()
            .await
            .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;

        let mut by_handle = HashMap::new();
        let mut handles = Vec::new();
        while let Some(authz) = authorizations.next().await {
            let authz = authz.map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;
            let handle = format!("{domain}#{}", handles.len());
            handles.push(handle.clone());
            by_handle.insert(handle, authz);
        }

        let finalize_handle = domain.to_string();
        self.inflight.lock().await.insert(
            finalize_handle.clone(),
            InflightOrder {
                order,
                authorizations: by_handle,
            },
        );

        Ok(OrderHandle {
            finalize_handle,
            authz_handles: handles,
        })
    }

    async fn get_authorization(&self, authz_handle: &str) -> Result<AuthorizationInfo> {
        let domain = authz_handle
            .split('#')
            .next()
            .ok_or_else(|| Error::Fatal(format!("malformed authorization handle: {authz_handle}")))?;

        let mut inflight = self.inflight.lock().await;
        let entry = inflight
            .get_mut(domain)
            .ok_or_else(|| Error::Fatal(format!("no in-flight order for {domain}")))?;
        let authz = entry
            .authorizations
            .get_mut(authz_handle)
            .ok_or_else(|| Error::Fatal(format!("unknown authorization handle: {authz_handle}")))?;

        let identifier = match &authz.identifier {
            Identifier::Dns(name) => name.clone(),
        };

        let mut challenges = Vec::new();
        for kind in [ChallengeKind::Http01, ChallengeKind::TlsAlpn01] {
            if let Some(challenge) = authz.challenge(kind.to_remote()) {
                let key_authorization: KeyAuthorization = challenge.key_authorization();
                challenges.push(ChallengeOffer {
                    kind,
                    token: challenge.token.clone(),
                    key_authorization: key_authorization.as_str().to_string(),
                });
            }
        }

        Ok(AuthorizationInfo {
            handle: authz_handle.to_string(),
            identifier,
            status: authz.status.into(),
            challenges,
        })
    }

    async fn accept_challenge(&self, authz_handle: &str, challenge: &ChallengeOffer) -> Result<()> {
        let domain = authz_handle
            .split('#')
            .next()
            .ok_or_else(|| Error::Fatal(format!("malformed authorization handle: {authz_handle}")))?;

        let mut inflight = self.inflight.lock().await;
        let entry = inflight
            .get_mut(domain)
            .ok_or_else(|| Error::Fatal(format!("no in-flight order for {domain}")))?;
        let authz = entry
            .authorizations
            .get_mut(authz_handle)
            .ok_or_else(|| Error::Fatal(format!("unknown authorization handle: {authz_handle}")))?;

        let remote_challenge = authz
            .challenge(challenge.kind.to_remote())
            .ok_or(Error::NoSupportedChallenge)?;

        tokio::time::timeout(STEP_TIMEOUT, remote_challenge.set_ready())
            .await
            .map_err(|_| Error::AcmeTransient("challenge readiness signal timed out".to_string()))?
            .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))
    }

    async fn wait_authorization(&self, authz_handle: &str, deadline: Duration) -> Result<AuthzStatus> {
        let domain = authz_handle
            .split('#')
            .next()
            .ok_or_else(|| Error::Fatal(format!("malformed authorization handle: {authz_handle}")))?;
        let bounded_deadline = deadline.min(MAX_AUTHORIZATION_WAIT);

        let mut inflight = self.inflight.lock().await;
        let entry = inflight
            .get_mut(domain)
            .ok_or_else(|| Error::Fatal(format!("no in-flight order for {domain}")))?;

        let status = tokio::time::timeout(
            bounded_deadline,
            entry.order.poll_ready(&RetryPolicy::default()),
        )
        .await
        .map_err(|_| Error::AcmeTransient("authorization wait timed out".to_string()))?
        .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;

        Ok(match status {
            OrderStatus::Ready | OrderStatus::Valid => AuthzStatus::Valid,
            OrderStatus::Invalid => AuthzStatus::Invalid,
            _ => AuthzStatus::Pending,
        })
    }

    async fn finalize_order(&self, finalize_handle: &str) -> Result<IssuedCertificate> {
        let mut inflight = self.inflight.lock().await;
        let entry = inflight
            .remove(finalize_handle)
            .ok_or_else(|| Error::Fatal(format!("no in-flight order for {finalize_handle}")))?;
        let mut order = entry.order;

        let key_pem = tokio::time::timeout(STEP_TIMEOUT, order.finalize())
            .await
            .map_err(|_| Error::AcmeTransient("order finalization timed out".to_string()))?
            .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;

        let cert_chain_pem = tokio::time::timeout(
            MAX_AUTHORIZATION_WAIT,
            order.poll_certificate(&RetryPolicy::default()),
        )
        .await
        .map_err(|_| Error::AcmeTransient("certificate download timed out".to_string()))?
        .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))?;

        Ok(IssuedCertificate { cert_chain_pem, key_pem })
    }

    async fn revoke(&self, cert_der: &[u8], reason: Option<u8>) -> Result<()> {
        let account = self.account().await?;
        tokio::time::timeout(STEP_TIMEOUT, account.revoke_certificate(cert_der, reason))
            .await
            .map_err(|_| Error::AcmeTransient("revocation timed out".to_string()))?
            .map_err(|err| classify_to_error(&self.transport.last_observation(), &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::TransportObservation;

    #[test]
    fn classifies_by_status_first() {
        let obs = TransportObservation {
            status: Some(429),
            retry_after: None,
        };
        assert_eq!(classify(&obs, "whatever"), ErrorClass::RateLimited);

        let obs = TransportObservation {
            status: Some(503),
            retry_after: None,
        };
        assert_eq!(classify(&obs, "whatever"), ErrorClass::Retryable);

        let obs = TransportObservation {
            status: Some(400),
            retry_after: None,
        };
        assert_eq!(classify(&obs, "whatever"), ErrorClass::Invalid);
    }

    #[test]
    fn classifies_by_message_when_status_unknown() {
        let obs = TransportObservation::default();
        assert_eq!(
            classify(&obs, "urn:ietf:params:acme:error:rateLimited"),
            ErrorClass::RateLimited
        );
        assert_eq!(classify(&obs, "operation timed out"), ErrorClass::Retryable);
        assert_eq!(
            classify(&obs, "urn:ietf:params:acme:error:malformed"),
            ErrorClass::Invalid
        );
        assert_eq!(classify(&obs, "something unexpected"), ErrorClass::Fatal);
    }
}
