//! A scriptable [`AcmeOperations`] double.
//!
//! Not gated behind `#[cfg(test)]` so integration tests under `tests/`
//! (which compile the crate without the unit-test cfg) can drive the
//! orchestrator's state machine deterministically, without a live ACME
//! server or a mocked JWS/nonce protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};

use crate::error::{Error, Result};

use super::{AcmeOperations, AuthorizationInfo, AuthzStatus, ChallengeKind, ChallengeOffer, IssuedCertificate, OrderHandle};

/// Generates a real self-signed certificate and matching key for
/// `domain`, so code that parses the "issued" material (DER chain
/// parsing, PEM splitting, X.509 metadata extraction) exercises its
/// real parsing path in tests instead of a placeholder string.
fn fake_issued_certificate(domain: &str) -> IssuedCertificate {
    let key_pair = KeyPair::generate().expect("keygen");
    let params = CertificateParams::new(vec![domain.to_string()]).expect("params");
    let cert = params.self_signed(&key_pair).expect("self sign");
    IssuedCertificate {
        cert_chain_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    }
}

/// A scripted failure, injected at a specific step for a specific
/// domain.
#[derive(Debug, Clone)]
pub enum Script {
    FailAuthorize(String),
    FailAcceptChallenge(String),
    FailWait(String),
    FailFinalize(String),
    RateLimit(String),
}

struct State {
    scripts: Vec<Script>,
    offered_challenges: Vec<ChallengeKind>,
    authorize_calls: Vec<String>,
    accept_calls: Vec<String>,
    accepted_kinds: Vec<ChallengeKind>,
    finalize_calls: Vec<String>,
    revoke_calls: Vec<Vec<u8>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            scripts: Vec::new(),
            offered_challenges: vec![ChallengeKind::Http01, ChallengeKind::TlsAlpn01],
            authorize_calls: Vec::new(),
            accept_calls: Vec::new(),
            accepted_kinds: Vec::new(),
            finalize_calls: Vec::new(),
            revoke_calls: Vec::new(),
        }
    }
}

/// Deterministic stand-in for a real ACME server, offering HTTP-01 and
/// TLS-ALPN-01 on every authorization and succeeding unless scripted
/// otherwise.
pub struct FakeAcmeOps {
    state: Mutex<State>,
}

impl Default for FakeAcmeOps {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }
}

impl FakeAcmeOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a failure script to a fake already under construction,
    /// applied once the matching step runs.
    pub fn script(&self, script: Script) {
        self.state.lock().scripts.push(script);
    }

    /// Installs failure scripts, applied in order as matching steps run.
    pub fn with_scripts(scripts: Vec<Script>) -> Self {
        Self {
            state: Mutex::new(State {
                scripts,
                ..Default::default()
            }),
        }
    }

    /// Restricts the challenge types offered on every authorization, so
    /// tests can force a specific challenge path (e.g. HTTP-01 only)
    /// regardless of the orchestrator's own preference order.
    pub fn with_offered_challenges(challenges: Vec<ChallengeKind>) -> Self {
        Self {
            state: Mutex::new(State {
                offered_challenges: challenges,
                ..Default::default()
            }),
        }
    }

    pub fn authorize_calls(&self) -> Vec<String> {
        self.state.lock().authorize_calls.clone()
    }

    pub fn accept_calls(&self) -> Vec<String> {
        self.state.lock().accept_calls.clone()
    }

    /// Which challenge kind was accepted on each call, in order.
    pub fn accepted_kinds(&self) -> Vec<ChallengeKind> {
        self.state.lock().accepted_kinds.clone()
    }

    pub fn finalize_calls(&self) -> Vec<String> {
        self.state.lock().finalize_calls.clone()
    }

    pub fn revoke_calls(&self) -> Vec<Vec<u8>> {
        self.state.lock().revoke_calls.clone()
    }

    fn take_script(&self, matches: impl Fn(&Script) -> bool) -> Option<Script> {
        let mut state = self.state.lock();
        let index = state.scripts.iter().position(matches)?;
        Some(state.scripts.remove(index))
    }
}

#[async_trait]
impl AcmeOperations for FakeAcmeOps {
    async fn ensure_account(&self, _contact_email: Option<&str>) -> Result<Vec<u8>> {
        Ok(b"fake-account-credentials".to_vec())
    }

    async fn load_account(&self, _credentials: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn authorize_order(&self, domain: &str) -> Result<OrderHandle> {
        self.state.lock().authorize_calls.push(domain.to_string());
        if let Some(Script::FailAuthorize(_)) =
            self.take_script(|s| matches!(s, Script::FailAuthorize(d) if d == domain))
        {
            return Err(Error::AcmeTransient(format!("authorize failed for {domain}")));
        }
        if let Some(Script::RateLimit(_)) = self.take_script(|s| matches!(s, Script::RateLimit(d) if d == domain)) {
            return Err(Error::RateLimited {
                until: std::time::SystemTime::now() + Duration::from_secs(3600),
            });
        }

        Ok(OrderHandle {
            finalize_handle: domain.to_string(),
            authz_handles: vec![format!("{domain}#0")],
        })
    }

    async fn get_authorization(&self, authz_handle: &str) -> Result<AuthorizationInfo> {
        let domain = authz_handle.split('#').next().unwrap_or(authz_handle).to_string();
        let challenges = self
            .state
            .lock()
            .offered_challenges
            .iter()
            .map(|kind| ChallengeOffer {
                kind: *kind,
                token: format!("{domain}-token"),
                key_authorization: format!("{domain}-token.thumbprint"),
            })
            .collect();
        Ok(AuthorizationInfo {
            handle: authz_handle.to_string(),
            identifier: domain.clone(),
            status: AuthzStatus::Pending,
            challenges,
        })
    }

    async fn accept_challenge(&self, authz_handle: &str, challenge: &ChallengeOffer) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.accept_calls.push(authz_handle.to_string());
            state.accepted_kinds.push(challenge.kind);
        }
        let domain = authz_handle.split('#').next().unwrap_or(authz_handle).to_string();
        if let Some(Script::FailAcceptChallenge(_)) =
            self.take_script(|s| matches!(s, Script::FailAcceptChallenge(d) if *d == domain))
        {
            return Err(Error::AcmeInvalid(format!("challenge rejected for {domain}")));
        }
        Ok(())
    }

    async fn wait_authorization(&self, authz_handle: &str, _deadline: Duration) -> Result<AuthzStatus> {
        let domain = authz_handle.split('#').next().unwrap_or(authz_handle).to_string();
        if let Some(Script::FailWait(_)) = self.take_script(|s| matches!(s, Script::FailWait(d) if *d == domain)) {
            return Ok(AuthzStatus::Invalid);
        }
        Ok(AuthzStatus::Valid)
    }

    async fn finalize_order(&self, finalize_handle: &str) -> Result<IssuedCertificate> {
        self.state.lock().finalize_calls.push(finalize_handle.to_string());
        if let Some(Script::FailFinalize(_)) =
            self.take_script(|s| matches!(s, Script::FailFinalize(d) if d == finalize_handle))
        {
            return Err(Error::AcmeTransient(format!("finalize failed for {finalize_handle}")));
        }
        Ok(fake_issued_certificate(finalize_handle))
    }

    async fn revoke(&self, cert_der: &[u8], _reason: Option<u8>) -> Result<()> {
        self.state.lock().revoke_calls.push(cert_der.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn happy_path_round_trip() {
        let fake = FakeAcmeOps::new();
        let order = fake.authorize_order("example.test").await.unwrap();
        assert_eq!(order.authz_handles.len(), 1);

        let authz = fake.get_authorization(&order.authz_handles[0]).await.unwrap();
        let challenge = authz
            .challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Http01)
            .unwrap();
        fake.accept_challenge(&order.authz_handles[0], challenge).await.unwrap();

        let status = fake
            .wait_authorization(&order.authz_handles[0], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status, AuthzStatus::Valid);

        let issued = fake.finalize_order(&order.finalize_handle).await.unwrap();
        assert!(issued.cert_chain_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
    }

    #[tokio::test]
    async fn scripted_authorize_failure_is_consumed_once() {
        let fake = FakeAcmeOps::with_scripts(vec![Script::FailAuthorize("bad.test".to_string())]);
        assert!(fake.authorize_order("bad.test").await.is_err());
        assert!(fake.authorize_order("bad.test").await.is_ok());
    }
}
