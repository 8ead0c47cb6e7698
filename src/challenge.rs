//! Challenge responder (component D)
//!
//! Thread-safe maps of pending HTTP-01 key authorizations and
//! TLS-ALPN-01 challenge certificates. Both maps are mutated only by
//! the orchestrator (component G); the HTTP handler and the TLS
//! handshake hook are readers only.

use std::collections::HashMap;
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use tokio::sync::RwLock;

/// ALPN protocol identifier advertised by clients attempting a
/// TLS-ALPN-01 challenge.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Fixed path prefix for the HTTP-01 challenge endpoint.
pub const HTTP01_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// A minimal HTTP response shape, decoupled from any particular HTTP
/// server framework so the outer gateway can adapt it to its own
/// request/response types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn ok(key_authorization: String) -> Self {
        Self {
            status: 200,
            content_type: "text/plain",
            body: key_authorization,
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain",
            body: "not found".to_string(),
        }
    }
}

/// Thread-safe storage for in-flight ACME challenges, shared between
/// the orchestrator (writer) and the HTTP/TLS responders (readers).
#[derive(Default)]
pub struct ChallengeResponder {
    http01: RwLock<HashMap<String, String>>,
    tls_alpn01: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl ChallengeResponder {
    /// Creates an empty responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an HTTP-01 key authorization for `token`.
    pub async fn publish_http01(&self, token: &str, key_authorization: &str) {
        self.http01
            .write()
            .await
            .insert(token.to_string(), key_authorization.to_string());
    }

    /// Removes a published HTTP-01 key authorization.
    pub async fn cleanup_http01(&self, token: &str) {
        self.http01.write().await.remove(token);
    }

    /// Publishes a TLS-ALPN-01 challenge certificate for `domain`.
    pub async fn publish_tls_alpn01(&self, domain: &str, certified_key: Arc<CertifiedKey>) {
        self.tls_alpn01
            .write()
            .await
            .insert(domain.to_string(), certified_key);
    }

    /// Removes a published TLS-ALPN-01 challenge certificate.
    pub async fn cleanup_tls_alpn01(&self, domain: &str) {
        self.tls_alpn01.write().await.remove(domain);
    }

    /// Looks up a TLS-ALPN-01 challenge certificate by SNI name,
    /// without removing it. Called from the TLS handshake hook.
    pub async fn lookup_tls_alpn01(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.tls_alpn01.read().await.get(domain).cloned()
    }

    /// Serves the HTTP-01 challenge endpoint for a request path. Returns
    /// `None` if `path` is not under the fixed challenge prefix, so the
    /// caller can fall through to a chained handler; returns `Some` with
    /// either a 200 (token found) or 404 (token absent or unknown path
    /// shape) otherwise.
    pub async fn http_challenge_handler(&self, path: &str) -> Option<HttpResponse> {
        let token = path.strip_prefix(HTTP01_PATH_PREFIX)?;
        let key_authorization = self.http01.read().await.get(token).cloned();
        Some(match key_authorization {
            Some(key_auth) => HttpResponse::ok(key_auth),
            None => HttpResponse::not_found(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_certified_key() -> Arc<CertifiedKey> {
        use rcgen::{CertificateParams, KeyPair};

        let key_pair = KeyPair::generate().expect("keygen");
        let params = CertificateParams::new(vec!["example.test".to_string()]).expect("params");
        let cert = params.self_signed(&key_pair).expect("self sign");
        let private_key = rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).expect("key der");
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&private_key).expect("signing key");
        Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key))
    }

    #[tokio::test]
    async fn http01_publish_serve_cleanup() {
        let responder = ChallengeResponder::new();
        responder.publish_http01("tok1", "tok1.thumb").await;

        let response = responder
            .http_challenge_handler("/.well-known/acme-challenge/tok1")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "tok1.thumb");

        responder.cleanup_http01("tok1").await;
        let response = responder
            .http_challenge_handler("/.well-known/acme-challenge/tok1")
            .await
            .unwrap();
        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn unknown_path_falls_through() {
        let responder = ChallengeResponder::new();
        assert!(responder.http_challenge_handler("/index.html").await.is_none());
    }

    #[tokio::test]
    async fn tls_alpn01_publish_lookup_cleanup() {
        let responder = ChallengeResponder::new();
        let key = fake_certified_key();
        responder.publish_tls_alpn01("example.test", key.clone()).await;

        assert!(responder.lookup_tls_alpn01("example.test").await.is_some());
        assert!(responder.lookup_tls_alpn01("other.test").await.is_none());

        responder.cleanup_tls_alpn01("example.test").await;
        assert!(responder.lookup_tls_alpn01("example.test").await.is_none());
    }
}
