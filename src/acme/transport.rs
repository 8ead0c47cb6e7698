//! HTTP transport for the ACME client
//!
//! Builds the `instant_acme::HttpClient` implementation used for every
//! directory, order, authorization, and finalize request, with the
//! timeouts spec.md §4.3 requires and per-request logging of method,
//! URL, status, duration, and `Retry-After`.
//!
//! Grounded on `ferronweb-ferron/ferron/src/acme.rs`'s `HttpsClientForAcme`,
//! which builds the same `hyper_util` legacy client over `hyper-rustls`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use instant_acme::{BytesResponse, HttpClient};
use parking_lot::Mutex;

/// Overall per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// TCP dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// TLS handshake timeout.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Time allowed to receive response headers.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// What we observed about the most recently completed request, kept
/// around so the error-classification layer (which only sees whatever
/// `instant_acme::Error` chooses to expose) can fall back to the raw
/// HTTP status and `Retry-After` header.
#[derive(Debug, Clone, Default)]
pub struct TransportObservation {
    pub status: Option<u16>,
    pub retry_after: Option<String>,
}

/// `instant_acme::HttpClient` implementation with the transport
/// timeouts and logging spec.md §4.3 requires.
pub struct AcmeTransport {
    inner: HyperClient<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>,
    last_observation: Arc<Mutex<TransportObservation>>,
}

impl AcmeTransport {
    /// Builds a transport using the platform's native roots, with an
    /// IPv4-first dial policy so misrouted IPv6 networks don't stall
    /// connection setup.
    pub fn new() -> Self {
        let mut http_connector = HttpConnector::new();
        http_connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        http_connector.enforce_http(false);

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .expect("native root store")
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http_connector);

        Self {
            inner: HyperClient::builder(TokioExecutor::new()).build(https_connector),
            last_observation: Arc::new(Mutex::new(TransportObservation::default())),
        }
    }

    /// The most recently observed response's status and `Retry-After`
    /// header, used by `crate::acme::classify` as a fallback when
    /// `instant_acme::Error` doesn't expose the HTTP status directly.
    pub fn last_observation(&self) -> TransportObservation {
        self.last_observation.lock().clone()
    }
}

impl Default for AcmeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl AcmeTransport {
    #[cfg(test)]
    fn request_to(&self, uri: &str) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let req = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .expect("valid request");
        HttpClient::request(self, req)
    }
}

impl HttpClient for AcmeTransport {
    fn request(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Pin<Box<dyn Future<Output = Result<BytesResponse, instant_acme::Error>> + Send>> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let client = self.inner.clone();
        let observation = self.last_observation.clone();

        Box::pin(async move {
            let started = Instant::now();
            let result = tokio::time::timeout(REQUEST_TIMEOUT, client.request(req)).await;
            let elapsed = started.elapsed();

            match result {
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());

                    tracing::debug!(
                        %method,
                        %uri,
                        status,
                        ?elapsed,
                        retry_after = retry_after.as_deref(),
                        "ACME HTTP request completed"
                    );

                    *observation.lock() = TransportObservation {
                        status: Some(status),
                        retry_after,
                    };

                    Ok(BytesResponse::from(response))
                }
                Ok(Err(err)) => {
                    tracing::debug!(%method, %uri, ?elapsed, error = %err, "ACME HTTP request failed");
                    *observation.lock() = TransportObservation::default();
                    Err(instant_acme::Error::Http(Box::new(err)))
                }
                Err(_elapsed) => {
                    tracing::debug!(%method, %uri, ?elapsed, "ACME HTTP request timed out");
                    *observation.lock() = TransportObservation::default();
                    Err(instant_acme::Error::Http(Box::new(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("ACME request to {uri} timed out after {REQUEST_TIMEOUT:?}"),
                    ))))
                }
            }
        })
    }
}
