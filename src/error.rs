//! Error types for acmecore

use std::time::SystemTime;

use thiserror::Error;

use crate::store::StoreError;

/// Result type for acmecore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error taxonomy surfaced to callers of the handshake entry point
/// and the administrative operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Host policy rejection; do not retry.
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),

    /// Rate-limit fast-fail; safe to retry after `until`.
    #[error("rate limited until {until:?}")]
    RateLimited {
        /// Earliest time a retry should be attempted.
        until: SystemTime,
    },

    /// Permanent issuer-side rejection. Do not retry without a
    /// configuration change.
    #[error("ACME request invalid: {0}")]
    AcmeInvalid(String),

    /// Timeout, network error, or 5xx from the issuer. Safe to retry.
    #[error("ACME request failed transiently: {0}")]
    AcmeTransient(String),

    /// The issuer offered only challenge types this client cannot solve.
    #[error("no supported challenge type offered")]
    NoSupportedChallenge,

    /// The certificate was issued but could not be durably persisted.
    /// The certificate is still usable for the current handshake.
    #[error("certificate issued but not persisted: {0}")]
    PersistenceCritical(String),

    /// Persistent store adapter error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything not covered above.
    #[error("fatal error: {0}")]
    Fatal(String),
}

impl Error {
    /// Whether retrying the same request without any configuration
    /// change is expected to succeed eventually.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AcmeTransient(_) | Error::RateLimited { .. })
    }
}
