//! Persistent store adapter (component B)
//!
//! A contract over an external durable store for certificate records and
//! opaque ACME cache entries (account credentials, per-order artifacts).
//! The embedding gateway supplies a real implementation; this crate ships
//! `InMemoryStore` as a reference implementation and test double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by a `CertificateStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested certificate or cache entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// `create` was called for a domain that already has a record.
    #[error("certificate record already exists for domain: {0}")]
    AlreadyExists(String),

    /// Backend-specific failure (I/O, serialization, connection loss…).
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Certificate lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Active,
    Expired,
    Revoked,
}

/// The persisted unit: one record per domain.
///
/// Invariants: `expires_at > issued_at`; exactly one active record per
/// domain at any time; `status == Revoked` implies `revoked_at.is_some()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: String,
    pub domain: String,
    /// Leaf certificate, PEM-encoded.
    pub cert_pem: String,
    /// Intermediate chain, PEM-encoded (leaf excluded).
    pub chain_pem: String,
    /// Private key, PEM-encoded.
    pub key_pem: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub issuer: String,
    pub serial: String,
    pub status: CertificateStatus,
    pub revoked_at: Option<i64>,
    pub revoke_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CertificateRecord {
    /// Full chain PEM: the leaf followed by the intermediates, as it
    /// would be presented to a TLS peer.
    pub fn full_chain_pem(&self) -> String {
        format!("{}{}", self.cert_pem, self.chain_pem)
    }
}

/// The persistent store contract consumed by the orchestrator and the
/// handshake entry point. Certificate operations and the opaque ACME
/// cache are namespaced separately so a miss on one cannot collide
/// with the other.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Fetches the certificate record for `domain`, if any.
    async fn get_by_domain(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError>;

    /// Creates a new record. Returns `StoreError::AlreadyExists` if a
    /// record already exists for `record.domain`.
    async fn create(&self, record: CertificateRecord) -> Result<(), StoreError>;

    /// Updates an existing record in place, replacing every field.
    /// Returns `StoreError::NotFound` if no record exists for the id.
    async fn update(&self, record: CertificateRecord) -> Result<(), StoreError>;

    /// Deletes a record by id. Returns `StoreError::NotFound` if absent.
    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;

    /// Reads an opaque ACME cache entry.
    async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Writes an opaque ACME cache entry.
    async fn cache_put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Deletes an opaque ACME cache entry.
    async fn cache_delete(&self, key: &str) -> Result<(), StoreError>;
}

/// A reference, process-local `CertificateStore` implementation backed
/// by nothing but a guarded `HashMap`. Useful for tests and as a
/// degraded-mode default when no durable backend is configured; not
/// suitable for production use since it loses all state on restart.
#[derive(Default)]
pub struct InMemoryStore {
    certs: RwLock<HashMap<String, CertificateRecord>>,
    cache: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CertificateStore for InMemoryStore {
    async fn get_by_domain(&self, domain: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.certs.read().get(domain).cloned())
    }

    async fn create(&self, record: CertificateRecord) -> Result<(), StoreError> {
        let mut certs = self.certs.write();
        if certs.contains_key(&record.domain) {
            return Err(StoreError::AlreadyExists(record.domain));
        }
        certs.insert(record.domain.clone(), record);
        Ok(())
    }

    async fn update(&self, record: CertificateRecord) -> Result<(), StoreError> {
        let mut certs = self.certs.write();
        if !certs.contains_key(&record.domain) {
            return Err(StoreError::NotFound(record.domain));
        }
        certs.insert(record.domain.clone(), record);
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let mut certs = self.certs.write();
        let domain = certs
            .values()
            .find(|r| r.id == id)
            .map(|r| r.domain.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        certs.remove(&domain);
        Ok(())
    }

    async fn cache_get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.cache.read().get(key).cloned())
    }

    async fn cache_put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.cache.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn cache_delete(&self, key: &str) -> Result<(), StoreError> {
        self.cache.write().remove(key);
        Ok(())
    }
}
