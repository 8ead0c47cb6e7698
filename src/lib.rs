//! acmecore
//!
//! Automated TLS certificate lifecycle management against an ACME
//! (RFC 8555) issuer: three-tier caching (memory, durable store,
//! remote issuer), HTTP-01 and TLS-ALPN-01 challenge fulfillment, a
//! rate-limit ledger, a host allow-list, and an issuance orchestrator
//! with RAII-guarded challenge cleanup and an at-most-once persistence
//! invariant.
//!
//! [`Manager`] is the entry point most embedders want; the individual
//! components are exported for callers who need finer-grained control.

pub mod acme;
pub mod cache;
pub mod challenge;
pub mod config;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod orchestrator;
pub mod policy;
pub mod ratelimit;
pub mod store;

pub use acme::{AcmeClient, AcmeOperations};
pub use cache::{CertCache, ParsedCertificate};
pub use challenge::{ChallengeResponder, HttpResponse};
pub use config::{AcmeManagerConfig, ConfigLoader};
pub use error::{Error, Result};
pub use handshake::{ClientHelloInfo, HandshakeResolver};
pub use manager::Manager;
pub use orchestrator::Orchestrator;
pub use policy::{HostPolicy, PolicyDecision};
pub use ratelimit::RateLimitLedger;
pub use store::{CertificateRecord, CertificateStatus, CertificateStore, InMemoryStore, StoreError};
