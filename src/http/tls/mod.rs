//! TLS support for conformance testing
//!
//! This module holds everything that touches OpenSSL directly:
//!
//! 1. `TransportConfig` defines the client parameters (version, ordered
//!    ciphers, trust anchor, client credential)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O,
//!    so the HTTP code runs unchanged over TLS
//! 3. `HandshakeProbe` drives a single handshake with narrowed parameters
//!    and records every state transition in a `HandshakeTrace`
//! 4. `RevocationAwareTlsListener` is a mutual-TLS endpoint that enforces
//!    a cipher profile and optional CRLs
//!
//! # Examples
//!
//! ```no_run
//! use sastls::http::tls::{ciphers, ClientCredential, HandshakeProbe, HandshakeTrace, TlsVersion};
//!
//! let mut probe = HandshakeProbe::new("certs/ca.cert", HandshakeTrace::new());
//! let credential = ClientCredential::new("certs/client.cert", "certs/client.key");
//! let outcome = probe.attempt(
//!     "localhost:9000",
//!     &credential,
//!     &[ciphers::AES128_GCM_SHA256],
//!     TlsVersion::Tls12,
//! );
//! assert!(outcome.succeeded());
//! outcome.verify_event_ordering().unwrap();
//! ```

pub mod cert;
pub mod config;
pub mod conformance;
pub mod handshake;
pub mod listener;
pub mod revocation;
pub mod session;
pub mod trace;

pub use cert::CertInfo;
pub use config::{
    ciphers, ClientCredential, CredentialPair, EndpointPair, ProfileKind, TlsVersion,
    TransportConfig,
};
pub use conformance::AssertionFailure;
pub use handshake::{HandshakeOutcome, HandshakeProbe, PeerIdentity, ProbeState};
pub use listener::{JsonRoutes, ListenerConfig, RequestHandler, RevocationAwareTlsListener};
pub use revocation::{RevocationSet, ValidationError};
pub use session::TlsSessionOps;
pub use trace::{HandshakeEvent, HandshakeTrace};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {message}")]
    Handshake { message: String, code: Option<u64> },
}

impl TlsError {
    /// Numeric code of the underlying failure, when there is one
    pub fn code(&self) -> Option<u64> {
        match self {
            TlsError::OpenSsl(stack) => stack.errors().first().map(|e| e.code() as u64),
            TlsError::Io(e) => e.raw_os_error().map(|c| c as u64),
            TlsError::Handshake { code, .. } => *code,
            _ => None,
        }
    }
}
