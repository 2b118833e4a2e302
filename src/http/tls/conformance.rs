//! Conformance assertions over handshake probes
//!
//! Each assertion drives a [`HandshakeProbe`] and compares what happened
//! against the expected protocol behavior, returning an
//! [`AssertionFailure`] that says exactly which expectation broke.

use super::config::{ciphers, ClientCredential, TlsVersion};
use super::handshake::{HandshakeOutcome, HandshakeProbe};
use crate::http::credential_scope::{with_credentials, ActiveTlsParams};
use crate::http::request::JsonTransport;
use serde_json::Value;

/// A conformance expectation that did not hold
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssertionFailure {
    #[error("handshake failed unexpectedly: {diagnostic}")]
    UnexpectedFailure { diagnostic: String },

    #[error("handshake succeeded unexpectedly (cipher {})", .cipher.as_deref().unwrap_or("unknown"))]
    UnexpectedSuccess { cipher: Option<String> },

    #[error("negotiated {actual:?}, expected {expected}")]
    VersionMismatch { expected: TlsVersion, actual: Option<TlsVersion> },

    #[error("negotiated cipher {actual:?} is not one of {proposed:?}")]
    CipherMismatch { proposed: Vec<String>, actual: Option<String> },

    #[error("event ordering violated: {0}")]
    EventOrdering(String),

    #[error("expected HTTP 403 after unexpected handshake success, got {status:?}")]
    UnexpectedStatus { status: Option<u16> },

    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// Handshake with exactly `cipher_suites` over TLS 1.2 must succeed
///
/// The negotiated version must be TLS 1.2, the negotiated cipher one of
/// the proposed suites, and cipher negotiation must be logged before
/// completion.
pub fn assert_handshake_succeeds(
    probe: &mut HandshakeProbe,
    host_port: &str,
    cipher_suites: &[&str],
    credential: &ClientCredential,
) -> Result<HandshakeOutcome, AssertionFailure> {
    let outcome = probe.attempt(host_port, credential, cipher_suites, TlsVersion::Tls12);

    if !outcome.succeeded() {
        return Err(AssertionFailure::UnexpectedFailure {
            diagnostic: outcome.failure_diagnostic().unwrap_or_default().to_string(),
        });
    }

    if outcome.negotiated_protocol_version() != Some(TlsVersion::Tls12) {
        return Err(AssertionFailure::VersionMismatch {
            expected: TlsVersion::Tls12,
            actual: outcome.negotiated_protocol_version(),
        });
    }

    let negotiated = outcome.negotiated_cipher();
    if !negotiated.is_some_and(|c| cipher_suites.contains(&c)) {
        return Err(AssertionFailure::CipherMismatch {
            proposed: cipher_suites.iter().map(|c| c.to_string()).collect(),
            actual: negotiated.map(str::to_string),
        });
    }

    outcome.verify_event_ordering()?;
    Ok(outcome)
}

/// Handshake must fail
///
/// Defaults to `AES128-GCM-SHA256` over TLS 1.2.
pub fn assert_handshake_fails(
    probe: &mut HandshakeProbe,
    host_port: &str,
    credential: &ClientCredential,
    cipher: Option<&str>,
    version: Option<TlsVersion>,
) -> Result<HandshakeOutcome, AssertionFailure> {
    let cipher = cipher.unwrap_or(ciphers::AES128_GCM_SHA256);
    let version = version.unwrap_or(TlsVersion::Tls12);

    let outcome = probe.attempt(host_port, credential, &[cipher], version);
    if outcome.succeeded() {
        return Err(AssertionFailure::UnexpectedSuccess {
            cipher: outcome.negotiated_cipher().map(str::to_string),
        });
    }

    tracing::debug!(
        diagnostic = outcome.failure_diagnostic().unwrap_or_default(),
        "handshake failed as expected"
    );
    Ok(outcome)
}

/// Handshake must fail, or the request it allows must be refused with 403
///
/// Some endpoints accept the TLS session and reject the credential at the
/// HTTP layer instead. When the probe succeeds, `url` is requested through
/// `client` with `cipher` and `credential` swapped in for the duration of
/// the call.
#[allow(clippy::too_many_arguments)]
pub fn assert_handshake_failure_or_http_403<C>(
    probe: &mut HandshakeProbe,
    client: &mut C,
    host_port: &str,
    url: &str,
    body: Option<&Value>,
    credential: &ClientCredential,
    cipher: Option<&str>,
    version: Option<TlsVersion>,
) -> Result<(), AssertionFailure>
where
    C: ActiveTlsParams + JsonTransport,
{
    let cipher = cipher.unwrap_or(ciphers::AES128_GCM_SHA256);
    let version = version.unwrap_or(TlsVersion::Tls12);

    let outcome = probe.attempt(host_port, credential, &[cipher], version);
    if !outcome.succeeded() {
        return Ok(());
    }

    tracing::info!(url, cipher, "handshake succeeded, expecting HTTP 403");

    let result = with_credentials(
        client,
        &[cipher],
        credential.certificate(),
        credential.private_key(),
        |client| client.post(url, body),
    )
    .map_err(|e| AssertionFailure::RequestFailed(e.to_string()))?;

    match result {
        Ok(outcome) if outcome.http_status_code() == Some(403) => Ok(()),
        Ok(outcome) => Err(AssertionFailure::UnexpectedStatus {
            status: outcome.http_status_code(),
        }),
        Err(e) => Err(AssertionFailure::RequestFailed(e.to_string())),
    }
}
