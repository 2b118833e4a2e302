//! Handshake probe and conformance assertions against a live listener

mod common;

use common::{cert, good_client, listener_config, revoked_client, start};
use sastls::http::tls::conformance::{assert_handshake_fails, assert_handshake_succeeds};
use sastls::http::tls::{
    ciphers, AssertionFailure, ClientCredential, HandshakeProbe, HandshakeTrace, ProbeState,
    ProfileKind, TlsVersion,
};

fn probe() -> HandshakeProbe {
    HandshakeProbe::new(cert("ca.cert"), HandshakeTrace::new())
}

fn host_port(listener: &sastls::http::tls::RevocationAwareTlsListener) -> String {
    format!("localhost:{}", listener.local_addr().port())
}

#[test]
fn test_rsa_handshake_records_ordered_events() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    let outcome = probe.attempt(
        &host_port(&listener),
        &good_client(),
        &[ciphers::AES128_GCM_SHA256],
        TlsVersion::Tls12,
    );

    assert!(outcome.succeeded(), "{:?}", outcome.failure_diagnostic());
    assert_eq!(outcome.state(), ProbeState::Established);
    assert_eq!(probe.state(), ProbeState::Established);
    assert_eq!(outcome.negotiated_protocol_version(), Some(TlsVersion::Tls12));
    assert_eq!(outcome.negotiated_cipher(), Some("AES128-GCM-SHA256"));

    let cipher_at = outcome.cipher_negotiation_index().unwrap();
    let done_at = outcome.completion_index().unwrap();
    assert!(cipher_at < done_at);
    outcome.verify_event_ordering().unwrap();

    let indices: Vec<usize> = outcome.event_log().iter().map(|e| e.sequence_index).collect();
    assert_eq!(indices, (0..indices.len()).collect::<Vec<_>>());
    assert_eq!(probe.trace().len(), outcome.event_log().len());

    let leaf = outcome.peer_chain().iter().find(|p| p.depth == 0).unwrap();
    assert_eq!(leaf.common_name, "localhost");
    assert_eq!(leaf.serial, "1001");
    assert!(leaf.preverified);
}

#[test]
fn test_assert_succeeds_for_each_rsa_cipher() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    for cipher in ciphers::RSA_PROFILE {
        let outcome =
            assert_handshake_succeeds(&mut probe, &host_port(&listener), &[cipher], &good_client())
                .unwrap();
        assert_eq!(outcome.negotiated_cipher(), Some(cipher));
    }
}

#[test]
fn test_ecdsa_profile() {
    let listener = start(listener_config(ProfileKind::Ecdsa));
    let mut probe = probe();

    let outcome = assert_handshake_succeeds(
        &mut probe,
        &host_port(&listener),
        &[ciphers::ECDHE_ECDSA_AES128_GCM_SHA256],
        &good_client(),
    )
    .unwrap();
    assert_eq!(outcome.peer_chain().iter().find(|p| p.depth == 0).unwrap().serial, "1002");

    // RSA-only cipher against the ECDSA chain
    let outcome = assert_handshake_fails(
        &mut probe,
        &host_port(&listener),
        &good_client(),
        Some(ciphers::AES128_GCM_SHA256),
        None,
    )
    .unwrap();
    assert!(outcome.negotiated_cipher().is_none());
    assert!(outcome
        .failure_diagnostic()
        .unwrap()
        .starts_with("handshake failed"));
}

#[test]
fn test_cipher_outside_profile_negotiates_nothing() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    let outcome = probe.attempt(
        &host_port(&listener),
        &good_client(),
        &[ciphers::ECDHE_ECDSA_AES256_GCM_SHA384],
        TlsVersion::Tls12,
    );
    assert!(!outcome.succeeded());
    assert!(outcome.negotiated_cipher().is_none());
    assert!(outcome.negotiated_protocol_version().is_none());
}

#[test]
fn test_inexact_cipher_proposal_is_configuration_failure() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    let outcome = probe.attempt(
        &host_port(&listener),
        &good_client(),
        &[ciphers::AES128_GCM_SHA256, "HIGH"],
        TlsVersion::Tls12,
    );
    assert!(!outcome.succeeded());
    assert!(outcome.event_log().is_empty());
    assert!(outcome
        .failure_diagnostic()
        .unwrap()
        .starts_with("invalid client configuration"));
}

#[test]
fn test_unsupported_version_fails() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    // A valid TLS 1.3 proposal reaches the listener, which only speaks TLS 1.2
    let outcome = assert_handshake_fails(
        &mut probe,
        &host_port(&listener),
        &good_client(),
        Some("TLS_AES_128_GCM_SHA256"),
        Some(TlsVersion::Tls13),
    )
    .unwrap();
    assert!(outcome
        .failure_diagnostic()
        .unwrap()
        .starts_with("handshake failed"));
    assert!(!outcome.event_log().is_empty());
    assert!(outcome.negotiated_cipher().is_none());
    assert_eq!(probe.state(), ProbeState::Failed);
}

#[test]
fn test_revoked_client_is_rejected_when_crl_loaded() {
    let listener = start(listener_config(ProfileKind::Rsa).with_crl_index(cert("crl/index.txt")));
    assert_eq!(listener.revocations().len(), 1);
    let mut probe = probe();

    let outcome = assert_handshake_fails(
        &mut probe,
        &host_port(&listener),
        &revoked_client(),
        None,
        None,
    )
    .unwrap();
    assert!(outcome
        .failure_diagnostic()
        .unwrap()
        .starts_with("handshake failed"));

    assert_handshake_succeeds(
        &mut probe,
        &host_port(&listener),
        &[ciphers::AES128_GCM_SHA256],
        &good_client(),
    )
    .unwrap();
}

#[test]
fn test_revoked_client_accepted_without_crl() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    let err = assert_handshake_fails(&mut probe, &host_port(&listener), &revoked_client(), None, None)
        .unwrap_err();
    assert!(matches!(err, AssertionFailure::UnexpectedSuccess { .. }));
}

#[test]
fn test_mismatched_key_is_configuration_failure() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let mut probe = probe();

    // Certificate and key from different pairs
    let stranger = ClientCredential::new(cert("server.cert"), cert("server-ecc.key"));
    let outcome = probe.attempt(
        &host_port(&listener),
        &stranger,
        &[ciphers::AES128_GCM_SHA256],
        TlsVersion::Tls12,
    );
    assert!(!outcome.succeeded());
    assert!(outcome
        .failure_diagnostic()
        .unwrap()
        .starts_with("invalid client configuration"));
}
