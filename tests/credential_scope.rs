//! Credential overrides on a client talking to a live listener

mod common;

use common::{cert, client_config, listener_config, start};
use sastls::http::credential_scope::{with_credentials, ActiveTlsParams};
use sastls::http::request::SecureRequestClient;
use sastls::http::tls::{ciphers, ProfileKind};
use sastls::http::{CredentialOverrideScope, StatusClass};

#[test]
fn test_override_presents_revoked_certificate() {
    let listener = start(listener_config(ProfileKind::Rsa).with_crl_index(cert("crl/index.txt")));
    let url = format!("{}/v1.2/registration", listener.base_url());
    let mut client = SecureRequestClient::new(client_config());
    let before = client.config().clone();

    {
        let scope = CredentialOverrideScope::enter(
            &mut client,
            &[ciphers::AES128_GCM_SHA256],
            cert("revoked_client.cert"),
            cert("revoked_client.key"),
        )
        .unwrap();

        let err = scope.post(&url, None).unwrap_err();
        assert_eq!(err.status_class(), StatusClass::TransportError);
    }

    assert_eq!(client.config(), &before);
    assert!(client.post(&url, None).unwrap().is_success());
}

#[test]
fn test_override_narrows_cipher() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let url = format!("{}/v1.2/registration", listener.base_url());
    let mut client = SecureRequestClient::new(client_config());

    // ECDSA-only proposal cannot match the RSA chain
    let result = with_credentials(
        &mut client,
        &[ciphers::ECDHE_ECDSA_AES128_GCM_SHA256],
        cert("client.cert"),
        cert("client.key"),
        |client| client.post(&url, None),
    )
    .unwrap();
    assert!(result.is_err());

    assert_eq!(client.tls_params().cipher_suites().len(), ciphers::DEFAULT.len());
    assert!(client.post(&url, None).unwrap().is_success());
}
