//! Scoped credential overrides
//!
//! Negative-path tests need a client that proposes a different cipher or
//! presents a different certificate for a few calls. The override scope
//! swaps those parameters in and puts the originals back when it is
//! dropped, including on early return and panic unwind.

use super::request::SecureRequestClient;
use super::tls::{ClientCredential, TlsError, TransportConfig};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

/// Access to the TLS parameters a client uses for its next request
pub trait ActiveTlsParams {
    fn tls_params(&self) -> &TransportConfig;

    fn tls_params_mut(&mut self) -> &mut TransportConfig;
}

impl ActiveTlsParams for SecureRequestClient {
    fn tls_params(&self) -> &TransportConfig {
        self.config()
    }

    fn tls_params_mut(&mut self) -> &mut TransportConfig {
        self.config_mut()
    }
}

/// Cipher list and client credential captured at scope entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialSnapshot {
    cipher_suites: Vec<String>,
    credential: Option<ClientCredential>,
}

impl CredentialSnapshot {
    pub fn capture(config: &TransportConfig) -> Self {
        CredentialSnapshot {
            cipher_suites: config.cipher_suites().to_vec(),
            credential: config.client_credential().cloned(),
        }
    }

    pub fn cipher_suites(&self) -> &[String] {
        &self.cipher_suites
    }

    pub fn client_certificate(&self) -> Option<&Path> {
        self.credential.as_ref().map(|c| c.certificate())
    }

    pub fn client_key(&self) -> Option<&Path> {
        self.credential.as_ref().map(|c| c.private_key())
    }

    fn restore(self, config: &mut TransportConfig) {
        // Captured from a valid config, so never empty
        if config.set_cipher_suites(self.cipher_suites).is_err() {
            tracing::error!("captured cipher list was empty, leaving override in place");
        }
        config.set_client_credential(self.credential);
    }
}

/// Guard that holds a client under overridden credentials
///
/// Derefs to the wrapped client. Dropping the guard writes the snapshot
/// back.
pub struct CredentialOverrideScope<'a, C: ActiveTlsParams> {
    client: &'a mut C,
    snapshot: Option<CredentialSnapshot>,
}

impl<'a, C: ActiveTlsParams> CredentialOverrideScope<'a, C> {
    /// Swap in `cipher_suites` and the `certificate`/`private_key` pair
    ///
    /// On error the client is left untouched.
    pub fn enter<S: AsRef<str>>(
        client: &'a mut C,
        cipher_suites: &[S],
        certificate: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
    ) -> Result<Self, TlsError> {
        let snapshot = CredentialSnapshot::capture(client.tls_params());
        let params = client.tls_params_mut();

        params.set_cipher_suites(cipher_suites.iter().map(|c| c.as_ref().to_string()).collect())?;
        params.set_client_credential(Some(ClientCredential::new(certificate, private_key)));

        tracing::debug!(
            ciphers = ?params.cipher_suites(),
            "credential override entered"
        );

        Ok(CredentialOverrideScope {
            client,
            snapshot: Some(snapshot),
        })
    }

    /// Values that will be restored on drop
    pub fn snapshot(&self) -> Option<&CredentialSnapshot> {
        self.snapshot.as_ref()
    }
}

impl<C: ActiveTlsParams> Deref for CredentialOverrideScope<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.client
    }
}

impl<C: ActiveTlsParams> DerefMut for CredentialOverrideScope<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.client
    }
}

impl<C: ActiveTlsParams> Drop for CredentialOverrideScope<'_, C> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            snapshot.restore(self.client.tls_params_mut());
            tracing::debug!("credential override restored");
        }
    }
}

/// Run `f` with overridden credentials, restoring them afterwards
pub fn with_credentials<C, S, F, R>(
    client: &mut C,
    cipher_suites: &[S],
    certificate: impl Into<PathBuf>,
    private_key: impl Into<PathBuf>,
    f: F,
) -> Result<R, TlsError>
where
    C: ActiveTlsParams,
    S: AsRef<str>,
    F: FnOnce(&mut C) -> R,
{
    let mut scope = CredentialOverrideScope::enter(client, cipher_suites, certificate, private_key)?;
    Ok(f(&mut *scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::ciphers;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    fn client() -> SecureRequestClient {
        SecureRequestClient::new(TransportConfig::default().with_credential("client.cert", "client.key"))
    }

    #[test]
    fn test_scope_overrides_and_restores() {
        let mut client = client();
        let before = client.config().clone();

        {
            let scope = CredentialOverrideScope::enter(
                &mut client,
                &[ciphers::ECDHE_RSA_AES128_GCM_SHA256],
                "other.cert",
                "other.key",
            )
            .unwrap();

            let params = scope.tls_params();
            assert_eq!(params.cipher_suites(), ["ECDHE-RSA-AES128-GCM-SHA256"]);
            assert_eq!(
                params.client_credential().unwrap().certificate(),
                Path::new("other.cert")
            );
            assert_eq!(
                scope.snapshot().unwrap().client_certificate(),
                Some(Path::new("client.cert"))
            );
        }

        assert_eq!(client.config(), &before);
    }

    #[test]
    fn test_restores_missing_credential() {
        let mut client = SecureRequestClient::new(TransportConfig::default());

        with_credentials(&mut client, &["AES256-GCM-SHA384"], "a.cert", "a.key", |c| {
            assert!(c.tls_params().client_credential().is_some());
        })
        .unwrap();

        assert!(client.config().client_credential().is_none());
        assert_eq!(client.config().cipher_suites().len(), ciphers::DEFAULT.len());
    }

    #[test]
    fn test_restores_on_early_return() {
        fn body(client: &mut SecureRequestClient) -> Result<(), TlsError> {
            let _scope = CredentialOverrideScope::enter(client, &["AES256-GCM-SHA384"], "x.cert", "x.key")?;
            Err(TlsError::InvalidConfig("bail".to_string()))
        }

        let mut client = client();
        let before = client.config().clone();
        assert!(body(&mut client).is_err());
        assert_eq!(client.config(), &before);
    }

    #[test]
    fn test_restores_on_panic() {
        let mut client = client();
        let before = client.config().clone();

        let result = catch_unwind(AssertUnwindSafe(|| {
            with_credentials(&mut client, &["AES256-GCM-SHA384"], "x.cert", "x.key", |_| {
                panic!("scope body failed");
            })
        }));

        assert!(result.is_err());
        assert_eq!(client.config(), &before);
    }

    #[test]
    fn test_empty_cipher_list_leaves_client_untouched() {
        let mut client = client();
        let before = client.config().clone();
        let empty: [&str; 0] = [];

        assert!(CredentialOverrideScope::enter(&mut client, &empty, "x.cert", "x.key").is_err());
        assert_eq!(client.config(), &before);
    }
}
