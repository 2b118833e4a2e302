//! TLS configuration
//!
//! [`TransportConfig`] is the client-side parameter bundle shared by the
//! request client and the handshake probe. It is a plain value: the
//! `with_*` methods return modified copies and never touch the original.

use super::{Result, TlsError};
use foreign_types::ForeignTypeRef;
use openssl::ssl::{
    SslCipher, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode, SslVersion,
};
use openssl::stack::StackRef;
use std::fmt;
use std::path::{Path, PathBuf};

/// Cipher suite identifiers (OpenSSL names)
pub mod ciphers {
    pub const AES128_GCM_SHA256: &str = "AES128-GCM-SHA256";
    pub const AES256_GCM_SHA384: &str = "AES256-GCM-SHA384";
    pub const ECDHE_ECDSA_AES128_GCM_SHA256: &str = "ECDHE-ECDSA-AES128-GCM-SHA256";
    pub const ECDHE_ECDSA_AES256_GCM_SHA384: &str = "ECDHE-ECDSA-AES256-GCM-SHA384";
    pub const ECDHE_RSA_AES128_GCM_SHA256: &str = "ECDHE-RSA-AES128-GCM-SHA256";

    /// Client proposal used unless a test narrows it
    pub const DEFAULT: [&str; 5] = [
        AES128_GCM_SHA256,
        AES256_GCM_SHA384,
        ECDHE_ECDSA_AES128_GCM_SHA256,
        ECDHE_ECDSA_AES256_GCM_SHA384,
        ECDHE_RSA_AES128_GCM_SHA256,
    ];

    /// Ciphers accepted by an RSA-chain endpoint
    pub const RSA_PROFILE: [&str; 3] = [AES128_GCM_SHA256, AES256_GCM_SHA384, ECDHE_RSA_AES128_GCM_SHA256];

    /// Ciphers accepted by an ECDSA-chain endpoint
    pub const ECDSA_PROFILE: [&str; 2] = [ECDHE_ECDSA_AES128_GCM_SHA256, ECDHE_ECDSA_AES256_GCM_SHA384];
}

/// Default CA certificate location
pub const DEFAULT_TRUST_ANCHOR: &str = "certs/ca.cert";

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Parse TLS version from string (case-insensitive)
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }

    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Map a negotiated OpenSSL version back, if it is one we model
    pub fn from_openssl(version: SslVersion) -> Option<Self> {
        [
            TlsVersion::Tls10,
            TlsVersion::Tls11,
            TlsVersion::Tls12,
            TlsVersion::Tls13,
        ]
        .into_iter()
        .find(|v| v.to_openssl_version() == version)
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate chain file and private key file
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialPair {
    certificate: PathBuf,
    private_key: PathBuf,
}

/// Credential a client presents for mutual TLS
pub type ClientCredential = CredentialPair;

impl CredentialPair {
    pub fn new(certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        CredentialPair {
            certificate: certificate.into(),
            private_key: private_key.into(),
        }
    }

    pub fn certificate(&self) -> &Path {
        &self.certificate
    }

    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// Load the chain and key into a context and check that they match
    pub(crate) fn apply(&self, builder: &mut SslContextBuilder) -> Result<()> {
        builder
            .set_certificate_chain_file(&self.certificate)
            .map_err(|e| {
                TlsError::Certificate(format!(
                    "failed to load certificate {}: {}",
                    self.certificate.display(),
                    e
                ))
            })?;
        builder
            .set_private_key_file(&self.private_key, SslFiletype::PEM)
            .map_err(|e| {
                TlsError::Certificate(format!(
                    "failed to load private key {}: {}",
                    self.private_key.display(),
                    e
                ))
            })?;
        builder.check_private_key().map_err(|e| {
            TlsError::Certificate(format!(
                "private key {} does not match certificate {}: {}",
                self.private_key.display(),
                self.certificate.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// Pin a context to exactly one protocol version
pub(crate) fn restrict_protocol(builder: &mut SslContextBuilder, version: TlsVersion) -> Result<()> {
    builder.set_min_proto_version(Some(version.to_openssl_version()))?;
    builder.set_max_proto_version(Some(version.to_openssl_version()))?;
    Ok(())
}

extern "C" {
    fn SSL_CTX_get_ciphers(ctx: *const openssl_sys::SSL_CTX) -> *mut openssl_sys::stack_st_SSL_CIPHER;
}

/// Suites a context will propose at `version`, in preference order
fn installed_ciphers(builder: &SslContextBuilder, version: TlsVersion) -> Vec<String> {
    let stack = unsafe { SSL_CTX_get_ciphers(builder.as_ptr()) };
    if stack.is_null() {
        return Vec::new();
    }
    let stack: &StackRef<SslCipher> = unsafe { StackRef::from_ptr(stack) };

    // The context keeps TLS 1.3 suites and the legacy list in one stack
    let tls13 = version == TlsVersion::Tls13;
    stack
        .iter()
        .filter(|cipher| (cipher.version() == "TLSv1.3") == tls13)
        .map(|cipher| cipher.name().to_string())
        .collect()
}

/// Install an ordered cipher proposal
///
/// TLS 1.3 suites live in a separate OpenSSL list; the legacy list is
/// used for everything older, with the TLS 1.3 list cleared. OpenSSL
/// drops unknown names and expands keywords such as `HIGH`, so the
/// installed list is read back and must equal `cipher_suites` entry for
/// entry.
pub(crate) fn restrict_ciphers(
    builder: &mut SslContextBuilder,
    cipher_suites: &[String],
    version: TlsVersion,
) -> Result<()> {
    let joined = cipher_suites.join(":");
    let applied = match version {
        TlsVersion::Tls13 => builder.set_ciphersuites(&joined),
        _ => builder
            .set_cipher_list(&joined)
            .and_then(|_| builder.set_ciphersuites("")),
    };
    applied.map_err(|e| TlsError::InvalidConfig(format!("cipher list {:?} rejected: {}", joined, e)))?;

    let installed = installed_ciphers(builder, version);
    if installed != cipher_suites {
        return Err(TlsError::InvalidConfig(format!(
            "cipher list {:?} installed as {:?}",
            joined, installed
        )));
    }
    Ok(())
}

/// Client-side TLS parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    protocol_version: TlsVersion,
    cipher_suites: Vec<String>,
    trust_anchor: PathBuf,
    client_credential: Option<ClientCredential>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            protocol_version: TlsVersion::Tls12,
            cipher_suites: ciphers::DEFAULT.iter().map(|c| c.to_string()).collect(),
            trust_anchor: PathBuf::from(DEFAULT_TRUST_ANCHOR),
            client_credential: None,
        }
    }
}

impl TransportConfig {
    pub fn protocol_version(&self) -> TlsVersion {
        self.protocol_version
    }

    /// Ordered cipher proposal; never empty
    pub fn cipher_suites(&self) -> &[String] {
        &self.cipher_suites
    }

    pub fn trust_anchor(&self) -> &Path {
        &self.trust_anchor
    }

    pub fn client_credential(&self) -> Option<&ClientCredential> {
        self.client_credential.as_ref()
    }

    pub fn with_protocol_version(mut self, version: TlsVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Copy with a different cipher proposal
    pub fn with_cipher_suites<I, S>(mut self, cipher_suites: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_cipher_suites(cipher_suites.into_iter().map(Into::into).collect())?;
        Ok(self)
    }

    pub fn with_trust_anchor(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_anchor = path.into();
        self
    }

    /// Copy that presents the given client certificate and key
    pub fn with_credential(&self, certificate: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        let mut copy = self.clone();
        copy.client_credential = Some(ClientCredential::new(certificate, private_key));
        copy
    }

    /// Copy that presents no client certificate
    pub fn without_credential(&self) -> Self {
        let mut copy = self.clone();
        copy.client_credential = None;
        copy
    }

    /// Replace the cipher proposal in place
    pub fn set_cipher_suites(&mut self, cipher_suites: Vec<String>) -> Result<()> {
        if cipher_suites.is_empty() {
            return Err(TlsError::InvalidConfig("cipher suite list is empty".to_string()));
        }
        self.cipher_suites = cipher_suites;
        Ok(())
    }

    /// Replace the client credential in place
    pub fn set_client_credential(&mut self, credential: Option<ClientCredential>) {
        self.client_credential = credential;
    }

    /// Build a client context
    ///
    /// The context pins the protocol version, proposes exactly the
    /// configured ciphers in order, trusts only the trust anchor and
    /// presents the client credential when one is set.
    pub fn connector(&self) -> Result<SslContext> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_client())?;

        restrict_protocol(&mut builder, self.protocol_version)?;
        restrict_ciphers(&mut builder, &self.cipher_suites, self.protocol_version)?;

        builder.set_ca_file(&self.trust_anchor).map_err(|e| {
            TlsError::Certificate(format!(
                "failed to load trust anchor {}: {}",
                self.trust_anchor.display(),
                e
            ))
        })?;
        builder.set_verify(SslVerifyMode::PEER);

        if let Some(credential) = &self.client_credential {
            credential.apply(&mut builder)?;
        }

        Ok(builder.build())
    }
}

/// Which server credential chain a cipher implies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProfileKind {
    #[default]
    Rsa,
    Ecdsa,
}

impl ProfileKind {
    /// ECDSA ciphers need the ECDSA chain; everything else uses RSA
    pub fn for_cipher(cipher: &str) -> Self {
        if cipher.contains("ECDSA") {
            ProfileKind::Ecdsa
        } else {
            ProfileKind::Rsa
        }
    }

    /// Ciphers an endpoint with this profile accepts
    pub fn allowed_ciphers(&self) -> &'static [&'static str] {
        match self {
            ProfileKind::Rsa => &ciphers::RSA_PROFILE,
            ProfileKind::Ecdsa => &ciphers::ECDSA_PROFILE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileKind::Rsa => "rsa",
            ProfileKind::Ecdsa => "ecdsa",
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base URLs of an endpoint serving both credential chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPair {
    rsa: String,
    ecdsa: String,
}

impl EndpointPair {
    pub fn new(rsa: impl Into<String>, ecdsa: impl Into<String>) -> Self {
        EndpointPair {
            rsa: rsa.into(),
            ecdsa: ecdsa.into(),
        }
    }

    pub fn for_profile(&self, profile: ProfileKind) -> &str {
        match profile {
            ProfileKind::Rsa => &self.rsa,
            ProfileKind::Ecdsa => &self.ecdsa,
        }
    }

    /// Base URL to use when proposing `cipher`
    pub fn for_cipher(&self, cipher: &str) -> &str {
        self.for_profile(ProfileKind::for_cipher(cipher))
    }
}
