//! Certificate handling and parsing
//!
//! Identity extraction from X.509 certificates for logging and
//! assertions, plus the serial formatting shared with the revocation set.

use super::{Result, TlsError};
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::ssl::SslRef;
use openssl::x509::{X509NameRef, X509Ref, X509};
use std::path::Path;

/// Certificate information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Certificate subject (Common Name)
    pub subject: String,
    /// Certificate issuer (Common Name)
    pub issuer: String,
    /// Serial number, upper-case hex
    pub serial: String,
    /// Subject Alternative Names (DNS names and IP addresses)
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    /// Extract certificate information from an X.509 certificate
    pub fn from_x509_ref(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            serial: serial_hex(cert).unwrap_or_else(|_| "<undef>".to_string()),
            subject_alt_names: subject_alt_names(cert),
        }
    }
}

/// Common Name of an X509 name, or `<undef>`
pub fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
        .unwrap_or_else(|| "<undef>".to_string())
}

/// Serial number as upper-case hex without leading zeros
pub fn serial_hex(cert: &X509Ref) -> std::result::Result<String, ErrorStack> {
    Ok(cert.serial_number().to_bn()?.to_hex_str()?.to_string())
}

fn subject_alt_names(cert: &X509Ref) -> Vec<String> {
    let mut names = Vec::new();

    if let Some(san_ext) = cert.subject_alt_names() {
        for name in san_ext {
            if let Some(dns) = name.dnsname() {
                names.push(format!("DNS:{}", dns));
            } else if let Some(ip) = name.ipaddress() {
                match ip.len() {
                    4 => names.push(format!("IP:{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3])),
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(ip);
                        names.push(format!("IP:{}", std::net::Ipv6Addr::from(octets)));
                    }
                    _ => {}
                }
            }
        }
    }

    names
}

/// Load a PEM certificate from disk
pub fn load_pem_certificate(path: &Path) -> Result<X509> {
    let pem = std::fs::read(path)?;
    X509::from_pem(&pem).map_err(|e| {
        TlsError::Certificate(format!("failed to parse {}: {}", path.display(), e))
    })
}

/// Extract certificate chain information from an SSL connection
///
/// The peer certificate comes first. Certificates the peer sent that are
/// already listed are skipped.
pub fn get_cert_chain(ssl: &SslRef) -> Vec<CertInfo> {
    let mut chain: Vec<CertInfo> = Vec::new();

    if let Some(peer_cert) = ssl.peer_certificate() {
        chain.push(CertInfo::from_x509_ref(&peer_cert));
    }

    if let Some(cert_chain) = ssl.peer_cert_chain() {
        for cert in cert_chain {
            let info = CertInfo::from_x509_ref(cert);
            if !chain.contains(&info) {
                chain.push(info);
            }
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)
    }

    #[test]
    fn test_cert_info_for_server() {
        let cert = load_pem_certificate(&fixture("server.cert")).unwrap();
        let info = CertInfo::from_x509_ref(&cert);

        assert_eq!(info.subject, "localhost");
        assert_eq!(info.serial, "1001");
        assert!(info.subject_alt_names.contains(&"DNS:localhost".to_string()));
        assert!(info.subject_alt_names.contains(&"IP:127.0.0.1".to_string()));
    }

    #[test]
    fn test_client_serials_differ() {
        let good = load_pem_certificate(&fixture("client.cert")).unwrap();
        let revoked = load_pem_certificate(&fixture("revoked_client.cert")).unwrap();

        assert_eq!(serial_hex(&good).unwrap(), "2001");
        assert_eq!(serial_hex(&revoked).unwrap(), "2002");
        assert_eq!(common_name(revoked.subject_name()), "revoked.test");
    }

    #[test]
    fn test_issuer_is_ca() {
        let ca = load_pem_certificate(&fixture("ca.cert")).unwrap();
        let client = load_pem_certificate(&fixture("client.cert")).unwrap();
        assert_eq!(
            CertInfo::from_x509_ref(&client).issuer,
            common_name(ca.subject_name())
        );
    }

    #[test]
    fn test_load_rejects_non_pem() {
        let result = load_pem_certificate(&fixture("crl/index.txt"));
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }
}
