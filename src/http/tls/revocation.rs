//! Certificate revocation data
//!
//! A CRL index is a text file naming one DER-encoded CRL per line,
//! relative to the index's own directory. Every listed CRL must load;
//! a partially loaded revocation set is never used.

use super::cert::serial_hex;
use super::config::{ProfileKind, TlsVersion};
use openssl::error::ErrorStack;
use openssl::x509::{X509Crl, X509Ref};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

/// Listener startup failures
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("failed to read CRL index {}: {source}", .path.display())]
    CrlIndex { path: PathBuf, source: io::Error },

    #[error("failed to read CRL {}: {source}", .path.display())]
    CrlRead { path: PathBuf, source: io::Error },

    #[error("failed to parse CRL {} as DER: {source}", .path.display())]
    CrlParse { path: PathBuf, source: ErrorStack },

    #[error("invalid credential {}: {message}", .path.display())]
    Credential { path: PathBuf, message: String },

    #[error("{0} is not supported; credential profiles only define TLSv1.2 ciphers")]
    UnsupportedVersion(TlsVersion),

    #[error("{profile} profile rejected: {message}")]
    Profile { profile: ProfileKind, message: String },

    #[error("TLS context setup failed: {0}")]
    Context(#[from] ErrorStack),

    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
}

/// Read a CRL index and resolve each entry against the index directory
///
/// Trailing whitespace is stripped and blank lines are skipped.
pub fn parse_crl_index(path: &Path) -> Result<Vec<PathBuf>, ValidationError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ValidationError::CrlIndex {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    Ok(contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| base.join(line))
        .collect())
}

/// Load one DER-encoded CRL
pub fn load_crl(path: &Path) -> Result<X509Crl, ValidationError> {
    let der = std::fs::read(path).map_err(|source| ValidationError::CrlRead {
        path: path.to_path_buf(),
        source,
    })?;
    X509Crl::from_der(&der).map_err(|source| ValidationError::CrlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Revoked certificates, keyed by issuer and serial
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationSet {
    entries: HashSet<(Vec<u8>, String)>,
    crl_count: usize,
}

impl RevocationSet {
    pub fn new() -> Self {
        RevocationSet::default()
    }

    /// Merge every CRL into a new set
    pub fn from_crls(crls: &[X509Crl]) -> Result<Self, ErrorStack> {
        let mut set = RevocationSet::new();
        for crl in crls {
            set.merge(crl)?;
        }
        Ok(set)
    }

    /// Add the entries of one CRL, returning how many were new
    pub fn merge(&mut self, crl: &X509Crl) -> Result<usize, ErrorStack> {
        let issuer = crl.issuer_name().to_der()?;
        let mut added = 0;

        if let Some(revoked) = crl.get_revoked() {
            for entry in revoked {
                let serial = entry.serial_number().to_bn()?.to_hex_str()?.to_string();
                if self.entries.insert((issuer.clone(), serial)) {
                    added += 1;
                }
            }
        }

        self.crl_count += 1;
        Ok(added)
    }

    /// Whether `cert` appears in any merged CRL from its issuer
    pub fn is_revoked(&self, cert: &X509Ref) -> bool {
        let (Ok(issuer), Ok(serial)) = (cert.issuer_name().to_der(), serial_hex(cert)) else {
            return false;
        };
        self.entries.contains(&(issuer, serial))
    }

    /// Revoked serials (upper-case hex), in no particular order
    pub fn serials(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, serial)| serial.as_str())
    }

    /// Number of revoked certificates
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of CRLs merged
    pub fn crl_count(&self) -> usize {
        self.crl_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tls::cert::load_pem_certificate;
    use std::io::Write;

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/certs").join(name)
    }

    #[test]
    fn test_parse_crl_index_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("index.txt");
        let mut file = std::fs::File::create(&index).unwrap();
        writeln!(file, "first.crl  ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "sub/second.crl").unwrap();

        let paths = parse_crl_index(&index).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("first.crl"), dir.path().join("sub/second.crl")]
        );
    }

    #[test]
    fn test_missing_index() {
        let result = parse_crl_index(Path::new("/nonexistent/index.txt"));
        assert!(matches!(result, Err(ValidationError::CrlIndex { .. })));
    }

    #[test]
    fn test_revoked_fixture() {
        let paths = parse_crl_index(&fixture("crl/index.txt")).unwrap();
        let crls: Vec<X509Crl> = paths.iter().map(|p| load_crl(p).unwrap()).collect();
        let set = RevocationSet::from_crls(&crls).unwrap();

        assert_eq!(set.crl_count(), 1);
        assert_eq!(set.len(), 1);
        assert_eq!(set.serials().collect::<Vec<_>>(), vec!["2002"]);

        let revoked = load_pem_certificate(&fixture("revoked_client.cert")).unwrap();
        let good = load_pem_certificate(&fixture("client.cert")).unwrap();
        assert!(set.is_revoked(&revoked));
        assert!(!set.is_revoked(&good));
    }

    #[test]
    fn test_malformed_crl_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.crl");
        std::fs::write(&path, b"not a crl").unwrap();

        assert!(matches!(load_crl(&path), Err(ValidationError::CrlParse { .. })));
        assert!(matches!(
            load_crl(&dir.path().join("absent.crl")),
            Err(ValidationError::CrlRead { .. })
        ));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let crl = load_crl(&fixture("crl/revoked.crl")).unwrap();
        let mut set = RevocationSet::new();
        assert_eq!(set.merge(&crl).unwrap(), 1);
        assert_eq!(set.merge(&crl).unwrap(), 0);
        assert_eq!(set.len(), 1);
    }
}
