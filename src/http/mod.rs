//! HTTPS transport for conformance testing
//!
//! This module provides the HTTP/1.1 wire layer and the mutually-authenticated
//! request machinery that certification tests drive against a protocol
//! endpoint.
//!
//! # Architecture
//!
//! The HTTP layer uses the session operations abstraction so that the same
//! request/response code runs over plain TCP (in unit tests) and over TLS:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `HttpSession` adds timeouts on top of any `SessionOps`
//! - `HttpClient` / `HttpServer` speak HTTP/1.1 over an `HttpSession`
//!
//! On top of that sit the conformance-facing pieces:
//!
//! - `request::SecureRequestClient` performs one blocking HTTPS/JSON call
//!   per operation, with a bounded retry policy
//! - `credential_scope::CredentialOverrideScope` temporarily swaps the
//!   client's cipher list and certificate
//! - `tls` holds the transport configuration, handshake probe and the
//!   revocation-aware listener
//!
//! # Examples
//!
//! ```no_run
//! use sastls::http::request::SecureRequestClient;
//! use sastls::http::tls::TransportConfig;
//! use serde_json::json;
//!
//! let config = TransportConfig::default()
//!     .with_credential("certs/client.cert", "certs/client.key");
//! let client = SecureRequestClient::new(config);
//!
//! let outcome = client
//!     .post("https://localhost:9000/v1.2/registration", Some(&json!({"a": 1})))
//!     .unwrap();
//! assert!(outcome.is_success());
//! ```

pub mod client;
pub mod credential_scope;
pub mod headers;
pub mod message;
pub mod parser;
pub mod request;
pub mod server;
pub mod session;
pub mod tls;

pub use client::HttpClient;
pub use credential_scope::{CredentialOverrideScope, CredentialSnapshot};
pub use headers::Headers;
pub use message::{HttpRequest, HttpResponse, Method, Status, Version};
pub use parser::{RequestParser, ResponseParser};
pub use request::{RequestOutcome, SecureRequestClient, StatusClass};
pub use server::HttpServer;
pub use session::{HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tls::TlsError),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid HTTP version: {0}")]
    InvalidVersion(String),

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid HTTP status: {0}")]
    InvalidStatus(String),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Maximum number of headers per message
pub const MAX_HEADERS: usize = 64;

/// Largest body a parser accepts
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Content type of every request and response body
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Split `host[:port]` into host and port
///
/// Accepts an optional `https://` prefix and ignores anything after the
/// authority. IPv6 hosts are written in brackets. The port defaults to
/// [`DEFAULT_HTTPS_PORT`].
pub(crate) fn split_authority(input: &str) -> Result<(String, u16)> {
    let rest = input.strip_prefix("https://").unwrap_or(input);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| Error::Parse(format!("Unterminated IPv6 host: {}", input)))?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(Error::Parse(format!("Invalid authority: {}", input))),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(Error::Parse(format!("Missing host: {}", input)));
    }

    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| Error::Parse(format!("Invalid port: {}", port)))?,
        None => DEFAULT_HTTPS_PORT,
    };

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_authority() {
        assert_eq!(
            split_authority("localhost:9000").unwrap(),
            ("localhost".to_string(), 9000)
        );
        assert_eq!(
            split_authority("https://sas.example/v1.2").unwrap(),
            ("sas.example".to_string(), 443)
        );
        assert_eq!(
            split_authority("[::1]:9001").unwrap(),
            ("::1".to_string(), 9001)
        );
        assert!(split_authority("localhost:notaport").is_err());
        assert!(split_authority(":9000").is_err());
    }
}
