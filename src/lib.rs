//! sastls - mutually-authenticated TLS transport for protocol conformance testing
//!
//! This crate provides the secure-channel layer of a certification test
//! harness: a blocking HTTPS/JSON request client, a handshake probe that
//! records the ordered TLS state log, scoped credential overrides for
//! negative-path tests, and a client-certificate-requiring TLS listener
//! with CRL-based revocation enforcement.

pub mod http;
