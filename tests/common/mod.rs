//! Shared fixtures for the integration tests

#![allow(dead_code)]

use sastls::http::tls::{
    ClientCredential, JsonRoutes, ListenerConfig, ProfileKind, RevocationAwareTlsListener,
    TransportConfig,
};
use sastls::http::{Method, Status};
use serde_json::json;
use std::path::PathBuf;

pub fn certs_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/certs")
}

pub fn cert(name: &str) -> PathBuf {
    certs_dir().join(name)
}

/// Install a test subscriber; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn good_client() -> ClientCredential {
    ClientCredential::new(cert("client.cert"), cert("client.key"))
}

pub fn revoked_client() -> ClientCredential {
    ClientCredential::new(cert("revoked_client.cert"), cert("revoked_client.key"))
}

/// Client config trusting the test CA and presenting the good client
pub fn client_config() -> TransportConfig {
    TransportConfig::default()
        .with_trust_anchor(cert("ca.cert"))
        .with_credential(cert("client.cert"), cert("client.key"))
}

pub fn routes() -> JsonRoutes {
    JsonRoutes::new()
        .route(Method::Post, "/v1.2/registration", json!({"b": 2}))
        .route(Method::Get, "/v1.2/status", json!({"up": true}))
        .route_with_status(
            Method::Post,
            "/v1.2/forbidden",
            Status::FORBIDDEN,
            json!({"error": "client not authorized"}),
        )
}

/// Listener on an ephemeral loopback port
pub fn listener_config(profile: ProfileKind) -> ListenerConfig {
    ListenerConfig::from_certs_dir(certs_dir())
        .with_port(0)
        .with_profile(profile)
}

pub fn start(config: ListenerConfig) -> RevocationAwareTlsListener {
    init_tracing();
    RevocationAwareTlsListener::start(config, routes()).unwrap()
}
