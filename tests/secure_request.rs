//! Secure request client against a live listener

mod common;

use common::{cert, client_config, init_tracing, listener_config, routes, start};
use sastls::http::request::{
    request_get, request_post, JsonTransport, RequestError, RetryPolicy, SecureRequestClient,
    TransportErrorKind,
};
use sastls::http::tls::conformance::assert_handshake_failure_or_http_403;
use sastls::http::tls::{
    ciphers, AssertionFailure, ClientCredential, HandshakeProbe, HandshakeTrace, ProfileKind,
    RevocationAwareTlsListener,
};
use sastls::http::{HttpRequest, HttpResponse, Status, StatusClass};
use serde_json::json;
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_post_returns_json_body() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let url = format!("{}/v1.2/registration", listener.base_url());

    let outcome = request_post(&url, Some(&json!({"a": 1})), &client_config()).unwrap();
    assert_eq!(outcome.status_class(), StatusClass::Success);
    assert_eq!(outcome.http_status_code(), Some(200));
    assert_eq!(outcome.body(), Some(&json!({"b": 2})));
    assert_eq!(outcome.into_json().unwrap(), Some(json!({"b": 2})));
}

#[test]
fn test_post_without_body() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let url = format!("{}/v1.2/registration", listener.base_url());

    let client = SecureRequestClient::new(client_config());
    let outcome = client.post(&url, None).unwrap();
    assert!(outcome.is_success());
}

#[test]
fn test_get_unknown_route_is_protocol_error() {
    let listener = start(listener_config(ProfileKind::Rsa));

    let ok = request_get(&format!("{}/v1.2/status", listener.base_url()), &client_config()).unwrap();
    assert_eq!(ok.body(), Some(&json!({"up": true})));

    let outcome =
        request_get(&format!("{}/v1.2/missing", listener.base_url()), &client_config()).unwrap();
    assert_eq!(outcome.status_class(), StatusClass::ProtocolError);
    assert_eq!(outcome.http_status_code(), Some(404));

    let err = outcome.into_json().unwrap_err();
    assert!(matches!(err, RequestError::Protocol { status: 404 }));
}

#[test]
fn test_trace_records_request_handshake() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let trace = HandshakeTrace::new();
    let client = SecureRequestClient::new(client_config()).with_trace(trace.clone());

    client
        .get(&format!("{}/v1.2/status", listener.base_url()))
        .unwrap();

    let cipher_at = trace.position("change cipher spec").unwrap();
    let done_at = trace.position("negotiation finished").unwrap();
    assert!(cipher_at < done_at);
}

#[test]
fn test_missing_client_certificate_is_transport_error() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let config = client_config().without_credential();

    let err = request_post(
        &format!("{}/v1.2/registration", listener.base_url()),
        None,
        &config,
    )
    .unwrap_err();
    assert_eq!(err.status_class(), StatusClass::TransportError);
}

#[test]
fn test_connection_refused_retries_then_fails() {
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let client = SecureRequestClient::new(client_config())
        .with_retry(RetryPolicy::new(3, Duration::from_millis(50)));

    let started = Instant::now();
    let err = client
        .post(&format!("https://127.0.0.1:{}/v1.2/registration", port), None)
        .unwrap_err();

    match err {
        RequestError::Transport(e) => assert_eq!(e.kind, TransportErrorKind::Connect),
        other => panic!("unexpected error: {}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[test]
fn test_protocol_error_is_not_retried() {
    init_tracing();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let listener = RevocationAwareTlsListener::start(
        listener_config(ProfileKind::Rsa),
        move |_: &HttpRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            HttpResponse::empty(Status::NOT_FOUND)
        },
    )
    .unwrap();
    let client = SecureRequestClient::new(client_config())
        .with_retry(RetryPolicy::new(3, Duration::from_millis(500)));

    let started = Instant::now();
    let outcome = client
        .post(&format!("{}/v1.2/registration", listener.base_url()), None)
        .unwrap();

    assert_eq!(outcome.status_class(), StatusClass::ProtocolError);
    assert_eq!(outcome.http_status_code(), Some(404));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_transient_connect_failure_recovers_within_budget() {
    init_tracing();
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    // Endpoint comes up after the first attempt has been refused
    let late_endpoint = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        RevocationAwareTlsListener::start(listener_config(ProfileKind::Rsa).with_port(port), routes())
            .unwrap()
    });

    let client = SecureRequestClient::new(client_config())
        .with_retry(RetryPolicy::new(10, Duration::from_millis(100)));
    let started = Instant::now();
    let outcome = client
        .post(&format!("https://localhost:{}/v1.2/registration", port), None)
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.body(), Some(&json!({"b": 2})));
    assert!(started.elapsed() >= Duration::from_millis(100));

    let listener = late_endpoint.join().unwrap();
    assert_eq!(listener.local_addr().port(), port);
}

#[test]
fn test_plain_http_url_is_rejected() {
    let client = SecureRequestClient::new(client_config());
    assert!(matches!(
        client.get("http://localhost:9000/v1.2/status"),
        Err(RequestError::InvalidUrl(_))
    ));
}

#[test]
fn test_json_transport_is_object_safe() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let transport: Box<dyn JsonTransport> = Box::new(SecureRequestClient::new(client_config()));

    let outcome = transport
        .post(&format!("{}/v1.2/registration", listener.base_url()), Some(&json!({})))
        .unwrap();
    assert!(outcome.is_success());
}

#[test]
fn test_handshake_failure_or_http_403() {
    let listener = start(listener_config(ProfileKind::Rsa));
    let host_port = format!("localhost:{}", listener.local_addr().port());
    let mut probe = HandshakeProbe::new(cert("ca.cert"), HandshakeTrace::new());
    let mut client = SecureRequestClient::new(client_config());
    let before = client.config().clone();
    let credential = ClientCredential::new(cert("client.cert"), cert("client.key"));

    // Handshake succeeds and the endpoint answers 403
    assert_handshake_failure_or_http_403(
        &mut probe,
        &mut client,
        &host_port,
        &format!("{}/v1.2/forbidden", listener.base_url()),
        Some(&json!({"a": 1})),
        &credential,
        None,
        None,
    )
    .unwrap();
    assert_eq!(client.config(), &before);

    // Handshake succeeds but the endpoint answers 200
    let err = assert_handshake_failure_or_http_403(
        &mut probe,
        &mut client,
        &host_port,
        &format!("{}/v1.2/registration", listener.base_url()),
        None,
        &credential,
        None,
        None,
    )
    .unwrap_err();
    assert_eq!(err, AssertionFailure::UnexpectedStatus { status: Some(200) });

    // Handshake fails outright
    assert_handshake_failure_or_http_403(
        &mut probe,
        &mut client,
        &host_port,
        &format!("{}/v1.2/registration", listener.base_url()),
        None,
        &credential,
        Some(ciphers::ECDHE_ECDSA_AES128_GCM_SHA256),
        None,
    )
    .unwrap();
    assert_eq!(client.config(), &before);
}
