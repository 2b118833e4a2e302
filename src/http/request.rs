//! Secure JSON request client
//!
//! Performs one blocking HTTPS request per call over a freshly
//! established mutual-TLS session, and classifies the result:
//!
//! - status in [200, 299]: `Ok` with [`StatusClass::Success`] and the body
//!   parsed as JSON when non-empty
//! - any other status: `Ok` with [`StatusClass::ProtocolError`] and the code
//! - connection or TLS failure: `Err(RequestError::Transport)` once the
//!   retry policy is exhausted
//!
//! Each attempt opens its own connection and handshake; no TLS state is
//! carried between attempts.

use super::client::{is_empty_reply, HttpClient};
use super::session::{connect_tcp, DEFAULT_SESSION_TIMEOUT};
use super::tls::{HandshakeTrace, TlsError, TlsSessionOps, TransportConfig};
use super::{split_authority, Error, HttpRequest, HttpResponse, Method};
use serde_json::Value;
use std::fmt;
use std::thread;
use std::time::Duration;

/// Attempts per request unless configured otherwise
pub const MAX_REQUEST_ATTEMPT_COUNT: u32 = 1;

/// Pause between attempts
pub const REQUEST_ATTEMPT_DELAY: Duration = Duration::from_millis(250);

/// Outcome class of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    ProtocolError,
    TransportError,
}

/// Result of a request that reached the HTTP layer
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOutcome {
    status_class: StatusClass,
    http_status_code: Option<u16>,
    body: Option<Value>,
}

impl RequestOutcome {
    pub fn status_class(&self) -> StatusClass {
        self.status_class
    }

    pub fn is_success(&self) -> bool {
        self.status_class == StatusClass::Success
    }

    pub fn http_status_code(&self) -> Option<u16> {
        self.http_status_code
    }

    /// Parsed JSON body; empty bodies are `None`
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Body of a successful request, or the protocol error as `Err`
    pub fn into_json(self) -> Result<Option<Value>, RequestError> {
        match self.status_class {
            StatusClass::Success => Ok(self.body),
            _ => Err(RequestError::Protocol {
                status: self.http_status_code.unwrap_or_default(),
            }),
        }
    }

    fn from_response(response: &HttpResponse) -> Result<Self, RequestError> {
        let code = response.status().code();

        if !response.status().is_success() {
            return Ok(RequestOutcome {
                status_class: StatusClass::ProtocolError,
                http_status_code: Some(code),
                body: serde_json::from_slice(response.body()).ok(),
            });
        }

        let body = if response.body().is_empty() {
            None
        } else {
            Some(serde_json::from_slice(response.body()).map_err(RequestError::Decode)?)
        };

        Ok(RequestOutcome {
            status_class: StatusClass::Success,
            http_status_code: Some(code),
            body,
        })
    }
}

/// Where a transport failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Context could not be built (ciphers, certificates, trust anchor)
    Configuration,
    /// TCP connect failed
    Connect,
    /// TLS handshake failed
    Handshake,
    /// Read or write timed out
    Timeout,
    /// I/O failure or premature close after the handshake
    Io,
    /// Response could not be parsed as HTTP
    MalformedResponse,
}

/// Connection- or TLS-level failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// OS errno or packed OpenSSL error code
    pub code: Option<u64>,
    pub message: String,
}

impl TransportError {
    fn new(kind: TransportErrorKind, code: Option<u64>, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            code,
            message: message.into(),
        }
    }

    fn connect(err: &std::io::Error) -> Self {
        TransportError::new(
            TransportErrorKind::Connect,
            err.raw_os_error().map(|c| c as u64),
            err.to_string(),
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(code) = self.code {
            write!(f, " (code {})", code)?;
        }
        Ok(())
    }
}

impl From<TlsError> for TransportError {
    fn from(err: TlsError) -> Self {
        let kind = match err {
            TlsError::Handshake { .. } => TransportErrorKind::Handshake,
            TlsError::Io(_) => TransportErrorKind::Io,
            _ => TransportErrorKind::Configuration,
        };
        TransportError::new(kind, err.code(), err.to_string())
    }
}

impl From<Error> for TransportError {
    fn from(err: Error) -> Self {
        if is_empty_reply(&err) {
            return TransportError::new(TransportErrorKind::Io, None, "empty reply from server");
        }
        match err {
            Error::Tls(e) => e.into(),
            Error::Timeout => TransportError::new(TransportErrorKind::Timeout, None, "timed out"),
            Error::Io(e) => {
                let kind = match e.kind() {
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                        TransportErrorKind::Timeout
                    }
                    _ => TransportErrorKind::Io,
                };
                TransportError::new(kind, e.raw_os_error().map(|c| c as u64), e.to_string())
            }
            other => TransportError::new(TransportErrorKind::MalformedResponse, None, other.to_string()),
        }
    }
}

/// Request failures
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("HTTP status {status}")]
    Protocol { status: u16 },

    #[error("failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode response body: {0}")]
    Decode(serde_json::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),
}

impl RequestError {
    /// Class of the failure, for callers that only need the taxonomy
    pub fn status_class(&self) -> StatusClass {
        match self {
            RequestError::Protocol { .. } => StatusClass::ProtocolError,
            _ => StatusClass::TransportError,
        }
    }

    /// HTTP status, for protocol errors
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Protocol { status } => Some(*status),
            _ => None,
        }
    }
}

/// Bounded retry of transport failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: MAX_REQUEST_ATTEMPT_COUNT,
            delay: REQUEST_ATTEMPT_DELAY,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` is clamped to at least one
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

/// Parsed `https://host[:port]/path` target
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    path: String,
}

impl Target {
    fn parse(url: &str) -> Result<Self, RequestError> {
        let rest = url
            .strip_prefix("https://")
            .ok_or_else(|| RequestError::InvalidUrl(format!("{}: only https URLs are supported", url)))?;
        let (host, port) =
            split_authority(rest).map_err(|e| RequestError::InvalidUrl(format!("{}: {}", url, e)))?;

        let path = match rest.find(['/', '?']) {
            Some(idx) => &rest[idx..],
            None => "/",
        };
        let path = path.split('#').next().unwrap_or_default();
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        Ok(Target { host, port, path })
    }
}

/// The JSON request operations a conformance test drives
///
/// Implemented by [`SecureRequestClient`] for real endpoints; test doubles
/// implement it to stand in for one.
pub trait JsonTransport {
    fn post(&self, url: &str, body: Option<&Value>) -> Result<RequestOutcome, RequestError>;

    fn get(&self, url: &str) -> Result<RequestOutcome, RequestError>;
}

/// Blocking HTTPS/JSON client over mutual TLS
#[derive(Debug, Clone)]
pub struct SecureRequestClient {
    config: TransportConfig,
    retry: RetryPolicy,
    trace: Option<HandshakeTrace>,
    timeout: Duration,
}

impl SecureRequestClient {
    pub fn new(config: TransportConfig) -> Self {
        SecureRequestClient {
            config,
            retry: RetryPolicy::default(),
            trace: None,
            timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record handshake events of every attempt into `trace`
    pub fn with_trace(mut self, trace: HandshakeTrace) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Connect and I/O timeout per attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// TLS parameters used for the next request
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut TransportConfig {
        &mut self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// POST `body` as JSON; an absent body is sent empty
    pub fn post(&self, url: &str, body: Option<&Value>) -> Result<RequestOutcome, RequestError> {
        self.execute(Method::Post, url, body)
    }

    pub fn get(&self, url: &str) -> Result<RequestOutcome, RequestError> {
        self.execute(Method::Get, url, None)
    }

    fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> Result<RequestOutcome, RequestError> {
        let target = Target::parse(url)?;
        let payload = match body {
            Some(value) => serde_json::to_vec(value).map_err(RequestError::Encode)?,
            None => Vec::new(),
        };

        tracing::debug!(%method, url, "request");
        if !payload.is_empty() {
            tracing::debug!(body = %String::from_utf8_lossy(&payload), "request body");
        }

        let request = HttpRequest::json(method, &target.host, &target.path, payload);
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 1;

        loop {
            match self.attempt(&target, &request) {
                Ok(response) => {
                    tracing::debug!(
                        status = response.status().code(),
                        body = %String::from_utf8_lossy(response.body()),
                        "response"
                    );
                    return RequestOutcome::from_response(&response);
                }
                Err(err) if attempt < max_attempts => {
                    tracing::warn!(
                        url,
                        attempt,
                        max_attempts,
                        error = %err,
                        "request attempt failed, retrying"
                    );
                    thread::sleep(self.retry.delay());
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(url, attempts = attempt, error = %err, "request failed");
                    return Err(RequestError::Transport(err));
                }
            }
        }
    }

    /// One connection, one handshake, one exchange
    fn attempt(&self, target: &Target, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        let ctx = self.config.connector()?;
        let mut ssl = TlsSessionOps::client_ssl(&ctx, &target.host, self.trace.as_ref())?;
        TlsSessionOps::verify_peer_name(&mut ssl, &target.host)?;

        if let Some(trace) = &self.trace {
            trace.reset();
        }

        let tcp = connect_tcp(&target.host, target.port, self.timeout)
            .map_err(|e| TransportError::connect(&e))?;
        let session = TlsSessionOps::connect(ssl, tcp)?;

        let mut client = HttpClient::new(session);
        client.set_timeout(self.timeout);
        Ok(client.exchange(request)?)
    }
}

impl JsonTransport for SecureRequestClient {
    fn post(&self, url: &str, body: Option<&Value>) -> Result<RequestOutcome, RequestError> {
        SecureRequestClient::post(self, url, body)
    }

    fn get(&self, url: &str) -> Result<RequestOutcome, RequestError> {
        SecureRequestClient::get(self, url)
    }
}

/// POST with an explicit configuration and the default retry policy
pub fn request_post(url: &str, body: Option<&Value>, config: &TransportConfig) -> Result<RequestOutcome, RequestError> {
    SecureRequestClient::new(config.clone()).post(url, body)
}

/// GET with an explicit configuration and the default retry policy
pub fn request_get(url: &str, config: &TransportConfig) -> Result<RequestOutcome, RequestError> {
    SecureRequestClient::new(config.clone()).get(url)
}
