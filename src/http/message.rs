//! HTTP message types
//!
//! Requests and responses exchanged with a certification endpoint. Only
//! the methods the transport actually issues are modelled.

use super::{Error, Headers, Result, CRLF, JSON_CONTENT_TYPE};
use std::fmt;
use std::str::FromStr;

/// HTTP methods used by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            _ => Err(Error::InvalidMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP/1.0" => Ok(Version::Http10),
            "HTTP/1.1" => Ok(Version::Http11),
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    pub const OK: Status = Status { code: 200 };
    pub const NO_CONTENT: Status = Status { code: 204 };
    pub const BAD_REQUEST: Status = Status { code: 400 };
    pub const FORBIDDEN: Status = Status { code: 403 };
    pub const NOT_FOUND: Status = Status { code: 404 };
    pub const INTERNAL_SERVER_ERROR: Status = Status { code: 500 };

    /// Create a status code in the range 100..=599
    pub fn new(code: u16) -> Result<Self> {
        if (100..600).contains(&code) {
            Ok(Status { code })
        } else {
            Err(Error::InvalidStatus(format!("Invalid status code: {}", code)))
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    /// Whether the code is in [200, 299]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Canonical reason phrase
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// HTTP request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    method: Method,
    uri: String,
    version: Version,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Create a builder for constructing requests
    pub fn builder() -> HttpRequestBuilder {
        HttpRequestBuilder::default()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Request path without the query string
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or(&self.uri)
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// JSON request for a one-shot connection
    ///
    /// Every request carries the JSON content type. POST always states
    /// its length, so an empty body goes out as `Content-Length: 0`.
    pub fn json(method: Method, host: &str, uri: &str, body: Vec<u8>) -> Self {
        let mut builder = HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("Host", host)
            .header("content-type", JSON_CONTENT_TYPE);

        if method == Method::Post {
            builder = builder.header("Content-Length", body.len().to_string());
        }

        builder.header("Connection", "close").body(body).build()
    }

    /// Convert the request to wire format
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());

        buf.extend_from_slice(self.method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.uri.as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);

        buf
    }
}

/// Builder for HTTP requests
#[derive(Debug, Default)]
pub struct HttpRequestBuilder {
    method: Option<Method>,
    uri: Option<String>,
    version: Option<Version>,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpRequestBuilder {
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> HttpRequest {
        HttpRequest {
            method: self.method.unwrap_or(Method::Get),
            uri: self.uri.unwrap_or_else(|| "/".to_string()),
            version: self.version.unwrap_or_default(),
            headers: self.headers,
            body: self.body,
        }
    }
}

/// HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    version: Version,
    status: Status,
    reason: String,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponse {
    /// Create a builder for constructing responses
    pub fn builder() -> HttpResponseBuilder {
        HttpResponseBuilder::default()
    }

    /// Response with a JSON body and matching headers
    pub fn json(status: Status, value: &serde_json::Value) -> Self {
        let body = value.to_string().into_bytes();
        HttpResponse::builder()
            .status(status)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Content-Length", body.len().to_string())
            .body(body)
            .build()
    }

    /// Response with no body
    pub fn empty(status: Status) -> Self {
        HttpResponse::builder()
            .status(status)
            .header("Content-Length", "0")
            .build()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Convert the response to wire format
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + self.body.len());

        buf.extend_from_slice(self.version.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.status.code().to_string().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.reason.as_bytes());
        buf.extend_from_slice(CRLF.as_bytes());

        self.headers.write_wire(&mut buf);
        buf.extend_from_slice(CRLF.as_bytes());
        buf.extend_from_slice(&self.body);

        buf
    }
}

/// Builder for HTTP responses
#[derive(Debug, Default)]
pub struct HttpResponseBuilder {
    version: Option<Version>,
    status: Option<Status>,
    reason: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

impl HttpResponseBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> HttpResponse {
        let status = self.status.unwrap_or(Status::OK);
        let reason = self
            .reason
            .unwrap_or_else(|| status.reason_phrase().to_string());
        HttpResponse {
            version: self.version.unwrap_or_default(),
            status,
            reason,
            headers: self.headers,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_method_and_version_parsing() {
        assert_eq!("POST".parse::<Method>().unwrap(), Method::Post);
        assert!("DELETE".parse::<Method>().is_err());
        assert_eq!("HTTP/1.0".parse::<Version>().unwrap(), Version::Http10);
        assert!("HTTP/2".parse::<Version>().is_err());
    }

    #[test]
    fn test_status_range() {
        assert!(Status::new(99).is_err());
        assert!(Status::new(600).is_err());
        assert!(Status::new(299).unwrap().is_success());
        assert!(!Status::new(300).unwrap().is_success());
        assert!(!Status::FORBIDDEN.is_success());
    }

    #[test]
    fn test_request_to_wire() {
        let req = HttpRequest::builder()
            .method(Method::Post)
            .uri("/v1.2/registration")
            .header("Host", "localhost")
            .header("content-type", "application/json")
            .body(b"{}".to_vec())
            .build();

        let wire = String::from_utf8(req.to_wire()).unwrap();
        assert!(wire.starts_with("POST /v1.2/registration HTTP/1.1\r\n"));
        assert!(wire.contains("Host: localhost\r\n"));
        assert!(wire.ends_with("\r\n\r\n{}"));
    }

    #[test]
    fn test_json_request_shape() {
        let post = HttpRequest::json(Method::Post, "localhost", "/v1.2/grant", Vec::new());
        let wire = String::from_utf8(post.to_wire()).unwrap();
        assert!(wire.starts_with("POST /v1.2/grant HTTP/1.1\r\n"));
        assert!(wire.contains("Host: localhost\r\n"));
        assert!(wire.contains("content-type: application/json\r\n"));
        assert!(wire.contains("Content-Length: 0\r\n"));
        assert!(wire.contains("Connection: close\r\n"));

        let get = HttpRequest::json(Method::Get, "localhost", "/v1.2/dump", Vec::new());
        assert!(!get.headers().contains("Content-Length"));
        assert_eq!(get.headers().get("Content-Type"), Some("application/json"));
    }

    #[test]
    fn test_request_path_strips_query() {
        let req = HttpRequest::builder().uri("/v1.2/dump?x=1").build();
        assert_eq!(req.path(), "/v1.2/dump");
    }

    #[test]
    fn test_json_response() {
        let resp = HttpResponse::json(Status::OK, &json!({"b": 2}));
        assert_eq!(resp.headers().get("Content-Type"), Some("application/json"));
        assert_eq!(resp.headers().get("Content-Length"), Some("7"));
        assert_eq!(resp.body(), br#"{"b":2}"#);

        let wire = String::from_utf8(resp.to_wire()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 200 OK\r\n"));
    }
}
