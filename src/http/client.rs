//! HTTP client implementation
//!
//! One request, one response. The caller owns the connection lifetime;
//! the secure request client opens a fresh session for every attempt.

use super::{Error, HttpRequest, HttpResponse, HttpSession, ResponseParser, Result, SessionOps};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// HTTP client
pub struct HttpClient<S: SessionOps> {
    session: HttpSession<S>,
    parser: ResponseParser,
}

impl<S: SessionOps> HttpClient<S> {
    /// Create a new HTTP client with a session
    pub fn new(session: S) -> Self {
        HttpClient {
            session: HttpSession::new(session),
            parser: ResponseParser::new(),
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(Some(timeout));
    }

    /// Send an HTTP request
    pub fn send_request(&mut self, request: &HttpRequest) -> Result<()> {
        tracing::trace!(method = %request.method(), uri = request.uri(), "sending request");
        self.session.write_all(&request.to_wire())
    }

    /// Receive an HTTP response
    ///
    /// Reads until the response is complete or, for close-delimited
    /// bodies, until the peer closes the connection.
    pub fn receive_response(&mut self) -> Result<HttpResponse> {
        self.parser.reset();
        let mut temp = vec![0u8; READ_CHUNK];

        loop {
            let n = self.session.read(&mut temp)?;

            if n == 0 {
                return self.parser.finish();
            }

            if let Some(response) = self.parser.parse(&temp[..n])? {
                tracing::trace!(status = response.status().code(), "received response");
                return Ok(response);
            }
        }
    }

    /// Send a request and wait for its response
    pub fn exchange(&mut self, request: &HttpRequest) -> Result<HttpResponse> {
        self.send_request(request)?;
        self.receive_response()
    }

    /// Close the connection
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn session(&self) -> &HttpSession<S> {
        &self.session
    }

    /// Get a mutable reference to the underlying session
    pub fn session_mut(&mut self) -> &mut HttpSession<S> {
        &mut self.session
    }
}

impl<S: SessionOps> Drop for HttpClient<S> {
    fn drop(&mut self) {
        let _ = self.session.close();
    }
}

/// Error returned when the peer sends nothing at all
pub(crate) fn is_empty_reply(err: &Error) -> bool {
    matches!(err, Error::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::session::FdSessionOps;
    use crate::http::Method;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn serve_once(reply: &'static [u8]) -> (std::net::SocketAddr, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(reply).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        (addr, handle)
    }

    #[test]
    fn test_post_json_request_shape() {
        let (addr, handle) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\n{\"b\":2}");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request =
            HttpRequest::json(Method::Post, "localhost", "/v1.2/registration", br#"{"a":1}"#.to_vec());
        let response = client.exchange(&request).unwrap();

        assert_eq!(response.status().code(), 200);
        assert_eq!(response.body(), br#"{"b":2}"#);

        let request = handle.join().unwrap();
        assert!(request.starts_with("POST /v1.2/registration HTTP/1.1\r\n"));
        assert!(request.contains("Host: localhost\r\n"));
        assert!(request.contains("content-type: application/json\r\n"));
        assert!(request.ends_with("\r\n\r\n{\"a\":1}"));
    }

    #[test]
    fn test_receive_until_close() {
        let (addr, handle) = serve_once(b"HTTP/1.0 404 Not Found\r\n\r\nmissing");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let request = HttpRequest::json(Method::Get, "localhost", "/v1.2/unknown", Vec::new());
        let response = client.exchange(&request).unwrap();

        assert_eq!(response.status().code(), 404);
        assert_eq!(response.body(), b"missing");
        handle.join().unwrap();
    }

    #[test]
    fn test_empty_reply() {
        let (addr, handle) = serve_once(b"");

        let mut client = HttpClient::new(FdSessionOps::new(TcpStream::connect(addr).unwrap()));
        let err = client
            .exchange(&HttpRequest::json(Method::Get, "localhost", "/", Vec::new()))
            .unwrap_err();
        assert!(is_empty_reply(&err));
        handle.join().unwrap();
    }
}
