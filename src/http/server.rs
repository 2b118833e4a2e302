//! HTTP server implementation
//!
//! Serves a single request on an accepted session. The revocation-aware
//! listener drives one of these per connection.

use super::{
    Error, HttpRequest, HttpResponse, HttpSession, RequestParser, Result, SessionOps, Status,
};
use std::time::Duration;

const READ_CHUNK: usize = 4096;

/// HTTP server side of one connection
pub struct HttpServer<S: SessionOps> {
    session: HttpSession<S>,
    parser: RequestParser,
}

impl<S: SessionOps> HttpServer<S> {
    /// Create a new HTTP server with a session
    pub fn new(session: S) -> Self {
        HttpServer {
            session: HttpSession::new(session),
            parser: RequestParser::new(),
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.session.set_timeout(Some(timeout));
    }

    /// Receive an HTTP request
    pub fn receive_request(&mut self) -> Result<HttpRequest> {
        self.parser = RequestParser::new();
        let mut temp = vec![0u8; READ_CHUNK];

        loop {
            let n = self.session.read(&mut temp)?;

            if n == 0 {
                return Err(Error::ConnectionClosed);
            }

            if let Some(request) = self.parser.parse(&temp[..n])? {
                return Ok(request);
            }
        }
    }

    /// Send an HTTP response
    pub fn send_response(&mut self, response: &HttpResponse) -> Result<()> {
        self.session.write_all(&response.to_wire())
    }

    /// Send a bodiless response with the given status
    pub fn send_status(&mut self, status: Status) -> Result<()> {
        self.send_response(&HttpResponse::empty(status))
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
