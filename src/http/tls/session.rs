//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::cert::{get_cert_chain, CertInfo};
use super::trace::HandshakeTrace;
use super::TlsError;
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{HandshakeError, Ssl, SslContextRef, SslRef, SslStream};
use std::io::{Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Convert a failed blocking handshake into a `TlsError`
pub(crate) fn handshake_error<S>(err: HandshakeError<S>) -> TlsError {
    match err {
        HandshakeError::SetupFailure(stack) => TlsError::OpenSsl(stack),
        HandshakeError::Failure(mid) | HandshakeError::WouldBlock(mid) => {
            let error = mid.error();
            let code = error
                .ssl_error()
                .and_then(|stack| stack.errors().first())
                .map(|e| e.code() as u64)
                .or_else(|| {
                    error
                        .io_error()
                        .and_then(|io| io.raw_os_error())
                        .map(|c| c as u64)
                });
            TlsError::Handshake {
                message: error.to_string(),
                code,
            }
        }
    }
}

/// TLS session operations
///
/// Wraps an OpenSSL `SslStream` and provides poll/read/write/close.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Per-connection state for a client handshake
    ///
    /// Sets SNI for DNS names and routes handshake events into `trace`.
    pub fn client_ssl(
        ctx: &SslContextRef,
        server_name: &str,
        trace: Option<&HandshakeTrace>,
    ) -> std::result::Result<Ssl, TlsError> {
        let mut ssl = Ssl::new(ctx)?;

        if server_name.parse::<IpAddr>().is_err() {
            ssl.set_hostname(server_name)?;
        }

        if let Some(trace) = trace {
            trace.attach(&mut ssl)?;
        }

        Ok(ssl)
    }

    /// Require the peer certificate to name `host`
    pub fn verify_peer_name(ssl: &mut SslRef, host: &str) -> std::result::Result<(), TlsError> {
        let param = ssl.param_mut();
        match host.parse::<IpAddr>() {
            Ok(ip) => param.set_ip(ip)?,
            Err(_) => param.set_host(host)?,
        }
        Ok(())
    }

    /// Perform a client handshake
    pub fn connect(ssl: Ssl, tcp_stream: TcpStream) -> std::result::Result<Self, TlsError> {
        let stream = ssl.connect(tcp_stream).map_err(handshake_error)?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Perform a server handshake
    pub fn accept(ssl: Ssl, tcp_stream: TcpStream) -> std::result::Result<Self, TlsError> {
        let stream = ssl.accept(tcp_stream).map_err(handshake_error)?;

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// The established connection
    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// Peer certificate followed by the rest of its chain
    pub fn peer_chain(&self) -> Vec<CertInfo> {
        get_cert_chain(self.stream.ssl())
    }

    /// Check if an I/O operation failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Set socket-level read and write timeouts
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> HttpResult<()> {
        self.stream.get_ref().set_read_timeout(timeout)?;
        self.stream.get_ref().set_write_timeout(timeout)?;
        Ok(())
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be buffered inside OpenSSL
        if events != PollEvents::Write && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            // Peer closed without close_notify
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(0),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        self.stream.write(buf).map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn flush(&mut self) -> HttpResult<()> {
        self.stream.flush().map_err(|e| {
            self.failed = true;
            Error::Io(e)
        })
    }

    fn close(&mut self) -> HttpResult<()> {
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Error::from),
        }
    }
}
