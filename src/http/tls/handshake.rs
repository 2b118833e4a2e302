//! Handshake probe
//!
//! A probe opens a raw TCP connection and drives exactly one TLS client
//! handshake with narrowed parameters: an exact cipher proposal, an exact
//! protocol version and an explicit client credential. It never returns
//! an error; every failure is folded into the [`HandshakeOutcome`].

use super::cert::{common_name, serial_hex};
use super::conformance::AssertionFailure;
use super::config::{ClientCredential, TlsVersion, TransportConfig};
use super::session::TlsSessionOps;
use super::trace::{position_in, HandshakeEvent, HandshakeTrace, CIPHER_NEGOTIATION_MARKERS, COMPLETION_MARKERS};
use crate::http::session::{connect_tcp, SessionOps};
use crate::http::split_authority;
use openssl::ssl::{Ssl, SslVerifyMode};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default connect and handshake I/O timeout
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Init,
    Connecting,
    Handshaking,
    Established,
    Failed,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeState::Init => "INIT",
            ProbeState::Connecting => "CONNECTING",
            ProbeState::Handshaking => "HANDSHAKING",
            ProbeState::Established => "ESTABLISHED",
            ProbeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A certificate seen by the verify callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// 0 is the peer's own certificate
    pub depth: u32,
    pub common_name: String,
    pub serial: String,
    /// OpenSSL's verdict before the callback ran
    pub preverified: bool,
}

/// Result of one probe attempt
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    succeeded: bool,
    negotiated_protocol_version: Option<TlsVersion>,
    negotiated_cipher: Option<String>,
    event_log: Vec<HandshakeEvent>,
    failure_diagnostic: Option<String>,
    peer_chain: Vec<PeerIdentity>,
}

impl HandshakeOutcome {
    fn failed(diagnostic: String, event_log: Vec<HandshakeEvent>, peer_chain: Vec<PeerIdentity>) -> Self {
        HandshakeOutcome {
            succeeded: false,
            negotiated_protocol_version: None,
            negotiated_cipher: None,
            event_log,
            failure_diagnostic: Some(diagnostic),
            peer_chain,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    /// Terminal state the probe reached
    pub fn state(&self) -> ProbeState {
        if self.succeeded {
            ProbeState::Established
        } else {
            ProbeState::Failed
        }
    }

    pub fn negotiated_protocol_version(&self) -> Option<TlsVersion> {
        self.negotiated_protocol_version
    }

    pub fn negotiated_cipher(&self) -> Option<&str> {
        self.negotiated_cipher.as_deref()
    }

    pub fn event_log(&self) -> &[HandshakeEvent] {
        &self.event_log
    }

    pub fn failure_diagnostic(&self) -> Option<&str> {
        self.failure_diagnostic.as_deref()
    }

    /// Certificates the verify callback saw, in callback order
    pub fn peer_chain(&self) -> &[PeerIdentity] {
        &self.peer_chain
    }

    /// Sequence index of the first cipher-negotiation event
    pub fn cipher_negotiation_index(&self) -> Option<usize> {
        position_in(&self.event_log, CIPHER_NEGOTIATION_MARKERS)
    }

    /// Sequence index of the first handshake-completion event
    pub fn completion_index(&self) -> Option<usize> {
        position_in(&self.event_log, COMPLETION_MARKERS)
    }

    /// Cipher negotiation must be logged strictly before completion
    pub fn verify_event_ordering(&self) -> Result<(), AssertionFailure> {
        if !self.succeeded {
            return Err(AssertionFailure::UnexpectedFailure {
                diagnostic: self.failure_diagnostic.clone().unwrap_or_default(),
            });
        }

        let cipher = self.cipher_negotiation_index().ok_or_else(|| {
            AssertionFailure::EventOrdering("no cipher negotiation event recorded".to_string())
        })?;
        let finished = self.completion_index().ok_or_else(|| {
            AssertionFailure::EventOrdering("no handshake completion event recorded".to_string())
        })?;

        if cipher < finished {
            Ok(())
        } else {
            Err(AssertionFailure::EventOrdering(format!(
                "cipher negotiation at {} is not before completion at {}",
                cipher, finished
            )))
        }
    }
}

/// Drives single TLS handshakes against an endpoint
pub struct HandshakeProbe {
    trust_anchor: PathBuf,
    trace: HandshakeTrace,
    server_name: Option<String>,
    timeout: Duration,
    state: ProbeState,
}

impl HandshakeProbe {
    /// Create a probe that validates peers against `trust_anchor`
    ///
    /// `trace` is reset at the start of every attempt.
    pub fn new(trust_anchor: impl Into<PathBuf>, trace: HandshakeTrace) -> Self {
        HandshakeProbe {
            trust_anchor: trust_anchor.into(),
            trace,
            server_name: None,
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: ProbeState::Init,
        }
    }

    /// Override the SNI name (defaults to the host being probed)
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn trace(&self) -> &HandshakeTrace {
        &self.trace
    }

    /// State reached by the most recent attempt
    pub fn state(&self) -> ProbeState {
        self.state
    }

    fn transition(&mut self, state: ProbeState) {
        tracing::debug!(from = %self.state, to = %state, "probe state");
        self.state = state;
    }

    fn fail(&mut self, diagnostic: String, peer_chain: &Mutex<Vec<PeerIdentity>>) -> HandshakeOutcome {
        tracing::info!(%diagnostic, "handshake probe failed");
        self.transition(ProbeState::Failed);
        let peers = peer_chain.lock().unwrap_or_else(|e| e.into_inner()).clone();
        HandshakeOutcome::failed(diagnostic, self.trace.events(), peers)
    }

    /// Attempt one handshake
    ///
    /// `host_port` is `host:port`, a bare host (port 443) or an
    /// `https://` URL whose authority is used.
    pub fn attempt<S: AsRef<str>>(
        &mut self,
        host_port: &str,
        credential: &ClientCredential,
        cipher_suites: &[S],
        protocol_version: TlsVersion,
    ) -> HandshakeOutcome {
        self.state = ProbeState::Init;
        self.trace.reset();
        let peer_chain = Arc::new(Mutex::new(Vec::new()));
        let proposed: Vec<String> = cipher_suites.iter().map(|c| c.as_ref().to_string()).collect();

        tracing::debug!(
            target_addr = host_port,
            ciphers = ?proposed,
            version = %protocol_version,
            certificate = %credential.certificate().display(),
            "starting handshake probe"
        );

        let (host, port) = match split_authority(host_port) {
            Ok(parts) => parts,
            Err(e) => return self.fail(format!("connection failed: {}", e), &peer_chain),
        };

        let ssl = match self.client_ssl(&host, credential, &proposed, protocol_version, &peer_chain) {
            Ok(ssl) => ssl,
            Err(e) => return self.fail(format!("invalid client configuration: {}", e), &peer_chain),
        };

        self.transition(ProbeState::Connecting);
        let tcp = match connect_tcp(&host, port, self.timeout) {
            Ok(tcp) => tcp,
            Err(e) => {
                return self.fail(
                    format!("connection failed: {}:{}: {}", host, port, e),
                    &peer_chain,
                )
            }
        };

        self.transition(ProbeState::Handshaking);
        let mut session = match TlsSessionOps::connect(ssl, tcp) {
            Ok(session) => session,
            Err(e) => return self.fail(format!("handshake failed: {}", e), &peer_chain),
        };

        let negotiated_protocol_version = session
            .ssl()
            .version2()
            .and_then(TlsVersion::from_openssl);
        let negotiated_cipher = session
            .ssl()
            .current_cipher()
            .map(|c| c.name().to_string());
        let _ = session.close();

        let peers = peer_chain.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let event_log = self.trace.events();

        let mismatch = if negotiated_protocol_version != Some(protocol_version) {
            Some(format!(
                "negotiated version mismatch: expected {}, got {:?}",
                protocol_version, negotiated_protocol_version
            ))
        } else if proposed.len() == 1 && negotiated_cipher.as_deref() != Some(proposed[0].as_str()) {
            Some(format!(
                "negotiated cipher mismatch: expected {}, got {:?}",
                proposed[0], negotiated_cipher
            ))
        } else {
            None
        };

        if let Some(diagnostic) = mismatch {
            tracing::warn!(%diagnostic, "handshake completed with unexpected parameters");
            self.transition(ProbeState::Failed);
            return HandshakeOutcome {
                succeeded: false,
                negotiated_protocol_version,
                negotiated_cipher,
                event_log,
                failure_diagnostic: Some(diagnostic),
                peer_chain: peers,
            };
        }

        tracing::info!(
            cipher = negotiated_cipher.as_deref().unwrap_or_default(),
            version = %protocol_version,
            "handshake probe established"
        );
        self.transition(ProbeState::Established);
        HandshakeOutcome {
            succeeded: true,
            negotiated_protocol_version,
            negotiated_cipher,
            event_log,
            failure_diagnostic: None,
            peer_chain: peers,
        }
    }

    fn client_ssl(
        &self,
        host: &str,
        credential: &ClientCredential,
        cipher_suites: &[String],
        protocol_version: TlsVersion,
        peer_chain: &Arc<Mutex<Vec<PeerIdentity>>>,
    ) -> super::Result<Ssl> {
        let ctx = TransportConfig::default()
            .with_protocol_version(protocol_version)
            .with_cipher_suites(cipher_suites.iter().cloned())?
            .with_trust_anchor(self.trust_anchor.clone())
            .with_credential(credential.certificate(), credential.private_key())
            .connector()?;

        let server_name = self.server_name.as_deref().unwrap_or(host);
        let mut ssl = TlsSessionOps::client_ssl(&ctx, server_name, Some(&self.trace))?;

        let peers = Arc::clone(peer_chain);
        ssl.set_verify_callback(SslVerifyMode::PEER, move |preverified, x509_ctx| {
            if let Some(cert) = x509_ctx.current_cert() {
                let identity = PeerIdentity {
                    depth: x509_ctx.error_depth(),
                    common_name: common_name(cert.subject_name()),
                    serial: serial_hex(cert).unwrap_or_default(),
                    preverified,
                };
                tracing::debug!(
                    depth = identity.depth,
                    cn = %identity.common_name,
                    serial = %identity.serial,
                    preverified,
                    error = %x509_ctx.error(),
                    "peer certificate"
                );
                peers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(identity);
            }
            preverified
        });

        Ok(ssl)
    }
}
