//! Revocation-aware mutual-TLS listener
//!
//! The endpoint side of the harness. It serves one of two credential
//! profiles (RSA chain or ECDSA chain), accepts only the ciphers of that
//! profile, requires a client certificate on every connection and, when
//! given a CRL index, rejects revoked client certificates.
//!
//! Connections are handled one at a time on a dedicated accept thread.
//! Each connection gets its own handshake and serves a single request.

use super::cert::common_name;
use super::config::{restrict_ciphers, restrict_protocol, CredentialPair, ProfileKind, TlsVersion};
use super::revocation::{load_crl, parse_crl_index, RevocationSet, ValidationError};
use super::session::TlsSessionOps;
use crate::http::server::HttpServer;
use crate::http::session::DEFAULT_SESSION_TIMEOUT;
use crate::http::{HttpRequest, HttpResponse, Method, Status};
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode};
use openssl::x509::store::X509Lookup;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509Crl, X509VerifyResult};
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Port the harness endpoint listens on unless told otherwise
pub const DEFAULT_LISTENER_PORT: u16 = 9000;

const LISTEN_BACKLOG: i32 = 128;

/// Produces the response for one request
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> RequestHandler for F
where
    F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// Fixed JSON responses keyed by method and path
///
/// Unknown routes answer 404. A POST whose non-empty body is not JSON
/// answers 400.
#[derive(Debug, Clone, Default)]
pub struct JsonRoutes {
    routes: HashMap<(Method, String), (Status, Value)>,
}

impl JsonRoutes {
    pub fn new() -> Self {
        JsonRoutes::default()
    }

    /// Answer `method path` with 200 and `body`
    pub fn route(self, method: Method, path: impl Into<String>, body: Value) -> Self {
        self.route_with_status(method, path, Status::OK, body)
    }

    pub fn route_with_status(
        mut self,
        method: Method,
        path: impl Into<String>,
        status: Status,
        body: Value,
    ) -> Self {
        self.routes.insert((method, path.into()), (status, body));
        self
    }
}

impl RequestHandler for JsonRoutes {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let key = (request.method(), request.path().to_string());
        let Some((status, body)) = self.routes.get(&key) else {
            return HttpResponse::empty(Status::NOT_FOUND);
        };

        if request.method() == Method::Post
            && !request.body().is_empty()
            && serde_json::from_slice::<Value>(request.body()).is_err()
        {
            return HttpResponse::empty(Status::BAD_REQUEST);
        }

        HttpResponse::json(*status, body)
    }
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    bind_address: IpAddr,
    port: u16,
    profile: ProfileKind,
    rsa: CredentialPair,
    ecdsa: CredentialPair,
    trust_anchor: PathBuf,
    crl_index: Option<PathBuf>,
    protocol_version: TlsVersion,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig::from_certs_dir("certs")
    }
}

impl ListenerConfig {
    /// Settings with every credential taken from `dir`
    ///
    /// Expects `server.cert`/`server.key`, `server-ecc.cert`/`server-ecc.key`
    /// and `ca.cert`.
    pub fn from_certs_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        ListenerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_LISTENER_PORT,
            profile: ProfileKind::Rsa,
            rsa: CredentialPair::new(dir.join("server.cert"), dir.join("server.key")),
            ecdsa: CredentialPair::new(dir.join("server-ecc.cert"), dir.join("server-ecc.key")),
            trust_anchor: dir.join("ca.cert"),
            crl_index: None,
            protocol_version: TlsVersion::Tls12,
        }
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Port to bind; 0 picks an ephemeral port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_profile(mut self, profile: ProfileKind) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_rsa_credential(mut self, credential: CredentialPair) -> Self {
        self.rsa = credential;
        self
    }

    pub fn with_ecdsa_credential(mut self, credential: CredentialPair) -> Self {
        self.ecdsa = credential;
        self
    }

    pub fn with_trust_anchor(mut self, path: impl Into<PathBuf>) -> Self {
        self.trust_anchor = path.into();
        self
    }

    pub fn with_crl_index(mut self, path: impl Into<PathBuf>) -> Self {
        self.crl_index = Some(path.into());
        self
    }

    pub fn with_protocol_version(mut self, version: TlsVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn profile(&self) -> ProfileKind {
        self.profile
    }

    /// Credential of the active profile
    pub fn credential(&self) -> &CredentialPair {
        match self.profile {
            ProfileKind::Rsa => &self.rsa,
            ProfileKind::Ecdsa => &self.ecdsa,
        }
    }

    pub fn trust_anchor(&self) -> &Path {
        &self.trust_anchor
    }

    pub fn crl_index(&self) -> Option<&Path> {
        self.crl_index.as_deref()
    }

    pub fn protocol_version(&self) -> TlsVersion {
        self.protocol_version
    }
}

fn server_context(
    config: &ListenerConfig,
    crl_paths: &[PathBuf],
    revocations: Arc<RevocationSet>,
) -> Result<SslContext, ValidationError> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;

    let credential = config.credential();
    credential
        .apply(&mut builder)
        .map_err(|e| ValidationError::Credential {
            path: credential.certificate().to_path_buf(),
            message: e.to_string(),
        })?;

    let allowed: Vec<String> = config
        .profile
        .allowed_ciphers()
        .iter()
        .map(|c| c.to_string())
        .collect();
    restrict_protocol(&mut builder, config.protocol_version)
        .and_then(|_| restrict_ciphers(&mut builder, &allowed, config.protocol_version))
        .map_err(|e| ValidationError::Profile {
            profile: config.profile,
            message: e.to_string(),
        })?;

    builder
        .set_ca_file(&config.trust_anchor)
        .map_err(|e| ValidationError::Credential {
            path: config.trust_anchor.clone(),
            message: e.to_string(),
        })?;

    if !crl_paths.is_empty() {
        let lookup = builder.cert_store_mut().add_lookup(X509Lookup::file())?;
        for path in crl_paths {
            lookup
                .load_crl_file(path, SslFiletype::ASN1)
                .map_err(|source| ValidationError::CrlParse {
                    path: path.clone(),
                    source,
                })?;
        }
        builder
            .cert_store_mut()
            .set_flags(X509VerifyFlags::CRL_CHECK | X509VerifyFlags::CRL_CHECK_ALL)?;
    }

    let mode = SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT;
    builder.set_verify_callback(mode, move |preverified, x509_ctx| {
        let depth = x509_ctx.error_depth();
        let Some(cert) = x509_ctx.current_cert() else {
            return preverified;
        };
        let subject = common_name(cert.subject_name());
        let revoked = depth == 0 && revocations.is_revoked(cert);

        if !preverified {
            tracing::warn!(depth, cn = %subject, error = %x509_ctx.error(), "client certificate rejected");
            return false;
        }
        if revoked {
            tracing::warn!(cn = %subject, "client certificate is revoked");
            x509_ctx.set_error(unsafe { X509VerifyResult::from_raw(openssl_sys::X509_V_ERR_CERT_REVOKED) });
            return false;
        }

        tracing::debug!(depth, cn = %subject, "client certificate accepted");
        true
    });

    Ok(builder.build())
}

fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn serve_connection(ctx: &SslContext, tcp: TcpStream, handler: &dyn RequestHandler) {
    let peer = tcp.peer_addr().ok();

    let ssl = match Ssl::new(ctx) {
        Ok(ssl) => ssl,
        Err(e) => {
            tracing::error!(error = %e, "failed to create TLS state");
            return;
        }
    };
    if let Err(e) = tcp
        .set_read_timeout(Some(DEFAULT_SESSION_TIMEOUT))
        .and_then(|_| tcp.set_write_timeout(Some(DEFAULT_SESSION_TIMEOUT)))
    {
        tracing::warn!(?peer, error = %e, "failed to set socket timeouts");
    }

    let session = match TlsSessionOps::accept(ssl, tcp) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(?peer, error = %e, "handshake rejected");
            return;
        }
    };

    let client_cn = session
        .peer_chain()
        .first()
        .map(|info| info.subject.clone())
        .unwrap_or_default();
    let mut server = HttpServer::new(session);

    match server.receive_request() {
        Ok(request) => {
            let response = handler.handle(&request);
            tracing::info!(
                method = %request.method(),
                path = request.path(),
                status = response.status().code(),
                client = %client_cn,
                "served request"
            );
            if let Err(e) = server.send_response(&response) {
                tracing::warn!(?peer, error = %e, "failed to send response");
            }
        }
        Err(e) => tracing::debug!(?peer, error = %e, "no request received"),
    }

    let _ = server.close();
}

/// Running listener; stops on [`stop`](Self::stop) or drop
pub struct RevocationAwareTlsListener {
    local_addr: SocketAddr,
    profile: ProfileKind,
    revocations: Arc<RevocationSet>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RevocationAwareTlsListener {
    /// Load credentials and revocation data, bind, and start accepting
    ///
    /// Any unreadable or malformed CRL aborts startup, as does a protocol
    /// version other than TLS 1.2.
    pub fn start(config: ListenerConfig, handler: impl RequestHandler) -> Result<Self, ValidationError> {
        if config.protocol_version() != TlsVersion::Tls12 {
            return Err(ValidationError::UnsupportedVersion(config.protocol_version()));
        }

        let (crl_paths, crls) = match config.crl_index() {
            Some(index) => {
                let paths = parse_crl_index(index)?;
                let crls = paths
                    .iter()
                    .map(|path| load_crl(path))
                    .collect::<Result<Vec<X509Crl>, _>>()?;
                (paths, crls)
            }
            None => (Vec::new(), Vec::new()),
        };
        let revocations = Arc::new(RevocationSet::from_crls(&crls)?);
        if config.crl_index().is_some() {
            tracing::info!(
                crls = revocations.crl_count(),
                revoked = revocations.len(),
                "loaded revocation lists"
            );
        }

        let ctx = server_context(&config, &crl_paths, Arc::clone(&revocations))?;

        let addr = config.addr();
        let listener = bind(addr).map_err(|source| ValidationError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ValidationError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&shutdown);
        let handler: Arc<dyn RequestHandler> = Arc::new(handler);

        let handle = thread::Builder::new()
            .name(format!("tls-listener-{}", local_addr.port()))
            .spawn(move || {
                for stream in listener.incoming() {
                    if stop_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(tcp) => serve_connection(&ctx, tcp, handler.as_ref()),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                tracing::debug!("listener stopped");
            })
            .map_err(|source| ValidationError::Bind {
                addr: local_addr.to_string(),
                source,
            })?;

        tracing::info!(
            addr = %local_addr,
            profile = %config.profile(),
            crl_check = config.crl_index().is_some(),
            "listener started"
        );

        Ok(RevocationAwareTlsListener {
            local_addr,
            profile: config.profile(),
            revocations,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn profile(&self) -> ProfileKind {
        self.profile
    }

    /// Revocation data loaded at startup
    pub fn revocations(&self) -> &RevocationSet {
        &self.revocations
    }

    /// `https://localhost:<port>`, matching the server certificate name
    pub fn base_url(&self) -> String {
        format!("https://localhost:{}", self.local_addr.port())
    }

    /// Stop accepting and wait for the accept thread to exit
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::SeqCst);

        // Wake the blocking accept
        let wake_ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        let _ = TcpStream::connect(SocketAddr::new(wake_ip, self.local_addr.port()));

        if handle.join().is_err() {
            tracing::error!("listener thread panicked");
        }
    }
}

impl Drop for RevocationAwareTlsListener {
    fn drop(&mut self) {
        self.stop();
    }
}
