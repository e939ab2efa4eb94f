//! HTTP endpoint task.
//!
//! Each execution dials the target afresh — resolve, connect, optional TLS,
//! then a single HTTP/1.1 exchange over hyper's connection API — so that
//! every connection phase gets a real timestamp instead of a pool hit.
//! Transport control pins the remote address, bypassing name resolution
//! entirely, with TLS and certificate verification toggles for probing
//! specific backends behind a shared name.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Method, Request};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;
use vigil_cadence::SchedulerError;

use super::{EndpointTask, TaskContext};
use crate::error::{WatchError, WatchResult};
use crate::response::{HttpPayload, RequestTimestamps, TaskPayload, WatcherResponse};

/// Connect timeout applied when the remote address is pinned.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pins the remote address of an HTTP endpoint, bypassing DNS.
#[derive(Debug, Clone)]
pub struct TransportControl {
    /// Address and port every request is dialed to.
    pub addr_port: SocketAddr,
    /// Wrap the connection in TLS, with the URL's hostname as SNI.
    pub tls_enabled: bool,
    /// Skip server certificate verification.
    pub skip_tls_verify: bool,
}

impl TransportControl {
    /// Transport control with TLS disabled.
    pub fn new(addr_port: SocketAddr) -> Self {
        Self {
            addr_port,
            tls_enabled: false,
            skip_tls_verify: false,
        }
    }
}

/// An HTTP endpoint the watcher polls.
///
/// Constructed with [`HttpEndpoint::new`] and builder-style options, then
/// handed to a watcher; the probe client is assembled at initialize time.
pub struct HttpEndpoint {
    url: Url,
    method: Method,
    header: HeaderMap,
    payload: Bytes,
    id: String,
    transport: Option<TransportControl>,
    read_fast: bool,

    client: OnceLock<ProbeClient>,
    ctx: OnceLock<TaskContext>,
}

impl HttpEndpoint {
    /// Creates an endpoint with an empty header map, empty payload, and a
    /// fresh ID.
    pub fn new(url: Url, method: Method) -> Self {
        Self {
            url,
            method,
            header: HeaderMap::new(),
            payload: Bytes::new(),
            id: Uuid::now_v7().simple().to_string(),
            transport: None,
            read_fast: false,
            client: OnceLock::new(),
            ctx: OnceLock::new(),
        }
    }

    /// Replaces the request headers.
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }

    /// Sets the request body.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Overrides the generated endpoint ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Pins the remote address via transport control.
    pub fn with_transport_control(mut self, tc: TransportControl) -> Self {
        self.transport = Some(tc);
        self
    }

    /// Buffers the response body in memory as soon as the response arrives,
    /// closing the underlying connection early.
    pub fn with_read_fast(mut self) -> Self {
        self.read_fast = true;
        self
    }

    /// The endpoint's stable ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn run(&self) -> WatchResult<()> {
        let Some(ctx) = self.ctx.get() else {
            return Err(WatchError::Configuration(
                "endpoint executed before initialize".into(),
            ));
        };
        // Clone the URL so nothing downstream can mutate the endpoint's copy.
        let url = self.url.clone();

        match self.exchange(&url).await {
            Ok(payload) => {
                ctx.emit(WatcherResponse::success(
                    self.id.clone(),
                    url,
                    TaskPayload::Http(payload),
                ))
                .await;
                Ok(())
            }
            Err(e) => {
                ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                    .await;
                Err(e)
            }
        }
    }

    async fn exchange(&self, url: &Url) -> WatchResult<HttpPayload> {
        let client = self
            .client
            .get()
            .ok_or_else(|| WatchError::Configuration("probe client not built".into()))?;

        let mut timestamps = RequestTimestamps::default();
        let sent_wall = SystemTime::now();
        timestamps.start = Some(Instant::now());

        // Resolve, unless the address is pinned.
        let addr = match client.pinned {
            Some(addr) => addr,
            None => {
                let host = url
                    .host_str()
                    .ok_or_else(|| WatchError::Configuration("URL has no host".into()))?;
                let port = url
                    .port_or_known_default()
                    .ok_or_else(|| WatchError::Configuration("URL has no port".into()))?;
                timestamps.dns_start = Some(Instant::now());
                let resolved = lookup_host((host, port))
                    .await
                    .map_err(|e| WatchError::Connection(format!("resolve {host}: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        WatchError::Connection(format!("resolve {host}: no addresses"))
                    })?;
                timestamps.dns_done = Some(Instant::now());
                resolved
            }
        };

        // Connect.
        timestamps.conn_start = Some(Instant::now());
        let connect = TcpStream::connect(addr);
        let tcp = if client.pinned.is_some() {
            timeout(DIAL_TIMEOUT, connect)
                .await
                .map_err(|_| WatchError::Timeout(format!("dial {addr}")))?
        } else {
            connect.await
        }
        .map_err(|e| WatchError::Connection(format!("dial {addr}: {e}")))?;
        timestamps.conn_done = Some(Instant::now());
        let remote_addr = tcp.peer_addr().ok();

        let request = self.build_request(url)?;

        // Optional TLS, then the exchange itself.
        let (parts, body) = match &client.tls {
            Some(tls) => {
                timestamps.tls_start = Some(Instant::now());
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|e| WatchError::Connection(format!("TLS handshake: {e}")))?;
                timestamps.tls_done = Some(Instant::now());
                send_over(stream, request, &mut timestamps).await?
            }
            None => send_over(tcp, request, &mut timestamps).await?,
        };

        if self.read_fast {
            let collected = body
                .collect()
                .await
                .map_err(|e| WatchError::Body(e.to_string()))?;
            timestamps.data_done = Some(Instant::now());
            Ok(HttpPayload::buffered(
                remote_addr,
                parts.status,
                parts.headers,
                collected.to_bytes(),
                timestamps,
                Some(sent_wall),
            ))
        } else {
            Ok(HttpPayload::streaming(
                remote_addr,
                parts.status,
                parts.headers,
                body,
                timestamps,
                Some(sent_wall),
            ))
        }
    }

    fn build_request(&self, url: &Url) -> WatchResult<Request<Full<Bytes>>> {
        let path_and_query = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(path_and_query)
            .body(Full::new(self.payload.clone()))
            .map_err(|e| WatchError::Configuration(format!("building request: {e}")))?;

        let headers = request.headers_mut();
        for (name, value) in &self.header {
            headers.append(name, value.clone());
        }
        if !headers.contains_key(HOST) {
            let host = host_header(url)?;
            headers.insert(
                HOST,
                host.parse()
                    .map_err(|_| WatchError::Configuration(format!("invalid host: {host}")))?,
            );
        }
        Ok(request)
    }
}

fn host_header(url: &Url) -> WatchResult<String> {
    let host = url
        .host_str()
        .ok_or_else(|| WatchError::Configuration("URL has no host".into()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

async fn send_over<S>(
    stream: S,
    request: Request<Full<Bytes>>,
    timestamps: &mut RequestTimestamps,
) -> WatchResult<(http::response::Parts, hyper::body::Incoming)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| WatchError::Connection(format!("HTTP handshake: {e}")))?;
    // The connection task lives until the response body is fully drained.
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "http connection ended");
        }
    });

    sender
        .ready()
        .await
        .map_err(|e| WatchError::Connection(format!("connection not ready: {e}")))?;
    timestamps.wrote_done = Some(Instant::now());
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| WatchError::Connection(format!("request failed: {e}")))?;
    timestamps.first_byte = Some(Instant::now());

    Ok(response.into_parts())
}

/// Connection settings assembled at initialize time.
struct ProbeClient {
    pinned: Option<SocketAddr>,
    tls: Option<TlsSetup>,
}

struct TlsSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

fn build_client(url: &Url, transport: Option<&TransportControl>) -> WatchResult<ProbeClient> {
    let use_tls = match transport {
        Some(tc) => tc.tls_enabled,
        None => url.scheme() == "https",
    };
    let skip_verify = transport.is_some_and(|tc| tc.skip_tls_verify);

    let tls = if use_tls {
        let host = url
            .host_str()
            .ok_or_else(|| WatchError::Configuration("URL has no host".into()))?;
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| WatchError::Configuration(format!("invalid SNI host: {host}")))?;
        let config = tls_config(skip_verify)?;
        Some(TlsSetup {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    } else {
        None
    };

    Ok(ProbeClient {
        pinned: transport.map(|tc| tc.addr_port),
        tls,
    })
}

fn tls_config(skip_verify: bool) -> WatchResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)
        .map_err(|e| WatchError::Configuration(format!("TLS protocol versions: {e}")))?;

    let config = if skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    Ok(config)
}

/// Certificate verifier honoring the skip-verify flag: accepts any chain,
/// delegates signature scheme support to the crypto provider.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[async_trait]
impl EndpointTask for HttpEndpoint {
    fn validate(&self) -> WatchResult<()> {
        match self.url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(WatchError::Configuration(format!(
                    "unsupported HTTP scheme: {other}"
                )))
            }
        }
        if self.url.host_str().is_none() {
            return Err(WatchError::Configuration("URL has no host".into()));
        }
        if self.id.is_empty() {
            return Err(WatchError::Configuration("endpoint ID is empty".into()));
        }
        if let Some(tc) = &self.transport {
            if tc.addr_port.port() == 0 || tc.addr_port.ip().is_unspecified() {
                return Err(WatchError::Configuration(
                    "transport control address is empty".into(),
                ));
            }
        }
        Ok(())
    }

    async fn initialize(
        &self,
        watcher_id: &str,
        response_tx: mpsc::Sender<WatcherResponse>,
    ) -> WatchResult<()> {
        let client = build_client(&self.url, self.transport.as_ref())?;
        let ctx = TaskContext {
            watcher_id: watcher_id.to_string(),
            response_tx,
            cancel: CancellationToken::new(),
        };
        if self.client.set(client).is_err() || self.ctx.set(ctx).is_err() {
            return Err(WatchError::Configuration(
                "endpoint already initialized".into(),
            ));
        }
        Ok(())
    }

    fn task(self: Arc<Self>) -> Arc<dyn vigil_cadence::Task> {
        Arc::new(HttpProbe { endpoint: self })
    }

    async fn close(&self) -> WatchResult<()> {
        if let Some(ctx) = self.ctx.get() {
            ctx.cancel.cancel();
        }
        Ok(())
    }
}

/// Schedulable unit wrapping one HTTP request execution.
struct HttpProbe {
    endpoint: Arc<HttpEndpoint>,
}

#[async_trait]
impl vigil_cadence::Task for HttpProbe {
    async fn execute(&self) -> Result<(), SchedulerError> {
        self.endpoint
            .run()
            .await
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }
}
