//! WebSocket endpoint task.
//!
//! Two operating modes share one endpoint type. One-hit text mode opens a
//! fresh connection for every execution, exchanges a single message, and
//! closes; there is no way to link replies to requests on a bare text
//! socket, so the connection itself is the correlation. Persistent JSON-RPC
//! mode keeps one long-lived connection and correlates replies to in-flight
//! requests by rewriting the request `id` to a per-call unique value, which
//! lets many requests share the socket without losing message integrity.
//!
//! Locking discipline: the endpoint mutex guards the write half and is held
//! for the whole of every execution; the read pump is the only reader and
//! never takes the mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;
use vigil_cadence::SchedulerError;

use super::{EndpointTask, TaskContext};
use crate::error::{WatchError, WatchResult};
use crate::jsonrpc;
use crate::response::{RequestTimestamps, TaskPayload, WatcherResponse, WsPayload};

/// Write deadline for close control frames, and the grace period granted to
/// an old read pump before reconnect gives up on joining it.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Operating mode of a WebSocket endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsEndpointMode {
    /// Unset; resolves to [`WsEndpointMode::OneHitText`] at initialize.
    #[default]
    Unknown,
    /// A new connection per message, one response read per execution.
    OneHitText,
    /// One long-lived connection carrying JSON-RPC envelopes, with reply
    /// correlation via ID rewriting.
    PersistentJsonRpc,
}

/// Bookkeeping for a request written to the socket whose reply has not yet
/// been observed.
#[derive(Debug, Clone)]
struct InflightMessage {
    original_id: Option<Value>,
    sent_at: Instant,
    sent_wall: SystemTime,
}

struct ConnHandle {
    sink: WsSink,
    remote_addr: Option<SocketAddr>,
    /// Which dial this handle came from; the read pump clears the slot only
    /// when it still holds its own connection.
    epoch: u64,
}

struct WsShared {
    conn: Mutex<Option<ConnHandle>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    inflight: DashMap<String, InflightMessage>,
    epoch: AtomicU64,
}

/// A WebSocket endpoint the watcher polls.
pub struct WsEndpoint {
    url: Url,
    header: HeaderMap,
    mode: WsEndpointMode,
    payload: Bytes,
    id: String,

    shared: Arc<WsShared>,
    ctx: OnceLock<TaskContext>,
}

impl WsEndpoint {
    /// Creates an endpoint with an empty header map, empty payload, and a
    /// fresh ID.
    pub fn new(url: Url, mode: WsEndpointMode) -> Self {
        Self {
            url,
            header: HeaderMap::new(),
            mode,
            payload: Bytes::new(),
            id: Uuid::now_v7().simple().to_string(),
            shared: Arc::new(WsShared {
                conn: Mutex::new(None),
                pump: Mutex::new(None),
                inflight: DashMap::new(),
                epoch: AtomicU64::new(0),
            }),
            ctx: OnceLock::new(),
        }
    }

    /// Replaces the handshake headers.
    pub fn with_header(mut self, header: HeaderMap) -> Self {
        self.header = header;
        self
    }

    /// Sets the outgoing message payload.
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Overrides the generated endpoint ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
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

    /// Number of requests currently awaiting replies. Persistent mode only.
    pub fn inflight_count(&self) -> usize {
        self.shared.inflight.len()
    }

    fn effective_mode(&self) -> WsEndpointMode {
        match self.mode {
            WsEndpointMode::Unknown => WsEndpointMode::OneHitText,
            mode => mode,
        }
    }

    fn context(&self) -> WatchResult<&TaskContext> {
        self.ctx.get().ok_or_else(|| {
            WatchError::Configuration("endpoint executed before initialize".into())
        })
    }

    async fn dial(&self) -> WatchResult<(WsStream, Option<SocketAddr>)> {
        let request = client_request(&self.url, &self.header)?;
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| WatchError::Connection(format!("failed to dial: {e}")))?;
        let remote_addr = peer_addr(&stream);
        Ok((stream, remote_addr))
    }

    /// Establishes the persistent connection and starts the read pump. Fails
    /// if a connection is already up.
    async fn connect(&self) -> WatchResult<()> {
        let mut conn = self.shared.conn.lock().await;
        if conn.is_some() {
            return Err(WatchError::Connection(
                "connection already established".into(),
            ));
        }
        let (stream, remote_addr) = self.dial().await?;
        let (sink, source) = stream.split();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *conn = Some(ConnHandle {
            sink,
            remote_addr,
            epoch,
        });
        drop(conn);

        self.spawn_pump(source, remote_addr, epoch).await;
        Ok(())
    }

    /// Closes the current connection, joins the old read pump, reports every
    /// orphaned in-flight request, then dials and pumps anew.
    async fn reconnect(&self) -> WatchResult<()> {
        if self.effective_mode() != WsEndpointMode::PersistentJsonRpc {
            return Err(WatchError::Configuration(
                "can only reconnect persistent endpoints".into(),
            ));
        }
        let ctx = self.context()?;

        // Initiate closure so the pump's read side terminates.
        if let Some(mut handle) = self.shared.conn.lock().await.take() {
            let _ = timeout(CLOSE_GRACE, handle.sink.send(Message::Close(None))).await;
        }

        // Join the previous pump before starting a new one.
        if let Some(mut handle) = self.shared.pump.lock().await.take() {
            if timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                tracing::warn!(task = %self.id, "read pump did not exit in time, aborting it");
                handle.abort();
            }
        }

        // No reply will arrive for requests written to the old socket.
        let orphaned: Vec<String> = self
            .shared
            .inflight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in orphaned {
            if self.shared.inflight.remove(&key).is_some() {
                ctx.emit(WatcherResponse::failure(
                    self.id.clone(),
                    self.url.clone(),
                    WatchError::TransportReset,
                ))
                .await;
            }
        }

        let (stream, remote_addr) = self
            .dial()
            .await
            .map_err(|e| WatchError::Connection(format!("failed to dial when reconnecting: {e}")))?;
        let (sink, source) = stream.split();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.conn.lock().await = Some(ConnHandle {
            sink,
            remote_addr,
            epoch,
        });

        self.spawn_pump(source, remote_addr, epoch).await;
        Ok(())
    }

    async fn spawn_pump(&self, source: WsSource, remote_addr: Option<SocketAddr>, epoch: u64) {
        let ctx = match self.ctx.get() {
            Some(ctx) => ctx.clone(),
            // connect() is only reachable through initialize, which sets the
            // context first.
            None => return,
        };
        let handle = tokio::spawn(read_pump(
            source,
            remote_addr,
            epoch,
            self.url.clone(),
            self.id.clone(),
            ctx,
            self.shared.clone(),
        ));
        *self.shared.pump.lock().await = Some(handle);
    }

    /// One-hit execution: dial, send one text frame, read one data frame,
    /// close.
    async fn run_one_hit(&self) -> WatchResult<()> {
        let ctx = self.context()?;

        // Hold the endpoint lock for the duration; the slot must be empty,
        // one-hit executions never share state with persistent mode.
        let conn = self.shared.conn.lock().await;
        if conn.is_some() {
            return Err(WatchError::Configuration(
                "connection is already open".into(),
            ));
        }
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let url = self.url.clone();

        let mut timestamps = RequestTimestamps::default();
        let sent_wall = SystemTime::now();

        // The dial is a single opaque interval on this path: resolve,
        // connect, and TLS all share the pre- and post-dial stamps.
        let before_dial = Instant::now();
        timestamps.start = Some(before_dial);
        timestamps.dns_start = Some(before_dial);
        timestamps.conn_start = Some(before_dial);
        timestamps.tls_start = Some(before_dial);

        let (mut stream, remote_addr) = match self.dial().await {
            Ok(pair) => pair,
            Err(e) => {
                ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                    .await;
                return Err(e);
            }
        };
        let after_dial = Instant::now();
        timestamps.dns_done = Some(after_dial);
        timestamps.conn_done = Some(after_dial);
        timestamps.tls_done = Some(after_dial);

        let text = match utf8_message(&self.payload) {
            Ok(text) => text,
            Err(e) => {
                ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                    .await;
                return Err(e);
            }
        };
        if let Err(e) = stream.send(Message::Text(text)).await {
            let e = WatchError::Write(format!("failed to write message: {e}"));
            ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                .await;
            return Err(e);
        }
        timestamps.wrote_done = Some(Instant::now());

        // Read exactly one data frame, skipping control traffic.
        let data = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => break Bytes::from(text),
                Some(Ok(Message::Binary(bytes))) => break bytes,
                Some(Ok(Message::Close(_))) | None => {
                    let e = WatchError::ConnectionClosed(
                        "connection closed before a response arrived".into(),
                    );
                    ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                        .await;
                    return Err(e);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let e = WatchError::Connection(format!("failed to read message: {e}"));
                    ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                        .await;
                    return Err(e);
                }
            }
        };
        let received = Instant::now();
        timestamps.first_byte = Some(received);
        timestamps.data_done = Some(received);

        ctx.emit(WatcherResponse::success(
            self.id.clone(),
            url,
            TaskPayload::Ws(WsPayload::new(
                remote_addr,
                data,
                timestamps,
                Some(sent_wall),
            )),
        ))
        .await;

        // Graceful close with a short deadline; don't wait for the peer's
        // close frame.
        let close = stream.close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::default(),
        }));
        match timeout(CLOSE_GRACE, close).await {
            Err(_) => Err(WatchError::Timeout("writing close frame".into())),
            Ok(Err(tungstenite::Error::ConnectionClosed)) | Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(WatchError::Write(format!(
                "failed to write close message: {e}"
            ))),
        }
    }

    /// Persistent execution: rewrite the request ID, record the in-flight
    /// entry, write the frame. The reply arrives through the read pump.
    async fn run_persistent(&self) -> WatchResult<()> {
        let ctx = self.context()?;
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        // Lazily reconnect when the connection has been torn down. The guard
        // must not outlive the check: reconnect takes the same lock.
        let disconnected = self.shared.conn.lock().await.is_none();
        if disconnected {
            self.reconnect().await?;
        }

        let mut conn = self.shared.conn.lock().await;
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let url = self.url.clone();

        let mut request = jsonrpc::Request::default();
        if !self.payload.is_empty() {
            request = match jsonrpc::Request::from_bytes(&self.payload) {
                Ok(request) => request,
                Err(e) => {
                    drop(conn);
                    ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                        .await;
                    return Err(e);
                }
            };
        }

        // Swap in a fresh correlation ID; remember the caller's.
        let correlation_id = Uuid::now_v7().simple().to_string();
        let mut original_id = None;
        if !request.is_empty() {
            original_id = request.id.take();
            request.id = Some(Value::String(correlation_id.clone()));
        }

        let frame = if request.is_empty() {
            self.payload.clone()
        } else {
            match request.to_bytes() {
                Ok(bytes) => Bytes::from(bytes),
                Err(e) => {
                    drop(conn);
                    ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                        .await;
                    return Err(e);
                }
            }
        };
        let text = match utf8_message(&frame) {
            Ok(text) => text,
            Err(e) => {
                drop(conn);
                ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                    .await;
                return Err(e);
            }
        };

        let Some(handle) = conn.as_mut() else {
            drop(conn);
            let e = WatchError::ConnectionClosed("connection lost before write".into());
            ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                .await;
            return Err(e);
        };

        // The entry goes in strictly before the write, so the pump can never
        // see a reply for an unknown-but-legitimate ID.
        self.shared.inflight.insert(
            correlation_id.clone(),
            InflightMessage {
                original_id,
                sent_at: Instant::now(),
                sent_wall: SystemTime::now(),
            },
        );

        if let Err(e) = handle.sink.send(Message::Text(text)).await {
            let e = classify_write_error(&e);
            // A failed write means the connection is no longer usable.
            *conn = None;
            drop(conn);
            ctx.emit(WatcherResponse::failure(self.id.clone(), url, e.clone()))
                .await;
            return Err(e);
        }

        Ok(())
    }
}

/// The read pump: sole reader of a persistent connection. Correlates
/// JSON-RPC replies against the in-flight map, restores original request
/// IDs, and emits response records until cancellation or a terminal read
/// condition.
async fn read_pump(
    mut source: WsSource,
    remote_addr: Option<SocketAddr>,
    epoch: u64,
    url: Url,
    task_id: String,
    ctx: TaskContext,
    shared: Arc<WsShared>,
) {
    loop {
        let message = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            message = source.next() => message,
        };

        let frame = match message {
            Some(Ok(Message::Text(text))) => Bytes::from(text),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(task = %task_id, ?frame, "peer closed websocket");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(
                e @ (tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed),
            )) => {
                tracing::debug!(task = %task_id, error = %e, "websocket closed");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(task = %task_id, error = %e, "unexpected websocket read error");
                break;
            }
            None => {
                tracing::debug!(task = %task_id, "websocket stream ended");
                break;
            }
        };

        let mut timestamps = RequestTimestamps {
            first_byte: Some(Instant::now()),
            ..Default::default()
        };

        let response = match jsonrpc::Response::from_bytes(&frame) {
            Ok(response) => response,
            Err(e) => {
                ctx.emit(WatcherResponse::failure(task_id.clone(), url.clone(), e))
                    .await;
                return;
            }
        };
        if response.is_empty() {
            ctx.emit(WatcherResponse::failure(
                task_id.clone(),
                url.clone(),
                WatchError::Protocol("empty JSON-RPC response".into()),
            ))
            .await;
            continue;
        }
        let correlation_id = response.id_string();
        if correlation_id.is_empty() {
            ctx.emit(WatcherResponse::failure(
                task_id.clone(),
                url.clone(),
                WatchError::Protocol("response has no ID".into()),
            ))
            .await;
            return;
        }

        let Some((_, inflight)) = shared.inflight.remove(&correlation_id) else {
            ctx.emit(WatcherResponse::failure(
                task_id.clone(),
                url.clone(),
                WatchError::UnknownCorrelationId(correlation_id),
            ))
            .await;
            continue;
        };

        timestamps.start = Some(inflight.sent_at);

        // Restore the caller's ID before handing the reply back.
        let mut response = response;
        response.id = inflight.original_id.clone();
        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                ctx.emit(WatcherResponse::failure(task_id.clone(), url.clone(), e))
                    .await;
                return;
            }
        };

        ctx.emit(WatcherResponse::success(
            task_id.clone(),
            url.clone(),
            TaskPayload::Ws(WsPayload::new(
                remote_addr,
                Bytes::from(bytes),
                timestamps,
                Some(inflight.sent_wall),
            )),
        ))
        .await;
    }

    // Read side is gone; clear the write half unless a newer connection has
    // already replaced it.
    let mut conn = shared.conn.lock().await;
    if conn.as_ref().is_some_and(|c| c.epoch == epoch) {
        *conn = None;
    }
}

fn classify_write_error(e: &tungstenite::Error) -> WatchError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            WatchError::ConnectionClosed(format!("websocket write failed: {e}"))
        }
        other => WatchError::Write(format!("unexpected websocket write error: {other}")),
    }
}

fn utf8_message(payload: &Bytes) -> WatchResult<Utf8Bytes> {
    Utf8Bytes::try_from(payload.clone())
        .map_err(|e| WatchError::Protocol(format!("payload is not valid UTF-8: {e}")))
}

fn client_request(url: &Url, header: &HeaderMap) -> WatchResult<http::Request<()>> {
    let host = url
        .host_str()
        .ok_or_else(|| WatchError::Configuration("URL has no host".into()))?;
    let host_value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let mut request = http::Request::builder()
        .method("GET")
        .uri(url.as_str())
        .header("Host", host_value)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| WatchError::Configuration(format!("building handshake request: {e}")))?;
    for (name, value) in header {
        request.headers_mut().append(name, value.clone());
    }
    Ok(request)
}

fn peer_addr(stream: &WsStream) -> Option<SocketAddr> {
    match stream.get_ref() {
        MaybeTlsStream::Plain(tcp) => tcp.peer_addr().ok(),
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0.peer_addr().ok(),
        _ => None,
    }
}

#[async_trait]
impl EndpointTask for WsEndpoint {
    fn validate(&self) -> WatchResult<()> {
        match self.url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(WatchError::Configuration(format!(
                    "unsupported WebSocket scheme: {other}"
                )))
            }
        }
        if self.url.host_str().is_none() {
            return Err(WatchError::Configuration("URL has no host".into()));
        }
        if self.id.is_empty() {
            return Err(WatchError::Configuration("endpoint ID is empty".into()));
        }
        Ok(())
    }

    async fn initialize(
        &self,
        watcher_id: &str,
        response_tx: mpsc::Sender<WatcherResponse>,
    ) -> WatchResult<()> {
        let ctx = TaskContext {
            watcher_id: watcher_id.to_string(),
            response_tx,
            cancel: CancellationToken::new(),
        };
        if self.ctx.set(ctx).is_err() {
            return Err(WatchError::Configuration(
                "endpoint already initialized".into(),
            ));
        }

        if self.effective_mode() == WsEndpointMode::PersistentJsonRpc {
            self.connect().await.map_err(|e| {
                WatchError::Connection(format!("failed to connect when initializing: {e}"))
            })?;
        }
        // One-hit mode needs no standing connection.
        Ok(())
    }

    fn task(self: Arc<Self>) -> Arc<dyn vigil_cadence::Task> {
        match self.effective_mode() {
            WsEndpointMode::PersistentJsonRpc => Arc::new(WsPersistent { endpoint: self }),
            _ => Arc::new(WsOneHit { endpoint: self }),
        }
    }

    async fn close(&self) -> WatchResult<()> {
        let mut write_error = None;

        let mut conn = self.shared.conn.lock().await;
        if let Some(mut handle) = conn.take() {
            let frame = Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Utf8Bytes::default(),
            }));
            match timeout(CLOSE_GRACE, handle.sink.send(frame)).await {
                Err(_) => write_error = Some(WatchError::Timeout("writing close frame".into())),
                Ok(Err(tungstenite::Error::ConnectionClosed)) | Ok(Ok(())) => {}
                Ok(Err(e)) => write_error = Some(classify_write_error(&e)),
            }
        }
        drop(conn);

        if let Some(ctx) = self.ctx.get() {
            ctx.cancel.cancel();
        }

        match write_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Schedulable unit for one-hit executions.
struct WsOneHit {
    endpoint: Arc<WsEndpoint>,
}

#[async_trait]
impl vigil_cadence::Task for WsOneHit {
    async fn execute(&self) -> Result<(), SchedulerError> {
        self.endpoint
            .run_one_hit()
            .await
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }
}

/// Schedulable unit for persistent JSON-RPC executions.
struct WsPersistent {
    endpoint: Arc<WsEndpoint>,
}

#[async_trait]
impl vigil_cadence::Task for WsPersistent {
    async fn execute(&self) -> Result<(), SchedulerError> {
        self.endpoint
            .run_persistent()
            .await
            .map_err(|e| SchedulerError::Execution(e.to_string()))
    }
}
