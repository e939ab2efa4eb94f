//! Response records and the timing data they carry.
//!
//! Every task execution funnels exactly one [`WatcherResponse`] into its
//! watcher's response path: either a payload wrapper or an error, never
//! both. HTTP payloads may hold an unread body; [`TaskPayload::data`] drains
//! it on first call and caches the bytes, so the consumer decides whether
//! body transfer time is part of the measurement.

use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use url::Url;

use crate::error::{WatchError, WatchResult};

/// Monotonic points captured over the course of one request.
///
/// Not every path populates every point: the HTTP engine stamps all phases,
/// the one-hit WebSocket task reports the dial as a single opaque interval,
/// and the persistent WebSocket path stamps `start` (send) and `first_byte`
/// (reply arrival) only.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTimestamps {
    pub start: Option<Instant>,
    pub dns_start: Option<Instant>,
    pub dns_done: Option<Instant>,
    pub conn_start: Option<Instant>,
    pub conn_done: Option<Instant>,
    pub tls_start: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub wrote_done: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub data_done: Option<Instant>,
}

impl RequestTimestamps {
    /// Time from request start to the first byte of the response, when both
    /// points were captured.
    pub fn latency(&self) -> Option<Duration> {
        match (self.start, self.first_byte) {
            (Some(start), Some(first_byte)) => Some(first_byte.saturating_duration_since(start)),
            _ => None,
        }
    }
}

/// Wall-clock metadata derived from a payload.
#[derive(Debug, Clone, Copy)]
pub struct ResponseMetadata {
    /// When the request was sent, if the path records it.
    pub sent_at: Option<SystemTime>,
    /// When the response was received.
    pub received_at: SystemTime,
    /// Derived start-to-first-byte latency.
    pub latency: Option<Duration>,
}

enum HttpBody {
    /// Body not yet read off the wire.
    Streaming(Incoming),
    /// Body fully buffered in memory.
    Buffered(Bytes),
}

/// Payload wrapper for an HTTP response.
pub struct HttpPayload {
    remote_addr: Option<SocketAddr>,
    status: StatusCode,
    headers: HeaderMap,
    body: HttpBody,
    timestamps: RequestTimestamps,
    sent_at: Option<SystemTime>,
    received_at: SystemTime,
}

impl HttpPayload {
    pub(crate) fn streaming(
        remote_addr: Option<SocketAddr>,
        status: StatusCode,
        headers: HeaderMap,
        body: Incoming,
        timestamps: RequestTimestamps,
        sent_at: Option<SystemTime>,
    ) -> Self {
        Self {
            remote_addr,
            status,
            headers,
            body: HttpBody::Streaming(body),
            timestamps,
            sent_at,
            received_at: SystemTime::now(),
        }
    }

    pub(crate) fn buffered(
        remote_addr: Option<SocketAddr>,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        timestamps: RequestTimestamps,
        sent_at: Option<SystemTime>,
    ) -> Self {
        Self {
            remote_addr,
            status,
            headers,
            body: HttpBody::Buffered(body),
            timestamps,
            sent_at,
            received_at: SystemTime::now(),
        }
    }

    /// HTTP status code of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Remote address the request was served from.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Captured timing points.
    pub fn timestamps(&self) -> RequestTimestamps {
        self.timestamps
    }

    /// Body bytes. Drains the wire on first call and caches the result;
    /// `data_done` is stamped when the drain completes.
    pub async fn data(&mut self) -> WatchResult<Bytes> {
        if let HttpBody::Buffered(bytes) = &self.body {
            return Ok(bytes.clone());
        }
        let HttpBody::Streaming(incoming) =
            std::mem::replace(&mut self.body, HttpBody::Buffered(Bytes::new()))
        else {
            unreachable!("buffered case returned above");
        };
        let collected = incoming
            .collect()
            .await
            .map_err(|e| WatchError::Body(e.to_string()))?;
        let bytes = collected.to_bytes();
        self.timestamps.data_done = Some(Instant::now());
        self.body = HttpBody::Buffered(bytes.clone());
        Ok(bytes)
    }

    /// Wall-clock metadata for this response.
    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            sent_at: self.sent_at,
            received_at: self.received_at,
            latency: self.timestamps.latency(),
        }
    }
}

impl std::fmt::Debug for HttpPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPayload")
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status)
            .field(
                "body",
                match &self.body {
                    HttpBody::Streaming(_) => &"<streaming>",
                    HttpBody::Buffered(_) => &"<buffered>",
                },
            )
            .finish()
    }
}

/// Payload wrapper for a WebSocket message.
#[derive(Debug)]
pub struct WsPayload {
    remote_addr: Option<SocketAddr>,
    data: Bytes,
    timestamps: RequestTimestamps,
    sent_at: Option<SystemTime>,
    received_at: SystemTime,
}

impl WsPayload {
    pub(crate) fn new(
        remote_addr: Option<SocketAddr>,
        data: Bytes,
        timestamps: RequestTimestamps,
        sent_at: Option<SystemTime>,
    ) -> Self {
        Self {
            remote_addr,
            data,
            timestamps,
            sent_at,
            received_at: SystemTime::now(),
        }
    }

    /// Remote address of the peer.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Captured timing points.
    pub fn timestamps(&self) -> RequestTimestamps {
        self.timestamps
    }

    /// Message bytes.
    pub fn data(&self) -> Bytes {
        self.data.clone()
    }

    /// Wall-clock metadata for this message.
    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            sent_at: self.sent_at,
            received_at: self.received_at,
            latency: self.timestamps.latency(),
        }
    }
}

/// The payload of a successful task execution.
#[derive(Debug)]
pub enum TaskPayload {
    Http(HttpPayload),
    Ws(WsPayload),
}

impl TaskPayload {
    /// Body or message bytes, draining a lazy HTTP body if necessary.
    pub async fn data(&mut self) -> WatchResult<Bytes> {
        match self {
            TaskPayload::Http(p) => p.data().await,
            TaskPayload::Ws(p) => Ok(p.data()),
        }
    }

    /// Captured timing points.
    pub fn timestamps(&self) -> RequestTimestamps {
        match self {
            TaskPayload::Http(p) => p.timestamps(),
            TaskPayload::Ws(p) => p.timestamps(),
        }
    }

    /// Wall-clock metadata.
    pub fn metadata(&self) -> ResponseMetadata {
        match self {
            TaskPayload::Http(p) => p.metadata(),
            TaskPayload::Ws(p) => p.metadata(),
        }
    }

    /// Remote address the exchange was served from.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            TaskPayload::Http(p) => p.remote_addr(),
            TaskPayload::Ws(p) => p.remote_addr(),
        }
    }
}

/// One record on the response stream: the outcome of a single task
/// execution, tagged with the task and watcher it came from.
#[derive(Debug)]
pub struct WatcherResponse {
    /// ID of the endpoint task that produced this record.
    pub task_id: String,
    /// ID of the owning watcher. Tagged by the watcher's forwarder; empty
    /// until then.
    pub watcher_id: String,
    /// Target URL of the exchange.
    pub url: Url,
    /// The payload, or the error that ended the execution.
    pub result: Result<TaskPayload, WatchError>,
}

impl WatcherResponse {
    /// Builds a success record.
    pub fn success(task_id: impl Into<String>, url: Url, payload: TaskPayload) -> Self {
        Self {
            task_id: task_id.into(),
            watcher_id: String::new(),
            url,
            result: Ok(payload),
        }
    }

    /// Builds an error record.
    pub fn failure(task_id: impl Into<String>, url: Url, err: WatchError) -> Self {
        Self {
            task_id: task_id.into(),
            watcher_id: String::new(),
            url,
            result: Err(err),
        }
    }

    /// The error, if this record carries one.
    pub fn err(&self) -> Option<&WatchError> {
        self.result.as_ref().err()
    }

    /// Payload bytes; fails with the record's own error for error records.
    pub async fn data(&mut self) -> WatchResult<Bytes> {
        match &mut self.result {
            Ok(payload) => payload.data().await,
            Err(e) => Err(e.clone()),
        }
    }

    /// Wall-clock metadata, when this is a success record.
    pub fn metadata(&self) -> Option<ResponseMetadata> {
        self.result.as_ref().ok().map(|p| p.metadata())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_requires_both_points() {
        let mut ts = RequestTimestamps::default();
        assert!(ts.latency().is_none());

        let start = Instant::now();
        ts.start = Some(start);
        assert!(ts.latency().is_none());

        ts.first_byte = Some(start + Duration::from_millis(25));
        assert_eq!(ts.latency(), Some(Duration::from_millis(25)));
    }

    #[tokio::test]
    async fn ws_payload_round_trip() {
        let start = Instant::now();
        let ts = RequestTimestamps {
            start: Some(start),
            first_byte: Some(start + Duration::from_millis(3)),
            ..Default::default()
        };
        let payload = WsPayload::new(None, Bytes::from_static(b"hello"), ts, None);

        let mut resp = WatcherResponse::success(
            "task-1",
            Url::parse("ws://localhost:9000/ws").unwrap(),
            TaskPayload::Ws(payload),
        );
        assert!(resp.err().is_none());
        assert_eq!(resp.data().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            resp.metadata().unwrap().latency,
            Some(Duration::from_millis(3))
        );
    }

    #[tokio::test]
    async fn error_record_yields_its_error() {
        let mut resp = WatcherResponse::failure(
            "task-1",
            Url::parse("http://localhost:9000").unwrap(),
            WatchError::Connection("refused".into()),
        );
        assert!(resp.err().is_some());
        assert!(matches!(
            resp.data().await,
            Err(WatchError::Connection(_))
        ));
        assert!(resp.metadata().is_none());
    }
}
