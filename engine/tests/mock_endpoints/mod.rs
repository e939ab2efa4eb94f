//! Local mock endpoints for integration tests.
//!
//! Every server binds `127.0.0.1:0` and runs until its accept task is
//! dropped with the test.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::routing::any;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_async;

/// Installs a fmt subscriber once per test binary; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// HTTP server echoing every request body back verbatim.
pub async fn spawn_http_echo() -> (SocketAddr, JoinHandle<()>) {
    async fn echo(body: Bytes) -> Bytes {
        body
    }

    let app = Router::new()
        .route("/", any(echo))
        .route("/echo", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, handle)
}

/// WebSocket server echoing every data frame back verbatim.
pub async fn spawn_ws_echo() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(echo_connection(stream));
        }
    });
    (addr, handle)
}

async fn echo_connection(stream: TcpStream) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };
    while let Some(Ok(message)) = ws.next().await {
        let reply = match message {
            Message::Text(text) => Message::Text(text),
            Message::Binary(bytes) => Message::Binary(bytes),
            Message::Ping(payload) => Message::Pong(payload),
            Message::Close(_) => return,
            _ => continue,
        };
        if ws.send(reply).await.is_err() {
            return;
        }
    }
}

/// How a [`spawn_jsonrpc_peer`] connection behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcBehavior {
    /// Reply to every request, echoing its ID.
    Reply,
    /// Send one unsolicited response with an unknown ID on connect, then
    /// behave like [`JsonRpcBehavior::Reply`].
    UnsolicitedFirst,
    /// Reply to one request, then drop the connection. Later connections
    /// behave like [`JsonRpcBehavior::Reply`].
    OneShotThenClose,
    /// Swallow one request and drop the connection without replying. Later
    /// connections behave like [`JsonRpcBehavior::Reply`].
    SwallowThenClose,
}

/// JSON-RPC WebSocket peer. Replies carry `"result": "0x1"` and whatever ID
/// the request carried.
pub async fn spawn_jsonrpc_peer(behavior: JsonRpcBehavior) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let handle = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let n = connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(jsonrpc_connection(stream, behavior, n));
        }
    });
    (addr, handle)
}

async fn jsonrpc_connection(stream: TcpStream, behavior: JsonRpcBehavior, connection: usize) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    if behavior == JsonRpcBehavior::UnsolicitedFirst && connection == 0 {
        let unsolicited = json!({
            "jsonrpc": "2.0",
            "id": "never-issued",
            "result": "0x0",
        });
        if ws
            .send(Message::Text(unsolicited.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    let mut replies = 0usize;
    while let Some(Ok(message)) = ws.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
                continue;
            }
            _ => continue,
        };

        if behavior == JsonRpcBehavior::SwallowThenClose && connection == 0 {
            // Drop the socket with the request unanswered.
            return;
        }

        let request: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => continue,
        };
        let reply = json!({
            "jsonrpc": "2.0",
            "id": request.get("id").cloned().unwrap_or(Value::Null),
            "result": "0x1",
        });
        if ws
            .send(Message::Text(reply.to_string().into()))
            .await
            .is_err()
        {
            return;
        }
        replies += 1;

        if behavior == JsonRpcBehavior::OneShotThenClose && connection == 0 && replies == 1 {
            // Drop the socket abruptly after the first reply.
            return;
        }
    }
}
