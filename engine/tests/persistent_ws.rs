//! Persistent JSON-RPC engine: correlation, unknown replies, reconnects.

mod mock_endpoints;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;
use vigil_engine::cadence::Task as _;
use vigil_engine::{EndpointTask, WatchError, WsEndpoint, WsEndpointMode};

use mock_endpoints::{init_tracing, spawn_jsonrpc_peer, JsonRpcBehavior};

const CHAIN_ID_REQUEST: &str = r#"{"jsonrpc":"2.0","id":42,"method":"eth_chainId","params":[]}"#;

fn ws_url(addr: std::net::SocketAddr) -> Url {
    Url::parse(&format!("ws://{addr}/")).unwrap()
}

async fn persistent_endpoint(
    addr: std::net::SocketAddr,
) -> (Arc<WsEndpoint>, mpsc::Receiver<vigil_engine::WatcherResponse>) {
    let endpoint = Arc::new(
        WsEndpoint::new(ws_url(addr), WsEndpointMode::PersistentJsonRpc)
            .with_id("rpc-probe")
            .with_payload(CHAIN_ID_REQUEST),
    );
    let (tx, rx) = mpsc::channel(32);
    endpoint.initialize("w1", tx).await.unwrap();
    (endpoint, rx)
}

#[tokio::test]
async fn replies_carry_the_original_request_id() {
    init_tracing();
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::Reply).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    task.execute().await.unwrap();

    let mut response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(response.err().is_none(), "unexpected error: {response:?}");

    let body: Value = serde_json::from_slice(&response.data().await.unwrap()).unwrap();
    assert_eq!(body["id"], Value::from(42), "correlation ID leaked out");
    assert_eq!(body["result"], Value::from("0x1"));

    // The reply consumed its in-flight entry.
    assert_eq!(endpoint.inflight_count(), 0);

    // Start is taken from the send time, first byte from reply arrival.
    let timestamps = response.result.as_ref().unwrap().timestamps();
    assert!(timestamps.start.is_some());
    assert!(timestamps.first_byte.is_some());
    assert!(timestamps.latency().is_some());

    endpoint.close().await.unwrap();
}

#[tokio::test]
async fn multiple_inflight_requests_correlate_independently() {
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::Reply).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    for _ in 0..3 {
        task.execute().await.unwrap();
    }

    for _ in 0..3 {
        let mut response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let body: Value = serde_json::from_slice(&response.data().await.unwrap()).unwrap();
        assert_eq!(body["id"], Value::from(42));
    }
    assert_eq!(endpoint.inflight_count(), 0);

    endpoint.close().await.unwrap();
}

#[tokio::test]
async fn unsolicited_reply_is_an_error_but_not_fatal() {
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::UnsolicitedFirst).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    // The peer pushes an unknown-ID response as soon as the pump connects.
    let unsolicited = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        unsolicited.err(),
        Some(WatchError::UnknownCorrelationId(id)) if id == "never-issued"
    ));

    // The connection survives; a real request still works.
    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    task.execute().await.unwrap();

    let mut response = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(response.err().is_none());
    let body: Value = serde_json::from_slice(&response.data().await.unwrap()).unwrap();
    assert_eq!(body["id"], Value::from(42));

    endpoint.close().await.unwrap();
}

#[tokio::test]
async fn reconnects_after_the_peer_drops_the_socket() {
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::OneShotThenClose).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    task.execute().await.unwrap();

    let mut first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let body: Value = serde_json::from_slice(&first.data().await.unwrap()).unwrap();
    assert_eq!(body["id"], Value::from(42));

    // Give the read pump a moment to observe the peer's hangup.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The next execution reconnects lazily and correlates as before.
    task.execute().await.unwrap();
    let mut second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(second.err().is_none(), "unexpected error: {second:?}");
    let body: Value = serde_json::from_slice(&second.data().await.unwrap()).unwrap();
    assert_eq!(body["id"], Value::from(42));
    assert_eq!(endpoint.inflight_count(), 0);

    endpoint.close().await.unwrap();
}

#[tokio::test]
async fn orphaned_requests_surface_as_transport_reset() {
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::SwallowThenClose).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    // The peer swallows this request and hangs up; the entry stays
    // in flight.
    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    task.execute().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(endpoint.inflight_count(), 1);

    // Reconnect on the next execution reports the orphan, then the new
    // request goes through.
    task.execute().await.unwrap();

    let reset = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(reset.err(), Some(WatchError::TransportReset)));

    let mut reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.err().is_none(), "unexpected error: {reply:?}");
    let body: Value = serde_json::from_slice(&reply.data().await.unwrap()).unwrap();
    assert_eq!(body["id"], Value::from(42));
    assert_eq!(endpoint.inflight_count(), 0);

    endpoint.close().await.unwrap();
}

#[tokio::test]
async fn execute_after_close_is_a_quiet_no_op() {
    let (addr, _server) = spawn_jsonrpc_peer(JsonRpcBehavior::Reply).await;
    let (endpoint, mut rx) = persistent_endpoint(addr).await;

    endpoint.close().await.unwrap();

    let task = (endpoint.clone() as Arc<dyn EndpointTask>).task();
    task.execute().await.unwrap();

    let quiet = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(quiet.is_err(), "closed endpoint produced a record");
}
