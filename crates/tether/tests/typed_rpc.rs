//! End-to-end typed RPC over an in-process port pair.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether::{
    CallShape, HandlerError, PeerConfig, RpcError, RpcPeer, ServiceClient, ServiceDescriptor,
    ServiceServer, StreamExt,
};
use tether_transport_mem::MemoryPort;

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

fn calculator() -> ServiceDescriptor {
    ServiceDescriptor::new("Calculator")
        .unary("add")
        .streaming("countUp")
        .oneway("reset")
}

async fn connect(resets: Arc<AtomicU32>) -> (Arc<RpcPeer>, Arc<RpcPeer>, ServiceClient) {
    let (client_port, server_port) = MemoryPort::pair();

    let handlers = ServiceServer::new(calculator())
        .unary("add", |req: AddRequest| async move {
            req.a
                .checked_add(req.b)
                .map(|sum| AddResponse { sum })
                .ok_or_else(|| HandlerError::new("overflow"))
        })
        .streaming("countUp", |limit: u32| {
            async_stream::stream! {
                for i in 0..limit {
                    yield Ok(i);
                }
            }
        })
        .oneway("reset", move |(): ()| {
            let resets = resets.clone();
            async move {
                resets.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .into_handlers();

    let server = RpcPeer::new(server_port, handlers, PeerConfig::default());
    let client_peer = RpcPeer::new(
        client_port,
        tether::HandlerMap::new(),
        PeerConfig::default(),
    );
    server.open().await.unwrap();
    client_peer.open().await.unwrap();

    let client = ServiceClient::new(client_peer.clone(), calculator());
    (client_peer, server, client)
}

#[tokio::test]
async fn unary_call_round_trips_typed_values() {
    let (_peer, _server, client) = connect(Arc::new(AtomicU32::new(0))).await;

    let response: AddResponse = client
        .unary("add", &AddRequest { a: 20, b: 22 })
        .await
        .unwrap();
    assert_eq!(response, AddResponse { sum: 42 });
}

#[tokio::test]
async fn handler_failure_surfaces_as_remote_error() {
    let (_peer, _server, client) = connect(Arc::new(AtomicU32::new(0))).await;

    let result: Result<AddResponse, _> = client
        .unary("add", &AddRequest { a: i64::MAX, b: 1 })
        .await;
    assert!(matches!(result, Err(RpcError::Remote { .. })));
}

#[tokio::test]
async fn streaming_call_decodes_every_item() {
    let (_peer, _server, client) = connect(Arc::new(AtomicU32::new(0))).await;

    let mut stream = client.streaming::<u32, u32>("countUp", &5).unwrap();
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item.unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn oneway_call_reaches_the_handler() {
    let resets = Arc::new(AtomicU32::new(0));
    let (_peer, _server, client) = connect(resets.clone()).await;

    client.oneway("reset", &()).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(resets.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shape_is_enforced_before_sending() {
    let (_peer, _server, client) = connect(Arc::new(AtomicU32::new(0))).await;

    let wrong_shape: Result<AddResponse, _> = client.unary("countUp", &3u32).await;
    assert!(matches!(
        wrong_shape,
        Err(RpcError::ShapeMismatch {
            expected: CallShape::Streaming,
            ..
        })
    ));

    let unknown: Result<AddResponse, _> = client.unary("divide", &()).await;
    assert!(matches!(unknown, Err(RpcError::UnknownMethod { .. })));
}

#[tokio::test]
async fn undecodable_request_is_a_remote_protocol_error() {
    let (_peer, _server, client) = connect(Arc::new(AtomicU32::new(0))).await;

    // The server expects an AddRequest; an empty payload will not parse.
    let result: Result<AddResponse, _> = client.unary("add", &()).await;
    match result {
        Err(RpcError::Remote { kind, .. }) => {
            assert_eq!(kind, tether::ErrorKind::Protocol);
        }
        other => panic!("expected remote protocol error, got {other:?}"),
    }
}
