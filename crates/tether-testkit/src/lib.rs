//! tether-testkit: conformance scenarios for tether port implementations.
//!
//! Provides the [`PortFactory`] trait and shared scenarios that every port
//! must pass. Each transport crate implements the factory and runs the
//! scenarios from its own tests:
//!
//! ```ignore
//! struct MyFactory;
//!
//! impl PortFactory for MyFactory {
//!     fn pair(&self) -> (Arc<dyn Port>, Arc<dyn Port>) {
//!         /* create a connected pair */
//!     }
//! }
//!
//! #[tokio::test]
//! async fn unary_echo() {
//!     tether_testkit::run_unary_echo(&MyFactory).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tether_core::{
    CallOptions, HandlerError, HandlerMap, PeerConfig, Port, RpcError, RpcPeer,
};
use tokio::time::Duration;

/// Error type for scenario failures.
#[derive(Debug)]
pub enum TestError {
    /// Port pair creation failed.
    Setup(String),
    /// RPC call failed where the scenario expected success.
    Rpc(RpcError),
    /// The peers behaved, but not the way the scenario demands.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {msg}"),
            TestError::Rpc(e) => write!(f, "rpc error: {e}"),
            TestError::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        TestError::Rpc(e)
    }
}

fn ensure(cond: bool, msg: &str) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg.to_string()))
    }
}

/// Factory for connected port pairs.
///
/// Returns (A, B) where frames sent on A arrive at B's subscriber and vice
/// versa.
pub trait PortFactory: Send + Sync {
    fn pair(&self) -> (Arc<dyn Port>, Arc<dyn Port>);
}

/// Handlers shared by the scenarios: an echo method, a counter stream, and
/// a method that never answers.
fn scenario_handlers() -> HandlerMap {
    HandlerMap::new()
        .unary("Echo", "reply", |payload| async move { Ok(payload) })
        .unary("Echo", "fail", |_| async move {
            Err(HandlerError::new("requested failure"))
        })
        .unary("Slow", "reply", |payload| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(payload)
        })
        .unary("Never", "replies", |_| async move {
            futures::future::pending::<()>().await;
            Ok(Bytes::new())
        })
        .streaming("Counter", "upTo", |payload| {
            let n = payload.first().copied().unwrap_or(0);
            async_stream::stream! {
                for i in 0..n {
                    yield Ok(Bytes::copy_from_slice(&[i]));
                }
            }
        })
}

async fn open_pair(
    factory: &impl PortFactory,
    config: PeerConfig,
) -> Result<(Arc<RpcPeer>, Arc<RpcPeer>), TestError> {
    let (port_a, port_b) = factory.pair();
    let client = RpcPeer::new(port_a, HandlerMap::new(), config.clone());
    let server = RpcPeer::new(port_b, scenario_handlers(), config);
    let (opened_client, opened_server) = tokio::join!(client.open(), server.open());
    opened_client?;
    opened_server?;
    Ok((client, server))
}

/// A unary call crosses the port and its response comes back intact.
pub async fn run_unary_echo(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    let reply = client
        .call("Echo.reply", Bytes::from_static(b"ping"), CallOptions::default())
        .await?;
    ensure(reply == Bytes::from_static(b"ping"), "echo reply mismatch")?;

    // Handler errors come back as remote failures, not transport ones.
    let failed = client
        .call("Echo.fail", Bytes::new(), CallOptions::default())
        .await;
    ensure(
        matches!(failed, Err(RpcError::Remote { .. })),
        "expected a remote error from Echo.fail",
    )?;

    client.close();
    server.close();
    Ok(())
}

/// A streaming call delivers every item in order and then finishes.
pub async fn run_streaming_counter(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    let mut stream = client.call_stream(
        "Counter.upTo",
        Bytes::from_static(&[4]),
        CallOptions::default(),
    )?;

    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        seen.push(item?);
    }
    ensure(seen.len() == 4, "expected four items")?;
    for (i, item) in seen.iter().enumerate() {
        ensure(item.as_ref() == [i as u8], "items out of order")?;
    }

    client.close();
    server.close();
    Ok(())
}

/// A call past its deadline fails with `Timeout`, and the response that
/// eventually arrives is dropped without disturbing the peer.
pub async fn run_timeout_then_late_frame(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    let timed_out = client
        .call(
            "Slow.reply",
            Bytes::from_static(b"late"),
            CallOptions::timeout(Duration::from_millis(10)),
        )
        .await;
    ensure(
        matches!(timed_out, Err(RpcError::Timeout)),
        "expected a timeout",
    )?;

    // Let the slow handler answer into the void.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let reply = client
        .call("Echo.reply", Bytes::from_static(b"still here"), CallOptions::default())
        .await?;
    ensure(
        reply == Bytes::from_static(b"still here"),
        "peer unusable after a late frame",
    )?;

    client.close();
    server.close();
    Ok(())
}

/// Closing a peer fails every pending call with `Aborted`.
pub async fn run_close_drains_pending(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call("Never.replies", Bytes::new(), CallOptions::default())
                .await
        })
    };
    // Give the call time to go out before pulling the plug.
    tokio::time::sleep(Duration::from_millis(20)).await;

    client.close();

    let outcome = pending
        .await
        .map_err(|e| TestError::Setup(format!("task failed: {e}")))?;
    ensure(
        matches!(outcome, Err(RpcError::Aborted)),
        "pending call must abort on close",
    )?;

    server.close();
    Ok(())
}

/// Close is idempotent, and a closed peer refuses new calls.
pub async fn run_idempotent_close(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    client.close();
    client.close();

    let refused = client
        .call("Echo.reply", Bytes::new(), CallOptions::default())
        .await;
    ensure(
        matches!(refused, Err(RpcError::NotOpen)),
        "closed peer must refuse calls",
    )?;

    server.close();
    server.close();
    Ok(())
}

/// Calling a method nobody registered fails with `UnknownMethod` and leaves
/// the peers usable.
pub async fn run_unknown_method(factory: &impl PortFactory) -> Result<(), TestError> {
    let (client, server) = open_pair(factory, PeerConfig::default()).await?;

    let missing = client
        .call("No.such", Bytes::new(), CallOptions::default())
        .await;
    ensure(
        matches!(missing, Err(RpcError::UnknownMethod { .. })),
        "expected unknown method",
    )?;

    let reply = client
        .call("Echo.reply", Bytes::from_static(b"ok"), CallOptions::default())
        .await?;
    ensure(reply == Bytes::from_static(b"ok"), "echo after unknown method")?;

    client.close();
    server.close();
    Ok(())
}

/// With the handshake enabled, both sides open concurrently and can call
/// each other afterwards.
pub async fn run_handshake(factory: &impl PortFactory) -> Result<(), TestError> {
    let config = PeerConfig {
        handshake: true,
        ..PeerConfig::default()
    };
    let (client, server) = open_pair(factory, config).await?;

    let reply = client
        .call("Echo.reply", Bytes::from_static(b"hello"), CallOptions::default())
        .await?;
    ensure(reply == Bytes::from_static(b"hello"), "echo after handshake")?;

    client.close();
    server.close();
    Ok(())
}
