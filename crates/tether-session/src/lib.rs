//! tether-session: pairs two RPC peers into one supervised session.
//!
//! A session owns an "app" peer and a "system" peer (two independent
//! ports). The system peer carries a reserved control service that gates
//! the session's lifecycle:
//!
//! - `AwaitingStart`: both peers are open; the session waits for the
//!   remote's `start` request carrying its origin.
//! - `Live`: entered on `start`; a heartbeat is issued on a fixed interval
//!   against the system peer. A failed or timed-out heartbeat, a remote
//!   `stop`, or a local `close()` all tear the session down.
//! - `Closed`: terminal. Both peers are closed, pending calls on them
//!   abort, and the `on_close` callback has run exactly once.
//!
//! Lifecycle events flow through one channel consumed by a single
//! supervisor task, so racing failure signals cannot re-enter teardown.
//! The heartbeat task is aborted before anything else, so a late tick can
//! never resurrect a closing session.
//!
//! Sessions must be closed explicitly (or by the remote); dropping all
//! handles without `close()` leaves the supervisor waiting.

#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether::{
    CallOptions, HandlerError, HandlerMap, PeerConfig, RpcError, RpcPeer, ServiceClient,
    ServiceDescriptor, ServiceServer,
};
use tether_core::Port;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Reserved service carried on the system peer.
pub const CONTROL_SERVICE: &str = "tether.control";

/// Session tuning. The grace period delays the first heartbeat after
/// `start`, so a session that went live mid-setup is not killed by its own
/// impatience.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_grace: Duration,
    /// Per-beat call timeout.
    pub heartbeat_timeout: Duration,
    /// Configuration for both underlying peers. Sessions default to the
    /// open/open-ack handshake so `connect` resolves only against a live
    /// counterpart.
    pub peer: PeerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let interval = Duration::from_millis(500);
        Self {
            heartbeat_interval: interval,
            heartbeat_grace: interval,
            heartbeat_timeout: interval,
            peer: PeerConfig {
                handshake: true,
                ..PeerConfig::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Live,
    Closed,
}

/// Why the session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    HeartbeatFailed,
    StopReceived,
    Local,
}

enum SessionEvent {
    Started { origin: String },
    HeartbeatFailed,
    StopReceived,
    LocalClose,
}

#[derive(Debug, Serialize, Deserialize)]
struct StartRequest {
    origin: String,
}

fn control_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::new(CONTROL_SERVICE)
        .unary("start")
        .unary("heartbeat")
        .oneway("stop")
}

type OnClose = Box<dyn FnOnce(CloseReason) + Send>;

/// Builder for a [`Session`].
pub struct SessionBuilder {
    origin: String,
    config: SessionConfig,
    app_handlers: HandlerMap,
    system_handlers: HandlerMap,
    on_close: Option<OnClose>,
}

impl SessionBuilder {
    /// `origin` identifies this side in the remote's `start` handler.
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            config: SessionConfig::default(),
            app_handlers: HandlerMap::new(),
            system_handlers: HandlerMap::new(),
            on_close: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Services exposed on the app peer.
    pub fn app_handlers(mut self, handlers: HandlerMap) -> Self {
        self.app_handlers = handlers;
        self
    }

    /// Extra services exposed on the system peer, next to the control
    /// service.
    pub fn system_handlers(mut self, handlers: HandlerMap) -> Self {
        self.system_handlers = handlers;
        self
    }

    /// Runs exactly once when the session reaches `Closed`, after both
    /// peers have been torn down.
    pub fn on_close(mut self, callback: impl FnOnce(CloseReason) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Open both peers, announce `start` to the remote, and hand back the
    /// session in `AwaitingStart`.
    pub async fn connect(
        self,
        app_port: Arc<dyn Port>,
        system_port: Arc<dyn Port>,
    ) -> Result<Arc<Session>, RpcError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let start_tx = events_tx.clone();
        let stop_tx = events_tx.clone();
        let control_handlers = ServiceServer::new(control_descriptor())
            .unary("start", move |request: StartRequest| {
                let start_tx = start_tx.clone();
                async move {
                    start_tx
                        .send(SessionEvent::Started {
                            origin: request.origin,
                        })
                        .map_err(|_| HandlerError::new("session is gone"))?;
                    Ok(())
                }
            })
            .unary("heartbeat", |(): ()| async move { Ok(()) })
            .oneway("stop", move |(): ()| {
                let stop_tx = stop_tx.clone();
                async move {
                    let _ = stop_tx.send(SessionEvent::StopReceived);
                    Ok(())
                }
            })
            .into_handlers();

        let app = RpcPeer::new(app_port, self.app_handlers, self.config.peer.clone());
        let system = RpcPeer::new(
            system_port,
            control_handlers.merge(self.system_handlers),
            self.config.peer.clone(),
        );
        let (opened_app, opened_system) = tokio::join!(app.open(), system.open());
        if let Err(e) = opened_app.and(opened_system) {
            app.close();
            system.close();
            return Err(e);
        }

        let (closed_tx, _) = watch::channel(false);
        let control = ServiceClient::new(system.clone(), control_descriptor());
        let session = Arc::new(Session {
            app,
            system,
            control,
            state: Mutex::new(SessionState::AwaitingStart),
            remote_origin: Mutex::new(None),
            events: events_tx,
            closed: closed_tx,
        });

        tokio::spawn(session.clone().supervise(events_rx, self.on_close, self.config.clone()));

        // Announce ourselves. If the other side is not a session (or not
        // ready), staying in AwaitingStart is the correct outcome.
        let announce = session.control.clone();
        let origin = self.origin;
        tokio::spawn(async move {
            if let Err(e) = announce.unary::<_, ()>("start", &StartRequest { origin }).await {
                tracing::warn!(error = %e, "start announcement failed");
            }
        });

        Ok(session)
    }
}

/// Two supervised peers with a shared lifecycle. See the module docs.
pub struct Session {
    app: Arc<RpcPeer>,
    system: Arc<RpcPeer>,
    control: ServiceClient,
    state: Mutex<SessionState>,
    remote_origin: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    closed: watch::Sender<bool>,
}

impl Session {
    pub fn builder(origin: impl Into<String>) -> SessionBuilder {
        SessionBuilder::new(origin)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// The origin the remote sent in its `start` request, once live.
    pub fn remote_origin(&self) -> Option<String> {
        self.remote_origin.lock().clone()
    }

    /// The application peer: make and serve calls on it freely.
    pub fn app(&self) -> &Arc<RpcPeer> {
        &self.app
    }

    /// The system peer. The control service lives here; extra system
    /// handlers registered at build time do too.
    pub fn system(&self) -> &Arc<RpcPeer> {
        &self.system
    }

    /// Tear the session down and wait until teardown finished. Idempotent;
    /// also tells the remote session to stop, best effort.
    pub async fn close(&self) {
        if self.state() != SessionState::Closed {
            if let Err(e) = self.control.oneway("stop", &()) {
                tracing::debug!(error = %e, "stop notification not sent");
            }
        }
        let _ = self.events.send(SessionEvent::LocalClose);

        let mut closed = self.closed.subscribe();
        while !*closed.borrow_and_update() {
            if closed.changed().await.is_err() {
                break;
            }
        }
    }

    /// Consumes lifecycle events until one of them is terminal. Sole owner
    /// of the heartbeat handle and the close callback.
    async fn supervise(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut on_close: Option<OnClose>,
        config: SessionConfig,
    ) {
        let mut heartbeat: Option<JoinHandle<()>> = None;

        let reason = loop {
            let Some(event) = events.recv().await else {
                break CloseReason::Local;
            };
            match event {
                SessionEvent::Started { origin } => {
                    {
                        let mut state = self.state.lock();
                        if *state != SessionState::AwaitingStart {
                            tracing::debug!(origin, "duplicate start; ignoring");
                            continue;
                        }
                        *state = SessionState::Live;
                    }
                    tracing::info!(origin, "session live");
                    *self.remote_origin.lock() = Some(origin);
                    heartbeat = Some(tokio::spawn(heartbeat_loop(
                        self.control.clone(),
                        self.events.clone(),
                        config.clone(),
                    )));
                }
                SessionEvent::HeartbeatFailed => break CloseReason::HeartbeatFailed,
                SessionEvent::StopReceived => break CloseReason::StopReceived,
                SessionEvent::LocalClose => break CloseReason::Local,
            }
        };

        // Heartbeat first: once it is gone no late tick can observe the
        // session mid-teardown and fail it again.
        if let Some(heartbeat) = heartbeat.take() {
            heartbeat.abort();
        }
        *self.state.lock() = SessionState::Closed;
        tracing::info!(?reason, "session closed");

        self.app.close();
        self.system.close();
        if let Some(callback) = on_close.take() {
            callback(reason);
        }
        self.closed.send_replace(true);
    }
}

async fn heartbeat_loop(
    control: ServiceClient,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: SessionConfig,
) {
    tokio::time::sleep(config.heartbeat_grace).await;
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let beat = control
            .unary_with::<(), ()>(
                "heartbeat",
                &(),
                CallOptions::timeout(config.heartbeat_timeout),
            )
            .await;
        if let Err(e) = beat {
            tracing::warn!(error = %e, "heartbeat failed");
            let _ = events.send(SessionEvent::HeartbeatFailed);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use bytes::Bytes;
    use tether::StreamExt as _;
    use tether_transport_mem::MemoryPort;

    use super::*;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_grace: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(20),
            ..SessionConfig::default()
        }
    }

    async fn wait_for_state(session: &Session, state: SessionState) {
        for _ in 0..200 {
            if session.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {state:?}");
    }

    struct Pair {
        alice: Arc<Session>,
        bob: Arc<Session>,
        system_port_alice: Arc<MemoryPort>,
        bob_closes: Arc<AtomicU32>,
        alice_closes: Arc<AtomicU32>,
    }

    async fn connect_pair(bob_app_handlers: HandlerMap) -> Pair {
        let (app_a, app_b) = MemoryPort::pair();
        let (sys_a, sys_b) = MemoryPort::pair();

        let alice_closes = Arc::new(AtomicU32::new(0));
        let bob_closes = Arc::new(AtomicU32::new(0));

        let count_a = alice_closes.clone();
        let count_b = bob_closes.clone();
        // The handshake needs both sides connecting concurrently.
        let (alice, bob) = tokio::join!(
            Session::builder("alice")
                .config(fast_config())
                .on_close(move |_| {
                    count_a.fetch_add(1, Ordering::SeqCst);
                })
                .connect(app_a, sys_a.clone()),
            Session::builder("bob")
                .config(fast_config())
                .app_handlers(bob_app_handlers)
                .on_close(move |_| {
                    count_b.fetch_add(1, Ordering::SeqCst);
                })
                .connect(app_b, sys_b),
        );
        let alice = alice.unwrap();
        let bob = bob.unwrap();

        Pair {
            alice,
            bob,
            system_port_alice: sys_a,
            bob_closes,
            alice_closes,
        }
    }

    #[tokio::test]
    async fn sessions_go_live_and_swap_origins() {
        let pair = connect_pair(HandlerMap::new()).await;

        wait_for_state(&pair.alice, SessionState::Live).await;
        wait_for_state(&pair.bob, SessionState::Live).await;

        assert_eq!(pair.alice.remote_origin().as_deref(), Some("bob"));
        assert_eq!(pair.bob.remote_origin().as_deref(), Some("alice"));

        pair.alice.close().await;
    }

    #[tokio::test]
    async fn app_peers_carry_calls_while_live() {
        let handlers =
            HandlerMap::new().unary("Echo", "reply", |payload| async move { Ok(payload) });
        let pair = connect_pair(handlers).await;
        wait_for_state(&pair.alice, SessionState::Live).await;

        let reply = pair
            .alice
            .app()
            .call("Echo.reply", Bytes::from_static(b"hi"), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, Bytes::from_static(b"hi"));

        pair.alice.close().await;
    }

    // A session whose counterpart never starts it stays in AwaitingStart,
    // and close() still tears everything down.
    #[tokio::test]
    async fn close_works_without_ever_starting() {
        let (app_a, app_b) = MemoryPort::pair();
        let (sys_a, sys_b) = MemoryPort::pair();

        // The far side is a pair of raw peers with no control service.
        let peer_config = PeerConfig {
            handshake: true,
            ..PeerConfig::default()
        };
        let far_app = RpcPeer::new(app_b, HandlerMap::new(), peer_config.clone());
        let far_sys = RpcPeer::new(sys_b, HandlerMap::new(), peer_config);

        let closes = Arc::new(AtomicU32::new(0));
        let count = closes.clone();
        let (session, far_app_opened, far_sys_opened) = tokio::join!(
            Session::builder("alice")
                .config(fast_config())
                .on_close(move |reason| {
                    assert_eq!(reason, CloseReason::Local);
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .connect(app_a, sys_a),
            far_app.open(),
            far_sys.open(),
        );
        let session = session.unwrap();
        far_app_opened.unwrap();
        far_sys_opened.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.state(), SessionState::AwaitingStart);

        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session
                .app()
                .call("Echo.reply", Bytes::new(), CallOptions::default())
                .await,
            Err(RpcError::NotOpen)
        ));
    }

    // A live session whose system port dies fails its next heartbeat,
    // closes exactly once, and aborts calls pending on the app peer.
    #[tokio::test]
    async fn severed_system_port_triggers_teardown() {
        let handlers = HandlerMap::new().unary("Never", "replies", |_| async move {
            futures::future::pending::<()>().await;
            Ok(Bytes::new())
        });
        let pair = connect_pair(handlers).await;
        wait_for_state(&pair.alice, SessionState::Live).await;

        let pending = {
            let app = pair.alice.app().clone();
            tokio::spawn(async move {
                app.call("Never.replies", Bytes::new(), CallOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pair.system_port_alice.sever();
        wait_for_state(&pair.alice, SessionState::Closed).await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(RpcError::Aborted)
        ));
        // Give racing failure signals a chance to double-fire.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pair.alice_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_close_stops_the_remote_session() {
        let pair = connect_pair(HandlerMap::new()).await;
        wait_for_state(&pair.alice, SessionState::Live).await;
        wait_for_state(&pair.bob, SessionState::Live).await;

        pair.alice.close().await;

        wait_for_state(&pair.bob, SessionState::Closed).await;
        assert_eq!(pair.bob_closes.load(Ordering::SeqCst), 1);
        assert_eq!(pair.alice_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let pair = connect_pair(HandlerMap::new()).await;
        wait_for_state(&pair.alice, SessionState::Live).await;

        pair.alice.close().await;
        pair.alice.close().await;
        assert_eq!(pair.alice_closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streaming_survives_heartbeats() {
        let handlers = HandlerMap::new().streaming("Counter", "upTo", |payload: Bytes| {
            let n = payload.first().copied().unwrap_or(0);
            async_stream::stream! {
                for i in 0..n {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    yield Ok(Bytes::copy_from_slice(&[i]));
                }
            }
        });
        let pair = connect_pair(handlers).await;
        wait_for_state(&pair.alice, SessionState::Live).await;

        let mut stream = pair
            .alice
            .app()
            .call_stream("Counter.upTo", Bytes::from_static(&[4]), CallOptions::default())
            .unwrap();
        let mut seen = 0u8;
        while let Some(item) = stream.next().await {
            assert_eq!(item.unwrap().as_ref(), &[seen]);
            seen += 1;
        }
        assert_eq!(seen, 4);

        pair.alice.close().await;
    }
}
