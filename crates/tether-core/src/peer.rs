//! RpcPeer: a symmetric RPC endpoint that owns one port.
//!
//! A peer is both client and server over a single frame transport. The key
//! rule is that only the peer's dispatch task consumes inbound frames. All
//! routing happens through internal channels:
//!
//! ```text
//!                  ┌──────────────────────────────────┐
//!                  │             RpcPeer              │
//!                  ├──────────────────────────────────┤
//!                  │  port:   Arc<dyn Port>           │
//!                  │  calls:  CallTable (outbound)    │
//!                  │  router: ServiceRouter (inbound) │
//!                  └───────────────┬──────────────────┘
//!                                  │
//!                           dispatch task
//!                                  │
//!        ┌─────────────────────────┼─────────────────────────┐
//!        │                         │                         │
//!  Response/StreamData/      Request?                   Open/OpenAck?
//!  StreamEnd/Error?               │                         │
//!        │                 spawn handler,             handshake state
//!  route to call table     write envelopes back
//! ```
//!
//! Outbound calls register a waiter in the call table before the request
//! frame is sent, so the response cannot race the registration. Inbound
//! requests are dispatched on spawned tasks so a slow handler never stalls
//! the frame loop.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, Sleep};

use crate::calls::{CallOptions, CallTable, StreamItem, DEFAULT_MAX_PENDING};
use crate::{
    Dispatch, Envelope, ErrorKind, FrameDecodeError, HandlerMap, Port, RpcError, ServiceRouter,
    Unsubscribe,
};

/// Default terminal-frame deadline for outbound calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(3000);

const DEFAULT_HANDSHAKE_RETRY: Duration = Duration::from_millis(50);

/// Tuning knobs for one peer.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Deadline for a terminal frame on each outbound call. Streaming calls
    /// refresh the deadline on every delivered item.
    pub call_timeout: Duration,
    /// Run the open/open-ack handshake before `open()` resolves. Both sides
    /// must agree; with handshake off the peer is usable immediately.
    pub handshake: bool,
    /// How often the opening frame is resent while waiting for the ack.
    pub handshake_retry: Duration,
    /// Upper bound on concurrently pending outbound calls.
    pub max_pending: usize,
    /// Treat a request for an unregistered method as fatal for the peer
    /// instead of answering with an error envelope.
    pub strict_methods: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            handshake: false,
            handshake_retry: DEFAULT_HANDSHAKE_RETRY,
            max_pending: DEFAULT_MAX_PENDING,
            strict_methods: false,
        }
    }
}

/// Lifecycle of a peer. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Opening,
    Open,
    Closing,
    Closed,
}

/// A symmetric RPC endpoint bound to one port.
pub struct RpcPeer {
    port: Arc<dyn Port>,
    calls: Arc<CallTable>,
    config: PeerConfig,
    state: Mutex<PeerState>,
    router: Mutex<Option<Arc<ServiceRouter>>>,
    subscription: Mutex<Option<Unsubscribe>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    /// Tasks driving responses for inbound requests, keyed by a local token.
    /// Streaming producers also record the remote's call id so a
    /// `StreamCancel` frame aborts the right task even when a misbehaving
    /// remote reuses an id across outstanding requests.
    inbound_tasks: Arc<Mutex<HashMap<u64, InboundTask>>>,
    next_task_token: AtomicU64,
    handshake_acked: watch::Sender<bool>,
}

struct InboundTask {
    /// The remote call id, recorded only for cancellable stream producers.
    stream_id: Option<u32>,
    handle: JoinHandle<()>,
}

impl RpcPeer {
    pub fn new(port: Arc<dyn Port>, handlers: HandlerMap, config: PeerConfig) -> Arc<Self> {
        let router = ServiceRouter::new(handlers, config.strict_methods);
        let (handshake_acked, _) = watch::channel(false);
        Arc::new(Self {
            port,
            calls: Arc::new(CallTable::new(config.max_pending)),
            config,
            state: Mutex::new(PeerState::Idle),
            router: Mutex::new(Some(Arc::new(router))),
            subscription: Mutex::new(None),
            dispatch_task: Mutex::new(None),
            inbound_tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_token: AtomicU64::new(0),
            handshake_acked,
        })
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Bind to the port and start serving.
    ///
    /// With the handshake enabled, resolves once the other side has
    /// acknowledged; the opening frame is resent every
    /// [`handshake_retry`](PeerConfig::handshake_retry) until then, bounded
    /// by the call timeout. Fails with `AlreadyOpen` on a peer that has ever
    /// been opened: peers are not reusable after `close()`.
    pub async fn open(self: &Arc<Self>) -> Result<(), RpcError> {
        {
            let mut state = self.state.lock();
            if *state != PeerState::Idle {
                return Err(RpcError::AlreadyOpen);
            }
            *state = PeerState::Opening;
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Bytes>();
        let unsub = self.port.subscribe(Box::new(move |frame| {
            let _ = frame_tx.send(frame);
        }));
        *self.subscription.lock() = Some(unsub);

        let task = tokio::spawn(self.clone().run_dispatch(frame_rx));
        *self.dispatch_task.lock() = Some(task);

        if self.config.handshake {
            if let Err(e) = self.handshake().await {
                self.close();
                return Err(e);
            }
        }

        let mut state = self.state.lock();
        // The dispatch task may have hit a fatal frame during the handshake.
        if *state != PeerState::Opening {
            return Err(RpcError::Aborted);
        }
        *state = PeerState::Open;
        tracing::debug!("peer open");
        Ok(())
    }

    async fn handshake(&self) -> Result<(), RpcError> {
        let deadline = Instant::now() + self.config.call_timeout;
        let mut acked = self.handshake_acked.subscribe();
        let wait = async {
            loop {
                if *acked.borrow_and_update() {
                    return Ok::<_, RpcError>(());
                }
                self.send_envelope(&Envelope::Open)?;
                tokio::select! {
                    changed = acked.changed() => {
                        if changed.is_err() {
                            return Err(RpcError::Aborted);
                        }
                    }
                    _ = tokio::time::sleep(self.config.handshake_retry) => {}
                }
            }
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("handshake timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Issue a unary call and wait for its single response.
    ///
    /// Cancelling the returned future (dropping it) forgets the call; a
    /// response arriving later is discarded silently.
    pub async fn call(
        &self,
        method: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<Bytes, RpcError> {
        self.ensure_open()?;
        let timeout = opts.timeout.unwrap_or(self.config.call_timeout);
        let deadline = Instant::now() + timeout;

        let (call_id, rx) = self.calls.register_unary(method, deadline)?;
        let mut guard = PendingGuard::new(&self.calls, call_id);

        self.send_envelope(&Envelope::Request {
            call_id,
            method: method.to_string(),
            streaming: false,
            oneway: false,
            payload,
        })?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            // Sender dropped without a terminal: the table was drained.
            Ok(Err(_)) => {
                guard.disarm();
                Err(RpcError::Aborted)
            }
            Err(_) => {
                tracing::debug!(call_id, method, "call timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Issue a streaming call. Items arrive in transport order; the stream
    /// finishes after the terminal frame. Dropping the stream before the
    /// terminal cancels the call and tells the other side to stop producing.
    pub fn call_stream(
        &self,
        method: &str,
        payload: Bytes,
        opts: CallOptions,
    ) -> Result<CallStream, RpcError> {
        self.ensure_open()?;
        let timeout = opts.timeout.unwrap_or(self.config.call_timeout);
        let deadline = Instant::now() + timeout;

        let (call_id, rx) = self.calls.register_stream(method, deadline)?;
        let mut guard = PendingGuard::new(&self.calls, call_id);

        self.send_envelope(&Envelope::Request {
            call_id,
            method: method.to_string(),
            streaming: true,
            oneway: false,
            payload,
        })?;

        guard.disarm();
        Ok(CallStream {
            call_id,
            rx,
            calls: self.calls.clone(),
            port: self.port.clone(),
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            refresh: timeout,
            done: false,
        })
    }

    /// Fire-and-forget: send a request that expects no reply of any kind.
    /// Only transport-level failure is reported.
    pub fn call_oneway(&self, method: &str, payload: Bytes) -> Result<(), RpcError> {
        self.ensure_open()?;
        // Allocated from the call table so the id cannot shadow an
        // outstanding unary or streaming call on the serving side.
        let call_id = self.calls.allocate_id();
        self.send_envelope(&Envelope::Request {
            call_id,
            method: method.to_string(),
            streaming: false,
            oneway: true,
            payload,
        })
    }

    /// Tear the peer down. Idempotent.
    ///
    /// Severs the port subscription, aborts the dispatch task and every
    /// in-flight inbound handler, and fails all pending outbound calls with
    /// `Aborted`. Safe to call from inside a call's error path.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, PeerState::Closing | PeerState::Closed) {
                return;
            }
            *state = PeerState::Closing;
        }
        tracing::debug!("closing peer");

        if let Some(mut unsub) = self.subscription.lock().take() {
            unsub.unsubscribe();
        }
        if let Some(task) = self.dispatch_task.lock().take() {
            task.abort();
        }
        for (_, task) in self.inbound_tasks.lock().drain() {
            task.handle.abort();
        }
        self.router.lock().take();
        self.calls.drain_all(|| RpcError::Aborted);

        *self.state.lock() = PeerState::Closed;
    }

    fn ensure_open(&self) -> Result<(), RpcError> {
        match *self.state.lock() {
            PeerState::Open => Ok(()),
            _ => Err(RpcError::NotOpen),
        }
    }

    fn send_envelope(&self, envelope: &Envelope) -> Result<(), RpcError> {
        self.port.send(envelope.encode()).map_err(RpcError::from)
    }

    async fn run_dispatch(self: Arc<Self>, mut frames: mpsc::UnboundedReceiver<Bytes>) {
        tracing::debug!("dispatch task started");
        while let Some(frame) = frames.recv().await {
            let envelope = match Envelope::decode(&frame) {
                Ok(env) => env,
                Err(FrameDecodeError::Malformed { call_id, source }) => {
                    tracing::warn!(call_id, %source, "malformed frame; failing its call");
                    self.calls
                        .fail(call_id, RpcError::Protocol(source.to_string()));
                    continue;
                }
                Err(FrameDecodeError::Corrupt(source)) => {
                    tracing::error!(%source, "corrupt frame; closing peer");
                    self.close();
                    return;
                }
            };
            self.handle_envelope(envelope);
        }
        tracing::debug!("dispatch task finished");
    }

    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Open => {
                // The other side (re)started its handshake; always ack.
                if let Err(e) = self.send_envelope(&Envelope::OpenAck) {
                    tracing::warn!(error = %e, "failed to ack handshake");
                }
            }
            Envelope::OpenAck => {
                self.handshake_acked.send_replace(true);
            }
            Envelope::Response { call_id, payload } => {
                self.calls.resolve(call_id, payload);
            }
            Envelope::StreamData { call_id, payload } => {
                self.calls.push(call_id, payload, self.config.call_timeout);
            }
            Envelope::StreamEnd { call_id } => {
                self.calls.end(call_id);
            }
            Envelope::StreamCancel { call_id } => {
                self.inbound_tasks.lock().retain(|_, task| {
                    if task.stream_id != Some(call_id) {
                        return true;
                    }
                    tracing::debug!(call_id, "remote cancelled stream; stopping producer");
                    task.handle.abort();
                    false
                });
            }
            Envelope::Error {
                call_id,
                kind,
                message,
            } => {
                self.calls.fail(call_id, RpcError::from_wire(kind, message));
            }
            Envelope::Request {
                call_id,
                method,
                streaming,
                oneway,
                payload,
            } => {
                self.handle_request(call_id, method, streaming, oneway, payload);
            }
        }
    }

    fn handle_request(
        self: &Arc<Self>,
        call_id: u32,
        method: String,
        streaming: bool,
        oneway: bool,
        payload: Bytes,
    ) {
        // Requests are served while opening too, so a handshaking pair can
        // start calling without waiting for both acks.
        let serving = matches!(self.state(), PeerState::Opening | PeerState::Open);
        let router = self.router.lock().clone();
        let (Some(router), true) = (router, serving) else {
            tracing::debug!(call_id, method, "request while closed");
            if !oneway {
                let _ = self.send_envelope(&Envelope::Error {
                    call_id,
                    kind: ErrorKind::Aborted,
                    message: "peer is closed".into(),
                });
            }
            return;
        };

        tracing::debug!(call_id, method, streaming, oneway, "dispatching request");
        let responses = match router.dispatch(call_id, &method, streaming, oneway, payload) {
            Dispatch::Respond(responses) => responses,
            Dispatch::FatalUnknownMethod(method) => {
                tracing::error!(method, "unknown method with strict routing; closing peer");
                self.close();
                return;
            }
        };

        let port = self.port.clone();
        let tasks = self.inbound_tasks.clone();
        let token = self.next_task_token.fetch_add(1, Ordering::Relaxed);
        // Insert under the same lock the task's own cleanup takes, so a
        // handler that finishes instantly cannot remove itself before its
        // handle is registered.
        let mut registry = self.inbound_tasks.lock();
        let task = tokio::spawn(async move {
            let drive = async {
                let mut responses = responses;
                while let Some(envelope) = responses.next().await {
                    if let Err(e) = port.send(envelope.encode()) {
                        tracing::warn!(call_id, error = %e, "failed to send response frame");
                        break;
                    }
                }
            };
            // A panicking handler must not take the peer down, and the
            // caller must not hang waiting for a terminal that never comes.
            if let Err(panic) = AssertUnwindSafe(drive).catch_unwind().await {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panic in handler: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panic in handler: {s}")
                } else {
                    "panic in handler".to_string()
                };
                tracing::error!(call_id, method = %method, message, "handler panicked");
                if !oneway {
                    let _ = port.send(
                        Envelope::Error {
                            call_id,
                            kind: ErrorKind::Internal,
                            message,
                        }
                        .encode(),
                    );
                }
            }
            tasks.lock().remove(&token);
        });
        registry.insert(
            token,
            InboundTask {
                stream_id: streaming.then_some(call_id),
                handle: task,
            },
        );
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        // Arc'd clones in spawned tasks keep the peer alive, so by the time
        // this runs the dispatch task is gone; this only releases waiters.
        self.close();
    }
}

/// Removes an entry from the call table on drop unless disarmed. Covers the
/// window between registration and handing responsibility elsewhere.
struct PendingGuard<'a> {
    calls: &'a CallTable,
    call_id: u32,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(calls: &'a CallTable, call_id: u32) -> Self {
        Self {
            calls,
            call_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.calls.discard(self.call_id);
        }
    }
}

/// Consumer half of a streaming call.
///
/// Yields payload items until the remote terminal, then finishes. A remote
/// error ends the stream with one `Err` item. If no item arrives within the
/// call timeout the stream fails with `Timeout`; every delivered item resets
/// the clock. Dropping the stream early cancels the call.
pub struct CallStream {
    call_id: u32,
    rx: mpsc::UnboundedReceiver<StreamItem>,
    calls: Arc<CallTable>,
    port: Arc<dyn Port>,
    deadline: Pin<Box<Sleep>>,
    refresh: Duration,
    done: bool,
}

impl CallStream {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    fn cancel(&mut self) {
        self.done = true;
        if self.calls.discard(self.call_id) {
            // Best effort; local bookkeeping is already authoritative.
            let _ = self
                .port
                .send(Envelope::StreamCancel { call_id: self.call_id }.encode());
        }
    }
}

impl Stream for CallStream {
    type Item = Result<Bytes, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamItem::Data(payload))) => {
                let deadline = Instant::now() + this.refresh;
                this.deadline.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(payload)))
            }
            Poll::Ready(Some(StreamItem::End)) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamItem::Failed(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            // Sender gone without a terminal: the table was drained or the
            // call was discarded out from under us.
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(Some(Err(RpcError::Aborted)))
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    this.cancel();
                    return Poll::Ready(Some(Err(RpcError::Timeout)));
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for CallStream {
    fn drop(&mut self) {
        if !self.done {
            self.cancel();
        }
    }
}
