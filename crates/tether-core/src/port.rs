//! The minimal transport capability the RPC peer is built on.
//!
//! A port pushes whole binary frames out and delivers whole binary frames in.
//! One frame is one logical RPC message; the port provides no retry and no
//! framing beyond that. Transports (in-process pairs, sockets, message
//! channels) implement this trait outside the core.

use core::fmt;

use bytes::Bytes;

/// Callback invoked for every inbound frame, in delivery order.
pub type FrameSink = Box<dyn FnMut(Bytes) + Send>;

/// Transport-level errors surfaced by [`Port::send`].
#[derive(Debug)]
pub enum PortError {
    /// The transport is gone; no further frames can be sent.
    Closed,
    Io(std::io::Error),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "port closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PortError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PortError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// One-shot subscription guard returned by [`Port::subscribe`].
///
/// Calling [`unsubscribe`](Unsubscribe::unsubscribe) more than once is a
/// no-op, as is dropping the guard after an explicit unsubscribe.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A guard that does nothing. Useful for tests and degenerate ports.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Tear down the subscription. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unsubscribe")
            .field(&self.0.as_ref().map(|_| "armed"))
            .finish()
    }
}

/// Abstract byte-frame transport.
///
/// A port is exclusively owned by at most one peer at a time: no two peers
/// may subscribe to the same port concurrently.
pub trait Port: Send + Sync + 'static {
    /// Push one frame to the remote side.
    ///
    /// May fail if the transport is gone. The peer treats a failed send as a
    /// remote-unreachable error for that specific call, not as fatal for the
    /// whole peer.
    fn send(&self, frame: Bytes) -> Result<(), PortError>;

    /// Register the inbound frame callback.
    ///
    /// Frames must be delivered to `on_frame` in transport order. The
    /// returned guard severs delivery; after it fires (or the port reports
    /// closed) `send` must not be called again by the subscriber.
    fn subscribe(&self, on_frame: FrameSink) -> Unsubscribe;
}
