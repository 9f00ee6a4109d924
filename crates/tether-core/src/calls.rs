//! The call table: per-peer registry of outstanding outbound calls.
//!
//! Every registered call reaches exactly one terminal state (resolved,
//! failed, or stream-ended). Entries are removed from the table *before*
//! their sink is signalled, so a late frame for a completed call finds no
//! entry and is a no-op rather than a double-resolve.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::RpcError;

pub(crate) const DEFAULT_MAX_PENDING: usize = 8192;

/// Per-call options for outbound calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Overrides the peer's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Items delivered into a streaming call's sink.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Data(Bytes),
    End,
    Failed(RpcError),
}

enum CallSink {
    Unary(oneshot::Sender<Result<Bytes, RpcError>>),
    Stream(mpsc::UnboundedSender<StreamItem>),
}

struct PendingCall {
    method: String,
    deadline: Instant,
    sink: CallSink,
}

impl PendingCall {
    fn terminate(self, outcome: Result<Bytes, RpcError>) {
        match self.sink {
            CallSink::Unary(tx) => {
                let _ = tx.send(outcome);
            }
            CallSink::Stream(tx) => {
                let item = match outcome {
                    Ok(_) => StreamItem::End,
                    Err(e) => StreamItem::Failed(e),
                };
                let _ = tx.send(item);
            }
        }
    }
}

/// Tracks in-flight outbound calls by correlation id.
///
/// All mutation goes through one mutex; terminal outcomes are signalled after
/// the entry leaves the map, so a sink waking a task that re-enters the table
/// (e.g. a close routine triggered by a failure) cannot double-fail.
pub struct CallTable {
    inner: Mutex<Inner>,
    max_pending: usize,
}

struct Inner {
    next_id: u32,
    entries: HashMap<u32, PendingCall>,
}

impl Inner {
    // Ids wrap; an id is only reused once its previous call completed.
    fn next_free_id(&mut self) -> u32 {
        loop {
            let candidate = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

impl CallTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 0,
                entries: HashMap::new(),
            }),
            max_pending,
        }
    }

    /// Register a unary call. Returns the fresh call id and the result slot.
    pub fn register_unary(
        &self,
        method: &str,
        deadline: Instant,
    ) -> Result<(u32, oneshot::Receiver<Result<Bytes, RpcError>>), RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(method, deadline, CallSink::Unary(tx))?;
        Ok((id, rx))
    }

    /// Register a streaming call. Returns the fresh call id and the sink's
    /// receiving end.
    pub(crate) fn register_stream(
        &self,
        method: &str,
        deadline: Instant,
    ) -> Result<(u32, mpsc::UnboundedReceiver<StreamItem>), RpcError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.insert(method, deadline, CallSink::Stream(tx))?;
        Ok((id, rx))
    }

    /// Take a fresh id from the shared id space without tracking a call.
    /// Oneway requests correlate with nothing locally, but their ids still
    /// must not collide with an outstanding unary or streaming call.
    pub(crate) fn allocate_id(&self) -> u32 {
        self.inner.lock().next_free_id()
    }

    fn insert(&self, method: &str, deadline: Instant, sink: CallSink) -> Result<u32, RpcError> {
        self.sweep(Instant::now());

        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.max_pending {
            tracing::warn!(
                pending = inner.entries.len(),
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::TooManyCalls);
        }

        let id = inner.next_free_id();
        inner.entries.insert(
            id,
            PendingCall {
                method: method.to_string(),
                deadline,
                sink,
            },
        );
        tracing::debug!(call_id = id, method, pending = inner.entries.len(), "registered call");
        Ok(id)
    }

    /// Unary terminal: complete the call with a successful payload.
    pub fn resolve(&self, call_id: u32, payload: Bytes) {
        let Some(entry) = self.inner.lock().entries.remove(&call_id) else {
            tracing::debug!(call_id, "response for unknown call; dropping");
            return;
        };
        match entry.sink {
            CallSink::Unary(tx) => {
                let _ = tx.send(Ok(payload));
            }
            CallSink::Stream(tx) => {
                // A unary response for a streaming call is a protocol bug on
                // the far side; the entry has already been removed, fail it.
                tracing::warn!(call_id, method = %entry.method, "unary response for streaming call");
                let _ = tx.send(StreamItem::Failed(RpcError::Protocol(
                    "unary response for streaming call".into(),
                )));
            }
        }
    }

    /// Stream data: push one item. No-op if the entry is gone (late frame
    /// after a timeout or cancellation). Each delivered item refreshes the
    /// call's deadline, so long-lived streams are not swept mid-flight.
    pub fn push(&self, call_id: u32, payload: Bytes, refresh: Duration) {
        let mut inner = self.inner.lock();
        let Some(mut entry) = inner.entries.remove(&call_id) else {
            drop(inner);
            tracing::debug!(call_id, "stream data for unknown call; dropping");
            return;
        };
        match &entry.sink {
            CallSink::Stream(tx) => {
                // Non-blocking send; the entry goes back unless the consumer
                // dropped the stream, in which case the call is forgotten.
                if tx.send(StreamItem::Data(payload)).is_ok() {
                    entry.deadline = Instant::now() + refresh;
                    inner.entries.insert(call_id, entry);
                }
            }
            CallSink::Unary(_) => {
                drop(inner);
                tracing::warn!(call_id, method = %entry.method, "stream data for unary call");
                entry.terminate(Err(RpcError::Protocol(
                    "stream data for unary call".into(),
                )));
            }
        }
    }

    /// Stream terminal: signal end-of-sequence.
    pub fn end(&self, call_id: u32) {
        let Some(entry) = self.inner.lock().entries.remove(&call_id) else {
            tracing::debug!(call_id, "stream end for unknown call; dropping");
            return;
        };
        entry.terminate(Ok(Bytes::new()));
    }

    /// Terminal failure for either call shape.
    pub fn fail(&self, call_id: u32, error: RpcError) {
        let Some(entry) = self.inner.lock().entries.remove(&call_id) else {
            tracing::debug!(call_id, %error, "failure for unknown call; dropping");
            return;
        };
        entry.terminate(Err(error));
    }

    /// Remove an entry without signalling its sink. Used when the caller
    /// itself walked away (cancelled future, dropped stream).
    pub fn discard(&self, call_id: u32) -> bool {
        let removed = self.inner.lock().entries.remove(&call_id).is_some();
        if removed {
            tracing::debug!(call_id, "call discarded");
        }
        removed
    }

    /// Fail every entry whose deadline has passed with `Timeout`.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<PendingCall> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u32> = inner
                .entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| inner.entries.remove(id))
                .collect()
        };
        for entry in expired {
            tracing::debug!(method = %entry.method, "call deadline elapsed");
            entry.terminate(Err(RpcError::Timeout));
        }
    }

    /// Fail every remaining entry. Called on peer close; safe to call from a
    /// close routine that was itself triggered by one of these failures (the
    /// map is swapped out under the lock first, so re-entry finds it empty).
    pub fn drain_all(&self, error_for: impl Fn() -> RpcError) {
        let drained = std::mem::take(&mut self.inner.lock().entries);
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "draining pending calls");
        }
        for (_, entry) in drained {
            entry.terminate(Err(error_for()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn unary_resolves_once() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let (id, rx) = table.register_unary("Echo.reply", far_deadline()).unwrap();

        table.resolve(id, Bytes::from_static(b"pong"));
        // Late duplicate terminal is a no-op.
        table.resolve(id, Bytes::from_static(b"again"));
        table.fail(id, RpcError::Timeout);

        assert_eq!(rx.await.unwrap().unwrap(), Bytes::from_static(b"pong"));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn stream_delivers_in_order_then_ends() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let (id, mut rx) = table.register_stream("Counter.upTo", far_deadline()).unwrap();

        for i in 0u8..3 {
            table.push(id, Bytes::copy_from_slice(&[i]), Duration::from_secs(60));
        }
        table.end(id);

        for i in 0u8..3 {
            match rx.recv().await.unwrap() {
                StreamItem::Data(b) => assert_eq!(b.as_ref(), &[i]),
                other => panic!("expected data, got {other:?}"),
            }
        }
        assert!(matches!(rx.recv().await, Some(StreamItem::End)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn push_after_removal_is_a_noop() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let (id, mut rx) = table.register_stream("Counter.upTo", far_deadline()).unwrap();

        assert!(table.discard(id));
        table.push(id, Bytes::from_static(b"late"), Duration::from_secs(1));
        table.end(id);

        // The sink saw nothing: the sender side was dropped with the entry.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sweep_times_out_expired_entries_only() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let now = Instant::now();
        let (expired, rx_expired) = table.register_unary("Slow.call", now).unwrap();
        let (_live, rx_live) = table.register_unary("Live.call", far_deadline()).unwrap();

        table.sweep(now + Duration::from_millis(1));

        assert!(matches!(rx_expired.await.unwrap(), Err(RpcError::Timeout)));
        assert_eq!(table.len(), 1);
        let _ = (expired, rx_live);
    }

    #[tokio::test]
    async fn drain_all_aborts_everything() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let (_a, rx_a) = table.register_unary("A.x", far_deadline()).unwrap();
        let (_b, mut rx_b) = table.register_stream("B.y", far_deadline()).unwrap();

        table.drain_all(|| RpcError::Aborted);

        assert!(matches!(rx_a.await.unwrap(), Err(RpcError::Aborted)));
        assert!(matches!(rx_b.recv().await, Some(StreamItem::Failed(RpcError::Aborted))));
        assert!(table.is_empty());

        // Draining an already-empty table is fine.
        table.drain_all(|| RpcError::Aborted);
    }

    #[test]
    fn register_refuses_past_capacity() {
        let table = CallTable::new(2);
        let _a = table.register_unary("A.x", far_deadline()).unwrap();
        let _b = table.register_unary("B.y", far_deadline()).unwrap();
        assert!(matches!(
            table.register_unary("C.z", far_deadline()),
            Err(RpcError::TooManyCalls)
        ));
    }

    #[test]
    fn allocated_ids_never_shadow_live_calls() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        let (unary_id, _rx) = table.register_unary("A.x", far_deadline()).unwrap();

        let loose = table.allocate_id();
        assert_ne!(loose, unary_id);

        // Wrapping back over a live entry skips it for loose ids too.
        table.inner.lock().next_id = unary_id;
        assert_ne!(table.allocate_id(), unary_id);
    }

    #[test]
    fn ids_skip_live_entries_when_wrapping() {
        let table = CallTable::new(DEFAULT_MAX_PENDING);
        table.inner.lock().next_id = u32::MAX;
        let (id_a, _rx_a) = table.register_unary("A.x", far_deadline()).unwrap();
        let (id_b, _rx_b) = table.register_unary("B.y", far_deadline()).unwrap();
        assert_eq!(id_a, u32::MAX);
        assert_eq!(id_b, 0);

        table.inner.lock().next_id = u32::MAX;
        let (id_c, _rx_c) = table.register_unary("C.z", far_deadline()).unwrap();
        // MAX and 0 are live, so the next free id is 1.
        assert_eq!(id_c, 1);
    }
}
