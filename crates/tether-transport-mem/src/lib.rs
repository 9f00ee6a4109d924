//! tether-transport-mem: in-process port pair.
//!
//! This is the semantic reference transport. All other ports must behave
//! identically to this one: frames arrive whole, in send order, and a
//! severed pair refuses sends on both sides. If another transport differs,
//! the other transport has a bug.
//!
//! # Usage
//!
//! ```ignore
//! let (alice, bob) = MemoryPort::pair();
//! ```

#![forbid(unsafe_code)]

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{FrameSink, Port, PortError, Unsubscribe};
use tokio::sync::{mpsc, watch};

/// One side of an in-process port pair.
///
/// Frames sent on one side are delivered to the other side's subscriber in
/// send order. Severing either side (or dropping it) closes the pair for
/// both. `subscribe` spawns a pump task and therefore needs a tokio runtime.
pub struct MemoryPort {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    severed: Arc<watch::Sender<bool>>,
}

impl MemoryPort {
    /// Create a connected pair.
    ///
    /// Returns (A, B) where frames sent on A are received on B and vice
    /// versa.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (severed, _) = watch::channel(false);
        let severed = Arc::new(severed);
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();

        let a = Arc::new(Self {
            tx: tx_ab,
            rx: Mutex::new(Some(rx_ba)),
            severed: severed.clone(),
        });
        let b = Arc::new(Self {
            tx: tx_ba,
            rx: Mutex::new(Some(rx_ab)),
            severed,
        });
        (a, b)
    }

    /// Kill the pair: both sides start refusing sends and stop delivering
    /// frames, including frames already in flight.
    pub fn sever(&self) {
        tracing::debug!("memory port severed");
        self.severed.send_replace(true);
    }

    pub fn is_severed(&self) -> bool {
        *self.severed.borrow()
    }
}

impl Port for MemoryPort {
    fn send(&self, frame: Bytes) -> Result<(), PortError> {
        if self.is_severed() {
            return Err(PortError::Closed);
        }
        self.tx.send(frame).map_err(|_| PortError::Closed)
    }

    fn subscribe(&self, mut on_frame: FrameSink) -> Unsubscribe {
        let Some(mut rx) = self.rx.lock().take() else {
            panic!("memory port already has a subscriber");
        };
        let mut severed = self.severed.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(frame) => on_frame(frame),
                        None => break,
                    },
                    _ = severed.changed() => {
                        if *severed.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        let abort = pump.abort_handle();
        Unsubscribe::new(move || abort.abort())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn collect_into(frames: Arc<Mutex<Vec<Bytes>>>) -> FrameSink {
        Box::new(move |frame| frames.lock().push(frame))
    }

    #[tokio::test]
    async fn frames_cross_in_order() {
        let (a, b) = MemoryPort::pair();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = b.subscribe(collect_into(seen.clone()));

        for i in 0u8..4 {
            a.send(Bytes::copy_from_slice(&[i])).unwrap();
        }
        tokio::task::yield_now().await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);
        for (i, frame) in seen.iter().enumerate() {
            assert_eq!(frame.as_ref(), &[i as u8]);
        }
    }

    #[tokio::test]
    async fn both_directions_work() {
        let (a, b) = MemoryPort::pair();
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let _sub_a = a.subscribe(collect_into(seen_a.clone()));
        let _sub_b = b.subscribe(collect_into(seen_b.clone()));

        a.send(Bytes::from_static(b"to b")).unwrap();
        b.send(Bytes::from_static(b"to a")).unwrap();
        tokio::task::yield_now().await;

        assert_eq!(seen_b.lock().as_slice(), &[Bytes::from_static(b"to b")]);
        assert_eq!(seen_a.lock().as_slice(), &[Bytes::from_static(b"to a")]);
    }

    #[tokio::test]
    async fn sever_closes_both_sides() {
        let (a, b) = MemoryPort::pair();
        a.sever();

        assert!(matches!(
            a.send(Bytes::from_static(b"x")),
            Err(PortError::Closed)
        ));
        assert!(matches!(
            b.send(Bytes::from_static(b"x")),
            Err(PortError::Closed)
        ));
        assert!(b.is_severed());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (a, b) = MemoryPort::pair();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut sub = b.subscribe(Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        a.send(Bytes::from_static(b"one")).unwrap();
        tokio::task::yield_now().await;
        sub.unsubscribe();
        tokio::task::yield_now().await;

        a.send(Bytes::from_static(b"two")).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "already has a subscriber")]
    async fn second_subscriber_panics() {
        let (_a, b) = MemoryPort::pair();
        let _first = b.subscribe(Box::new(|_| {}));
        let _second = b.subscribe(Box::new(|_| {}));
    }
}

#[cfg(test)]
mod conformance {
    use std::sync::Arc;
    use std::sync::Once;

    use tether_core::Port;
    use tether_testkit::PortFactory;

    use crate::MemoryPort;

    struct MemoryFactory;

    impl PortFactory for MemoryFactory {
        fn pair(&self) -> (Arc<dyn Port>, Arc<dyn Port>) {
            let (a, b) = MemoryPort::pair();
            (a, b)
        }
    }

    fn init_tracing() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }

    #[tokio::test]
    async fn unary_echo() {
        init_tracing();
        tether_testkit::run_unary_echo(&MemoryFactory).await.unwrap();
    }

    #[tokio::test]
    async fn streaming_counter() {
        init_tracing();
        tether_testkit::run_streaming_counter(&MemoryFactory)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn timeout_then_late_frame() {
        init_tracing();
        tether_testkit::run_timeout_then_late_frame(&MemoryFactory)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn close_drains_pending() {
        init_tracing();
        tether_testkit::run_close_drains_pending(&MemoryFactory)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn idempotent_close() {
        init_tracing();
        tether_testkit::run_idempotent_close(&MemoryFactory)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_method() {
        init_tracing();
        tether_testkit::run_unknown_method(&MemoryFactory)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn handshake() {
        init_tracing();
        tether_testkit::run_handshake(&MemoryFactory).await.unwrap();
    }
}
