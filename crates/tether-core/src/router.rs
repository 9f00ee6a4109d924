//! Dispatch of inbound requests to locally-exposed handlers.
//!
//! Handlers are registered under `"Service.method"` keys as a tagged
//! [`MethodHandler`] (unary, streaming, or oneway), resolved once at router
//! construction. Dispatch never touches the port: it yields a stream of
//! response envelopes for the peer to write, so the peer's frame loop stays
//! in control of I/O and never blocks on a slow handler.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use futures::Future;

use crate::{Envelope, ErrorKind};

/// Error returned by a handler; serialized into an `Error` envelope.
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Application,
            message: message.into(),
        }
    }

    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for HandlerError {}

type BoxedUnary = Arc<
    dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes, HandlerError>> + Send>>
        + Send
        + Sync,
>;
type BoxedStreaming =
    Arc<dyn Fn(Bytes) -> BoxStream<'static, Result<Bytes, HandlerError>> + Send + Sync>;
type BoxedOneway = Arc<
    dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync,
>;

/// A locally-exposed method, tagged by call shape.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(BoxedUnary),
    Streaming(BoxedStreaming),
    Oneway(BoxedOneway),
}

/// Builder for the handler map consumed by [`ServiceRouter`].
#[derive(Default)]
pub struct HandlerMap {
    handlers: HashMap<String, MethodHandler>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unary handler under `"Service.method"`.
    pub fn unary<F, Fut>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.insert(
            service,
            method,
            MethodHandler::Unary(Arc::new(move |payload| Box::pin(handler(payload)))),
        );
        self
    }

    /// Register a streaming handler under `"Service.method"`.
    pub fn streaming<F, S>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(Bytes) -> S + Send + Sync + 'static,
        S: futures::Stream<Item = Result<Bytes, HandlerError>> + Send + 'static,
    {
        self.insert(
            service,
            method,
            MethodHandler::Streaming(Arc::new(move |payload| handler(payload).boxed())),
        );
        self
    }

    /// Register a oneway handler under `"Service.method"`.
    pub fn oneway<F, Fut>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.insert(
            service,
            method,
            MethodHandler::Oneway(Arc::new(move |payload| Box::pin(handler(payload)))),
        );
        self
    }

    /// Merge another map into this one. Later registrations win.
    pub fn merge(mut self, other: HandlerMap) -> Self {
        self.handlers.extend(other.handlers);
        self
    }

    fn insert(&mut self, service: &str, method: &str, handler: MethodHandler) {
        let key = format!("{service}.{method}");
        let prev = self.handlers.insert(key.clone(), handler);
        assert!(prev.is_none(), "handler already registered for {key}");
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Outcome of dispatching one inbound request.
pub enum Dispatch {
    /// Envelopes to write back, produced lazily. Empty for oneway requests
    /// (the handler still runs as the stream is driven).
    Respond(BoxStream<'static, Envelope>),
    /// The method is unknown and the router is configured to treat that as
    /// fatal for the peer.
    FatalUnknownMethod(String),
}

/// Per-peer dispatcher from inbound requests to local handler functions.
pub struct ServiceRouter {
    handlers: HashMap<String, MethodHandler>,
    strict_methods: bool,
}

impl ServiceRouter {
    pub fn new(map: HandlerMap, strict_methods: bool) -> Self {
        Self {
            handlers: map.handlers,
            strict_methods,
        }
    }

    /// An empty router: every request answers `UnknownMethod`.
    pub fn empty() -> Self {
        Self::new(HandlerMap::new(), false)
    }

    /// Dispatch one request. Handler errors (and shape mismatches) become
    /// `Error` envelopes; they never escape to the caller.
    pub fn dispatch(
        &self,
        call_id: u32,
        method: &str,
        streaming: bool,
        oneway: bool,
        payload: Bytes,
    ) -> Dispatch {
        let Some(handler) = self.handlers.get(method) else {
            tracing::warn!(call_id, method, "request for unknown method");
            if self.strict_methods {
                return Dispatch::FatalUnknownMethod(method.to_string());
            }
            return Self::respond_error(call_id, oneway, ErrorKind::UnknownMethod, method);
        };

        match handler {
            MethodHandler::Unary(h) => {
                if streaming || oneway {
                    return Self::respond_error(
                        call_id,
                        oneway,
                        ErrorKind::Protocol,
                        &format!("{method} is a unary method"),
                    );
                }
                let fut = h(payload);
                Dispatch::Respond(
                    stream::once(async move {
                        match fut.await {
                            Ok(payload) => Envelope::Response { call_id, payload },
                            Err(e) => Envelope::Error {
                                call_id,
                                kind: e.kind,
                                message: e.message,
                            },
                        }
                    })
                    .boxed(),
                )
            }
            MethodHandler::Streaming(h) => {
                if !streaming {
                    return Self::respond_error(
                        call_id,
                        oneway,
                        ErrorKind::Protocol,
                        &format!("{method} is a streaming method"),
                    );
                }
                let items = h(payload);
                // Data items in production order, then exactly one terminal:
                // StreamEnd on completion, Error on mid-stream failure.
                let out = async_stream::stream! {
                    futures::pin_mut!(items);
                    while let Some(item) = items.next().await {
                        match item {
                            Ok(payload) => yield Envelope::StreamData { call_id, payload },
                            Err(e) => {
                                yield Envelope::Error {
                                    call_id,
                                    kind: e.kind,
                                    message: e.message,
                                };
                                return;
                            }
                        }
                    }
                    yield Envelope::StreamEnd { call_id };
                };
                Dispatch::Respond(out.boxed())
            }
            MethodHandler::Oneway(h) => {
                let fut = h(payload);
                let method = method.to_string();
                Dispatch::Respond(
                    stream::once(async move {
                        if let Err(e) = fut.await {
                            // Oneway failures are observed locally only.
                            tracing::warn!(call_id, method = %method, error = %e.message, "oneway handler failed");
                        }
                    })
                    .filter_map(|()| async { None::<Envelope> })
                    .boxed(),
                )
            }
        }
    }

    fn respond_error(call_id: u32, oneway: bool, kind: ErrorKind, message: &str) -> Dispatch {
        if oneway {
            return Dispatch::Respond(stream::empty().boxed());
        }
        Dispatch::Respond(
            stream::once({
                let message = message.to_string();
                async move {
                    Envelope::Error {
                        call_id,
                        kind,
                        message,
                    }
                }
            })
            .boxed(),
        )
    }
}
