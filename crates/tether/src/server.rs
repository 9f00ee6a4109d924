//! Typed handler registration for exposed services.

use std::sync::Arc;

use futures::{Future, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{CallShape, ErrorKind, HandlerError, HandlerMap};

use crate::codec::{CodecError, PayloadCodec, PostcardCodec};
use crate::descriptor::ServiceDescriptor;

fn bad_request(e: CodecError) -> HandlerError {
    HandlerError::with_kind(ErrorKind::Protocol, format!("request decode failed: {e}"))
}

fn bad_response(e: CodecError) -> HandlerError {
    HandlerError::with_kind(ErrorKind::Internal, format!("response encode failed: {e}"))
}

/// Builds the handler map for one exposed service.
///
/// Registration is checked against the descriptor: exposing a method with a
/// shape other than the declared one is a programming error and panics.
/// Multiple services compose by merging the resulting handler maps.
pub struct ServiceServer<C: PayloadCodec = PostcardCodec> {
    descriptor: ServiceDescriptor,
    codec: C,
    handlers: HandlerMap,
}

impl ServiceServer<PostcardCodec> {
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self::with_codec(descriptor, PostcardCodec)
    }
}

impl<C: PayloadCodec> ServiceServer<C> {
    pub fn with_codec(descriptor: ServiceDescriptor, codec: C) -> Self {
        Self {
            descriptor,
            codec,
            handlers: HandlerMap::new(),
        }
    }

    /// Expose a unary method.
    pub fn unary<Req, Resp, F, Fut>(mut self, method: &'static str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        self.check_shape(method, CallShape::Unary);
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.handlers = self
            .handlers
            .unary(self.descriptor.name(), method, move |payload| {
                let codec = codec.clone();
                let handler = handler.clone();
                async move {
                    let request: Req = codec.decode(&payload).map_err(bad_request)?;
                    let response = handler(request).await?;
                    codec.encode(&response).map_err(bad_response)
                }
            });
        self
    }

    /// Expose a streaming method.
    pub fn streaming<Req, Item, F, S>(mut self, method: &'static str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Item: Serialize + Send + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Item, HandlerError>> + Send + 'static,
    {
        self.check_shape(method, CallShape::Streaming);
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.handlers = self
            .handlers
            .streaming(self.descriptor.name(), method, move |payload| {
                let codec = codec.clone();
                let handler = handler.clone();
                async_stream::stream! {
                    let request: Req = match codec.decode(&payload) {
                        Ok(request) => request,
                        Err(e) => {
                            yield Err(bad_request(e));
                            return;
                        }
                    };
                    let items = handler(request);
                    futures::pin_mut!(items);
                    while let Some(item) = items.next().await {
                        match item {
                            Ok(item) => match codec.encode(&item) {
                                Ok(bytes) => yield Ok(bytes),
                                Err(e) => {
                                    yield Err(bad_response(e));
                                    return;
                                }
                            },
                            Err(e) => {
                                yield Err(e);
                                return;
                            }
                        }
                    }
                }
            });
        self
    }

    /// Expose a oneway method. Failures are logged on the serving side and
    /// never reported to the caller.
    pub fn oneway<Req, F, Fut>(mut self, method: &'static str, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.check_shape(method, CallShape::Oneway);
        let codec = self.codec.clone();
        let handler = Arc::new(handler);
        self.handlers = self
            .handlers
            .oneway(self.descriptor.name(), method, move |payload| {
                let codec = codec.clone();
                let handler = handler.clone();
                async move {
                    let request: Req = codec.decode(&payload).map_err(bad_request)?;
                    handler(request).await
                }
            });
        self
    }

    /// Finish: the handler map to hand to the peer (merge maps to expose
    /// several services on one peer).
    pub fn into_handlers(self) -> HandlerMap {
        self.handlers
    }

    fn check_shape(&self, method: &str, used: CallShape) {
        match self.descriptor.shape(method) {
            Some(declared) if declared == used => {}
            Some(declared) => panic!(
                "method {} is declared {declared}, registered as {used}",
                self.descriptor.full_name(method)
            ),
            None => panic!(
                "method {} is not declared on the service",
                self.descriptor.full_name(method)
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("Echo").unary("reply")
    }

    #[test]
    #[should_panic(expected = "registered as")]
    fn wrong_shape_registration_panics() {
        let _ = ServiceServer::new(echo_descriptor()).streaming(
            "reply",
            |(): ()| futures::stream::empty::<Result<u32, HandlerError>>(),
        );
    }

    #[test]
    #[should_panic(expected = "not declared")]
    fn undeclared_method_registration_panics() {
        let _ = ServiceServer::new(echo_descriptor())
            .unary("nope", |n: u32| async move { Ok(n) });
    }

    #[test]
    fn registration_builds_a_handler_map() {
        let handlers = ServiceServer::new(echo_descriptor())
            .unary("reply", |s: String| async move { Ok(s) })
            .into_handlers();
        assert!(!handlers.is_empty());
    }
}
