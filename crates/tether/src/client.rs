//! Typed client handles over an open peer.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{CallOptions, CallShape, CallStream, RpcError, RpcPeer};

use crate::codec::{PayloadCodec, PostcardCodec};
use crate::descriptor::ServiceDescriptor;

/// A typed view of one remote service.
///
/// Thin and cheap to clone; many clients can share one peer. Every call is
/// checked against the descriptor's declared shape before anything goes on
/// the wire.
#[derive(Clone)]
pub struct ServiceClient<C: PayloadCodec = PostcardCodec> {
    peer: Arc<RpcPeer>,
    descriptor: ServiceDescriptor,
    codec: C,
}

impl ServiceClient<PostcardCodec> {
    pub fn new(peer: Arc<RpcPeer>, descriptor: ServiceDescriptor) -> Self {
        Self::with_codec(peer, descriptor, PostcardCodec)
    }
}

impl<C: PayloadCodec> ServiceClient<C> {
    pub fn with_codec(peer: Arc<RpcPeer>, descriptor: ServiceDescriptor, codec: C) -> Self {
        Self {
            peer,
            descriptor,
            codec,
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Invoke a unary method and wait for its decoded response.
    pub async fn unary<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.unary_with(method, request, CallOptions::default()).await
    }

    pub async fn unary_with<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        opts: CallOptions,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.check_shape(method, CallShape::Unary)?;
        let payload = self.codec.encode(request)?;
        let reply = self
            .peer
            .call(&self.descriptor.full_name(method), payload, opts)
            .await?;
        Ok(self.codec.decode(&reply)?)
    }

    /// Invoke a streaming method. Items decode lazily as they are consumed.
    pub fn streaming<Req, Item>(
        &self,
        method: &str,
        request: &Req,
    ) -> Result<TypedCallStream<Item, C>, RpcError>
    where
        Req: Serialize,
        Item: DeserializeOwned,
    {
        self.streaming_with(method, request, CallOptions::default())
    }

    pub fn streaming_with<Req, Item>(
        &self,
        method: &str,
        request: &Req,
        opts: CallOptions,
    ) -> Result<TypedCallStream<Item, C>, RpcError>
    where
        Req: Serialize,
        Item: DeserializeOwned,
    {
        self.check_shape(method, CallShape::Streaming)?;
        let payload = self.codec.encode(request)?;
        let inner = self
            .peer
            .call_stream(&self.descriptor.full_name(method), payload, opts)?;
        Ok(TypedCallStream {
            inner,
            codec: self.codec.clone(),
            _item: PhantomData,
        })
    }

    /// Invoke a oneway method. Nothing comes back, not even failure.
    pub fn oneway<Req>(&self, method: &str, request: &Req) -> Result<(), RpcError>
    where
        Req: Serialize,
    {
        self.check_shape(method, CallShape::Oneway)?;
        let payload = self.codec.encode(request)?;
        self.peer
            .call_oneway(&self.descriptor.full_name(method), payload)
    }

    fn check_shape(&self, method: &str, used: CallShape) -> Result<(), RpcError> {
        match self.descriptor.shape(method) {
            None => Err(RpcError::UnknownMethod {
                method: self.descriptor.full_name(method),
            }),
            Some(declared) if declared == used => Ok(()),
            Some(declared) => Err(RpcError::ShapeMismatch {
                method: self.descriptor.full_name(method),
                expected: declared,
            }),
        }
    }
}

/// A streaming call whose items decode into `Item`.
///
/// Carries the same cancellation semantics as the untyped stream: dropping
/// it early cancels the call.
pub struct TypedCallStream<Item, C: PayloadCodec = PostcardCodec> {
    inner: CallStream,
    codec: C,
    _item: PhantomData<fn() -> Item>,
}

impl<Item, C: PayloadCodec> TypedCallStream<Item, C> {
    pub fn call_id(&self) -> u32 {
        self.inner.call_id()
    }
}

impl<Item: DeserializeOwned, C: PayloadCodec + Unpin> Stream for TypedCallStream<Item, C> {
    type Item = Result<Item, RpcError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(payload))) => {
                let decoded = this.codec.decode(&payload).map_err(RpcError::from);
                Poll::Ready(Some(decoded))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
