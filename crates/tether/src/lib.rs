//! tether: typed service layer over the tether-core peer runtime.
//!
//! This crate defines:
//! - Payload codecs ([`PayloadCodec`], [`PostcardCodec`])
//! - Service contracts ([`ServiceDescriptor`])
//! - Typed clients ([`ServiceClient`], [`TypedCallStream`])
//! - Typed handler registration ([`ServiceServer`])
//!
//! The untyped runtime (peer, ports, envelopes) is re-exported from
//! `tether-core`, so most users depend on this crate alone.

#![forbid(unsafe_code)]

mod client;
mod codec;
mod descriptor;
mod server;

pub use client::*;
pub use codec::*;
pub use descriptor::*;
pub use server::*;

pub use tether_core::{
    CallOptions, CallShape, CallStream, ErrorKind, HandlerError, HandlerMap, PeerConfig,
    PeerState, Port, PortError, RpcError, RpcPeer, StreamExt, Unsubscribe,
};
