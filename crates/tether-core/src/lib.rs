//! tether-core: transport-agnostic RPC peer runtime.
//!
//! This crate defines:
//! - The frame transport abstraction ([`Port`], [`Unsubscribe`])
//! - The wire envelope ([`Envelope`], [`FrameDecodeError`])
//! - The peer runtime ([`RpcPeer`], [`PeerConfig`], [`CallStream`])
//! - Inbound dispatch ([`ServiceRouter`], [`HandlerMap`], [`MethodHandler`])
//! - The error taxonomy ([`RpcError`], [`ErrorKind`])
//!
//! A peer is symmetric: the same endpoint issues calls and serves handlers
//! over one port. Typed payloads and service descriptors live one layer up,
//! in the `tether` crate.

#![forbid(unsafe_code)]

mod calls;
mod envelope;
mod error;
mod peer;
mod port;
mod router;

pub use calls::{CallOptions, CallTable};
pub use envelope::*;
pub use error::*;
pub use peer::*;
pub use port::*;
pub use router::*;

// Re-export StreamExt so call sites can consume streaming calls without
// depending on futures directly.
pub use futures::StreamExt;
