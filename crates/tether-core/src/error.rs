//! Error taxonomy for the RPC runtime.

use core::fmt;

use crate::PortError;

/// Error kinds carried on the wire inside `Error` envelopes.
///
/// These are what a remote peer reports about a failed call; the local peer
/// maps them back into [`RpcError`] variants for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// The handler on the far side returned or threw an error.
    Application = 0,
    /// No handler is registered for the requested method.
    UnknownMethod = 1,
    /// The far side closed (or was closing) while the call was outstanding.
    Aborted = 2,
    /// The far side could not make sense of the request.
    Protocol = 3,
    /// The handler panicked or the far side hit an internal fault.
    Internal = 4,
}

impl ErrorKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Application),
            1 => Some(Self::UnknownMethod),
            2 => Some(Self::Aborted),
            3 => Some(Self::Protocol),
            4 => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => write!(f, "application error"),
            Self::UnknownMethod => write!(f, "unknown method"),
            Self::Aborted => write!(f, "aborted"),
            Self::Protocol => write!(f, "protocol error"),
            Self::Internal => write!(f, "internal error"),
        }
    }
}

/// The shape of a call as declared by a method descriptor or handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    Streaming,
    Oneway,
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary => write!(f, "unary"),
            Self::Streaming => write!(f, "streaming"),
            Self::Oneway => write!(f, "oneway"),
        }
    }
}

/// Errors surfaced to callers of the RPC peer.
///
/// Every variant is a distinguishable kind so call sites can special-case
/// `Timeout`/`Aborted` for retry logic above the peer, versus treating
/// `Remote` as a semantic failure of the business logic on the other side.
#[derive(Debug)]
pub enum RpcError {
    /// The call's deadline elapsed with no terminal frame.
    Timeout,
    /// The local peer closed while the call was outstanding.
    Aborted,
    /// The handler on the other side reported an error.
    Remote { kind: ErrorKind, message: String },
    /// No handler is registered for this method on the remote side.
    UnknownMethod { method: String },
    /// A frame could not be decoded, or a frame arrived that makes no sense
    /// for the call it names.
    Protocol(String),
    /// The port's `send` failed.
    Transport(PortError),
    /// `call` was issued before `open()` (or after `close()`).
    NotOpen,
    /// `open()` was called on a peer that is not idle.
    AlreadyOpen,
    /// The call table is at its configured capacity.
    TooManyCalls,
    /// A method was invoked through the wrong call shape.
    ShapeMismatch { method: String, expected: CallShape },
    /// Typed payload encoding or decoding failed.
    Codec(String),
}

impl RpcError {
    /// Map a wire-level error kind (from an `Error` envelope) to the local
    /// taxonomy.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::UnknownMethod => Self::UnknownMethod { method: message },
            ErrorKind::Aborted => Self::Aborted,
            _ => Self::Remote { kind, message },
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::Aborted => write!(f, "peer closed while call was outstanding"),
            Self::Remote { kind, message } => write!(f, "remote error ({kind}): {message}"),
            Self::UnknownMethod { method } => write!(f, "unknown method: {method}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::NotOpen => write!(f, "peer is not open"),
            Self::AlreadyOpen => write!(f, "peer is already open"),
            Self::TooManyCalls => write!(f, "too many pending calls"),
            Self::ShapeMismatch { method, expected } => {
                write!(f, "method {method} must be called as {expected}")
            }
            Self::Codec(msg) => write!(f, "codec error: {msg}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PortError> for RpcError {
    fn from(e: PortError) -> Self {
        Self::Transport(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_round_trips() {
        for kind in [
            ErrorKind::Application,
            ErrorKind::UnknownMethod,
            ErrorKind::Aborted,
            ErrorKind::Protocol,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(ErrorKind::from_u8(250), None);
    }

    #[test]
    fn wire_kinds_map_to_distinct_variants() {
        assert!(matches!(
            RpcError::from_wire(ErrorKind::UnknownMethod, "Echo.reply".into()),
            RpcError::UnknownMethod { .. }
        ));
        assert!(matches!(
            RpcError::from_wire(ErrorKind::Aborted, String::new()),
            RpcError::Aborted
        ));
        assert!(matches!(
            RpcError::from_wire(ErrorKind::Application, "boom".into()),
            RpcError::Remote { kind: ErrorKind::Application, .. }
        ));
    }
}
