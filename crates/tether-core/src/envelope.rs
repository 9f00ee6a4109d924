//! The self-describing envelope wrapped around every frame.
//!
//! Layout (little-endian):
//!
//! ```text
//! [0]     kind tag
//! [1..5]  call id (u32)            -- absent for Open/OpenAck
//! then per kind:
//!   Request:      flags (bit0 streaming, bit1 oneway),
//!                 method len (u16), method UTF-8, payload...
//!   Response:     payload...
//!   StreamData:   payload...
//!   StreamEnd:    (empty)
//!   StreamCancel: (empty)
//!   Error:        error code (u8), msg len (u32), msg UTF-8
//!   Open/OpenAck: (empty)
//! ```
//!
//! Decoding distinguishes failures where the call id is recoverable (scoped
//! to that call) from header corruption (fatal for the peer).

use core::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::ErrorKind;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_STREAM_DATA: u8 = 3;
const KIND_STREAM_END: u8 = 4;
const KIND_STREAM_CANCEL: u8 = 5;
const KIND_ERROR: u8 = 6;
const KIND_OPEN: u8 = 7;
const KIND_OPEN_ACK: u8 = 8;

const FLAG_STREAMING: u8 = 0b01;
const FLAG_ONEWAY: u8 = 0b10;

/// One logical RPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Request {
        call_id: u32,
        method: String,
        streaming: bool,
        oneway: bool,
        payload: Bytes,
    },
    Response {
        call_id: u32,
        payload: Bytes,
    },
    StreamData {
        call_id: u32,
        payload: Bytes,
    },
    /// Terminal marker for a streaming call; no more `StreamData` may follow.
    StreamEnd {
        call_id: u32,
    },
    /// Best-effort notice that the consumer stopped listening; the receiver
    /// stops its producer for this call.
    StreamCancel {
        call_id: u32,
    },
    Error {
        call_id: u32,
        kind: ErrorKind,
        message: String,
    },
    /// Handshake: "I am open".
    Open,
    /// Handshake: "I saw your open".
    OpenAck,
}

impl Envelope {
    /// The call id this envelope refers to, if any.
    pub fn call_id(&self) -> Option<u32> {
        match self {
            Self::Request { call_id, .. }
            | Self::Response { call_id, .. }
            | Self::StreamData { call_id, .. }
            | Self::StreamEnd { call_id }
            | Self::StreamCancel { call_id }
            | Self::Error { call_id, .. } => Some(*call_id),
            Self::Open | Self::OpenAck => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Self::Request {
                call_id,
                method,
                streaming,
                oneway,
                payload,
            } => {
                buf.put_u8(KIND_REQUEST);
                buf.put_u32_le(*call_id);
                let mut flags = 0;
                if *streaming {
                    flags |= FLAG_STREAMING;
                }
                if *oneway {
                    flags |= FLAG_ONEWAY;
                }
                buf.put_u8(flags);
                let method = clip(method, u16::MAX as usize);
                buf.put_u16_le(method.len() as u16);
                buf.put_slice(method.as_bytes());
                buf.put_slice(payload);
            }
            Self::Response { call_id, payload } => {
                buf.put_u8(KIND_RESPONSE);
                buf.put_u32_le(*call_id);
                buf.put_slice(payload);
            }
            Self::StreamData { call_id, payload } => {
                buf.put_u8(KIND_STREAM_DATA);
                buf.put_u32_le(*call_id);
                buf.put_slice(payload);
            }
            Self::StreamEnd { call_id } => {
                buf.put_u8(KIND_STREAM_END);
                buf.put_u32_le(*call_id);
            }
            Self::StreamCancel { call_id } => {
                buf.put_u8(KIND_STREAM_CANCEL);
                buf.put_u32_le(*call_id);
            }
            Self::Error {
                call_id,
                kind,
                message,
            } => {
                buf.put_u8(KIND_ERROR);
                buf.put_u32_le(*call_id);
                buf.put_u8(*kind as u8);
                let message = clip(message, u32::MAX as usize);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message.as_bytes());
            }
            Self::Open => buf.put_u8(KIND_OPEN),
            Self::OpenAck => buf.put_u8(KIND_OPEN_ACK),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::Request {
                method, payload, ..
            } => 1 + 4 + 1 + 2 + method.len() + payload.len(),
            Self::Response { payload, .. } | Self::StreamData { payload, .. } => {
                1 + 4 + payload.len()
            }
            Self::StreamEnd { .. } | Self::StreamCancel { .. } => 1 + 4,
            Self::Error { message, .. } => 1 + 4 + 1 + 4 + message.len(),
            Self::Open | Self::OpenAck => 1,
        }
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameDecodeError> {
        let kind = *frame.first().ok_or(FrameDecodeError::Corrupt(
            DecodeError::UnexpectedEof,
        ))?;

        match kind {
            KIND_OPEN => return Ok(Self::Open),
            KIND_OPEN_ACK => return Ok(Self::OpenAck),
            KIND_REQUEST | KIND_RESPONSE | KIND_STREAM_DATA | KIND_STREAM_END
            | KIND_STREAM_CANCEL | KIND_ERROR => {}
            other => return Err(FrameDecodeError::Corrupt(DecodeError::UnknownKind(other))),
        }

        if frame.len() < 5 {
            return Err(FrameDecodeError::Corrupt(DecodeError::UnexpectedEof));
        }
        let call_id = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let body = &frame[5..];

        let scoped = |source: DecodeError| FrameDecodeError::Malformed { call_id, source };

        match kind {
            KIND_REQUEST => {
                if body.len() < 3 {
                    return Err(scoped(DecodeError::UnexpectedEof));
                }
                let flags = body[0];
                let method_len = u16::from_le_bytes([body[1], body[2]]) as usize;
                let rest = &body[3..];
                if rest.len() < method_len {
                    return Err(scoped(DecodeError::UnexpectedEof));
                }
                let method = std::str::from_utf8(&rest[..method_len])
                    .map_err(|_| scoped(DecodeError::InvalidUtf8))?
                    .to_string();
                Ok(Self::Request {
                    call_id,
                    method,
                    streaming: flags & FLAG_STREAMING != 0,
                    oneway: flags & FLAG_ONEWAY != 0,
                    payload: Bytes::copy_from_slice(&rest[method_len..]),
                })
            }
            KIND_RESPONSE => Ok(Self::Response {
                call_id,
                payload: Bytes::copy_from_slice(body),
            }),
            KIND_STREAM_DATA => Ok(Self::StreamData {
                call_id,
                payload: Bytes::copy_from_slice(body),
            }),
            KIND_STREAM_END => Ok(Self::StreamEnd { call_id }),
            KIND_STREAM_CANCEL => Ok(Self::StreamCancel { call_id }),
            KIND_ERROR => {
                if body.len() < 5 {
                    return Err(scoped(DecodeError::UnexpectedEof));
                }
                let kind = ErrorKind::from_u8(body[0]).unwrap_or(ErrorKind::Application);
                let msg_len = u32::from_le_bytes([body[1], body[2], body[3], body[4]]) as usize;
                let rest = &body[5..];
                if rest.len() < msg_len {
                    return Err(scoped(DecodeError::UnexpectedEof));
                }
                let message = String::from_utf8_lossy(&rest[..msg_len]).into_owned();
                Ok(Self::Error {
                    call_id,
                    kind,
                    message,
                })
            }
            _ => unreachable!("kind validated above"),
        }
    }
}

/// Bound text to what its length prefix can express. Clipping lands on a
/// char boundary so the encoded bytes stay valid UTF-8.
fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Low-level reasons a frame failed to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    UnknownKind(u8),
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of frame"),
            Self::UnknownKind(k) => write!(f, "unknown envelope kind {k}"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 in method name"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Frame decode failure, classified by how much of the header survived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    /// The header is unreadable; there is no call to scope the failure to.
    /// This is fatal for the peer.
    Corrupt(DecodeError),
    /// The header decoded but the body did not; the failure is scoped to the
    /// named call.
    Malformed { call_id: u32, source: DecodeError },
}

impl fmt::Display for FrameDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt(e) => write!(f, "corrupt frame: {e}"),
            Self::Malformed { call_id, source } => {
                write!(f, "malformed frame for call {call_id}: {source}")
            }
        }
    }
}

impl std::error::Error for FrameDecodeError {}
