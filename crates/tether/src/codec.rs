//! Payload codecs: typed values to frame payloads and back.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::RpcError;

/// A failed encode or decode.
#[derive(Debug)]
pub struct CodecError(pub String);

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        RpcError::Codec(e.0)
    }
}

/// Serializes request and response values into payload bytes.
///
/// A codec applies uniformly to one client or server; both sides of a
/// service must agree on it.
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError>;
}

/// The default codec: postcard's compact non-self-describing format.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl PayloadCodec for PostcardCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        postcard::to_stdvec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, CodecError> {
        postcard::from_bytes(payload).map_err(|e| CodecError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
        tags: Vec<u8>,
    }

    #[test]
    fn postcard_round_trip() {
        let value = Sample {
            name: "widget".into(),
            count: 7,
            tags: vec![1, 2, 3],
        };
        let codec = PostcardCodec;
        let bytes = codec.encode(&value).unwrap();
        let back: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let codec = PostcardCodec;
        let result: Result<Sample, _> = codec.decode(&[0xff; 2]);
        assert!(result.is_err());
    }

    #[test]
    fn codec_error_maps_to_rpc_error() {
        let e: RpcError = CodecError("bad".into()).into();
        assert!(matches!(e, RpcError::Codec(msg) if msg == "bad"));
    }
}
