//! Message codecs.
//!
//! A codec turns a [`Message`] into a wire payload and back. Failures are
//! always [`WampError::Serialization`] so callers can tell them apart from
//! transport errors.
//!
//! | Codec         | Protocol id     | RawSocket id | Binary |
//! |---------------|-----------------|--------------|--------|
//! | [`JsonCodec`] | `wamp.2.json`   | 1            | no     |
//!
//! # Usage
//!
//! ```rust,ignore
//! use wamp::codec::{Codec, JsonCodec};
//!
//! let codec = JsonCodec::new();
//! let bytes = codec.serialize(&message)?;
//! let decoded = codec.deserialize(&bytes)?;
//! ```
//!
//! [`WampError::Serialization`]: crate::error::WampError::Serialization

mod json;

pub use json::JsonCodec;

use bytes::Bytes;

use crate::error::{Result, WampError};
use crate::protocol::Message;

/// Serializer between messages and wire payloads.
pub trait Codec: Send + Sync {
    /// WebSocket subprotocol name
    fn protocol_id(&self) -> &'static str;

    /// Serializer id in the RawSocket handshake
    fn rawsocket_id(&self) -> u8;

    /// Whether payloads are binary
    fn is_binary(&self) -> bool;

    /// Encode one message
    fn serialize(&self, message: &Message) -> Result<Bytes>;

    /// Decode one message
    fn deserialize(&self, payload: &[u8]) -> Result<Message>;
}

/// Codec for a configured serializer name.
pub fn codec_for(name: &str) -> Result<Box<dyn Codec>> {
    match name.to_lowercase().as_str() {
        "json" | "wamp.2.json" => Ok(Box::new(JsonCodec::new())),
        other => Err(WampError::Config(format!("Unknown serializer: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_for() {
        let codec = codec_for("JSON").unwrap();
        assert_eq!(codec.protocol_id(), "wamp.2.json");
        assert!(!codec.is_binary());
        assert!(codec_for("cbor").is_err());
    }
}
