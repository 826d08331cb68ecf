//! JSON codec (`wamp.2.json`).

use bytes::Bytes;

use super::Codec;
use crate::error::{Result, WampError};
use crate::protocol::Message;

/// JSON array codec
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a JSON codec
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn protocol_id(&self) -> &'static str {
        "wamp.2.json"
    }

    fn rawsocket_id(&self) -> u8 {
        1
    }

    fn is_binary(&self) -> bool {
        false
    }

    fn serialize(&self, message: &Message) -> Result<Bytes> {
        serde_json::to_vec(&message.to_value())
            .map(Bytes::from)
            .map_err(WampError::serialization)
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Message> {
        let value = serde_json::from_slice(payload).map_err(WampError::serialization)?;
        Message::from_value(value)
    }
}
