//! Transport layer abstraction for WAMP sessions.
//!
//! Provides pluggable message transports including:
//! - **RawSocket**: length-prefixed frames over TCP
//! - **Memory**: in-process pipe to a scripted router, used by tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │                Session                   │
//! │         (Transport-Agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │ TransportFactory::create()
//!          ┌────────┴────────┐
//!          ▼                 ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │RawSocketTransport│ │ MemoryTransport │
//! │     (TCP)       │ │   (in-process)  │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! A session creates a fresh transport for every connection attempt. The
//! transport reports what happens on the connection through
//! [`TransportEvent`]s; `send` reports failures of the send itself.

mod memory;
mod rawsocket;

pub use memory::{MemoryConnector, MemoryTransport, MemoryTransportFactory, RouterEnd};
pub use rawsocket::{RawSocketFactory, RawSocketTransport};

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::{Result, WampError};
use crate::protocol::Message;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Connection dropped without a close handshake
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Closure because of a protocol error or failed authentication
pub const CLOSE_PROTOCOL_ERROR: u16 = 3000;

/// Details of a closed connection.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseEvent {
    /// Close code
    pub code: u16,
    /// Close reason
    pub reason: String,
    /// Optional human-readable message
    pub message: Option<String>,
    /// Whether the close handshake completed
    pub was_clean: bool,
}

impl CloseEvent {
    /// Clean close
    pub fn clean(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: None,
            was_clean: true,
        }
    }

    /// Connection lost
    pub fn lost(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: reason.into(),
            message: None,
            was_clean: false,
        }
    }
}

/// What a transport reports about its connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// Connection ready for the HELLO
    Open,
    /// Decoded inbound message
    Message(Message),
    /// Recoverable error (the connection stays up)
    Error(WampError),
    /// Fatal error (a `Close` follows)
    CriticalError(WampError),
    /// Connection closed
    Close(CloseEvent),
}

/// Sender half the session hands to each transport it opens.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Boxed transport future
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Transport trait for pluggable connection backends.
///
/// Implementations handle framing and encoding while the session stays
/// transport-agnostic.
pub trait Transport: Send {
    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Connect to `endpoint`. Emits `Open` once the connection is usable and
    /// `Close` when it ends, whichever side ends it.
    fn open(&mut self, endpoint: String, events: EventSender) -> TransportFuture<'_, ()>;

    /// Encode and send one message.
    fn send(&mut self, message: Message) -> TransportFuture<'_, ()>;

    /// Close the connection. Emits `Close`.
    fn close(&mut self, code: u16, reason: String) -> TransportFuture<'_, ()>;

    /// Whether the connection is usable
    fn is_open(&self) -> bool;
}

/// Creates one transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    /// New unopened transport
    fn create(&self) -> Box<dyn Transport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_events() {
        let clean = CloseEvent::clean(CLOSE_NORMAL, "wamp.close.normal");
        assert!(clean.was_clean);
        assert_eq!(clean.code, 1000);

        let lost = CloseEvent::lost("connection reset");
        assert!(!lost.was_clean);
        assert_eq!(lost.code, CLOSE_ABNORMAL);
    }
}
