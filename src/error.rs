//! WAMP session error types.
//!
//! # Error Classification
//!
//! - **Connection errors** (`ConnectionOpen`, `ConnectionClose`) describe the
//!   lifecycle of the session as a whole.
//! - **Protocol violations** are never absorbed: the session aborts with
//!   `wamp.error.protocol_violation` and does not retry.
//! - **Domain errors** carry an application error URI plus arguments and are
//!   what a remote procedure call fails with.
//! - **Serialization errors** come from the codec and stay distinguishable so a
//!   callee can turn a failed YIELD into an ERROR reply.
//!
//! `WampError` is `Clone`: a single send failure both rejects the correlator
//! entry it belongs to and is returned to the initiating caller. Sources are
//! kept behind `Arc` to allow this.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{Dict, List, Uri};

/// Error URI used when a handler fails with something that is not a domain error.
pub const RUNTIME_ERROR: &str = "wamp.error.runtime_error";

/// Error URI sent when a callee result cannot be serialized.
pub const SERIALIZATION_ERROR: &str = "wamp.error.serialization-error";

/// ABORT reason used for protocol violations.
pub const PROTOCOL_VIOLATION: &str = "wamp.error.protocol_violation";

/// Application-level RPC failure: an error URI with optional arguments.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{uri}")]
pub struct DomainError {
    /// Error URI, e.g. `com.example.error.not_found`.
    pub uri: Uri,
    /// Positional error arguments.
    pub args: List,
    /// Keyword error arguments.
    pub kwargs: Dict,
}

impl DomainError {
    /// Create a domain error without arguments.
    pub fn new(uri: impl Into<Uri>) -> Self {
        Self {
            uri: uri.into(),
            args: List::new(),
            kwargs: Dict::new(),
        }
    }

    /// Attach positional arguments.
    pub fn with_args(mut self, args: List) -> Self {
        self.args = args;
        self
    }

    /// Attach keyword arguments.
    pub fn with_kwargs(mut self, kwargs: Dict) -> Self {
        self.kwargs = kwargs;
        self
    }

    /// Generic runtime error capturing an arbitrary failure as its first argument.
    pub fn runtime(detail: impl Into<Value>) -> Self {
        Self::new(RUNTIME_ERROR).with_args(vec![detail.into()])
    }
}

/// WAMP client errors.
#[derive(Error, Debug, Clone)]
pub enum WampError {
    /// The session failed before it was established.
    #[error("{}", open_error_text(.reason, .message.as_deref()))]
    ConnectionOpen {
        /// Reason URI or transport reason.
        reason: String,
        /// Optional human-readable message.
        message: Option<String>,
    },

    /// The session was torn down after having been established.
    #[error("Connection closed ({code}): {reason}")]
    ConnectionClose {
        /// Transport close code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// The codec failed to encode or decode a message.
    #[error("Serialization failed: {0}")]
    Serialization(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A message arrived in a state or shape the protocol forbids.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Remote application error.
    #[error("Domain error: {0}")]
    Domain(DomainError),

    /// The owning processor or session is closing.
    #[error("Closing: {0}")]
    Closing(String),

    /// Operation requires an established session.
    #[error("Session not established")]
    NotEstablished,

    /// Operation is not valid in the current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Challenge/response authentication failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

fn open_error_text(reason: &str, message: Option<&str>) -> String {
    match message {
        Some(message) => format!("{message} ({reason})"),
        None => reason.to_string(),
    }
}

impl WampError {
    /// Wrap a codec failure.
    pub fn serialization(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        WampError::Serialization(Arc::new(err))
    }

    /// Error used to reject everything still pending when a processor closes.
    pub fn closing(what: &str) -> Self {
        WampError::Closing(format!("{what} closing"))
    }

    /// Whether this error came from the codec.
    pub fn is_serialization(&self) -> bool {
        matches!(self, WampError::Serialization(_))
    }

    /// Domain error payload, if any.
    pub fn as_domain(&self) -> Option<&DomainError> {
        match self {
            WampError::Domain(err) => Some(err),
            _ => None,
        }
    }
}

/// Result type alias for WAMP operations
pub type Result<T> = std::result::Result<T, WampError>;

impl From<DomainError> for WampError {
    fn from(err: DomainError) -> Self {
        WampError::Domain(err)
    }
}

impl From<std::io::Error> for WampError {
    fn from(err: std::io::Error) -> Self {
        WampError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for WampError {
    fn from(err: toml::de::Error) -> Self {
        WampError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_open_error_display() {
        let err = WampError::ConnectionOpen {
            reason: "wamp.error.no_such_realm".to_string(),
            message: Some("realm does not exist".to_string()),
        };
        assert_eq!(err.to_string(), "realm does not exist (wamp.error.no_such_realm)");

        let err = WampError::ConnectionOpen {
            reason: "protocol violation".to_string(),
            message: None,
        };
        assert_eq!(err.to_string(), "protocol violation");
    }

    #[test]
    fn test_runtime_domain_error() {
        let err = DomainError::runtime("boom");
        assert_eq!(err.uri, RUNTIME_ERROR);
        assert_eq!(err.args, vec![json!("boom")]);
        assert!(err.kwargs.is_empty());
    }

    #[test]
    fn test_serialization_is_distinguishable() {
        let cause = serde_json::from_str::<Value>("{").unwrap_err();
        let err = WampError::serialization(cause);
        assert!(err.is_serialization());
        assert!(std::error::Error::source(&err).is_some());
        assert!(!WampError::NotEstablished.is_serialization());
    }
}
