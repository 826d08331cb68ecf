//! # wamp - Client Session Engine for WAMP
//!
//! Client side of the Web Application Messaging Protocol: join a realm on a
//! router, then publish and subscribe to events, call remote procedures and
//! register local procedures for others to call, all over one connection.
//!
//! ## Features
//!
//! - **Session state machine**: HELLO/CHALLENGE/WELCOME handshake, GOODBYE and ABORT handling
//! - **Four roles**: publisher, subscriber, caller and callee with request correlation
//! - **Progressive results**: partial call results in both directions
//! - **Cooperative cancellation**: CANCEL/INTERRUPT surfaced as a cancellation token
//! - **Reconnects**: exponential backoff with Gaussian jitter
//! - **Transports**: RawSocket over TCP, plus an in-memory transport for tests
//!
//! ## Protocol Overview
//!
//! ### Architecture
//!
//! ```text
//! Client                          Router                          Other client
//!    |                              |                                |
//!    |------ HELLO (roles) -------->|                                |
//!    |<----- CHALLENGE -------------|   (session-level auth only)    |
//!    |------ AUTHENTICATE --------->|                                |
//!    |<----- WELCOME ---------------|                                |
//!    |                              |                                |
//!    |------ CALL ----------------->|------- INVOCATION ------------>|
//!    |<----- RESULT ----------------|<------ YIELD ------------------|
//!    |                              |                                |
//!    |------ GOODBYE -------------->|                                |
//!    |<----- GOODBYE ---------------|                                |
//! ```
//!
//! ### State Machine
//!
//! ```text
//!               recv CHALLENGE                 sent AUTHENTICATE
//!     [Idle] ─────────────────> [Challenging] ─────────────────> [Idle]
//!        │                            │
//!        │ recv WELCOME               │ recv WELCOME
//!        v                            v
//!   [Established] <───────────────────┘
//!        │
//!        │ GOODBYE (either side)
//!        v
//!    [Closing] ──── GOODBYE (other side) ───> [Closed]
//!
//!    recv ABORT during handshake or sent ABORT anywhere ──> [Error]
//! ```
//!
//! Any message the table does not allow is a protocol violation: the session
//! sends ABORT (`wamp.error.protocol_violation`), closes with code 3000 and
//! does not reconnect.
//!
//! ### Message Types
//!
//! | Role       | Sends                           | Receives                                   |
//! |------------|---------------------------------|--------------------------------------------|
//! | Publisher  | PUBLISH                         | PUBLISHED, ERROR                           |
//! | Subscriber | SUBSCRIBE, UNSUBSCRIBE          | SUBSCRIBED, UNSUBSCRIBED, EVENT, ERROR     |
//! | Caller     | CALL, CANCEL                    | RESULT, ERROR                              |
//! | Callee     | REGISTER, UNREGISTER, YIELD, ERROR | REGISTERED, UNREGISTERED, INVOCATION, INTERRUPT, ERROR |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wamp::{
//!     call_handler, event_handler, CallOptions, CallResult, Dict, JsonCodec, PublishOptions,
//!     RawSocketFactory, RegisterOptions, RetryConfig, Session, SessionConfig, SubscribeOptions,
//! };
//!
//! let factory = Arc::new(RawSocketFactory::new(Arc::new(JsonCodec::new()), 1 << 24));
//! let session = Session::new(
//!     SessionConfig::new("127.0.0.1:8080", "realm1"),
//!     RetryConfig::default(),
//!     factory,
//! );
//! session.open().await?;
//!
//! // Callee
//! let add = call_handler(|inv| async move {
//!     let a = inv.args[0].as_i64().unwrap_or(0);
//!     let b = inv.args[1].as_i64().unwrap_or(0);
//!     Ok(CallResult::value(a + b))
//! });
//! session.register("com.example.add", add, RegisterOptions::default()).await?;
//!
//! // Caller
//! let call = session
//!     .call("com.example.add", vec![2.into(), 3.into()], Dict::new(), CallOptions::default())
//!     .await?;
//! println!("{:?}", call.result().await?.args);
//!
//! // Subscriber and publisher
//! let sub = session
//!     .subscribe("com.example.tick", event_handler(|e| println!("{:?}", e.args)), SubscribeOptions::default())
//!     .await?;
//! session
//!     .publish("com.example.tick", vec![1.into()], Dict::new(), PublishOptions::acknowledged())
//!     .await?
//!     .published()
//!     .await?;
//! sub.unsubscribe().await?;
//!
//! session.close().await;
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Public session handle and its driver task
//! - [`protocol`]: Messages, options, ids, state machine and feature advertisement
//! - [`processor`]: Publisher, subscriber, caller and callee processors
//! - [`correlator`]: Request/response matching
//! - [`retry`]: Reconnect backoff
//! - [`auth`]: Authentication providers
//! - [`codec`]: Message serialization
//! - [`transport`]: Connection backends
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod auth;
pub mod codec;
pub mod config;
pub mod correlator;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use auth::{
    AnonymousAuthProvider, AuthProvider, ChallengeResponse, CookieAuthProvider, TicketAuthProvider,
    TlsAuthProvider,
};
pub use codec::{Codec, JsonCodec};
pub use config::{Config, RetryConfig, SessionConfig, TransportConfig};
pub use error::{DomainError, Result, WampError};
pub use processor::{
    call_handler, event_handler, CallError, CallHandler, CallUpdate, CancellationToken, Event,
    EventHandler, Invocation, Publication,
};
pub use protocol::{
    CallOptions, CallResult, CancelMode, Dict, EventDetails, Id, InvocationDetails, List,
    MatchPolicy, Message, PublishOptions, RegisterOptions, SessionState, SubscribeOptions, Uri,
    WelcomeDetails,
};
pub use retry::RetryController;
pub use session::{CloseDetails, OutgoingCall, Registration, Session, SessionStatus, Subscription};
pub use transport::{MemoryTransportFactory, RawSocketFactory, Transport, TransportFactory};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WAMP protocol version implemented
pub const PROTOCOL_VERSION: &str = "2";
