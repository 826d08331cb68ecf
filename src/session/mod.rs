//! Client session.
//!
//! A [`Session`] is a handle to a driver task that owns the connection, the
//! state machine and the four role processors. Every public operation is a
//! command sent to that task; replies come back over oneshot channels, so no
//! session state is shared between threads.
//!
//! # Lifecycle
//!
//! ```text
//! open() ──▶ HELLO ──▶ [CHALLENGE ──▶ AUTHENTICATE] ──▶ WELCOME
//!                                                          │
//!            retry timer ◀── connection lost ◀─────────────┤
//!                                                          ▼
//!                          close() ──▶ GOODBYE ◀──▶ GOODBYE ──▶ closed
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wamp::{CallOptions, RawSocketFactory, JsonCodec, Session, SessionConfig, RetryConfig};
//!
//! let factory = Arc::new(RawSocketFactory::new(Arc::new(JsonCodec::new()), 1 << 24));
//! let session = Session::new(SessionConfig::new("127.0.0.1:8080", "realm1"), RetryConfig::default(), factory);
//! let welcome = session.open().await?;
//!
//! let call = session.call("com.example.add", vec![2.into(), 3.into()], Dict::new(), CallOptions::default()).await?;
//! let sum = call.result().await?;
//!
//! session.close().await;
//! ```

mod driver;
mod handles;

pub use handles::{OutgoingCall, Registration, Subscription};

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};

use crate::auth::{AnonymousAuthProvider, AuthProvider};
use crate::config::{RetryConfig, SessionConfig};
use crate::error::{DomainError, Result, WampError};
use crate::processor::{
    CallHandler, CallParts, EventHandler, Publication, RegistrationParts, SubscriptionParts,
};
use crate::protocol::{
    is_valid_pattern, is_valid_uri, CallOptions, CancelMode, Dict, Id, List, PublishOptions,
    RegisterOptions, SessionState, SubscribeOptions, Uri, WelcomeDetails,
};
use crate::transport::{CloseEvent, TransportFactory};
use driver::Driver;

/// Error URI returned for malformed topic or procedure URIs.
pub const INVALID_URI: &str = "wamp.error.invalid_uri";

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseDetails {
    /// Transport close code
    pub code: u16,
    /// Close reason (GOODBYE/ABORT reason when there was one)
    pub reason: String,
    /// Optional human-readable message
    pub message: Option<String>,
    /// Whether the session ended in an orderly way
    pub was_clean: bool,
}

impl CloseDetails {
    fn from_event(event: &CloseEvent) -> Self {
        Self {
            code: event.code,
            reason: event.reason.clone(),
            message: event.message.clone(),
            was_clean: event.was_clean,
        }
    }
}

/// Observable session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStatus {
    /// State machine state
    pub state: SessionState,
    /// Router-assigned id while established
    pub session_id: Option<Id>,
}

pub(crate) enum Command {
    Open(oneshot::Sender<Result<WelcomeDetails>>),
    Close(oneshot::Sender<CloseDetails>),
    Closed(oneshot::Sender<Result<CloseDetails>>),
    Publish {
        topic: Uri,
        args: List,
        kwargs: Dict,
        options: PublishOptions,
        reply: oneshot::Sender<Result<Publication>>,
    },
    Subscribe {
        topic: Uri,
        handler: EventHandler,
        options: SubscribeOptions,
        reply: oneshot::Sender<Result<SubscriptionParts>>,
    },
    Unsubscribe {
        epoch: u64,
        subscription: Id,
        member: Id,
        reply: oneshot::Sender<Result<()>>,
    },
    Call {
        procedure: Uri,
        args: List,
        kwargs: Dict,
        options: CallOptions,
        reply: oneshot::Sender<Result<CallParts>>,
    },
    Cancel {
        epoch: u64,
        request: Id,
        mode: CancelMode,
        reply: oneshot::Sender<Result<()>>,
    },
    Register {
        procedure: Uri,
        handler: CallHandler,
        options: RegisterOptions,
        reply: oneshot::Sender<Result<RegistrationParts>>,
    },
    Unregister {
        epoch: u64,
        registration: Id,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Send `command` built around a fresh reply channel and wait for the reply.
pub(crate) async fn request<T>(
    commands: &CommandSender,
    command: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(command(tx))
        .map_err(|_| WampError::closing("Session"))?;
    rx.await.map_err(|_| WampError::closing("Session"))?
}

fn invalid_uri(uri: &str) -> WampError {
    WampError::Domain(DomainError::new(INVALID_URI).with_args(vec![uri.into()]))
}

/// WAMP client session
pub struct Session {
    commands: CommandSender,
    driver: Mutex<Option<Driver>>,
    status: watch::Receiver<SessionStatus>,
}

impl Session {
    /// Session joining `config.realm` through transports from `factory`.
    ///
    /// Nothing connects until [`open`](Self::open).
    pub fn new(
        config: SessionConfig,
        retry: RetryConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SessionStatus::default());
        let driver = Driver::new(
            config,
            &retry,
            factory,
            Arc::new(AnonymousAuthProvider::new()),
            commands_rx,
            status_tx,
        );
        Self {
            commands,
            driver: Mutex::new(Some(driver)),
            status,
        }
    }

    /// Authenticate with `provider` instead of anonymously.
    pub fn with_auth(self, provider: Arc<dyn AuthProvider>) -> Self {
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            driver.set_auth(provider);
        }
        self
    }

    fn start(&self) {
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            tokio::spawn(driver.run());
        }
    }

    /// Connect and join the realm.
    ///
    /// Fails only once the connection cannot be established and no further
    /// retry will be made.
    pub async fn open(&self) -> Result<WelcomeDetails> {
        self.start();
        request(&self.commands, Command::Open).await
    }

    /// Leave the realm and close the connection. Pending retries are
    /// cancelled. Never fails.
    pub async fn close(&self) -> CloseDetails {
        self.start();
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Close(tx)).is_ok() {
            if let Ok(details) = rx.await {
                return details;
            }
        }
        CloseDetails {
            code: crate::transport::CLOSE_NORMAL,
            reason: crate::protocol::CLOSE_NORMAL.to_string(),
            message: None,
            was_clean: true,
        }
    }

    /// Wait for the session to end for good (no retry pending).
    ///
    /// Fails with [`WampError::ConnectionClose`] if it ended uncleanly.
    pub async fn closed(&self) -> Result<CloseDetails> {
        self.start();
        request(&self.commands, Command::Closed).await
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Status updates
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Current state machine state
    pub fn state(&self) -> SessionState {
        self.status().state
    }

    /// Router-assigned session id while established
    pub fn session_id(&self) -> Option<Id> {
        self.status().session_id
    }

    /// Whether role operations are possible
    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Publish an event to `topic`.
    pub async fn publish(
        &self,
        topic: impl Into<Uri>,
        args: List,
        kwargs: Dict,
        options: PublishOptions,
    ) -> Result<Publication> {
        let topic = topic.into();
        if !is_valid_uri(&topic) {
            return Err(invalid_uri(&topic));
        }
        self.start();
        request(&self.commands, |reply| Command::Publish {
            topic,
            args,
            kwargs,
            options,
            reply,
        })
        .await
    }

    /// Subscribe `handler` to `topic`.
    pub async fn subscribe(
        &self,
        topic: impl Into<Uri>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        let topic = topic.into();
        if !is_valid_pattern(&topic, options.match_policy) {
            return Err(invalid_uri(&topic));
        }
        self.start();
        let parts = request(&self.commands, |reply| Command::Subscribe {
            topic,
            handler,
            options,
            reply,
        })
        .await?;
        Ok(Subscription::new(parts, self.commands.clone()))
    }

    /// Call `procedure`.
    ///
    /// Returns once the CALL is sent; the result arrives through the
    /// returned [`OutgoingCall`].
    pub async fn call(
        &self,
        procedure: impl Into<Uri>,
        args: List,
        kwargs: Dict,
        options: CallOptions,
    ) -> Result<OutgoingCall> {
        let procedure = procedure.into();
        if !is_valid_uri(&procedure) {
            return Err(invalid_uri(&procedure));
        }
        self.start();
        let cancel_mode = options.cancel_mode;
        let parts = request(&self.commands, |reply| Command::Call {
            procedure,
            args,
            kwargs,
            options,
            reply,
        })
        .await?;
        Ok(OutgoingCall::new(parts, cancel_mode, self.commands.clone()))
    }

    /// Register `handler` as `procedure`.
    pub async fn register(
        &self,
        procedure: impl Into<Uri>,
        handler: CallHandler,
        options: RegisterOptions,
    ) -> Result<Registration> {
        let procedure = procedure.into();
        if !is_valid_pattern(&procedure, options.match_policy) {
            return Err(invalid_uri(&procedure));
        }
        self.start();
        let parts = request(&self.commands, |reply| Command::Register {
            procedure,
            handler,
            options,
            reply,
        })
        .await?;
        Ok(Registration::new(parts, self.commands.clone()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::event_handler;
    use crate::transport::MemoryTransportFactory;

    fn session() -> Session {
        let (factory, _connector) = MemoryTransportFactory::new();
        Session::new(
            SessionConfig::new("memory", "realm1"),
            RetryConfig::disabled(),
            Arc::new(factory),
        )
    }

    #[tokio::test]
    async fn test_role_operations_need_an_established_session() {
        let session = session();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.session_id(), None);

        let err = session
            .publish("com.example.topic", List::new(), Dict::new(), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WampError::NotEstablished));

        let err = session
            .call("com.example.proc", List::new(), Dict::new(), CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, WampError::NotEstablished));
    }

    #[tokio::test]
    async fn test_invalid_uris_are_rejected_locally() {
        let session = session();
        let err = session
            .publish("com.example topic", List::new(), Dict::new(), PublishOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.as_domain().map(|e| e.uri.as_str()), Some(INVALID_URI));

        let err = session
            .subscribe("com..topic", event_handler(|_| {}), SubscribeOptions::default())
            .await
            .unwrap_err();
        assert!(err.as_domain().is_some());
    }

    #[tokio::test]
    async fn test_close_without_open_resolves() {
        let session = session();
        let details = session.close().await;
        assert!(details.was_clean);
        assert_eq!(details.code, crate::transport::CLOSE_NORMAL);
    }
}
