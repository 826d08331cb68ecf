//! Session driver task.
//!
//! Owns the connection and everything tied to it. The loop waits on user
//! commands, transport events, callee handler updates, the retry timer, a
//! pending challenge response and the GOODBYE deadline, and handles one of
//! them at a time.

use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Sleep};

use super::{CloseDetails, Command, SessionStatus};
use crate::auth::{hello_auth_details, AuthProvider, ChallengeResponse};
use crate::config::{RetryConfig, SessionConfig};
use crate::error::{Result, WampError, PROTOCOL_VIOLATION};
use crate::processor::{InvocationUpdate, MessageSink, Roles};
use crate::protocol::{
    Dict, Direction, IdGenerator, IdGenerators, Message, Role, SessionState,
    SessionStateMachine, WelcomeDetails, CLOSE_GOODBYE_AND_OUT, CLOSE_NORMAL,
};
use crate::retry::RetryController;
use crate::transport::{
    CloseEvent, Transport, TransportEvent, TransportFactory, CLOSE_PROTOCOL_ERROR,
};

/// ABORT reason when a challenge cannot be answered.
const CANNOT_AUTHENTICATE: &str = "wamp.error.cannot_authenticate";

type AuthFuture = BoxFuture<'static, Result<ChallengeResponse>>;

/// One open connection.
struct Link {
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Why the current connection is going away.
#[derive(Debug, Clone)]
struct Failure {
    reason: String,
    message: Option<String>,
}

/// Outbound messages go through the state machine before the transport.
struct Outbound<'a> {
    transport: &'a mut dyn Transport,
    machine: &'a mut SessionStateMachine,
}

impl MessageSink for Outbound<'_> {
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.machine
                .apply(Direction::Sent, message.kind())
                .map_err(WampError::InvalidState)?;
            self.transport.send(message).await
        })
    }
}

async fn next_event(link: &mut Option<Link>) -> TransportEvent {
    match link {
        Some(link) => match link.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn next_update(roles: &mut Option<Roles>) -> InvocationUpdate {
    match roles {
        Some(roles) => match roles.callee.next_update().await {
            Some(update) => update,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn fire(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn challenge_response(pending: &mut Option<AuthFuture>) -> Result<ChallengeResponse> {
    match pending {
        Some(response) => response.await,
        None => std::future::pending().await,
    }
}

pub(crate) struct Driver {
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<SessionStatus>,

    machine: SessionStateMachine,
    ids: IdGenerators,
    roles: Option<Roles>,
    link: Option<Link>,
    welcome: Option<WelcomeDetails>,
    /// Bumped on every WELCOME; handles from other sessions are stale
    epoch: u64,

    retry: RetryController,
    retry_timer: Option<Pin<Box<Sleep>>>,
    goodbye_deadline: Option<Pin<Box<Sleep>>>,
    auth_pending: Option<AuthFuture>,

    open_waiters: Vec<oneshot::Sender<Result<WelcomeDetails>>>,
    close_waiters: Vec<oneshot::Sender<CloseDetails>>,
    closed_waiters: Vec<oneshot::Sender<Result<CloseDetails>>>,

    /// An open cycle is running (connected, connecting or waiting to retry)
    active: bool,
    /// Established at least once in this open cycle
    was_established: bool,
    close_requested: bool,
    /// Aborted by either side; never retried
    aborted: bool,
    /// The transport reported a fatal error on this connection
    critical: bool,
    failure: Option<Failure>,
    goodbye_reason: Option<String>,
    last_close: Option<Result<CloseDetails>>,
}

impl Driver {
    pub(crate) fn new(
        config: SessionConfig,
        retry: &RetryConfig,
        factory: Arc<dyn TransportFactory>,
        auth: Arc<dyn AuthProvider>,
        commands: mpsc::UnboundedReceiver<Command>,
        status: watch::Sender<SessionStatus>,
    ) -> Self {
        Self {
            config,
            factory,
            auth,
            commands,
            status,
            machine: SessionStateMachine::new(),
            ids: IdGenerators::default(),
            roles: None,
            link: None,
            welcome: None,
            epoch: 0,
            retry: RetryController::new(retry),
            retry_timer: None,
            goodbye_deadline: None,
            auth_pending: None,
            open_waiters: Vec::new(),
            close_waiters: Vec::new(),
            closed_waiters: Vec::new(),
            active: false,
            was_established: false,
            close_requested: false,
            aborted: false,
            critical: false,
            failure: None,
            goodbye_reason: None,
            last_close: None,
        }
    }

    pub(crate) fn set_auth(&mut self, auth: Arc<dyn AuthProvider>) {
        self.auth = auth;
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                event = next_event(&mut self.link) => self.on_transport_event(event).await,
                update = next_update(&mut self.roles) => self.on_invocation_update(update).await,
                response = challenge_response(&mut self.auth_pending) => {
                    self.auth_pending = None;
                    self.on_challenge_response(response).await;
                },
                () = fire(&mut self.retry_timer) => {
                    self.retry_timer = None;
                    self.connect().await;
                },
                () = fire(&mut self.goodbye_deadline) => {
                    self.goodbye_deadline = None;
                    tracing::warn!("Router did not answer GOODBYE, closing transport");
                    self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
                },
            }
            self.publish_status();
        }

        tracing::debug!("Session handle dropped, stopping driver");
        self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
        if let Some(mut roles) = self.roles.take() {
            roles.close();
        }
    }

    fn publish_status(&self) {
        let status = SessionStatus {
            state: self.machine.state(),
            session_id: self.welcome.as_ref().map(|welcome| welcome.session),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Roles and sink, if role traffic is currently possible.
    fn established(&mut self) -> Option<(&mut Roles, Outbound<'_>)> {
        if !self.machine.is_established() {
            return None;
        }
        let roles = self.roles.as_mut()?;
        let link = self.link.as_mut()?;
        Some((
            roles,
            Outbound {
                transport: link.transport.as_mut(),
                machine: &mut self.machine,
            },
        ))
    }

    /// Handles carry the epoch of the session that created them. Request and
    /// router ids restart with each session, so a stale handle must not reach
    /// the current processors.
    fn check_epoch(&self, epoch: u64, owner: &str) -> Result<()> {
        if epoch == self.epoch && self.roles.is_some() {
            Ok(())
        } else {
            tracing::debug!("Rejecting {} request from session epoch {}", owner, epoch);
            Err(WampError::closing(owner))
        }
    }

    async fn send(&mut self, message: Message) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(WampError::Transport("Transport is not open".to_string()));
        };
        let mut outbound = Outbound {
            transport: link.transport.as_mut(),
            machine: &mut self.machine,
        };
        outbound.send(message).await
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Open(reply) => self.on_open(reply).await,
            Command::Close(reply) => self.on_close(reply).await,
            Command::Closed(reply) => {
                if self.active {
                    self.closed_waiters.push(reply);
                } else {
                    match &self.last_close {
                        Some(outcome) => {
                            let _ = reply.send(outcome.clone());
                        },
                        None => self.closed_waiters.push(reply),
                    }
                }
            },
            Command::Publish {
                topic,
                args,
                kwargs,
                options,
                reply,
            } => {
                let request = self.ids.session.next_id();
                let outcome = match self.established() {
                    Some((roles, mut sink)) => {
                        roles
                            .publisher
                            .publish(&mut sink, request, topic, args, kwargs, &options)
                            .await
                    },
                    None => Err(WampError::NotEstablished),
                };
                let _ = reply.send(outcome);
            },
            Command::Subscribe {
                topic,
                handler,
                options,
                reply,
            } => {
                let request = self.ids.session.next_id();
                match self.established() {
                    Some((roles, mut sink)) => {
                        if let Err(err) = roles
                            .subscriber
                            .subscribe(&mut sink, request, topic, handler, &options, reply)
                            .await
                        {
                            tracing::debug!("SUBSCRIBE {} failed: {}", request, err);
                        }
                    },
                    None => {
                        let _ = reply.send(Err(WampError::NotEstablished));
                    },
                }
            },
            Command::Unsubscribe {
                epoch,
                subscription,
                member,
                reply,
            } => {
                if let Err(err) = self.check_epoch(epoch, "Subscriber") {
                    let _ = reply.send(Err(err));
                    return;
                }
                let request = self.ids.session.next_id();
                match self.established() {
                    Some((roles, mut sink)) => {
                        if let Err(err) = roles
                            .subscriber
                            .unsubscribe(&mut sink, request, subscription, member, reply)
                            .await
                        {
                            tracing::debug!("UNSUBSCRIBE {} failed: {}", subscription, err);
                        }
                    },
                    None => {
                        let _ = reply.send(Err(WampError::NotEstablished));
                    },
                }
            },
            Command::Call {
                procedure,
                args,
                kwargs,
                options,
                reply,
            } => {
                let request = self.ids.session.next_id();
                let outcome = match self.established() {
                    Some((roles, mut sink)) => {
                        roles
                            .caller
                            .call(&mut sink, request, procedure, args, kwargs, &options)
                            .await
                    },
                    None => Err(WampError::NotEstablished),
                };
                let _ = reply.send(outcome);
            },
            Command::Cancel {
                epoch,
                request,
                mode,
                reply,
            } => {
                if let Err(err) = self.check_epoch(epoch, "Caller") {
                    let _ = reply.send(Err(err));
                    return;
                }
                let outcome = match self.established() {
                    Some((roles, mut sink)) => roles.caller.cancel(&mut sink, request, mode).await,
                    None => Err(WampError::NotEstablished),
                };
                let _ = reply.send(outcome);
            },
            Command::Register {
                procedure,
                handler,
                options,
                reply,
            } => {
                let request = self.ids.session.next_id();
                match self.established() {
                    Some((roles, mut sink)) => {
                        if let Err(err) = roles
                            .callee
                            .register(&mut sink, request, procedure, handler, &options, reply)
                            .await
                        {
                            tracing::debug!("REGISTER {} failed: {}", request, err);
                        }
                    },
                    None => {
                        let _ = reply.send(Err(WampError::NotEstablished));
                    },
                }
            },
            Command::Unregister {
                epoch,
                registration,
                reply,
            } => {
                if let Err(err) = self.check_epoch(epoch, "Callee") {
                    let _ = reply.send(Err(err));
                    return;
                }
                let request = self.ids.session.next_id();
                match self.established() {
                    Some((roles, mut sink)) => {
                        if let Err(err) = roles
                            .callee
                            .unregister(&mut sink, request, registration, reply)
                            .await
                        {
                            tracing::debug!("UNREGISTER {} failed: {}", registration, err);
                        }
                    },
                    None => {
                        let _ = reply.send(Err(WampError::NotEstablished));
                    },
                }
            },
        }
    }

    async fn on_open(&mut self, reply: oneshot::Sender<Result<WelcomeDetails>>) {
        if let (true, Some(welcome)) = (self.machine.is_established(), &self.welcome) {
            let _ = reply.send(Ok(welcome.clone()));
            return;
        }
        self.open_waiters.push(reply);
        if self.active {
            return;
        }

        self.active = true;
        self.was_established = false;
        self.close_requested = false;
        self.last_close = None;
        self.retry.reset();
        self.connect().await;
    }

    async fn on_close(&mut self, reply: oneshot::Sender<CloseDetails>) {
        if !self.active {
            let details = match &self.last_close {
                Some(Ok(details)) => details.clone(),
                _ => CloseDetails {
                    code: crate::transport::CLOSE_NORMAL,
                    reason: CLOSE_NORMAL.to_string(),
                    message: None,
                    was_clean: true,
                },
            };
            let _ = reply.send(details);
            return;
        }

        self.close_waiters.push(reply);
        if self.close_requested {
            return;
        }
        self.close_requested = true;
        self.retry.stop();

        if self.link.is_none() {
            // Waiting to retry: nothing to tear down.
            self.retry_timer = None;
            tracing::info!("Close requested while waiting to reconnect");
            self.finish(CloseDetails {
                code: crate::transport::CLOSE_NORMAL,
                reason: CLOSE_NORMAL.to_string(),
                message: None,
                was_clean: true,
            });
            return;
        }

        match self.machine.state() {
            SessionState::Established => {
                tracing::info!("Leaving realm {}", self.config.realm);
                match self.send(Message::goodbye(CLOSE_NORMAL, "client shutdown")).await {
                    Ok(()) => {
                        self.goodbye_deadline = Some(Box::pin(sleep(self.config.goodbye_timeout())));
                    },
                    Err(err) => {
                        tracing::warn!("Failed to send GOODBYE: {}", err);
                        self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
                    },
                }
            },
            // Our GOODBYE reply follows the router's.
            SessionState::Closing => {},
            _ => {
                self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
            },
        }
    }

    async fn connect(&mut self) {
        self.machine.reset();
        self.critical = false;
        self.aborted = false;
        self.failure = None;
        self.goodbye_reason = None;

        let mut transport = self.factory.create();
        let (events_tx, events) = mpsc::unbounded_channel();
        tracing::info!(
            "Connecting to {} over {} (realm {})",
            self.config.endpoint,
            transport.name(),
            self.config.realm
        );
        match transport.open(self.config.endpoint.clone(), events_tx).await {
            Ok(()) => {
                self.link = Some(Link { transport, events });
            },
            Err(err) => {
                tracing::warn!("Connection to {} failed: {}", self.config.endpoint, err);
                self.on_connection_closed(CloseEvent::lost(err.to_string())).await;
            },
        }
    }

    async fn close_transport(&mut self, code: u16, reason: &str) {
        if let Some(link) = self.link.as_mut() {
            if let Err(err) = link.transport.close(code, reason.to_string()).await {
                tracing::debug!("Transport close failed: {}", err);
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.send_hello().await,
            TransportEvent::Message(message) => self.on_message(message).await,
            TransportEvent::Error(err) => {
                tracing::warn!("Transport error: {}", err);
            },
            TransportEvent::CriticalError(err) => {
                tracing::error!("Fatal transport error: {}", err);
                self.critical = true;
                self.close_transport(crate::transport::CLOSE_ABNORMAL, "transport error")
                    .await;
            },
            TransportEvent::Close(close) => self.on_connection_closed(close).await,
        }
    }

    async fn send_hello(&mut self) {
        let mut details = hello_auth_details(self.auth.as_ref(), self.config.authid.as_deref());
        details.insert("roles".into(), Role::hello_roles().into());
        details.insert("agent".into(), self.config.agent.clone().into());

        let hello = Message::Hello {
            realm: self.config.realm.clone(),
            details,
        };
        tracing::debug!("Sending HELLO for realm {}", self.config.realm);
        if let Err(err) = self.send(hello).await {
            tracing::warn!("Failed to send HELLO: {}", err);
            self.close_transport(crate::transport::CLOSE_ABNORMAL, "HELLO failed").await;
        }
    }

    async fn on_message(&mut self, message: Message) {
        let kind = message.kind();
        if let Err(violation) = self.machine.apply(Direction::Received, kind) {
            self.protocol_violation(violation).await;
            return;
        }

        match message {
            Message::Challenge { auth_method, extra } => self.on_challenge(&auth_method, extra).await,
            Message::Welcome { session, details } => self.on_welcome(session, details),
            Message::Abort { details, reason } => self.on_abort(&details, reason).await,
            Message::Goodbye { details, reason } => self.on_goodbye(&details, reason).await,
            message => {
                let handled = match self.roles.as_mut() {
                    Some(roles) => roles.dispatch(&message),
                    None => Ok(false),
                };
                match handled {
                    Ok(true) => {},
                    Ok(false) => self.protocol_violation(format!("Unexpected {}.", kind)).await,
                    Err(violation) => self.protocol_violation(violation).await,
                }
            },
        }
    }

    async fn on_challenge(&mut self, method: &str, extra: Dict) {
        if self.auth.is_transport_level() || self.auth.auth_method() != method {
            tracing::warn!(
                "Cannot answer {} challenge with {} authentication",
                method,
                self.auth.auth_method()
            );
            self.abort(CANNOT_AUTHENTICATE, "Authentication failed").await;
            return;
        }
        tracing::debug!("Answering {} challenge", method);
        self.auth_pending = Some(self.auth.compute_challenge(extra));
    }

    async fn on_challenge_response(&mut self, response: Result<ChallengeResponse>) {
        if self.machine.state() != SessionState::Challenging {
            return;
        }
        match response {
            Ok(response) => {
                let authenticate = Message::Authenticate {
                    signature: response.signature,
                    extra: response.extra,
                };
                if let Err(err) = self.send(authenticate).await {
                    tracing::warn!("Failed to send AUTHENTICATE: {}", err);
                    self.close_transport(crate::transport::CLOSE_ABNORMAL, "AUTHENTICATE failed")
                        .await;
                }
            },
            Err(err) => {
                tracing::warn!("Challenge response failed: {}", err);
                self.abort(CANNOT_AUTHENTICATE, &err.to_string()).await;
            },
        }
    }

    fn on_welcome(&mut self, session: u64, details: Dict) {
        let welcome = WelcomeDetails::from_welcome(session, details);
        tracing::info!(
            "Joined realm {} as session {} (authid {:?}, role {:?})",
            self.config.realm,
            session,
            welcome.authid,
            welcome.authrole
        );
        self.ids = IdGenerators::default();
        self.epoch += 1;
        self.roles = Some(Roles::new(self.epoch));
        self.retry.reset();
        self.was_established = true;
        self.welcome = Some(welcome.clone());
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Ok(welcome.clone()));
        }
    }

    async fn on_abort(&mut self, details: &Dict, reason: String) {
        let message = details
            .get("message")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        tracing::warn!("Router aborted session: {} {:?}", reason, message);
        self.aborted = true;
        self.failure = Some(Failure { reason, message });
        self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
    }

    async fn on_goodbye(&mut self, details: &Dict, reason: String) {
        let message = details.get("message").and_then(|v| v.as_str()).unwrap_or("");
        self.goodbye_reason = Some(reason.clone());

        if self.machine.state() == SessionState::Closing {
            // Router initiated: answer, then close.
            tracing::info!("Router closed session: {} {}", reason, message);
            if let Err(err) = self
                .send(Message::goodbye(CLOSE_GOODBYE_AND_OUT, "clean close"))
                .await
            {
                tracing::warn!("Failed to answer GOODBYE: {}", err);
            }
        } else {
            tracing::debug!("Router acknowledged GOODBYE: {}", reason);
            self.goodbye_deadline = None;
        }
        self.close_transport(crate::transport::CLOSE_NORMAL, CLOSE_NORMAL).await;
    }

    async fn abort(&mut self, reason: &str, message: &str) {
        self.aborted = true;
        self.failure = Some(Failure {
            reason: reason.to_string(),
            message: Some(message.to_string()),
        });
        if !self.machine.state().is_terminal() {
            if let Err(err) = self.send(Message::abort(reason, message)).await {
                tracing::debug!("Failed to send ABORT: {}", err);
            }
        }
        self.close_transport(CLOSE_PROTOCOL_ERROR, reason).await;
    }

    async fn protocol_violation(&mut self, violation: String) {
        tracing::error!("Protocol violation: {}", violation);
        self.abort(PROTOCOL_VIOLATION, &violation).await;
    }

    async fn on_invocation_update(&mut self, update: InvocationUpdate) {
        let Some(roles) = self.roles.as_mut() else {
            return;
        };
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let mut sink = Outbound {
            transport: link.transport.as_mut(),
            machine: &mut self.machine,
        };
        if let Err(err) = roles.callee.apply_update(&mut sink, update).await {
            tracing::debug!("Could not deliver invocation outcome: {}", err);
        }
    }

    async fn on_connection_closed(&mut self, close: CloseEvent) {
        let state = self.machine.state();
        tracing::debug!(
            "Connection closed in state {:?}: {} {} (clean: {})",
            state,
            close.code,
            close.reason,
            close.was_clean
        );

        // Tear down in order: transport, state machine, processors.
        self.link = None;
        self.auth_pending = None;
        self.goodbye_deadline = None;
        self.machine.reset();
        if let Some(mut roles) = self.roles.take() {
            roles.close();
        }
        self.welcome = None;

        let orderly = state == SessionState::Closed || self.close_requested;
        let was_clean = close.was_clean && !self.critical && !self.aborted && orderly;

        let may_retry = !was_clean
            && !self.aborted
            && !self.close_requested
            && (self.was_established || self.config.retry_if_unreachable);
        if may_retry {
            if let Some(delay) = self.retry.next_delay() {
                tracing::info!(
                    "Reconnecting in {:?} (attempt {})",
                    delay,
                    self.retry.retry_count()
                );
                self.retry_timer = Some(Box::pin(sleep(delay)));
                return;
            }
            tracing::warn!("Giving up after {} retries", self.retry.retry_count());
        }

        let mut details = CloseDetails::from_event(&close);
        details.was_clean = was_clean;
        if let Some(failure) = &self.failure {
            details.reason = failure.reason.clone();
            details.message = failure.message.clone();
        } else if let Some(reason) = &self.goodbye_reason {
            details.reason = reason.clone();
        }
        self.finish(details);
    }

    /// End the open cycle and settle every waiter.
    fn finish(&mut self, details: CloseDetails) {
        tracing::info!("Session closed: {} ({})", details.reason, details.code);
        self.active = false;
        self.retry_timer = None;

        let open_error = WampError::ConnectionOpen {
            reason: details.reason.clone(),
            message: details.message.clone(),
        };
        for waiter in self.open_waiters.drain(..) {
            let _ = waiter.send(Err(open_error.clone()));
        }
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(details.clone());
        }

        let outcome = if details.was_clean {
            Ok(details)
        } else {
            Err(WampError::ConnectionClose {
                code: details.code,
                reason: details.reason,
            })
        };
        for waiter in self.closed_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.last_close = Some(outcome);
    }
}
