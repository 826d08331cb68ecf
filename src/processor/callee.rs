//! Callee role.
//!
//! Registered handlers run on their own task, never inside message
//! dispatch. Their progress and final outcome come back to the session
//! as [`InvocationUpdate`]s so YIELD/ERROR are sent from the session task
//! and the call table needs no locking.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};

use super::subscriber::Membership;
use super::{Handled, MessageSink, Processor};
use crate::correlator::{Correlation, Pending, RequestCorrelator};
use crate::error::{DomainError, Result, WampError, SERIALIZATION_ERROR};
use crate::protocol::{
    CallResult, Dict, Id, InvocationDetails, List, Message, MessageKind, RegisterOptions, Role,
    Uri,
};

/// Cooperative cancellation signal handed to call handlers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    /// New, not cancelled
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake every waiter.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether cancellation was signalled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is signalled.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Failure returned by a call handler.
#[derive(Debug, Error)]
pub enum CallError {
    /// Forwarded as-is
    #[error("{0}")]
    Domain(DomainError),
    /// A bare error URI
    #[error("{0}")]
    Uri(String),
    /// Anything else; sent as `wamp.error.runtime_error`
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Protocol-level error sent to the caller.
    pub fn into_domain(self) -> DomainError {
        match self {
            CallError::Domain(err) => err,
            CallError::Uri(uri) => DomainError::new(uri),
            CallError::Other(err) => DomainError::runtime(err.to_string()),
        }
    }
}

impl From<DomainError> for CallError {
    fn from(err: DomainError) -> Self {
        CallError::Domain(err)
    }
}

impl From<&str> for CallError {
    fn from(uri: &str) -> Self {
        CallError::Uri(uri.to_string())
    }
}

impl From<String> for CallError {
    fn from(uri: String) -> Self {
        CallError::Uri(uri)
    }
}

impl From<WampError> for CallError {
    fn from(err: WampError) -> Self {
        match err {
            WampError::Domain(err) => CallError::Domain(err),
            other => CallError::Other(other.into()),
        }
    }
}

/// Registered procedure implementation.
pub type CallHandler = Arc<
    dyn Fn(Invocation) -> BoxFuture<'static, std::result::Result<CallResult, CallError>>
        + Send
        + Sync,
>;

/// Wrap an async closure as a [`CallHandler`].
pub fn call_handler<F, Fut>(f: F) -> CallHandler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<CallResult, CallError>> + Send + 'static,
{
    Arc::new(move |invocation| f(invocation).boxed())
}

/// One invocation of a registered procedure.
#[derive(Debug)]
pub struct Invocation {
    /// Positional arguments
    pub args: List,
    /// Keyword arguments
    pub kwargs: Dict,
    /// Invocation details
    pub details: InvocationDetails,
    request: Id,
    token: CancellationToken,
    progress: Option<mpsc::UnboundedSender<InvocationUpdate>>,
}

impl Invocation {
    /// Request id of the INVOCATION
    pub fn request_id(&self) -> Id {
        self.request
    }

    /// Send a partial result. Only allowed when the caller asked for
    /// progressive results.
    pub fn progress(&self, result: CallResult) -> Result<()> {
        let Some(updates) = &self.progress else {
            return Err(WampError::InvalidState(
                "Caller did not request progressive results".to_string(),
            ));
        };
        updates
            .send(InvocationUpdate::Progress {
                request: self.request,
                result,
            })
            .map_err(|_| WampError::closing("Callee"))
    }

    /// Whether the caller cancelled the call
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the caller cancels the call.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Token that can be moved into sub-tasks
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Terminal outcome of a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Sent as the final YIELD
    Result(CallResult),
    /// Sent as ERROR
    Error(DomainError),
}

/// Handler output funneled back to the session task.
#[derive(Debug)]
pub enum InvocationUpdate {
    /// Progressive YIELD
    Progress {
        /// Invocation request id
        request: Id,
        /// Partial result
        result: CallResult,
    },
    /// Final YIELD or ERROR
    Done {
        /// Invocation request id
        request: Id,
        /// Handler outcome
        outcome: InvocationOutcome,
    },
}

/// What a successful register hands back to the session.
#[derive(Debug)]
pub struct RegistrationParts {
    /// Router registration id
    pub registration: Id,
    /// Registered procedure
    pub procedure: Uri,
    /// Session the registration belongs to
    pub epoch: u64,
    /// Registration signal
    pub state: watch::Receiver<Membership>,
}

struct Registration {
    procedure: Uri,
    handler: CallHandler,
    state: watch::Sender<Membership>,
}

struct ActiveCall {
    receive_progress: bool,
    token: CancellationToken,
}

struct PendingRegister {
    procedure: Uri,
    handler: CallHandler,
    reply: oneshot::Sender<Result<RegistrationParts>>,
}

impl Pending for PendingRegister {
    fn reject(self, err: WampError) {
        let _ = self.reply.send(Err(err));
    }
}

struct PendingUnregister {
    registration: Id,
    reply: oneshot::Sender<Result<()>>,
}

impl Pending for PendingUnregister {
    fn reject(self, err: WampError) {
        let _ = self.reply.send(Err(err));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Callee processor
pub struct Callee {
    registering: RequestCorrelator<PendingRegister>,
    unregistering: RequestCorrelator<PendingUnregister>,
    registrations: HashMap<Id, Registration>,
    calls: HashMap<Id, ActiveCall>,
    updates_tx: mpsc::UnboundedSender<InvocationUpdate>,
    updates_rx: mpsc::UnboundedReceiver<InvocationUpdate>,
    epoch: u64,
    closed: bool,
}

impl Callee {
    /// New callee
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            registering: RequestCorrelator::new(
                "Callee",
                MessageKind::Register,
                MessageKind::Registered,
            ),
            unregistering: RequestCorrelator::new(
                "Callee",
                MessageKind::Unregister,
                MessageKind::Unregistered,
            )
            .revocable(),
            registrations: HashMap::new(),
            calls: HashMap::new(),
            updates_tx,
            updates_rx,
            epoch: 0,
            closed: false,
        }
    }

    /// Stamp handles with the session `epoch`.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Send a REGISTER. `reply` settles when the router answers.
    pub async fn register<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        procedure: Uri,
        handler: CallHandler,
        options: &RegisterOptions,
        reply: oneshot::Sender<Result<RegistrationParts>>,
    ) -> Result<()> {
        self.registering.add(
            request,
            PendingRegister {
                procedure: procedure.clone(),
                handler,
                reply,
            },
        )?;

        tracing::debug!("Registering {} (request {})", procedure, request);
        let message = Message::Register {
            request,
            options: options.to_dict(),
            procedure,
        };
        if let Err(err) = sink.send(message).await {
            self.registering.reject(request, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Send an UNREGISTER. The registration keeps serving invocations until
    /// the router confirms.
    pub async fn unregister<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        registration: Id,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        if !self.registrations.contains_key(&registration) {
            let err = WampError::InvalidState(format!("Unknown registration {}", registration));
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        }
        self.unregistering.add(
            request,
            PendingUnregister {
                registration,
                reply,
            },
        )?;

        tracing::debug!("Unregistering {} (request {})", registration, request);
        let message = Message::Unregister {
            request,
            registration,
        };
        if let Err(err) = sink.send(message).await {
            self.unregistering.reject(request, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Next handler update. Pending forever while no handler is running.
    pub async fn next_update(&mut self) -> Option<InvocationUpdate> {
        self.updates_rx.recv().await
    }

    /// Send the YIELD or ERROR for a handler update.
    ///
    /// A result the codec cannot serialize is answered with
    /// `wamp.error.serialization-error` instead.
    pub async fn apply_update<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        update: InvocationUpdate,
    ) -> Result<()> {
        match update {
            InvocationUpdate::Progress { request, result } => {
                match self.calls.get(&request) {
                    Some(call) if call.receive_progress => {},
                    _ => {
                        tracing::debug!("Dropping progress for inactive invocation {}", request);
                        return Ok(());
                    },
                }
                let mut options = Dict::new();
                options.insert("progress".into(), true.into());
                let message = Message::Yield {
                    request,
                    options,
                    args: result.args,
                    kwargs: result.kwargs,
                };
                match sink.send(message).await {
                    Err(err) if err.is_serialization() => {
                        self.calls.remove(&request);
                        Self::send_serialization_error(sink, request, &err).await
                    },
                    other => other,
                }
            },
            InvocationUpdate::Done { request, outcome } => {
                if self.calls.remove(&request).is_none() {
                    tracing::debug!("Dropping outcome for inactive invocation {}", request);
                    return Ok(());
                }
                match outcome {
                    InvocationOutcome::Result(result) => {
                        let message = Message::Yield {
                            request,
                            options: Dict::new(),
                            args: result.args,
                            kwargs: result.kwargs,
                        };
                        match sink.send(message).await {
                            Err(err) if err.is_serialization() => {
                                Self::send_serialization_error(sink, request, &err).await
                            },
                            other => other,
                        }
                    },
                    InvocationOutcome::Error(err) => {
                        tracing::debug!("Invocation {} failed with {}", request, err.uri);
                        sink.send(Message::error(MessageKind::Invocation, request, err))
                            .await
                    },
                }
            },
        }
    }

    async fn send_serialization_error<S: MessageSink + ?Sized>(
        sink: &mut S,
        request: Id,
        cause: &WampError,
    ) -> Result<()> {
        tracing::warn!("Invocation {} result not serializable: {}", request, cause);
        let err = DomainError::new(SERIALIZATION_ERROR).with_args(vec![cause.to_string().into()]);
        sink.send(Message::error(MessageKind::Invocation, request, err))
            .await
    }

    /// Live registrations
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Invocations whose handler has not completed
    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    fn on_invocation(
        &mut self,
        request: Id,
        registration: Id,
        details: &Dict,
        args: &List,
        kwargs: &Dict,
    ) -> Handled {
        let Some(entry) = self.registrations.get(&registration) else {
            return Err(format!(
                "Unexpected INVOCATION for registration {}.",
                registration
            ));
        };
        if self.calls.contains_key(&request) {
            return Err(format!("Duplicate INVOCATION {}.", request));
        }

        let details = InvocationDetails::from_invocation(details.clone(), &entry.procedure);
        let receive_progress = details.receive_progress;
        let token = CancellationToken::new();
        self.calls.insert(
            request,
            ActiveCall {
                receive_progress,
                token: token.clone(),
            },
        );

        let invocation = Invocation {
            args: args.clone(),
            kwargs: kwargs.clone(),
            details,
            request,
            token,
            progress: receive_progress.then(|| self.updates_tx.clone()),
        };
        let handler = Arc::clone(&entry.handler);
        let updates = self.updates_tx.clone();

        tokio::spawn(async move {
            let run = AssertUnwindSafe(async move { handler(invocation).await });
            let outcome = match run.catch_unwind().await {
                Ok(Ok(result)) => InvocationOutcome::Result(result),
                Ok(Err(err)) => InvocationOutcome::Error(err.into_domain()),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!("Handler for invocation {} panicked: {}", request, message);
                    InvocationOutcome::Error(DomainError::runtime(message))
                },
            };
            let _ = updates.send(InvocationUpdate::Done { request, outcome });
        });

        Ok(true)
    }

    fn on_interrupt(&mut self, request: Id, options: &Dict) -> Handled {
        let Some(call) = self.calls.get(&request) else {
            return Err(format!("Unexpected INTERRUPT for invocation {}.", request));
        };
        let mode = options.get("mode").and_then(|v| v.as_str()).unwrap_or("");
        tracing::debug!("Interrupting invocation {} {}", request, mode);
        call.token.cancel();
        Ok(true)
    }

    fn on_registered(&mut self, pending: PendingRegister, registration: Id) {
        let (state, state_rx) = watch::channel(Membership::Active);
        tracing::debug!("Registered {} as {}", pending.procedure, registration);
        self.registrations.insert(
            registration,
            Registration {
                procedure: pending.procedure.clone(),
                handler: pending.handler,
                state,
            },
        );
        let parts = RegistrationParts {
            registration,
            procedure: pending.procedure,
            epoch: self.epoch,
            state: state_rx,
        };
        let _ = pending.reply.send(Ok(parts));
    }

    fn on_revoked(&mut self, details: Option<&Dict>) -> Handled {
        let registration = details
            .and_then(|d| d.get("registration"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| "Revocation without registration id.".to_string())?;
        let entry = self
            .registrations
            .remove(&registration)
            .ok_or_else(|| format!("Revocation of unknown registration {}.", registration))?;
        tracing::info!("Registration {} of {} revoked", registration, entry.procedure);
        entry.state.send_replace(Membership::Ended);
        Ok(true)
    }
}

impl Default for Callee {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Callee {
    fn role(&self) -> Role {
        Role::Callee
    }

    fn try_handle(&mut self, message: &Message) -> Handled {
        match message {
            Message::Invocation {
                request,
                registration,
                details,
                args,
                kwargs,
            } => return self.on_invocation(*request, *registration, details, args, kwargs),
            Message::Interrupt { request, options } => return self.on_interrupt(*request, options),
            _ => {},
        }

        match self.registering.handle(message)? {
            Correlation::NotMine => {},
            Correlation::Succeeded(pending) => {
                if let Message::Registered { registration, .. } = message {
                    self.on_registered(pending, *registration);
                }
                return Ok(true);
            },
            Correlation::Failed(pending, err) => {
                pending.reject(err.into());
                return Ok(true);
            },
            Correlation::Revoked => return Err("Unexpected REGISTERED revocation.".to_string()),
        }

        match self.unregistering.handle(message)? {
            Correlation::NotMine => Ok(false),
            Correlation::Succeeded(pending) => {
                if let Some(entry) = self.registrations.remove(&pending.registration) {
                    entry.state.send_replace(Membership::Ended);
                }
                let _ = pending.reply.send(Ok(()));
                Ok(true)
            },
            Correlation::Failed(pending, err) => {
                pending.reject(err.into());
                Ok(true)
            },
            Correlation::Revoked => match message {
                Message::Unregistered { details, .. } => self.on_revoked(details.as_ref()),
                _ => Ok(false),
            },
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.registering.close();
        self.unregistering.close();
        for (_, entry) in self.registrations.drain() {
            entry
                .state
                .send_replace(Membership::Failed(WampError::closing("Callee")));
        }
        for (_, call) in self.calls.drain() {
            call.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::RecordingSink;
    use serde_json::json;
    use std::time::Duration;

    const PROCEDURE: &str = "com.example.proc";

    async fn register(callee: &mut Callee, sink: &mut RecordingSink, handler: CallHandler) -> RegistrationParts {
        let (tx, rx) = oneshot::channel();
        callee
            .register(sink, 1, PROCEDURE.into(), handler, &RegisterOptions::default(), tx)
            .await
            .unwrap();
        assert_eq!(
            callee.try_handle(&Message::Registered {
                request: 1,
                registration: 100
            }),
            Ok(true)
        );
        rx.await.unwrap().unwrap()
    }

    fn invocation(request: Id, receive_progress: bool) -> Message {
        let mut details = Dict::new();
        if receive_progress {
            details.insert("receive_progress".into(), true.into());
        }
        Message::Invocation {
            request,
            registration: 100,
            details,
            args: vec![json!(2), json!(3)],
            kwargs: Dict::new(),
        }
    }

    async fn drain(callee: &mut Callee, sink: &mut RecordingSink) {
        let update = tokio::time::timeout(Duration::from_secs(5), callee.next_update())
            .await
            .unwrap()
            .unwrap();
        callee.apply_update(sink, update).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_token() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
        token.cancel();
        task.await.unwrap();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[test]
    fn test_call_error_mapping() {
        let domain = CallError::from(DomainError::new("com.example.error.not_found"));
        assert_eq!(domain.into_domain().uri, "com.example.error.not_found");

        let bare = CallError::from("com.example.error.bare");
        assert_eq!(bare.into_domain(), DomainError::new("com.example.error.bare"));

        let other = CallError::from(anyhow::anyhow!("disk full"));
        let err = other.into_domain();
        assert_eq!(err.uri, crate::error::RUNTIME_ERROR);
        assert_eq!(err.args, vec![json!("disk full")]);
    }

    #[tokio::test]
    async fn test_invocation_yields_result() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|inv: Invocation| async move {
                let sum: i64 = inv.args.iter().filter_map(|v| v.as_i64()).sum();
                Ok(CallResult::value(sum))
            }),
        )
        .await;

        assert_eq!(callee.try_handle(&invocation(5, false)), Ok(true));
        assert_eq!(callee.active_calls(), 1);
        drain(&mut callee, &mut sink).await;

        assert_eq!(sink.sent.last().unwrap().to_value(), json!([70, 5, {}, [5]]));
        assert_eq!(callee.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_errors_become_error_messages() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|inv: Invocation| async move {
                match inv.args.len() {
                    0 => Err(CallError::from("com.example.error.empty")),
                    _ => Err(CallError::Other(anyhow::anyhow!("boom"))),
                }
            }),
        )
        .await;

        callee.try_handle(&invocation(5, false)).unwrap();
        drain(&mut callee, &mut sink).await;
        assert_eq!(
            sink.sent.last().unwrap().to_value(),
            json!([8, 68, 5, {}, "wamp.error.runtime_error", ["boom"]])
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_runtime_error() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|_inv: Invocation| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(CallResult::new())
            }),
        )
        .await;

        callee.try_handle(&invocation(6, false)).unwrap();
        drain(&mut callee, &mut sink).await;
        assert_eq!(
            sink.sent.last().unwrap().to_value(),
            json!([8, 68, 6, {}, "wamp.error.runtime_error", ["kaboom"]])
        );
    }

    #[tokio::test]
    async fn test_progressive_yields() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|inv: Invocation| async move {
                inv.progress(CallResult::value(1)).unwrap();
                inv.progress(CallResult::value(2)).unwrap();
                Ok(CallResult::value(3))
            }),
        )
        .await;

        callee.try_handle(&invocation(9, true)).unwrap();
        for _ in 0..3 {
            drain(&mut callee, &mut sink).await;
        }
        let yields: Vec<_> = sink.sent[1..].iter().map(Message::to_value).collect();
        assert_eq!(
            yields,
            vec![
                json!([70, 9, {"progress": true}, [1]]),
                json!([70, 9, {"progress": true}, [2]]),
                json!([70, 9, {}, [3]]),
            ]
        );
    }

    #[tokio::test]
    async fn test_progress_requires_caller_opt_in() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|inv: Invocation| async move {
                assert!(inv.progress(CallResult::value(1)).is_err());
                Ok(CallResult::new())
            }),
        )
        .await;

        callee.try_handle(&invocation(2, false)).unwrap();
        drain(&mut callee, &mut sink).await;
        assert_eq!(sink.sent.last().unwrap().to_value(), json!([70, 2, {}]));
    }

    #[tokio::test]
    async fn test_interrupt_cancels_handler() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|inv: Invocation| async move {
                inv.cancelled().await;
                Err(CallError::from("wamp.error.canceled"))
            }),
        )
        .await;

        callee.try_handle(&invocation(3, false)).unwrap();
        let interrupt = Message::Interrupt {
            request: 3,
            options: json!({"mode": "kill"}).as_object().cloned().unwrap(),
        };
        assert_eq!(callee.try_handle(&interrupt), Ok(true));
        drain(&mut callee, &mut sink).await;
        assert_eq!(
            sink.sent.last().unwrap().to_value(),
            json!([8, 68, 3, {}, "wamp.error.canceled"])
        );
    }

    #[test]
    fn test_unknown_invocation_and_interrupt_are_violations() {
        let mut callee = Callee::new();
        assert!(callee.try_handle(&invocation(1, false)).is_err());
        let interrupt = Message::Interrupt {
            request: 1,
            options: Dict::new(),
        };
        assert!(callee.try_handle(&interrupt).is_err());
    }

    #[tokio::test]
    async fn test_serialization_failure_replies_with_error() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        register(
            &mut callee,
            &mut sink,
            call_handler(|_inv: Invocation| async move { Ok(CallResult::value("unencodable")) }),
        )
        .await;
        callee.try_handle(&invocation(4, false)).unwrap();
        let update = callee.next_update().await.unwrap();

        struct RejectYield(RecordingSink);
        impl MessageSink for RejectYield {
            fn send(&mut self, message: Message) -> BoxFuture<'_, Result<()>> {
                Box::pin(async move {
                    if message.kind() == MessageKind::Yield {
                        let cause = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
                        return Err(WampError::serialization(cause));
                    }
                    self.0.sent.push(message);
                    Ok(())
                })
            }
        }

        let mut rejecting = RejectYield(RecordingSink::default());
        callee.apply_update(&mut rejecting, update).await.unwrap();
        match &rejecting.0.sent[0] {
            Message::Error { request, error, .. } => {
                assert_eq!(*request, 4);
                assert_eq!(error, SERIALIZATION_ERROR);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregister_two_phase() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        let parts = register(
            &mut callee,
            &mut sink,
            call_handler(|_inv: Invocation| async move { Ok(CallResult::new()) }),
        )
        .await;

        let (tx, rx) = oneshot::channel();
        callee.unregister(&mut sink, 2, 100, tx).await.unwrap();
        assert_eq!(callee.registration_count(), 1);
        assert!(matches!(*parts.state.borrow(), Membership::Active));

        assert_eq!(
            callee.try_handle(&Message::Unregistered {
                request: 2,
                details: None
            }),
            Ok(true)
        );
        rx.await.unwrap().unwrap();
        assert_eq!(callee.registration_count(), 0);
        assert!(matches!(*parts.state.borrow(), Membership::Ended));

        let (tx, rx) = oneshot::channel();
        assert!(callee.unregister(&mut sink, 3, 100, tx).await.is_err());
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_revocation() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        let parts = register(
            &mut callee,
            &mut sink,
            call_handler(|_inv: Invocation| async move { Ok(CallResult::new()) }),
        )
        .await;
        let revocation = Message::Unregistered {
            request: 0,
            details: json!({"registration": 100, "reason": "wamp.close.killed"})
                .as_object()
                .cloned(),
        };
        assert_eq!(callee.try_handle(&revocation), Ok(true));
        assert!(matches!(*parts.state.borrow(), Membership::Ended));
        assert!(callee.try_handle(&invocation(1, false)).is_err());
    }

    #[tokio::test]
    async fn test_close_settles_everything() {
        let mut callee = Callee::new();
        let mut sink = RecordingSink::default();
        let observed = CancellationToken::new();
        let flag = observed.clone();
        let parts = register(
            &mut callee,
            &mut sink,
            call_handler(move |inv: Invocation| {
                let flag = flag.clone();
                async move {
                    inv.cancelled().await;
                    flag.cancel();
                    Ok(CallResult::new())
                }
            }),
        )
        .await;
        callee.try_handle(&invocation(1, false)).unwrap();

        let (tx, rx) = oneshot::channel();
        callee
            .register(
                &mut sink,
                2,
                "com.example.other".into(),
                call_handler(|_inv: Invocation| async move { Ok(CallResult::new()) }),
                &RegisterOptions::default(),
                tx,
            )
            .await
            .unwrap();

        callee.close();
        assert!(matches!(rx.await.unwrap(), Err(WampError::Closing(_))));
        assert!(matches!(
            *parts.state.borrow(),
            Membership::Failed(WampError::Closing(_))
        ));
        assert_eq!(callee.active_calls(), 0);
        tokio::time::timeout(Duration::from_secs(5), observed.cancelled())
            .await
            .unwrap();
    }
}
