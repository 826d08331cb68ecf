//! Handles returned by session operations.

use tokio::sync::{mpsc, watch};

use super::{request, Command, CommandSender};
use crate::error::{Result, WampError};
use crate::processor::{CallParts, CallUpdate, Membership, RegistrationParts, SubscriptionParts};
use crate::protocol::{CallResult, CancelMode, Id, Uri};

/// Wait until a membership signal leaves `Active`.
async fn ended(mut state: watch::Receiver<Membership>, owner: &str) -> Result<()> {
    loop {
        let outcome = match &*state.borrow_and_update() {
            Membership::Active => None,
            Membership::Ended => Some(Ok(())),
            Membership::Failed(err) => Some(Err(err.clone())),
        };
        if let Some(outcome) = outcome {
            return outcome;
        }
        if state.changed().await.is_err() {
            return Err(WampError::closing(owner));
        }
    }
}

/// One local subscription.
///
/// Several local subscriptions may share the router's subscription id.
#[derive(Debug)]
pub struct Subscription {
    id: Id,
    member: Id,
    epoch: u64,
    topic: Uri,
    state: watch::Receiver<Membership>,
    commands: CommandSender,
}

impl Subscription {
    pub(crate) fn new(parts: SubscriptionParts, commands: CommandSender) -> Self {
        Self {
            id: parts.subscription,
            member: parts.member,
            epoch: parts.epoch,
            topic: parts.topic,
            state: parts.state,
            commands,
        }
    }

    /// Router subscription id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Subscribed topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether events are still delivered to this subscription
    pub fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), Membership::Active)
    }

    /// Stop receiving events. The UNSUBSCRIBE is only sent when this is the
    /// last local subscription on the router's subscription.
    pub async fn unsubscribe(&self) -> Result<()> {
        let (subscription, member, epoch) = (self.id, self.member, self.epoch);
        request(&self.commands, |reply| Command::Unsubscribe {
            epoch,
            subscription,
            member,
            reply,
        })
        .await
    }

    /// Resolve once the subscription ended, whether by `unsubscribe` or by
    /// router revocation. Fails if the session closed underneath it.
    pub async fn unsubscribed(&self) -> Result<()> {
        ended(self.state.clone(), "Subscriber").await
    }
}

/// One registered procedure.
#[derive(Debug)]
pub struct Registration {
    id: Id,
    procedure: Uri,
    epoch: u64,
    state: watch::Receiver<Membership>,
    commands: CommandSender,
}

impl Registration {
    pub(crate) fn new(parts: RegistrationParts, commands: CommandSender) -> Self {
        Self {
            id: parts.registration,
            procedure: parts.procedure,
            epoch: parts.epoch,
            state: parts.state,
            commands,
        }
    }

    /// Router registration id
    pub fn id(&self) -> Id {
        self.id
    }

    /// Registered procedure
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// Whether invocations are still routed to this registration
    pub fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), Membership::Active)
    }

    /// Send UNREGISTER and wait for the router to confirm.
    pub async fn unregister(&self) -> Result<()> {
        let (registration, epoch) = (self.id, self.epoch);
        request(&self.commands, |reply| Command::Unregister {
            epoch,
            registration,
            reply,
        })
        .await
    }

    /// Resolve once the registration ended.
    pub async fn unregistered(&self) -> Result<()> {
        ended(self.state.clone(), "Callee").await
    }
}

/// A CALL awaiting its result.
#[derive(Debug)]
pub struct OutgoingCall {
    id: Id,
    epoch: u64,
    updates: mpsc::UnboundedReceiver<Result<CallUpdate>>,
    cancel_mode: CancelMode,
    commands: CommandSender,
}

impl OutgoingCall {
    pub(crate) fn new(parts: CallParts, cancel_mode: CancelMode, commands: CommandSender) -> Self {
        Self {
            id: parts.request,
            epoch: parts.epoch,
            updates: parts.updates,
            cancel_mode,
            commands,
        }
    }

    /// Request id of the CALL
    pub fn id(&self) -> Id {
        self.id
    }

    /// Next progressive or final result; `None` once the call settled.
    pub async fn next(&mut self) -> Option<Result<CallUpdate>> {
        self.updates.recv().await
    }

    /// Skip progressive results and wait for the final one.
    pub async fn result(mut self) -> Result<CallResult> {
        loop {
            match self.next().await {
                Some(Ok(CallUpdate::Final(result))) => return Ok(result),
                Some(Ok(CallUpdate::Progress(_))) => {},
                Some(Err(err)) => return Err(err),
                None => return Err(WampError::closing("Caller")),
            }
        }
    }

    /// Cancel with the mode given in the call options.
    pub async fn cancel(&self) -> Result<()> {
        self.cancel_with(self.cancel_mode).await
    }

    /// Send CANCEL with `mode`. Fails if the call already settled or
    /// belongs to an earlier session.
    pub async fn cancel_with(&self, mode: CancelMode) -> Result<()> {
        let (request_id, epoch) = (self.id, self.epoch);
        request(&self.commands, |reply| Command::Cancel {
            epoch,
            request: request_id,
            mode,
            reply,
        })
        .await
    }
}
