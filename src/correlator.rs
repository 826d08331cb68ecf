//! Request/response correlation.
//!
//! Each role processor owns one correlator per request kind it sends. An
//! entry is added before the request goes out and consumed exactly once: by
//! the matching success message, by an ERROR answering the same request kind,
//! or by `close()`.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::{DomainError, Result, WampError};
use crate::protocol::{Id, Message, MessageKind};

/// A pending request slot that can be rejected without knowing its payload.
pub trait Pending: Send {
    /// Settle the slot with a failure.
    fn reject(self, err: WampError);
}

impl<T: Send> Pending for oneshot::Sender<Result<T>> {
    fn reject(self, err: WampError) {
        // The requester may have stopped waiting.
        let _ = self.send(Err(err));
    }
}

/// Outcome of offering a message to a correlator.
#[derive(Debug)]
pub enum Correlation<P> {
    /// The message is not a reply this correlator tracks.
    NotMine,
    /// Success reply; the entry has been removed.
    Succeeded(P),
    /// ERROR reply; the entry has been removed.
    Failed(P, DomainError),
    /// Success-kind message with request id 0 (router-initiated). The owning
    /// processor resolves it from the message content.
    Revoked,
}

/// Generic request/response matcher
#[derive(Debug)]
pub struct RequestCorrelator<P> {
    owner: &'static str,
    request: MessageKind,
    success: MessageKind,
    revocable: bool,
    pending: HashMap<Id, P>,
    closed: bool,
}

impl<P: Pending> RequestCorrelator<P> {
    /// Correlator for `request` messages answered by `success` messages.
    pub fn new(owner: &'static str, request: MessageKind, success: MessageKind) -> Self {
        Self {
            owner,
            request,
            success,
            revocable: false,
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Also accept success messages carrying request id 0 as revocations.
    pub fn revocable(mut self) -> Self {
        self.revocable = true;
        self
    }

    /// Track a request that is about to be sent.
    pub fn add(&mut self, id: Id, pending: P) -> Result<()> {
        if self.closed {
            pending.reject(WampError::closing(self.owner));
            return Err(WampError::closing(self.owner));
        }
        if self.pending.contains_key(&id) {
            let err = WampError::InvalidState(format!("{} request {} already pending", self.request, id));
            pending.reject(err.clone());
            return Err(err);
        }
        self.pending.insert(id, pending);
        Ok(())
    }

    /// Reject and remove one entry. Returns false if it was not pending.
    pub fn reject(&mut self, id: Id, err: WampError) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                pending.reject(err);
                true
            },
            None => false,
        }
    }

    /// Whether `id` is awaiting a reply.
    pub fn contains(&self, id: Id) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of entries awaiting a reply.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Offer an inbound message.
    ///
    /// A reply whose request id is not pending is a protocol violation and
    /// comes back as `Err` with a description.
    pub fn handle(&mut self, message: &Message) -> std::result::Result<Correlation<P>, String> {
        let kind = message.kind();

        if kind == self.success {
            let id = message.request_id().unwrap_or(0);
            if id == 0 && self.revocable {
                return Ok(Correlation::Revoked);
            }
            return match self.pending.remove(&id) {
                Some(pending) => Ok(Correlation::Succeeded(pending)),
                None => Err(format!("Unexpected {}.", kind)),
            };
        }

        if let Message::Error {
            request_type,
            request,
            error,
            args,
            kwargs,
            ..
        } = message
        {
            if *request_type != self.request {
                return Ok(Correlation::NotMine);
            }
            return match self.pending.remove(request) {
                Some(pending) => {
                    let err = DomainError::new(error.clone())
                        .with_args(args.clone())
                        .with_kwargs(kwargs.clone());
                    Ok(Correlation::Failed(pending, err))
                },
                None => Err(format!("Unexpected {} error.", self.request)),
            };
        }

        Ok(Correlation::NotMine)
    }

    /// Reject everything still pending. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            tracing::debug!("{}: rejecting {} pending {} requests", self.owner, pending.len(), self.request);
        }
        for (_, entry) in pending {
            entry.reject(WampError::closing(self.owner));
        }
    }
}
