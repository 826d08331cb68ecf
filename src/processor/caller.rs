//! Caller role.
//!
//! Each in-flight call is a small state machine (`Waiting`, `Progressing`,
//! `Done`). Progressive RESULTs re-arm the pending slot for the same request
//! id; the final RESULT or ERROR removes it.

use tokio::sync::mpsc;

use super::{Handled, MessageSink, Processor};
use crate::correlator::{Correlation, Pending, RequestCorrelator};
use crate::error::{Result, WampError};
use crate::protocol::{
    CallOptions, CallResult, CancelMode, Dict, Id, List, Message, MessageKind, Role, Uri,
};

/// One update on an outgoing call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallUpdate {
    /// Partial result, more to come
    Progress(CallResult),
    /// Final result
    Final(CallResult),
}

/// What the session hands back once a CALL has been sent.
#[derive(Debug)]
pub struct CallParts {
    /// Request id of the CALL
    pub request: Id,
    /// Session the CALL was sent in
    pub epoch: u64,
    /// Updates in arrival order; closes after the final update
    pub updates: mpsc::UnboundedReceiver<Result<CallUpdate>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Waiting,
    Progressing,
    Done,
}

#[derive(Debug)]
enum CallEvent {
    Progress,
    Final,
    Failed,
}

fn advance(state: CallState, event: &CallEvent, receive_progress: bool) -> std::result::Result<CallState, String> {
    match (state, event) {
        (CallState::Done, _) => Err("Call already settled.".to_string()),
        (_, CallEvent::Progress) if !receive_progress => {
            Err("Unexpected progressive RESULT (progress was not requested).".to_string())
        },
        (_, CallEvent::Progress) => Ok(CallState::Progressing),
        (_, CallEvent::Final | CallEvent::Failed) => Ok(CallState::Done),
    }
}

struct CallSlot {
    receive_progress: bool,
    state: CallState,
    updates: mpsc::UnboundedSender<Result<CallUpdate>>,
}

impl Pending for CallSlot {
    fn reject(self, err: WampError) {
        let _ = self.updates.send(Err(err));
    }
}

/// Caller processor
pub struct Caller {
    calls: RequestCorrelator<CallSlot>,
    epoch: u64,
    closed: bool,
}

impl Caller {
    /// New caller
    pub fn new() -> Self {
        Self {
            calls: RequestCorrelator::new("Caller", MessageKind::Call, MessageKind::Result),
            epoch: 0,
            closed: false,
        }
    }

    /// Stamp handles with the session `epoch`.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Send a CALL.
    pub async fn call<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        procedure: Uri,
        args: List,
        kwargs: Dict,
        options: &CallOptions,
    ) -> Result<CallParts> {
        if self.closed {
            return Err(WampError::closing("Caller"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let slot = CallSlot {
            receive_progress: options.receive_progress,
            state: CallState::Waiting,
            updates: tx,
        };
        self.calls.add(request, slot)?;

        tracing::debug!("Calling {} (request {})", procedure, request);
        let message = Message::Call {
            request,
            options: options.to_dict(),
            procedure,
            args,
            kwargs,
        };
        if let Err(err) = sink.send(message).await {
            self.calls.reject(request, err.clone());
            return Err(err);
        }

        Ok(CallParts {
            request,
            epoch: self.epoch,
            updates: rx,
        })
    }

    /// Send a CANCEL for a call still awaiting its result.
    ///
    /// Fails without sending anything if the call is unknown or already settled.
    pub async fn cancel<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        mode: CancelMode,
    ) -> Result<()> {
        if !self.calls.contains(request) {
            return Err(WampError::InvalidState(
                "Unexpected cancellation (unable to find the related call)".to_string(),
            ));
        }

        tracing::debug!("Cancelling call {} ({})", request, mode.as_str());
        let mut options = Dict::new();
        options.insert("mode".into(), mode.as_str().into());
        sink.send(Message::Cancel { request, options }).await
    }

    /// Calls awaiting a final result
    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    fn on_result(&mut self, mut slot: CallSlot, message: &Message) -> Handled {
        let Message::Result {
            request,
            details,
            args,
            kwargs,
        } = message
        else {
            return Ok(false);
        };

        let progress = details
            .get("progress")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let event = if progress {
            CallEvent::Progress
        } else {
            CallEvent::Final
        };

        slot.state = match advance(slot.state, &event, slot.receive_progress) {
            Ok(state) => state,
            Err(violation) => {
                slot.reject(WampError::ProtocolViolation(violation.clone()));
                return Err(violation);
            },
        };

        let result = CallResult {
            args: args.clone(),
            kwargs: kwargs.clone(),
        };
        if slot.state == CallState::Progressing {
            let _ = slot.updates.send(Ok(CallUpdate::Progress(result)));
            // Re-arm for the next partial or final result.
            self.calls
                .add(*request, slot)
                .map_err(|err| err.to_string())?;
        } else {
            let _ = slot.updates.send(Ok(CallUpdate::Final(result)));
        }
        Ok(true)
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Caller {
    fn role(&self) -> Role {
        Role::Caller
    }

    fn try_handle(&mut self, message: &Message) -> Handled {
        match self.calls.handle(message)? {
            Correlation::NotMine => Ok(false),
            Correlation::Succeeded(slot) => self.on_result(slot, message),
            Correlation::Failed(mut slot, err) => {
                slot.state = advance(slot.state, &CallEvent::Failed, slot.receive_progress)?;
                slot.reject(err.into());
                Ok(true)
            },
            Correlation::Revoked => Err("Unexpected RESULT revocation.".to_string()),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.calls.close();
    }
}
