//! Role processors.
//!
//! One processor per client role. Each owns the correlators and local
//! objects for its role and claims the inbound messages addressed to it.
//! The session offers every established-state message to the processors in
//! a fixed order until one claims it.
//!
//! Outbound operations take the request id and a [`MessageSink`] from the
//! session. Every operation registers its pending entry before sending so a
//! send failure rejects exactly the entry it created.

pub mod callee;
pub mod caller;
pub mod publisher;
pub mod subscriber;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::protocol::{Message, Role};

pub use callee::{
    call_handler, CallError, CallHandler, CancellationToken, Callee, Invocation,
    InvocationOutcome, InvocationUpdate, RegistrationParts,
};
pub use caller::{CallParts, CallUpdate, Caller};
pub use publisher::{Publication, Publisher};
pub use subscriber::{event_handler, Event, EventHandler, Membership, Subscriber, SubscriptionParts};

/// Outbound half of the connection as seen by the role processors.
pub trait MessageSink: Send {
    /// Send one message.
    fn send(&mut self, message: Message) -> BoxFuture<'_, Result<()>>;
}

/// Result of offering a message: `Ok(true)` when claimed, `Err` with a
/// description when the message violates the protocol.
pub type Handled = std::result::Result<bool, String>;

/// Capability shared by every role processor.
pub trait Processor: Send {
    /// Role this processor implements.
    fn role(&self) -> Role;

    /// Claim `message` if it belongs to this role.
    fn try_handle(&mut self, message: &Message) -> Handled;

    /// Settle everything outstanding with a closing error. Idempotent.
    fn close(&mut self);
}

/// The four processors of one established session.
pub struct Roles {
    /// Publisher role
    pub publisher: Publisher,
    /// Subscriber role
    pub subscriber: Subscriber,
    /// Caller role
    pub caller: Caller,
    /// Callee role
    pub callee: Callee,
}

impl Roles {
    /// Fresh processors for session number `epoch`.
    pub fn new(epoch: u64) -> Self {
        Self {
            publisher: Publisher::new(),
            subscriber: Subscriber::new().with_epoch(epoch),
            caller: Caller::new().with_epoch(epoch),
            callee: Callee::new().with_epoch(epoch),
        }
    }

    /// Processors in dispatch order.
    pub fn all(&mut self) -> [&mut dyn Processor; 4] {
        [
            &mut self.publisher,
            &mut self.subscriber,
            &mut self.caller,
            &mut self.callee,
        ]
    }

    /// Offer a message to each processor until one claims it.
    pub fn dispatch(&mut self, message: &Message) -> Handled {
        for processor in self.all() {
            if processor.try_handle(message)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Close every processor.
    pub fn close(&mut self) {
        for processor in self.all() {
            processor.close();
        }
    }
}
