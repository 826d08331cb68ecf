//! Subscriber role.
//!
//! The router may answer several SUBSCRIBE requests for the same topic with
//! one subscription id. Local subscriptions sharing an id form a group; an
//! EVENT fans out to every member and the UNSUBSCRIBE is only sent when the
//! last member leaves.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{oneshot, watch};

use super::{Handled, MessageSink, Processor};
use crate::correlator::{Correlation, Pending, RequestCorrelator};
use crate::error::{Result, WampError};
use crate::protocol::{
    Dict, EventDetails, Id, List, Message, MessageKind, Role, SubscribeOptions, Uri,
};

/// An event delivered to a subscription handler
#[derive(Debug, Clone)]
pub struct Event {
    /// Positional payload
    pub args: List,
    /// Keyword payload
    pub kwargs: Dict,
    /// Event details
    pub details: EventDetails,
}

/// Event callback. Runs synchronously on the session task; hand heavy work
/// off to a channel or task.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`].
pub fn event_handler<F>(f: F) -> EventHandler
where
    F: Fn(Event) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Lifecycle of one local subscription or registration.
#[derive(Debug, Clone)]
pub enum Membership {
    /// Receiving events or invocations
    Active,
    /// Removed by the client or revoked by the router
    Ended,
    /// Removed by a failure (error reply or session close)
    Failed(WampError),
}

/// What a successful subscribe hands back to the session.
#[derive(Debug)]
pub struct SubscriptionParts {
    /// Router subscription id (shared across the group)
    pub subscription: Id,
    /// Local member id
    pub member: Id,
    /// Session the subscription belongs to
    pub epoch: u64,
    /// Subscribed topic
    pub topic: Uri,
    /// Membership signal
    pub state: watch::Receiver<Membership>,
}

struct Member {
    handler: EventHandler,
    state: watch::Sender<Membership>,
}

struct Group {
    topic: Uri,
    members: BTreeMap<Id, Member>,
}

struct PendingSubscribe {
    member: Id,
    topic: Uri,
    handler: EventHandler,
    reply: oneshot::Sender<Result<SubscriptionParts>>,
}

impl Pending for PendingSubscribe {
    fn reject(self, err: WampError) {
        let _ = self.reply.send(Err(err));
    }
}

struct PendingUnsubscribe {
    subscription: Id,
    state: watch::Sender<Membership>,
    reply: oneshot::Sender<Result<()>>,
}

impl Pending for PendingUnsubscribe {
    fn reject(self, err: WampError) {
        self.state.send_replace(Membership::Failed(err.clone()));
        let _ = self.reply.send(Err(err));
    }
}

/// Subscriber processor
pub struct Subscriber {
    subscribing: RequestCorrelator<PendingSubscribe>,
    unsubscribing: RequestCorrelator<PendingUnsubscribe>,
    groups: HashMap<Id, Group>,
    retiring: HashSet<Id>,
    epoch: u64,
    closed: bool,
}

impl Subscriber {
    /// New subscriber
    pub fn new() -> Self {
        Self {
            subscribing: RequestCorrelator::new(
                "Subscriber",
                MessageKind::Subscribe,
                MessageKind::Subscribed,
            ),
            unsubscribing: RequestCorrelator::new(
                "Subscriber",
                MessageKind::Unsubscribe,
                MessageKind::Unsubscribed,
            )
            .revocable(),
            groups: HashMap::new(),
            retiring: HashSet::new(),
            epoch: 0,
            closed: false,
        }
    }

    /// Stamp handles with the session `epoch`.
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Send a SUBSCRIBE. `reply` settles when the router answers.
    pub async fn subscribe<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        topic: Uri,
        handler: EventHandler,
        options: &SubscribeOptions,
        reply: oneshot::Sender<Result<SubscriptionParts>>,
    ) -> Result<()> {
        let pending = PendingSubscribe {
            member: request,
            topic: topic.clone(),
            handler,
            reply,
        };
        self.subscribing.add(request, pending)?;

        tracing::debug!("Subscribing to {} (request {})", topic, request);
        let message = Message::Subscribe {
            request,
            options: options.to_dict(),
            topic,
        };
        if let Err(err) = sink.send(message).await {
            self.subscribing.reject(request, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Remove one member. Only the last member of a group sends UNSUBSCRIBE.
    pub async fn unsubscribe<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        subscription: Id,
        member: Id,
        reply: oneshot::Sender<Result<()>>,
    ) -> Result<()> {
        let Some(group) = self.groups.get_mut(&subscription) else {
            let err = WampError::InvalidState(format!("Unknown subscription {}", subscription));
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        };
        let Some(removed) = group.members.remove(&member) else {
            let err = WampError::InvalidState(format!(
                "Subscription {} has no member {}",
                subscription, member
            ));
            let _ = reply.send(Err(err.clone()));
            return Err(err);
        };

        if !group.members.is_empty() {
            tracing::debug!(
                "Left subscription {} locally, {} members remain",
                subscription,
                group.members.len()
            );
            removed.state.send_replace(Membership::Ended);
            let _ = reply.send(Ok(()));
            return Ok(());
        }

        self.groups.remove(&subscription);
        self.retiring.insert(subscription);
        let pending = PendingUnsubscribe {
            subscription,
            state: removed.state,
            reply,
        };
        if let Err(err) = self.unsubscribing.add(request, pending) {
            self.retiring.remove(&subscription);
            return Err(err);
        }

        tracing::debug!("Unsubscribing {} (request {})", subscription, request);
        let message = Message::Unsubscribe {
            request,
            subscription,
        };
        if let Err(err) = sink.send(message).await {
            self.retiring.remove(&subscription);
            self.unsubscribing.reject(request, err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Number of live subscription groups
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of local members subscribed under `subscription`
    pub fn member_count(&self, subscription: Id) -> usize {
        self.groups
            .get(&subscription)
            .map_or(0, |group| group.members.len())
    }

    fn on_subscribed(&mut self, pending: PendingSubscribe, subscription: Id) {
        let (state, state_rx) = watch::channel(Membership::Active);
        let group = self.groups.entry(subscription).or_insert_with(|| Group {
            topic: pending.topic.clone(),
            members: BTreeMap::new(),
        });
        group.members.insert(
            pending.member,
            Member {
                handler: pending.handler,
                state,
            },
        );
        tracing::debug!(
            "Subscribed to {} as {} ({} members)",
            pending.topic,
            subscription,
            group.members.len()
        );

        let parts = SubscriptionParts {
            subscription,
            member: pending.member,
            epoch: self.epoch,
            topic: pending.topic,
            state: state_rx,
        };
        let _ = pending.reply.send(Ok(parts));
    }

    fn on_revoked(&mut self, details: Option<&Dict>) -> Handled {
        let subscription = details
            .and_then(|d| d.get("subscription"))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| "Revocation without subscription id.".to_string())?;
        let group = self
            .groups
            .remove(&subscription)
            .ok_or_else(|| format!("Revocation of unknown subscription {}.", subscription))?;

        let reason = details
            .and_then(|d| d.get("reason"))
            .and_then(|v| v.as_str())
            .unwrap_or("");
        tracing::info!("Subscription {} on {} revoked {}", subscription, group.topic, reason);
        for member in group.members.into_values() {
            member.state.send_replace(Membership::Ended);
        }
        Ok(true)
    }

    fn on_event(
        &mut self,
        subscription: Id,
        publication: Id,
        details: &Dict,
        args: &List,
        kwargs: &Dict,
    ) -> Handled {
        let Some(group) = self.groups.get(&subscription) else {
            if self.retiring.contains(&subscription) {
                tracing::debug!("Dropping event for retiring subscription {}", subscription);
                return Ok(true);
            }
            return Err(format!("Unexpected EVENT for subscription {}.", subscription));
        };

        let details = EventDetails::from_event(publication, details.clone(), &group.topic);
        for (member, entry) in &group.members {
            let event = Event {
                args: args.clone(),
                kwargs: kwargs.clone(),
                details: details.clone(),
            };
            let handler = &entry.handler;
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(
                    "Event handler for {} (member {}) panicked",
                    group.topic,
                    member
                );
            }
        }
        Ok(true)
    }
}

impl Default for Subscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Subscriber {
    fn role(&self) -> Role {
        Role::Subscriber
    }

    fn try_handle(&mut self, message: &Message) -> Handled {
        if let Message::Event {
            subscription,
            publication,
            details,
            args,
            kwargs,
        } = message
        {
            return self.on_event(*subscription, *publication, details, args, kwargs);
        }

        match self.subscribing.handle(message)? {
            Correlation::NotMine => {},
            Correlation::Succeeded(pending) => {
                if let Message::Subscribed { subscription, .. } = message {
                    self.on_subscribed(pending, *subscription);
                }
                return Ok(true);
            },
            Correlation::Failed(pending, err) => {
                pending.reject(err.into());
                return Ok(true);
            },
            Correlation::Revoked => return Err("Unexpected SUBSCRIBED revocation.".to_string()),
        }

        match self.unsubscribing.handle(message)? {
            Correlation::NotMine => Ok(false),
            Correlation::Succeeded(pending) => {
                self.retiring.remove(&pending.subscription);
                pending.state.send_replace(Membership::Ended);
                let _ = pending.reply.send(Ok(()));
                Ok(true)
            },
            Correlation::Failed(pending, err) => {
                self.retiring.remove(&pending.subscription);
                pending.reject(err.into());
                Ok(true)
            },
            Correlation::Revoked => match message {
                Message::Unsubscribed { details, .. } => self.on_revoked(details.as_ref()),
                _ => Ok(false),
            },
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.subscribing.close();
        self.unsubscribing.close();
        for (_, group) in self.groups.drain() {
            for member in group.members.into_values() {
                member
                    .state
                    .send_replace(Membership::Failed(WampError::closing("Subscriber")));
            }
        }
        self.retiring.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::RecordingSink;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC: &str = "com.example.topic";

    fn counting_handler(counter: &Arc<AtomicUsize>) -> EventHandler {
        let counter = Arc::clone(counter);
        event_handler(move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn subscribe(
        subscriber: &mut Subscriber,
        sink: &mut RecordingSink,
        request: Id,
        subscription: Id,
        handler: EventHandler,
    ) -> SubscriptionParts {
        let (tx, rx) = oneshot::channel();
        subscriber
            .subscribe(sink, request, TOPIC.into(), handler, &SubscribeOptions::default(), tx)
            .await
            .unwrap();
        let handled = subscriber.try_handle(&Message::Subscribed {
            request,
            subscription,
        });
        assert_eq!(handled, Ok(true));
        rx.await.unwrap().unwrap()
    }

    fn event(subscription: Id) -> Message {
        Message::Event {
            subscription,
            publication: 500,
            details: Dict::new(),
            args: vec![json!("hello")],
            kwargs: Dict::new(),
        }
    }

    fn unsubscribe_count(sink: &RecordingSink) -> usize {
        sink.sent
            .iter()
            .filter(|m| m.kind() == MessageKind::Unsubscribe)
            .count()
    }

    #[tokio::test]
    async fn test_shared_subscription_group() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let a = subscribe(&mut subscriber, &mut sink, 1, 10, counting_handler(&first)).await;
        let b = subscribe(&mut subscriber, &mut sink, 2, 10, counting_handler(&second)).await;
        assert_eq!(subscriber.group_count(), 1);
        assert_eq!(subscriber.member_count(10), 2);

        assert_eq!(subscriber.try_handle(&event(10)), Ok(true));
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        let (tx, rx) = oneshot::channel();
        subscriber.unsubscribe(&mut sink, 3, 10, a.member, tx).await.unwrap();
        rx.await.unwrap().unwrap();
        assert!(matches!(*a.state.borrow(), Membership::Ended));
        assert_eq!(unsubscribe_count(&sink), 0);

        subscriber.try_handle(&event(10)).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);

        let (tx, rx) = oneshot::channel();
        subscriber.unsubscribe(&mut sink, 4, 10, b.member, tx).await.unwrap();
        assert_eq!(unsubscribe_count(&sink), 1);
        assert_eq!(
            subscriber.try_handle(&Message::Unsubscribed {
                request: 4,
                details: None
            }),
            Ok(true)
        );
        rx.await.unwrap().unwrap();
        assert!(matches!(*b.state.borrow(), Membership::Ended));
        assert_eq!(subscriber.group_count(), 0);
    }

    #[tokio::test]
    async fn test_late_event_during_unsubscribe_is_dropped() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let parts = subscribe(&mut subscriber, &mut sink, 1, 10, counting_handler(&counter)).await;

        let (tx, _rx) = oneshot::channel();
        subscriber.unsubscribe(&mut sink, 2, 10, parts.member, tx).await.unwrap();
        assert_eq!(subscriber.try_handle(&event(10)), Ok(true));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_unsubscribe_does_not_swallow_events() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let parts = subscribe(&mut subscriber, &mut sink, 1, 10, counting_handler(&counter)).await;

        let mut broken = RecordingSink::failing(WampError::Transport("gone".into()));
        let (tx, rx) = oneshot::channel();
        assert!(subscriber
            .unsubscribe(&mut broken, 2, 10, parts.member, tx)
            .await
            .is_err());
        assert!(rx.await.unwrap().is_err());

        // Nothing is retiring, so an EVENT for the id is unexpected again.
        assert!(subscriber.try_handle(&event(10)).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_for_unknown_subscription_is_violation() {
        let mut subscriber = Subscriber::new();
        assert!(subscriber.try_handle(&event(77)).is_err());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_group() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let counter = Arc::new(AtomicUsize::new(0));
        subscribe(
            &mut subscriber,
            &mut sink,
            1,
            10,
            event_handler(|_| panic!("handler failure")),
        )
        .await;
        subscribe(&mut subscriber, &mut sink, 2, 10, counting_handler(&counter)).await;

        assert_eq!(subscriber.try_handle(&event(10)), Ok(true));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_event_details_topic() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        subscribe(
            &mut subscriber,
            &mut sink,
            1,
            10,
            event_handler(move |event| {
                sink_seen.lock().unwrap().push(event.details.topic.clone());
            }),
        )
        .await;
        subscriber.try_handle(&event(10)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![TOPIC.to_string()]);
    }

    #[tokio::test]
    async fn test_revocation_ends_all_members() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = subscribe(&mut subscriber, &mut sink, 1, 10, counting_handler(&counter)).await;
        let b = subscribe(&mut subscriber, &mut sink, 2, 10, counting_handler(&counter)).await;

        let revocation = Message::Unsubscribed {
            request: 0,
            details: json!({"subscription": 10, "reason": "wamp.close.killed"})
                .as_object()
                .cloned(),
        };
        assert_eq!(subscriber.try_handle(&revocation), Ok(true));
        assert!(matches!(*a.state.borrow(), Membership::Ended));
        assert!(matches!(*b.state.borrow(), Membership::Ended));
        assert_eq!(subscriber.group_count(), 0);
    }

    #[test]
    fn test_malformed_revocation_is_violation() {
        let mut subscriber = Subscriber::new();
        let missing = Message::Unsubscribed {
            request: 0,
            details: None,
        };
        assert!(subscriber.try_handle(&missing).is_err());

        let unknown = Message::Unsubscribed {
            request: 0,
            details: json!({"subscription": 3}).as_object().cloned(),
        };
        assert!(subscriber.try_handle(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_subscribe_error() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let (tx, rx) = oneshot::channel();
        subscriber
            .subscribe(
                &mut sink,
                1,
                TOPIC.into(),
                event_handler(|_| {}),
                &SubscribeOptions::default(),
                tx,
            )
            .await
            .unwrap();
        let error = Message::error(
            MessageKind::Subscribe,
            1,
            crate::error::DomainError::new("wamp.error.not_authorized"),
        );
        assert_eq!(subscriber.try_handle(&error), Ok(true));
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.as_domain().unwrap().uri, "wamp.error.not_authorized");
    }

    #[tokio::test]
    async fn test_close_fails_members_and_pending() {
        let mut subscriber = Subscriber::new();
        let mut sink = RecordingSink::default();
        let parts = subscribe(&mut subscriber, &mut sink, 1, 10, event_handler(|_| {})).await;

        let (tx, rx) = oneshot::channel();
        subscriber
            .subscribe(
                &mut sink,
                2,
                "com.example.other".into(),
                event_handler(|_| {}),
                &SubscribeOptions::default(),
                tx,
            )
            .await
            .unwrap();

        subscriber.close();
        assert!(matches!(rx.await.unwrap(), Err(WampError::Closing(_))));
        assert!(matches!(
            *parts.state.borrow(),
            Membership::Failed(WampError::Closing(_))
        ));
        assert_eq!(subscriber.group_count(), 0);
    }
}
