//! Publisher role.

use tokio::sync::oneshot;

use super::{Handled, MessageSink, Processor};
use crate::correlator::{Correlation, RequestCorrelator};
use crate::error::{Result, WampError};
use crate::protocol::{Dict, Id, List, Message, MessageKind, PublishOptions, Role, Uri};

/// Outcome of a publish request.
///
/// Unacknowledged publications resolve immediately with `None`.
#[derive(Debug)]
pub struct Publication {
    request: Id,
    ack: Option<oneshot::Receiver<Result<Id>>>,
}

impl Publication {
    /// Request id of the PUBLISH message
    pub fn request_id(&self) -> Id {
        self.request
    }

    /// Whether the router was asked to acknowledge
    pub fn is_acknowledged(&self) -> bool {
        self.ack.is_some()
    }

    /// Wait for the router's acknowledgment.
    ///
    /// Returns the publication id, or `None` if acknowledgment was not requested.
    pub async fn published(self) -> Result<Option<Id>> {
        match self.ack {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(outcome) => outcome.map(Some),
                Err(_) => Err(WampError::closing("Publisher")),
            },
        }
    }
}

/// Publisher processor
pub struct Publisher {
    published: RequestCorrelator<oneshot::Sender<Result<Id>>>,
    closed: bool,
}

impl Publisher {
    /// New publisher
    pub fn new() -> Self {
        Self {
            published: RequestCorrelator::new("Publisher", MessageKind::Publish, MessageKind::Published),
            closed: false,
        }
    }

    /// Send a PUBLISH.
    pub async fn publish<S: MessageSink + ?Sized>(
        &mut self,
        sink: &mut S,
        request: Id,
        topic: Uri,
        args: List,
        kwargs: Dict,
        options: &PublishOptions,
    ) -> Result<Publication> {
        if self.closed {
            return Err(WampError::closing("Publisher"));
        }

        let ack = if options.acknowledge {
            let (tx, rx) = oneshot::channel();
            self.published.add(request, tx)?;
            Some(rx)
        } else {
            None
        };

        tracing::debug!("Publishing to {} (request {})", topic, request);
        let message = Message::Publish {
            request,
            options: options.to_dict(),
            topic,
            args,
            kwargs,
        };
        if let Err(err) = sink.send(message).await {
            self.published.reject(request, err.clone());
            return Err(err);
        }

        Ok(Publication { request, ack })
    }

    /// Publications awaiting acknowledgment
    pub fn pending(&self) -> usize {
        self.published.len()
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for Publisher {
    fn role(&self) -> Role {
        Role::Publisher
    }

    fn try_handle(&mut self, message: &Message) -> Handled {
        match self.published.handle(message)? {
            Correlation::NotMine => Ok(false),
            Correlation::Succeeded(tx) => {
                if let Message::Published { publication, .. } = message {
                    let _ = tx.send(Ok(*publication));
                }
                Ok(true)
            },
            Correlation::Failed(tx, err) => {
                let _ = tx.send(Err(err.into()));
                Ok(true)
            },
            Correlation::Revoked => Err("Unexpected PUBLISHED revocation.".to_string()),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.published.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::testing::RecordingSink;

    fn topic() -> Uri {
        "com.example.topic".to_string()
    }

    #[tokio::test]
    async fn test_unacknowledged_resolves_immediately() {
        let mut publisher = Publisher::new();
        let mut sink = RecordingSink::default();
        let publication = publisher
            .publish(&mut sink, 1, topic(), vec![1.into()], Dict::new(), &PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(sink.sent.len(), 1);
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publication.published().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_acknowledged_waits_for_published() {
        let mut publisher = Publisher::new();
        let mut sink = RecordingSink::default();
        let publication = publisher
            .publish(&mut sink, 7, topic(), List::new(), Dict::new(), &PublishOptions::acknowledged())
            .await
            .unwrap();
        assert_eq!(publisher.pending(), 1);

        let handled = publisher.try_handle(&Message::Published {
            request: 7,
            publication: 4242,
        });
        assert_eq!(handled, Ok(true));
        assert_eq!(publication.published().await.unwrap(), Some(4242));
    }

    #[tokio::test]
    async fn test_publish_error() {
        let mut publisher = Publisher::new();
        let mut sink = RecordingSink::default();
        let publication = publisher
            .publish(&mut sink, 3, topic(), List::new(), Dict::new(), &PublishOptions::acknowledged())
            .await
            .unwrap();
        let error = Message::error(
            MessageKind::Publish,
            3,
            crate::error::DomainError::new("wamp.error.not_authorized"),
        );
        assert_eq!(publisher.try_handle(&error), Ok(true));
        let err = publication.published().await.unwrap_err();
        assert_eq!(err.as_domain().unwrap().uri, "wamp.error.not_authorized");
    }

    #[tokio::test]
    async fn test_send_failure_leaves_no_entry() {
        let mut publisher = Publisher::new();
        let mut sink = RecordingSink::failing(WampError::Transport("down".into()));
        let result = publisher
            .publish(&mut sink, 1, topic(), List::new(), Dict::new(), &PublishOptions::acknowledged())
            .await;
        assert!(matches!(result, Err(WampError::Transport(_))));
        assert_eq!(publisher.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let mut publisher = Publisher::new();
        let mut sink = RecordingSink::default();
        let publication = publisher
            .publish(&mut sink, 1, topic(), List::new(), Dict::new(), &PublishOptions::acknowledged())
            .await
            .unwrap();
        publisher.close();
        assert!(matches!(publication.published().await, Err(WampError::Closing(_))));
        assert!(publisher
            .publish(&mut sink, 2, topic(), List::new(), Dict::new(), &PublishOptions::default())
            .await
            .is_err());
    }

    #[test]
    fn test_unknown_published_is_violation() {
        let mut publisher = Publisher::new();
        assert!(publisher
            .try_handle(&Message::Published {
                request: 1,
                publication: 2
            })
            .is_err());
    }
}
