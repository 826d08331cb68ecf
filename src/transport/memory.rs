//! In-process transport.
//!
//! Every opened [`MemoryTransport`] hands its router side ([`RouterEnd`]) to
//! the [`MemoryConnector`], where a test plays the router. Messages cross in
//! both directions as encoded JSON so the codec is exercised end to end.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{CloseEvent, EventSender, Transport, TransportEvent, TransportFactory, TransportFuture};
use crate::codec::{Codec, JsonCodec};
use crate::error::{Result, WampError};
use crate::protocol::Message;

/// Factory producing connected in-memory transports
#[derive(Debug, Clone)]
pub struct MemoryTransportFactory {
    accept: mpsc::UnboundedSender<RouterEnd>,
    refusals: Arc<AtomicUsize>,
}

/// Router side of a [`MemoryTransportFactory`]
#[derive(Debug)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedReceiver<RouterEnd>,
    refusals: Arc<AtomicUsize>,
}

impl MemoryTransportFactory {
    /// New factory and the connector that receives its connections
    pub fn new() -> (Self, MemoryConnector) {
        let (tx, rx) = mpsc::unbounded_channel();
        let refusals = Arc::new(AtomicUsize::new(0));
        (
            Self {
                accept: tx,
                refusals: Arc::clone(&refusals),
            },
            MemoryConnector {
                accept: rx,
                refusals,
            },
        )
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(MemoryTransport {
            codec: JsonCodec::new(),
            accept: self.accept.clone(),
            refusals: Arc::clone(&self.refusals),
            link: None,
        })
    }
}

impl MemoryConnector {
    /// Next connection opened by a client
    pub async fn accept(&mut self) -> Option<RouterEnd> {
        self.accept.recv().await
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }
}

struct ClientLink {
    to_router: mpsc::UnboundedSender<Bytes>,
    events: EventSender,
    open: Arc<AtomicBool>,
}

/// Client side of an in-memory connection
pub struct MemoryTransport {
    codec: JsonCodec,
    accept: mpsc::UnboundedSender<RouterEnd>,
    refusals: Arc<AtomicUsize>,
    link: Option<ClientLink>,
}

impl MemoryTransport {
    fn take_refusal(&self) -> bool {
        self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&mut self, endpoint: String, events: EventSender) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.take_refusal() {
                return Err(WampError::Transport(format!(
                    "Connection to {} refused",
                    endpoint
                )));
            }

            let (to_router, from_client) = mpsc::unbounded_channel();
            let open = Arc::new(AtomicBool::new(true));
            let router = RouterEnd {
                endpoint,
                codec: self.codec,
                from_client,
                to_client: events.clone(),
                open: Arc::clone(&open),
            };
            self.accept
                .send(router)
                .map_err(|_| WampError::Transport("No router listening".to_string()))?;

            self.link = Some(ClientLink {
                to_router,
                events: events.clone(),
                open,
            });
            let _ = events.send(TransportEvent::Open);
            Ok(())
        })
    }

    fn send(&mut self, message: Message) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let link = match &self.link {
                Some(link) if link.open.load(Ordering::SeqCst) => link,
                _ => return Err(WampError::Transport("Transport is not open".to_string())),
            };
            let payload = self.codec.serialize(&message)?;
            link.to_router
                .send(payload)
                .map_err(|_| WampError::Transport("Router went away".to_string()))
        })
    }

    fn close(&mut self, code: u16, reason: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if let Some(link) = self.link.take() {
                if link.open.swap(false, Ordering::SeqCst) {
                    let _ = link
                        .events
                        .send(TransportEvent::Close(CloseEvent::clean(code, reason)));
                }
            }
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.open.load(Ordering::SeqCst))
    }
}

/// Router side of one in-memory connection
#[derive(Debug)]
pub struct RouterEnd {
    endpoint: String,
    codec: JsonCodec,
    from_client: mpsc::UnboundedReceiver<Bytes>,
    to_client: EventSender,
    open: Arc<AtomicBool>,
}

impl RouterEnd {
    /// Endpoint the client connected to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Next message from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Message> {
        let payload = self.from_client.recv().await?;
        self.codec.deserialize(&payload).ok()
    }

    /// Deliver `message` to the client. Returns false if the connection is closed.
    pub fn send(&self, message: Message) -> bool {
        if !self.is_open() {
            return false;
        }
        let decoded: Result<Message> = self
            .codec
            .serialize(&message)
            .and_then(|payload| self.codec.deserialize(&payload));
        match decoded {
            Ok(message) => self.to_client.send(TransportEvent::Message(message)).is_ok(),
            Err(err) => self
                .to_client
                .send(TransportEvent::CriticalError(err))
                .is_ok(),
        }
    }

    /// Report a recoverable transport error to the client
    pub fn report_error(&self, err: WampError) {
        let _ = self.to_client.send(TransportEvent::Error(err));
    }

    /// Close the connection cleanly from the router side
    pub fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .to_client
                .send(TransportEvent::Close(CloseEvent::clean(code, reason)));
        }
    }

    /// Drop the connection without a close handshake
    pub fn drop_connection(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self
                .to_client
                .send(TransportEvent::Close(CloseEvent::lost("Connection lost")));
        }
    }

    /// Whether the connection is still up
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
