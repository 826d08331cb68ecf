//! RawSocket transport over TCP.
//!
//! Handshake: the client sends `0x7F`, a byte holding the maximum message
//! length exponent (high nibble, length = 2^(9+n)) and the serializer id (low
//! nibble), then two reserved zero bytes. The router answers in the same
//! shape; a zero serializer nibble means refusal with the error code in the
//! high nibble.
//!
//! Frames: one type byte (0 message, 1 ping, 2 pong) and a 24-bit big-endian
//! payload length, followed by the payload.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{CloseEvent, EventSender, Transport, TransportEvent, TransportFactory, TransportFuture};
use crate::codec::Codec;
use crate::error::{Result, WampError};
use crate::protocol::Message;

const MAGIC: u8 = 0x7F;
const MAX_LENGTH_EXPONENT: u8 = 15;

/// RawSocket frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Message,
    Ping,
    Pong,
}

impl FrameKind {
    fn code(self) -> u8 {
        match self {
            FrameKind::Message => 0,
            FrameKind::Ping => 1,
            FrameKind::Pong => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FrameKind::Message),
            1 => Some(FrameKind::Ping),
            2 => Some(FrameKind::Pong),
            _ => None,
        }
    }
}

/// Exponent announcing `max_message_size` (rounded up, capped at 2^24).
pub(crate) fn length_exponent(max_message_size: usize) -> u8 {
    let mut exponent = 0u8;
    while exponent < MAX_LENGTH_EXPONENT && (1usize << (9 + exponent)) < max_message_size {
        exponent += 1;
    }
    exponent
}

pub(crate) fn encode_handshake(exponent: u8, serializer: u8) -> [u8; 4] {
    [MAGIC, (exponent << 4) | (serializer & 0x0F), 0, 0]
}

/// Parse the router's handshake reply into its maximum message length.
pub(crate) fn decode_handshake(reply: [u8; 4], serializer: u8) -> Result<usize> {
    if reply[0] != MAGIC {
        return Err(WampError::Transport(format!(
            "Invalid RawSocket handshake magic 0x{:02X}",
            reply[0]
        )));
    }
    let high = reply[1] >> 4;
    let low = reply[1] & 0x0F;
    if low == 0 {
        let reason = match high {
            1 => "serializer unsupported",
            2 => "maximum message length unacceptable",
            3 => "use of reserved bits",
            4 => "maximum connection count reached",
            _ => "unknown error",
        };
        return Err(WampError::Transport(format!(
            "RawSocket handshake refused: {}",
            reason
        )));
    }
    if low != serializer {
        return Err(WampError::Transport(format!(
            "RawSocket router chose serializer {} instead of {}",
            low, serializer
        )));
    }
    Ok(1usize << (9 + high))
}

pub(crate) fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Bytes> {
    if payload.len() >= 1 << 24 {
        return Err(WampError::Transport(format!(
            "Frame of {} bytes exceeds RawSocket limit",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u8(kind.code());
    let len = payload.len() as u32;
    frame.put_u8((len >> 16) as u8);
    frame.put_u16(len as u16);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

pub(crate) fn decode_header(header: [u8; 4]) -> Result<(FrameKind, usize)> {
    let kind = FrameKind::from_code(header[0] & 0x07).ok_or_else(|| {
        WampError::Transport(format!("Unknown RawSocket frame type {}", header[0]))
    })?;
    let len = (usize::from(header[1]) << 16) | (usize::from(header[2]) << 8) | usize::from(header[3]);
    Ok((kind, len))
}

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

async fn write_frame(writer: &SharedWriter, frame: Bytes) -> Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Factory for RawSocket connections
#[derive(Clone)]
pub struct RawSocketFactory {
    codec: Arc<dyn Codec>,
    max_message_size: usize,
}

impl RawSocketFactory {
    /// Factory using `codec`, accepting messages up to `max_message_size`
    pub fn new(codec: Arc<dyn Codec>, max_message_size: usize) -> Self {
        Self {
            codec,
            max_message_size,
        }
    }
}

impl TransportFactory for RawSocketFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(RawSocketTransport::new(
            Arc::clone(&self.codec),
            self.max_message_size,
        ))
    }
}

/// RawSocket transport over one TCP connection
pub struct RawSocketTransport {
    codec: Arc<dyn Codec>,
    max_message_size: usize,
    router_max_size: usize,
    writer: Option<SharedWriter>,
    reader: Option<JoinHandle<()>>,
    events: Option<EventSender>,
    open: Arc<AtomicBool>,
}

impl RawSocketTransport {
    /// Create an unconnected transport
    pub fn new(codec: Arc<dyn Codec>, max_message_size: usize) -> Self {
        Self {
            codec,
            max_message_size,
            router_max_size: 0,
            writer: None,
            reader: None,
            events: None,
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        writer: SharedWriter,
        codec: Arc<dyn Codec>,
        max_message_size: usize,
        events: EventSender,
        open: Arc<AtomicBool>,
    ) {
        let outcome: Result<()> = async {
            loop {
                let mut header = [0u8; 4];
                reader.read_exact(&mut header).await?;
                let (kind, len) = decode_header(header)?;
                if len > max_message_size {
                    return Err(WampError::Transport(format!(
                        "Incoming message of {} bytes exceeds limit of {}",
                        len, max_message_size
                    )));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;

                match kind {
                    FrameKind::Message => match codec.deserialize(&payload) {
                        Ok(message) => {
                            if events.send(TransportEvent::Message(message)).is_err() {
                                return Ok(());
                            }
                        },
                        Err(err) => return Err(err),
                    },
                    FrameKind::Ping => {
                        write_frame(&writer, encode_frame(FrameKind::Pong, &payload)?).await?;
                    },
                    FrameKind::Pong => {
                        tracing::trace!("RawSocket pong ({} bytes)", len);
                    },
                }
            }
        }
        .await;

        if !open.swap(false, Ordering::SeqCst) {
            return;
        }
        match outcome {
            Ok(()) => {
                let _ = events.send(TransportEvent::Close(CloseEvent::lost("Connection closed")));
            },
            Err(err) => {
                tracing::debug!("RawSocket connection ended: {}", err);
                let reason = err.to_string();
                if err.is_serialization() {
                    let _ = events.send(TransportEvent::CriticalError(err));
                }
                let _ = events.send(TransportEvent::Close(CloseEvent::lost(reason)));
            },
        }
    }
}

impl Transport for RawSocketTransport {
    fn name(&self) -> &'static str {
        "rawsocket"
    }

    fn open(&mut self, endpoint: String, events: EventSender) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!("RawSocket connecting to {}", endpoint);
            let mut stream = TcpStream::connect(&endpoint).await.map_err(|e| {
                WampError::Transport(format!("Failed to connect to {}: {}", endpoint, e))
            })?;
            stream.set_nodelay(true)?;

            let serializer = self.codec.rawsocket_id();
            stream
                .write_all(&encode_handshake(length_exponent(self.max_message_size), serializer))
                .await?;
            let mut reply = [0u8; 4];
            stream.read_exact(&mut reply).await?;
            self.router_max_size = decode_handshake(reply, serializer)?;

            let (read_half, write_half) = stream.into_split();
            let writer = Arc::new(Mutex::new(write_half));
            self.open.store(true, Ordering::SeqCst);

            self.reader = Some(tokio::spawn(Self::read_loop(
                read_half,
                Arc::clone(&writer),
                Arc::clone(&self.codec),
                self.max_message_size,
                events.clone(),
                Arc::clone(&self.open),
            )));
            self.writer = Some(writer);
            self.events = Some(events.clone());

            let _ = events.send(TransportEvent::Open);
            Ok(())
        })
    }

    fn send(&mut self, message: Message) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let writer = match &self.writer {
                Some(writer) if self.open.load(Ordering::SeqCst) => Arc::clone(writer),
                _ => return Err(WampError::Transport("Transport is not open".to_string())),
            };
            let payload = self.codec.serialize(&message)?;
            if payload.len() > self.router_max_size {
                return Err(WampError::Transport(format!(
                    "{} message of {} bytes exceeds router limit of {}",
                    message.kind(),
                    payload.len(),
                    self.router_max_size
                )));
            }
            write_frame(&writer, encode_frame(FrameKind::Message, &payload)?).await
        })
    }

    fn close(&mut self, code: u16, reason: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if !self.open.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(reader) = self.reader.take() {
                reader.abort();
            }
            if let Some(writer) = self.writer.take() {
                let mut writer = writer.lock().await;
                if let Err(err) = writer.shutdown().await {
                    tracing::debug!("RawSocket shutdown failed: {}", err);
                }
            }
            if let Some(events) = self.events.take() {
                let _ = events.send(TransportEvent::Close(CloseEvent::clean(code, reason)));
            }
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for RawSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::Dict;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    #[test]
    fn test_length_exponent() {
        assert_eq!(length_exponent(512), 0);
        assert_eq!(length_exponent(513), 1);
        assert_eq!(length_exponent(16 * 1024 * 1024), 15);
        assert_eq!(length_exponent(usize::MAX), 15);
    }

    #[test]
    fn test_handshake() {
        assert_eq!(encode_handshake(15, 1), [0x7F, 0xF1, 0, 0]);
        assert_eq!(decode_handshake([0x7F, 0xF1, 0, 0], 1).unwrap(), 1 << 24);
        assert!(decode_handshake([0x7F, 0x10, 0, 0], 1).is_err());
        assert!(decode_handshake([0x00, 0xF1, 0, 0], 1).is_err());
        assert!(decode_handshake([0x7F, 0xF2, 0, 0], 1).is_err());
    }

    #[test]
    fn test_frame_header() {
        let frame = encode_frame(FrameKind::Ping, &[1, 2, 3]).unwrap();
        assert_eq!(&frame[..], &[1, 0, 0, 3, 1, 2, 3]);
        assert_eq!(decode_header([0, 0x01, 0x00, 0x02]).unwrap(), (FrameKind::Message, 258));
        assert!(decode_header([5, 0, 0, 0]).is_err());
    }

    async fn read_frame(stream: &mut TcpStream) -> (FrameKind, Vec<u8>) {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let (kind, len) = decode_header(header).unwrap();
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        (kind, payload)
    }

    #[tokio::test]
    async fn test_exchange_with_router() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let router = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 4];
            stream.read_exact(&mut handshake).await.unwrap();
            assert_eq!(handshake[0], 0x7F);
            stream.write_all(&[0x7F, 0xF1, 0, 0]).await.unwrap();

            let (kind, payload) = read_frame(&mut stream).await;
            assert_eq!(kind, FrameKind::Message);
            let hello = JsonCodec.deserialize(&payload).unwrap();
            assert_eq!(hello.kind(), crate::protocol::MessageKind::Hello);

            stream
                .write_all(&encode_frame(FrameKind::Ping, b"hb").unwrap())
                .await
                .unwrap();
            let (kind, payload) = read_frame(&mut stream).await;
            assert_eq!((kind, payload.as_slice()), (FrameKind::Pong, &b"hb"[..]));

            let welcome = JsonCodec
                .serialize(&Message::Welcome {
                    session: 9,
                    details: Dict::new(),
                })
                .unwrap();
            stream
                .write_all(&encode_frame(FrameKind::Message, &welcome).unwrap())
                .await
                .unwrap();
        });

        let mut transport = RawSocketTransport::new(Arc::new(JsonCodec), 1 << 20);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        transport.open(addr.to_string(), events_tx).await.unwrap();
        assert!(matches!(events.recv().await, Some(TransportEvent::Open)));

        transport
            .send(Message::Hello {
                realm: "realm1".into(),
                details: Dict::new(),
            })
            .await
            .unwrap();

        match events.recv().await {
            Some(TransportEvent::Message(Message::Welcome { session, .. })) => assert_eq!(session, 9),
            other => panic!("unexpected {other:?}"),
        }
        router.await.unwrap();

        match events.recv().await {
            Some(TransportEvent::Close(close)) => assert!(!close.was_clean),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_client_close_is_clean() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut handshake = [0u8; 4];
            stream.read_exact(&mut handshake).await.unwrap();
            stream.write_all(&[0x7F, 0xF1, 0, 0]).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let mut transport = RawSocketTransport::new(Arc::new(JsonCodec), 1 << 20);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        transport.open(addr.to_string(), events_tx).await.unwrap();
        events.recv().await.unwrap();

        transport.close(1000, "wamp.close.normal".into()).await.unwrap();
        match events.recv().await {
            Some(TransportEvent::Close(close)) => {
                assert!(close.was_clean);
                assert_eq!(close.code, 1000);
            },
            other => panic!("unexpected {other:?}"),
        }
        router.await.unwrap();
        assert!(transport.send(Message::goodbye("wamp.close.normal", "")).await.is_err());
    }
}
