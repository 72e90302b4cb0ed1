//! Network front-ends. A transport owns its sockets, turns bytes into
//! [`Message`]s with its [`Serializer`], and hands each one to the installed
//! [`QueryHandler`].

pub mod http;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::error::DnsError;
use crate::message::{Connection, FinishedResponse, TransportKind};
use crate::types::{flags, Message, Rcode};
use crate::wire;

pub use http::HttpTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

/// Largest response a plain UDP client is guaranteed to accept.
pub const MAX_UDP_RESPONSE: usize = 512;

/// Per-transport message framing.
pub trait Serializer: Send + Sync {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, DnsError>;
    fn decode(&self, bytes: &[u8]) -> Result<Message, DnsError>;
}

/// One message per datagram, responses capped at `max_size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct DatagramSerializer {
    pub max_size: usize,
}

impl Default for DatagramSerializer {
    fn default() -> Self { Self { max_size: MAX_UDP_RESPONSE } }
}

impl Serializer for DatagramSerializer {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, DnsError> {
        let full = wire::encode(msg)?;
        if full.len() <= self.max_size {
            return Ok(full);
        }
        wire::encode(&truncate(msg, self.max_size)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, DnsError> { wire::decode(bytes) }
}

/// Shrinks `msg` until it encodes within `limit` bytes.
///
/// Sets TC, then drops the additional section, then the authority section,
/// then answers one at a time from the end. Stops early once it fits; a
/// message that still does not fit with nothing left to drop is returned as is.
pub fn truncate(msg: &Message, limit: usize) -> Result<Message, DnsError> {
    let mut cut = msg.clone();
    cut.flags |= flags::TRUNCATED_RESPONSE;

    cut.additionals.clear();
    if wire::encoded_len(&cut)? <= limit { return Ok(cut); }

    cut.authorities.clear();
    if wire::encoded_len(&cut)? <= limit { return Ok(cut); }

    while cut.answers.pop().is_some() {
        if wire::encoded_len(&cut)? <= limit { break; }
    }
    Ok(cut)
}

/// Messages prefixed with a two-byte big-endian length.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSerializer;

impl StreamSerializer {
    pub fn frame(payload: &[u8]) -> Result<Vec<u8>, DnsError> {
        let len = u16::try_from(payload.len()).map_err(|_| DnsError::Encode(format!("{} bytes exceed a stream frame", payload.len())))?;
        let mut framed = Vec::with_capacity(payload.len() + 2);
        framed.extend_from_slice(&len.to_be_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }
}

impl Serializer for StreamSerializer {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, DnsError> {
        Self::frame(&wire::encode(msg)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message, DnsError> {
        if bytes.len() < 2 {
            return Err(DnsError::malformed("stream frame shorter than its length prefix"));
        }
        let (len, body) = bytes.split_at(2);
        let len = u16::from_be_bytes([len[0], len[1]]) as usize;
        if body.len() < len {
            return Err(DnsError::malformed(format!("frame announces {} bytes, {} present", len, body.len())));
        }
        wire::decode(&body[..len])
    }
}

/// DNS-over-HTTPS bodies: the bare message.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpSerializer;

impl Serializer for HttpSerializer {
    fn encode(&self, msg: &Message) -> Result<Vec<u8>, DnsError> { wire::encode(msg) }

    fn decode(&self, bytes: &[u8]) -> Result<Message, DnsError> { wire::decode(bytes) }
}

/// Lifecycle notifications published by every transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Listening(SocketAddr),
    Connection(SocketAddr),
    Message { peer: SocketAddr, bytes: usize },
    Error(String),
    Closed,
}

/// Whatever answers decoded queries; the server core in practice.
#[async_trait::async_trait]
pub trait QueryHandler: Send + Sync {
    async fn handle(&self, message: Message, connection: Connection) -> FinishedResponse;
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn set_handler(&self, handler: Arc<dyn QueryHandler>);

    /// Binds and starts serving. Returns the bound address.
    async fn listen(&self) -> Result<SocketAddr, DnsError>;

    /// Stops accepting and aborts in-flight work.
    async fn close(&self);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

/// State shared between a transport handle and its serving tasks.
pub(crate) struct Shared {
    handler: RwLock<Option<Arc<dyn QueryHandler>>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self { handler: RwLock::new(None), events })
    }

    pub(crate) fn set_handler(&self, handler: Arc<dyn QueryHandler>) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn QueryHandler>> {
        self.handler.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TransportEvent> { self.events.subscribe() }

    /// Decodes and answers one query. `None` when the bytes carry no readable id.
    pub(crate) async fn answer(&self, bytes: &[u8], serializer: &dyn Serializer, connection: Connection) -> Option<Message> {
        self.emit(TransportEvent::Message { peer: connection.peer(), bytes: bytes.len() });
        let query = match serializer.decode(bytes) {
            Ok(query) => query,
            Err(e) => {
                tracing::debug!("[{}] undecodable message from {}: {}", connection.kind, connection.peer(), e);
                return wire::peek_id(bytes).map(|id| Message::error_response(id, Rcode::FormErr));
            }
        };
        match self.handler() {
            Some(handler) => Some(handler.handle(query, connection).await.message().clone()),
            None => Some(Message::error_response(query.id, Rcode::NotImp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageKind, Question, RData, Record, RecordType};
    use std::net::Ipv4Addr;

    fn response_with(answers: usize, authorities: usize, additionals: usize) -> Message {
        let rec = |i: usize| Record::new(format!("host-{:04}.example.com", i), 60, RData::A(Ipv4Addr::new(10, 0, 0, (i % 250) as u8)));
        Message {
            id: 77,
            kind: MessageKind::Response,
            questions: vec![Question::new("example.com", RecordType::A)],
            answers: (0..answers).map(rec).collect(),
            authorities: (0..authorities).map(rec).collect(),
            additionals: (0..additionals).map(rec).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn small_responses_are_untouched() {
        let msg = response_with(2, 1, 1);
        let bytes = DatagramSerializer::default().encode(&msg).unwrap();
        let back = wire::decode(&bytes).unwrap();
        assert!(!back.is_truncated());
        assert_eq!(back, msg);
    }

    #[test]
    fn oversized_responses_drop_additionals_first() {
        // 8 answers fit comfortably; the additionals push it past the limit.
        let msg = response_with(8, 2, 20);
        let bytes = DatagramSerializer::default().encode(&msg).unwrap();
        assert!(bytes.len() <= MAX_UDP_RESPONSE);
        let back = wire::decode(&bytes).unwrap();
        assert!(back.is_truncated());
        assert!(back.additionals.is_empty());
        assert_eq!(back.authorities.len(), 2);
        assert_eq!(back.answers.len(), 8);
    }

    #[test]
    fn authorities_go_before_any_answer_is_dropped() {
        let msg = response_with(10, 5, 5);
        let without_additionals = Message { additionals: Vec::new(), ..msg.clone() };
        assert!(wire::encoded_len(&without_additionals).unwrap() > MAX_UDP_RESPONSE);

        let bytes = DatagramSerializer::default().encode(&msg).unwrap();
        assert!(bytes.len() <= MAX_UDP_RESPONSE);
        let back = wire::decode(&bytes).unwrap();
        assert!(back.is_truncated());
        assert!(back.additionals.is_empty());
        assert!(back.authorities.is_empty());
        assert_eq!(back.answers, msg.answers);
    }

    #[test]
    fn answers_are_trimmed_from_the_end_as_a_last_resort() {
        let msg = response_with(40, 5, 5);
        let bytes = DatagramSerializer::default().encode(&msg).unwrap();
        assert!(bytes.len() <= MAX_UDP_RESPONSE);
        let back = wire::decode(&bytes).unwrap();
        assert!(back.is_truncated());
        assert!(back.additionals.is_empty() && back.authorities.is_empty());
        assert!(!back.answers.is_empty() && back.answers.len() < 40);
        assert_eq!(back.answers[..], msg.answers[..back.answers.len()]);
    }

    #[test]
    fn stream_frames_carry_a_length_prefix() {
        let msg = response_with(1, 0, 0);
        let framed = StreamSerializer.encode(&msg).unwrap();
        assert_eq!(u16::from_be_bytes([framed[0], framed[1]]) as usize, framed.len() - 2);
        assert_eq!(StreamSerializer.decode(&framed).unwrap(), msg);
        assert!(StreamSerializer.decode(&framed[..framed.len() - 1]).is_err());
    }
}
