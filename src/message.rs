//! Request/response pair for a single DNS transaction.
//!
//! A [`Response`] can be mutated until it is finalized. Finalizing hands an
//! immutable [`FinishedResponse`] to the owning transport through a one-shot
//! [`Completion`], exactly once.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::oneshot;

use crate::error::DnsError;
use crate::types::{Message, MessageKind, Question, Rcode, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind { Udp, Tcp, Http, Https }

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Http => "http",
            TransportKind::Https => "https",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Where a message came from. Owned by the transport, shared by the request/response pair.
#[derive(Debug, Clone)]
pub struct Connection {
    pub remote_address: IpAddr,
    pub remote_port: u16,
    pub kind: TransportKind,
    pub received_at: Instant,
    pub received_wall: SystemTime,
}

impl Connection {
    pub fn new(peer: SocketAddr, kind: TransportKind) -> Self {
        Self {
            remote_address: peer.ip(),
            remote_port: peer.port(),
            kind,
            received_at: Instant::now(),
            received_wall: SystemTime::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr { SocketAddr::new(self.remote_address, self.remote_port) }

    pub fn elapsed(&self) -> Duration { self.received_at.elapsed() }
}

/// An inbound query. Read-only for handlers.
#[derive(Debug, Clone)]
pub struct Request {
    message: Message,
    connection: Connection,
}

impl Request {
    pub fn new(message: Message, connection: Connection) -> Self {
        Self { message, connection }
    }

    pub fn message(&self) -> &Message { &self.message }

    pub fn connection(&self) -> &Connection { &self.connection }

    pub fn id(&self) -> u16 { self.message.id }

    pub fn question(&self) -> Option<&Question> { self.message.questions.first() }

    /// Derives the writable response: same id, questions and flags, kind flipped.
    pub fn to_response(&self) -> (Response, Completion) {
        let message = Message {
            id: self.message.id,
            kind: MessageKind::Response,
            flags: self.message.flags,
            questions: self.message.questions.clone(),
            ..Default::default()
        };
        let (tx, rx) = oneshot::channel();
        let response = Response { message, connection: self.connection.clone(), finished: false, done: Some(tx) };
        (response, Completion { rx })
    }
}

/// The response under construction for one transaction.
#[derive(Debug)]
pub struct Response {
    message: Message,
    connection: Connection,
    finished: bool,
    done: Option<oneshot::Sender<FinishedResponse>>,
}

impl Response {
    pub fn message(&self) -> &Message { &self.message }

    pub fn connection(&self) -> &Connection { &self.connection }

    pub fn id(&self) -> u16 { self.message.id }

    pub fn flags(&self) -> u16 { self.message.flags }

    pub fn questions(&self) -> &[Question] { &self.message.questions }

    pub fn answers(&self) -> &[Record] { &self.message.answers }

    pub fn authorities(&self) -> &[Record] { &self.message.authorities }

    pub fn additionals(&self) -> &[Record] { &self.message.additionals }

    pub fn is_finished(&self) -> bool { self.finished }

    fn writable(&mut self) -> Result<&mut Message, DnsError> {
        if self.finished {
            return Err(DnsError::ModifiedAfterSent);
        }
        Ok(&mut self.message)
    }

    pub fn set_flags(&mut self, flags: u16) -> Result<(), DnsError> {
        self.writable()?.flags = flags;
        Ok(())
    }

    pub fn set_answers(&mut self, answers: Vec<Record>) -> Result<(), DnsError> {
        self.writable()?.answers = answers;
        Ok(())
    }

    pub fn push_answer(&mut self, answer: Record) -> Result<(), DnsError> {
        self.writable()?.answers.push(answer);
        Ok(())
    }

    pub fn set_authorities(&mut self, records: Vec<Record>) -> Result<(), DnsError> {
        self.writable()?.authorities = records;
        Ok(())
    }

    pub fn set_additionals(&mut self, records: Vec<Record>) -> Result<(), DnsError> {
        self.writable()?.additionals = records;
        Ok(())
    }

    /// Replaces the answer section and finalizes in one step.
    pub fn answer(&mut self, answers: Vec<Record>) -> Result<(), DnsError> {
        if self.finished {
            return Err(DnsError::DuplicateAnswer);
        }
        self.message.answers = answers;
        self.finish()
    }

    /// Finalizes the response with whatever it currently holds.
    pub fn resolve(&mut self) -> Result<(), DnsError> {
        self.finish()
    }

    pub fn errors(&mut self) -> ErrorResponses<'_> {
        ErrorResponses { response: self }
    }

    fn finish(&mut self) -> Result<(), DnsError> {
        if self.finished {
            return Err(DnsError::DuplicateAnswer);
        }
        self.finished = true;
        if let Some(tx) = self.done.take() {
            let snapshot = FinishedResponse {
                message: Arc::new(self.message.clone()),
                connection: self.connection.clone(),
                finished_at: Instant::now(),
            };
            // The receiver is gone when the transport stopped waiting; nothing to deliver to.
            let _ = tx.send(snapshot);
        }
        Ok(())
    }
}

/// Canonical error outcomes. Each ORs its rcode into the flags and finalizes.
pub struct ErrorResponses<'a> {
    response: &'a mut Response,
}

impl ErrorResponses<'_> {
    pub fn nx_domain(self) -> Result<(), DnsError> { self.finish_with(Rcode::NxDomain) }

    pub fn server_failure(self) -> Result<(), DnsError> { self.finish_with(Rcode::ServFail) }

    pub fn refused(self) -> Result<(), DnsError> { self.finish_with(Rcode::Refused) }

    pub fn format_error(self) -> Result<(), DnsError> { self.finish_with(Rcode::FormErr) }

    pub fn not_implemented(self) -> Result<(), DnsError> { self.finish_with(Rcode::NotImp) }

    pub fn with_rcode(self, rcode: Rcode) -> Result<(), DnsError> { self.finish_with(rcode) }

    fn finish_with(self, rcode: Rcode) -> Result<(), DnsError> {
        if self.response.finished {
            return Err(DnsError::DuplicateAnswer);
        }
        let flags = self.response.message.flags | rcode as u16;
        self.response.set_flags(flags)?;
        self.response.finish()
    }
}

/// A finalized response. Only read accessors exist.
#[derive(Debug, Clone)]
pub struct FinishedResponse {
    message: Arc<Message>,
    connection: Connection,
    finished_at: Instant,
}

impl FinishedResponse {
    /// Wraps a message built outside a handler chain (e.g. NOTIMP from a transport with no handler).
    pub fn from_message(message: Message, connection: Connection) -> Self {
        Self { message: Arc::new(message), connection, finished_at: Instant::now() }
    }

    pub fn message(&self) -> &Message { &self.message }

    pub fn connection(&self) -> &Connection { &self.connection }

    pub fn rcode(&self) -> u16 { self.message.rcode() }

    /// Time from arrival to finalization.
    pub fn duration(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.connection.received_at)
    }
}

/// One-shot completion signal for a transaction.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<FinishedResponse>,
}

impl Completion {
    /// Waits until the response is finalized. Fails if the response was dropped unanswered.
    pub async fn wait(self) -> Result<FinishedResponse, DnsError> {
        self.rx.await.map_err(|_| DnsError::Abandoned)
    }

    pub fn try_take(&mut self) -> Option<FinishedResponse> {
        self.rx.try_recv().ok()
    }
}
