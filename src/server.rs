//! The server core: owns the router and the transports, and turns every
//! decoded query into exactly one finished response.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::error::DnsError;
use crate::message::{Connection, FinishedResponse, Request, Response};
use crate::plugin::{Chain, Handler, Next};
use crate::router::Router;
use crate::transport::{HttpTransport, QueryHandler, TcpTransport, Transport, UdpTransport};
use crate::types::{flags, Message, MessageKind, Rcode};

/// Terminal handler: answers whatever is still unanswered with a fixed rcode.
pub struct DefaultHandler {
    rcode: Rcode,
}

impl DefaultHandler {
    pub fn new(rcode: Rcode) -> Self { Self { rcode } }
}

impl Default for DefaultHandler {
    fn default() -> Self { Self::new(Rcode::NxDomain) }
}

#[async_trait::async_trait]
impl Handler for DefaultHandler {
    fn name(&self) -> &str { "default" }

    async fn handle(&self, req: &Request, res: &mut Response, mut next: Next<'_>) -> Result<()> {
        if !res.is_finished() {
            res.errors().with_rcode(self.rcode)?;
        }
        match next.take_error() {
            Some(err) => next.fail(err, req, res).await,
            None => next.run(req, res).await,
        }
    }
}

/// Aborts the chain task unless the answer went out first.
struct ChainGuard(Option<JoinHandle<()>>);

impl ChainGuard {
    fn detach(mut self) { self.0 = None; }
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        if let Some(task) = self.0.take() {
            task.abort();
        }
    }
}

struct ServerCore {
    router: RwLock<Router>,
    default: RwLock<Arc<dyn Handler>>,
}

impl ServerCore {
    fn chain_for(&self, name: &str, qtype: crate::types::RecordType) -> (Chain, Arc<dyn Handler>) {
        let mut chain = self.router.read().unwrap_or_else(PoisonError::into_inner).chain_for(name, qtype);
        let default = self.default.read().unwrap_or_else(PoisonError::into_inner).clone();
        chain.push(default.clone());
        (chain, default)
    }
}

fn server_failure(message: &Message, connection: Connection) -> FinishedResponse {
    let reply = Message {
        id: message.id,
        kind: MessageKind::Response,
        flags: (message.flags & !flags::RCODE_MASK) | Rcode::ServFail as u16,
        questions: message.questions.clone(),
        ..Default::default()
    };
    FinishedResponse::from_message(reply, connection)
}

#[async_trait::async_trait]
impl QueryHandler for ServerCore {
    async fn handle(&self, message: Message, connection: Connection) -> FinishedResponse {
        let request = Request::new(message, connection);
        let (mut response, mut completion) = request.to_response();

        let Some(question) = request.question().cloned() else {
            tracing::debug!("TxID {:#06x} carries no question, answering FORMERR", request.id());
            if let Err(e) = response.errors().format_error() {
                tracing::error!("cannot finalize FORMERR for TxID {:#06x}: {}", request.id(), e);
            }
            return completion.try_take()
                .unwrap_or_else(|| server_failure(request.message(), request.connection().clone()));
        };

        let (chain, default) = self.chain_for(&question.name, question.qtype);
        tracing::debug!("TxID {:#06x} {} {} -> chain {:?}", request.id(), question.name, question.qtype, chain.names());

        let original = request.message().clone();
        let connection = request.connection().clone();
        let task = tokio::spawn(async move {
            if let Err(e) = chain.run(&request, &mut response).await {
                tracing::warn!("Handler chain for TxID {:#06x} ended with an error: {:#}", request.id(), e);
            }
            if !response.is_finished() {
                // The chain stopped before reaching the default handler.
                if let Err(e) = Chain::new(vec![default]).run(&request, &mut response).await {
                    tracing::warn!("Default handler failed for TxID {:#06x}: {:#}", request.id(), e);
                }
            }
            if !response.is_finished() {
                if let Err(e) = response.errors().server_failure() {
                    tracing::error!("cannot finalize SERVFAIL for TxID {:#06x}: {}", request.id(), e);
                }
            }
        });
        let guard = ChainGuard(Some(task));

        match completion.wait().await {
            Ok(finished) => {
                guard.detach();
                finished
            }
            Err(e) => {
                tracing::error!("TxID {:#06x}: {}", original.id, e);
                server_failure(&original, connection)
            }
        }
    }
}

/// An embeddable DNS server.
///
/// Routes and middleware may be registered before or after [`DnsServer::start`].
pub struct DnsServer {
    core: Arc<ServerCore>,
    transports: Vec<Arc<dyn Transport>>,
}

impl DnsServer {
    pub fn new() -> Self {
        let core = ServerCore {
            router: RwLock::new(Router::new()),
            default: RwLock::new(Arc::new(DefaultHandler::default())),
        };
        Self { core: Arc::new(core), transports: Vec::new() }
    }

    pub fn handle(&self, pattern: &str, handler: Arc<dyn Handler>) -> Result<(), DnsError> {
        self.core.router.write().unwrap_or_else(PoisonError::into_inner).handle(pattern, handler)
    }

    pub fn use_middleware(&self, handler: Arc<dyn Handler>) {
        self.core.router.write().unwrap_or_else(PoisonError::into_inner).use_middleware(handler);
    }

    /// Replaces the NXDOMAIN fallback.
    pub fn default_handler(&self, handler: Arc<dyn Handler>) {
        *self.core.default.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) -> &mut Self {
        self.transports.push(transport);
        self
    }

    pub fn listen_udp(&mut self, addr: SocketAddr) -> &mut Self {
        self.add_transport(Arc::new(UdpTransport::new(addr)))
    }

    pub fn listen_tcp(&mut self, addr: SocketAddr) -> &mut Self {
        self.add_transport(Arc::new(TcpTransport::new(addr)))
    }

    pub fn listen_http(&mut self, addr: SocketAddr) -> &mut Self {
        self.add_transport(Arc::new(HttpTransport::new(addr)))
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] { &self.transports }

    /// Answers a query in-process, bypassing every transport.
    pub async fn query(&self, message: Message, connection: Connection) -> FinishedResponse {
        self.core.handle(message, connection).await
    }

    /// Installs the core on every transport and starts them, in registration order.
    pub async fn start(&self) -> Result<Vec<SocketAddr>, DnsError> {
        let mut bound = Vec::with_capacity(self.transports.len());
        for transport in &self.transports {
            transport.set_handler(self.core.clone());
            match transport.listen().await {
                Ok(addr) => bound.push(addr),
                Err(e) => {
                    tracing::error!("Failed to start {} transport: {}", transport.kind(), e);
                    self.stop().await;
                    return Err(e);
                }
            }
        }
        Ok(bound)
    }

    pub async fn stop(&self) {
        for transport in &self.transports {
            transport.close().await;
        }
    }
}

impl Default for DnsServer {
    fn default() -> Self { Self::new() }
}
