//! DNS over HTTP(S), RFC 8484 style.
//!
//! `GET /dns-query?dns=<base64url>` or `GET /dns-query?name=example.com&type=A`,
//! and `POST /dns-query` with an `application/dns-message` body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Bytes;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Extension, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

use super::{HttpSerializer, QueryHandler, Serializer, Shared, Transport, TransportEvent};
use crate::error::DnsError;
use crate::message::{Connection, TransportKind};
use crate::types::{Message, Question, RecordType};

pub const DNS_MESSAGE: &str = "application/dns-message";
const MAX_BODY: usize = 65_535;

#[derive(Debug, Clone, Copy)]
struct PeerAddr(SocketAddr);

#[derive(Clone)]
struct DohState {
    shared: Arc<Shared>,
    kind: TransportKind,
}

pub struct HttpTransport {
    bind: SocketAddr,
    tls: Option<Arc<ServerConfig>>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, tls: None, shared: Shared::new(), task: Mutex::new(None) }
    }

    /// Serves HTTPS with the given certificate configuration.
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// The axum application behind the listener.
    pub fn router(&self) -> Router {
        let kind = if self.tls.is_some() { TransportKind::Https } else { TransportKind::Http };
        Router::new()
            .route("/dns-query", any(dns_query))
            .with_state(DohState { shared: self.shared.clone(), kind })
    }
}

fn status(code: StatusCode, reason: &str) -> Response {
    (code, reason.to_string()).into_response()
}

fn query_from_params(params: &HashMap<String, String>) -> Result<Vec<u8>, Response> {
    if let Some(encoded) = params.get("dns") {
        return URL_SAFE_NO_PAD
            .decode(encoded.trim_end_matches('='))
            .map_err(|_| status(StatusCode::BAD_REQUEST, "dns parameter is not base64url"));
    }
    let Some(name) = params.get("name") else {
        return Err(status(StatusCode::BAD_REQUEST, "missing dns or name parameter"));
    };
    let qtype = match params.get("type") {
        Some(t) => match t.parse::<u16>() {
            Ok(n) => RecordType::from_u16(n),
            Err(_) => t.parse::<RecordType>().map_err(|_| status(StatusCode::BAD_REQUEST, "unknown record type"))?,
        },
        None => RecordType::A,
    };
    HttpSerializer
        .encode(&Message::query(0, Question::new(name.as_str(), qtype)))
        .map_err(|_| status(StatusCode::BAD_REQUEST, "invalid name"))
}

/// Media type check that tolerates parameters such as `; charset=...`.
fn is_dns_message(content_type: Option<&HeaderValue>) -> bool {
    content_type
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(DNS_MESSAGE))
}

async fn dns_query(State(state): State<DohState>, request: Request) -> Response {
    let peer = request.extensions().get::<PeerAddr>().map(|p| p.0).unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 0)));

    let method = request.method().clone();
    let body: Vec<u8> = match method {
        Method::GET => {
            let params = match Query::<HashMap<String, String>>::try_from_uri(request.uri()) {
                Ok(Query(params)) => params,
                Err(_) => return status(StatusCode::BAD_REQUEST, "bad query string"),
            };
            match query_from_params(&params) {
                Ok(bytes) => bytes,
                Err(resp) => return resp,
            }
        }
        Method::POST => {
            if !is_dns_message(request.headers().get(header::CONTENT_TYPE)) {
                return status(StatusCode::UNSUPPORTED_MEDIA_TYPE, "expected application/dns-message");
            }
            match axum::body::to_bytes(request.into_body(), MAX_BODY).await {
                Ok(bytes) => bytes.to_vec(),
                Err(_) => return status(StatusCode::BAD_REQUEST, "unreadable body"),
            }
        }
        _ => return status(StatusCode::METHOD_NOT_ALLOWED, "use GET or POST"),
    };

    let Some(handler) = state.shared.handler() else {
        return status(StatusCode::NOT_IMPLEMENTED, "no handler installed");
    };
    state.shared.emit(TransportEvent::Message { peer, bytes: body.len() });
    let query = match HttpSerializer.decode(&body) {
        Ok(query) => query,
        Err(e) => {
            tracing::debug!("[{}] undecodable message from {}: {}", state.kind, peer, e);
            return status(StatusCode::BAD_REQUEST, "malformed DNS message");
        }
    };

    let finished = handler.handle(query, Connection::new(peer, state.kind)).await;
    let reply = finished.message();
    match HttpSerializer.encode(reply) {
        Ok(bytes) => {
            let mut response = ([(header::CONTENT_TYPE, DNS_MESSAGE)], Bytes::from(bytes)).into_response();
            if let Some(ttl) = reply.answers.iter().map(|r| r.ttl).min() {
                if let Ok(value) = HeaderValue::from_str(&format!("max-age={}", ttl)) {
                    response.headers_mut().insert(header::CACHE_CONTROL, value);
                }
            }
            response
        }
        Err(e) => {
            tracing::error!("[{}] cannot encode reply TxID {:#06x}: {}", state.kind, reply.id, e);
            status(StatusCode::INTERNAL_SERVER_ERROR, "cannot encode reply")
        }
    }
}

async fn serve_io<I>(io: I, app: Router)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = TowerToHyperService::new(app);
    if let Err(e) = Builder::new(TokioExecutor::new()).serve_connection(TokioIo::new(io), service).await {
        tracing::debug!("[http] connection ended with error: {}", e);
    }
}

async fn accept_loop(listener: TcpListener, app: Router, tls: Option<TlsAcceptor>, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("[http] accept failed: {}", e);
                        shared.emit(TransportEvent::Error(e.to_string()));
                        continue;
                    }
                };
                shared.emit(TransportEvent::Connection(peer));
                let app = app.clone().layer(Extension(PeerAddr(peer)));
                let tls = tls.clone();
                let shared = shared.clone();
                connections.spawn(async move {
                    match tls {
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(stream) => serve_io(stream, app).await,
                            Err(e) => {
                                tracing::debug!("[https] TLS handshake with {} failed: {}", peer, e);
                                shared.emit(TransportEvent::Error(format!("{}: {}", peer, e)));
                            }
                        },
                        None => serve_io(stream, app).await,
                    }
                });
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        if self.tls.is_some() { TransportKind::Https } else { TransportKind::Http }
    }

    fn set_handler(&self, handler: Arc<dyn QueryHandler>) { self.shared.set_handler(handler); }

    async fn listen(&self) -> Result<SocketAddr, DnsError> {
        let listener = TcpListener::bind(self.bind).await?;
        let local = listener.local_addr()?;
        tracing::info!("🚀 {} transport listening on {}/dns-query", self.kind(), local);

        let acceptor = self.tls.clone().map(TlsAcceptor::from);
        let handle = tokio::spawn(accept_loop(listener, self.router(), acceptor, self.shared.clone()));
        if let Some(old) = self.task.lock().unwrap_or_else(PoisonError::into_inner).replace(handle) {
            old.abort();
        }
        self.shared.emit(TransportEvent::Listening(local));
        Ok(local)
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            tracing::info!("[{}] transport on {} closed", self.kind(), self.bind);
            self.shared.emit(TransportEvent::Closed);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> { self.shared.subscribe() }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
