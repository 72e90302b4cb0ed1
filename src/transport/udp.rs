use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};

use super::{DatagramSerializer, QueryHandler, Serializer, Shared, Transport, TransportEvent};
use crate::error::DnsError;
use crate::message::{Connection, TransportKind};

pub struct UdpTransport {
    bind: SocketAddr,
    serializer: DatagramSerializer,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, serializer: DatagramSerializer::default(), shared: Shared::new(), task: Mutex::new(None) }
    }

    /// Overrides the 512-byte response budget.
    pub fn with_max_response(mut self, max_size: usize) -> Self {
        self.serializer = DatagramSerializer { max_size };
        self
    }
}

async fn serve(socket: Arc<UdpSocket>, serializer: DatagramSerializer, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 4096];
    let mut inflight = JoinSet::new();
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (size, src) = match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable from an earlier reply surfaces here on some platforms.
                        tracing::debug!("[udp] recv error: {}", e);
                        shared.emit(TransportEvent::Error(e.to_string()));
                        continue;
                    }
                };
                let query = buf[..size].to_vec();
                let socket = socket.clone();
                let shared = shared.clone();
                inflight.spawn(async move {
                    let connection = Connection::new(src, TransportKind::Udp);
                    let Some(reply) = shared.answer(&query, &serializer, connection).await else { return };
                    match serializer.encode(&reply) {
                        Ok(bytes) => {
                            if let Err(e) = socket.send_to(&bytes, src).await {
                                tracing::warn!("[udp] failed to reply to {}: {}", src, e);
                                shared.emit(TransportEvent::Error(e.to_string()));
                            }
                        }
                        Err(e) => tracing::error!("[udp] cannot encode reply TxID {:#06x}: {}", reply.id, e),
                    }
                });
            }
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind { TransportKind::Udp }

    fn set_handler(&self, handler: Arc<dyn QueryHandler>) { self.shared.set_handler(handler); }

    async fn listen(&self) -> Result<SocketAddr, DnsError> {
        let socket = UdpSocket::bind(self.bind).await?;
        let local = socket.local_addr()?;
        tracing::info!("🚀 UDP transport listening on {}", local);

        let handle = tokio::spawn(serve(Arc::new(socket), self.serializer, self.shared.clone()));
        if let Some(old) = self.task.lock().unwrap_or_else(PoisonError::into_inner).replace(handle) {
            old.abort();
        }
        self.shared.emit(TransportEvent::Listening(local));
        Ok(local)
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            tracing::info!("[udp] transport on {} closed", self.bind);
            self.shared.emit(TransportEvent::Closed);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> { self.shared.subscribe() }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}
