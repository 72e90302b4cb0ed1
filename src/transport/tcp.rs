use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use super::{HttpSerializer, QueryHandler, Serializer, Shared, StreamSerializer, Transport, TransportEvent};
use crate::error::DnsError;
use crate::message::{Connection, TransportKind};

/// DNS over TCP. A connection may carry any number of framed queries, answered
/// as they complete. Losing the connection or closing the transport aborts
/// whatever is still in flight.
pub struct TcpTransport {
    bind: SocketAddr,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn new(bind: SocketAddr) -> Self {
        Self { bind, shared: Shared::new(), task: Mutex::new(None) }
    }
}

/// Reads one length-prefixed payload. `None` on a clean end of stream.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Reads framed queries and answers each on its own task. On a clean end of
/// stream the peer has only half-closed, so the queries it already sent are
/// still answered. A read error drops the set and aborts them.
async fn read_queries(mut reader: OwnedReadHalf, peer: SocketAddr, shared: Arc<Shared>, tx: mpsc::Sender<Vec<u8>>) -> std::io::Result<()> {
    let mut inflight = JoinSet::new();
    loop {
        let payload = match read_frame(&mut reader).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                if !inflight.is_empty() {
                    tracing::debug!("[tcp] connection {} lost, aborting {} in-flight queries", peer, inflight.len());
                }
                return Err(e);
            }
        };
        let tx = tx.clone();
        let shared = shared.clone();
        inflight.spawn(async move {
            let connection = Connection::new(peer, TransportKind::Tcp);
            // Frame already stripped, so the body decodes like an HTTP one.
            let Some(reply) = shared.answer(&payload, &HttpSerializer, connection).await else { return };
            match StreamSerializer.encode(&reply) {
                Ok(bytes) => { let _ = tx.send(bytes).await; }
                Err(e) => tracing::error!("[tcp] cannot encode reply TxID {:#06x}: {}", reply.id, e),
            }
        });
        while inflight.try_join_next().is_some() {}
    }
    while inflight.join_next().await.is_some() {}
    Ok(())
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let (reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);

    let reading = read_queries(reader, peer, shared.clone(), tx);
    tokio::pin!(reading);
    let mut reading_done = false;

    // The writer runs until every sender is gone: the reader and each query task.
    let outcome = loop {
        tokio::select! {
            r = &mut reading, if !reading_done => match r {
                Ok(()) => reading_done = true,
                Err(e) => break Err(e),
            },
            bytes = rx.recv() => match bytes {
                Some(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
        }
    };
    if let Err(e) = outcome {
        tracing::debug!("[tcp] connection {} failed: {}", peer, e);
        shared.emit(TransportEvent::Error(format!("{}: {}", peer, e)));
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    shared.emit(TransportEvent::Connection(peer));
                    connections.spawn(serve_connection(stream, peer, shared.clone()));
                }
                Err(e) => {
                    tracing::warn!("[tcp] accept failed: {}", e);
                    shared.emit(TransportEvent::Error(e.to_string()));
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind { TransportKind::Tcp }

    fn set_handler(&self, handler: Arc<dyn QueryHandler>) { self.shared.set_handler(handler); }

    async fn listen(&self) -> Result<SocketAddr, DnsError> {
        let listener = TcpListener::bind(self.bind).await?;
        let local = listener.local_addr()?;
        tracing::info!("🚀 TCP transport listening on {}", local);

        let handle = tokio::spawn(accept_loop(listener, self.shared.clone()));
        if let Some(old) = self.task.lock().unwrap_or_else(PoisonError::into_inner).replace(handle) {
            old.abort();
        }
        self.shared.emit(TransportEvent::Listening(local));
        Ok(local)
    }

    async fn close(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
            tracing::info!("[tcp] transport on {} closed", self.bind);
            self.shared.emit(TransportEvent::Closed);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> { self.shared.subscribe() }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_are_read_until_clean_eof() {
        let mut input: &[u8] = &[0, 3, b'a', b'b', b'c', 0, 1, b'z'];
        assert_eq!(read_frame(&mut input).await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(read_frame(&mut input).await.unwrap(), Some(b"z".to_vec()));
        assert_eq!(read_frame(&mut input).await.unwrap(), None);

        let mut cut: &[u8] = &[0, 5, b'a'];
        assert!(read_frame(&mut cut).await.is_err());
    }
}
