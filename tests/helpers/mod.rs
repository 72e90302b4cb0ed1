#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use zonedns::plugin::store::ZoneStore;
use zonedns::types::{Message, Question, RData, Record, RecordType};
use zonedns::{wire, DnsServer, ZoneTrie};

pub const LOCALHOST: &str = "127.0.0.1:0";

pub fn a(name: &str, last: u8) -> Record {
    Record::new(name, 300, RData::A(Ipv4Addr::new(127, 0, 0, last)))
}

/// A trie holding `example.com A 127.0.0.1` and a wildcard under it.
pub fn sample_zone() -> Arc<ZoneTrie> {
    let trie = Arc::new(ZoneTrie::new());
    trie.add("example.com", RecordType::A, vec![a("example.com", 1)]);
    trie.add("*.example.com", RecordType::A, vec![a("*.example.com", 2)]);
    trie
}

/// Server with the sample zone as middleware, listening on UDP and TCP.
pub async fn started_server() -> (DnsServer, SocketAddr, SocketAddr) {
    let mut server = DnsServer::new();
    server.use_middleware(Arc::new(ZoneStore::with_trie(sample_zone())));
    server.listen_udp(LOCALHOST.parse().unwrap()).listen_tcp(LOCALHOST.parse().unwrap());
    let bound = server.start().await.expect("server starts");
    (server, bound[0], bound[1])
}

pub fn query(id: u16, name: &str, qtype: RecordType) -> Message {
    Message::query(id, Question::new(name, qtype))
}

pub async fn udp_exchange(server: SocketAddr, bytes: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind(LOCALHOST).await.unwrap();
    socket.send_to(bytes, server).await.unwrap();
    let mut buf = vec![0u8; 4096];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), socket.recv_from(&mut buf))
        .await
        .expect("udp reply in time")
        .unwrap();
    buf.truncate(n);
    buf
}

pub async fn udp_query(server: SocketAddr, msg: &Message) -> Message {
    wire::decode(&udp_exchange(server, &wire::encode(msg).unwrap()).await).unwrap()
}

pub async fn tcp_read_frame(stream: &mut TcpStream) -> Message {
    let mut len = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut len)).await.expect("tcp reply in time").unwrap();
    let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut body).await.unwrap();
    wire::decode(&body).unwrap()
}

pub async fn tcp_send(stream: &mut TcpStream, msg: &Message) {
    let body = wire::encode(msg).unwrap();
    let mut framed = (body.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&body);
    stream.write_all(&framed).await.unwrap();
}
