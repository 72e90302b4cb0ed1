use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use zonedns::plugin::{Handler, Next};
use zonedns::transport::MAX_UDP_RESPONSE;
use zonedns::types::{flags, RData, Rcode, RecordType};
use zonedns::{wire, DnsServer, Request, Response};

mod helpers;
use helpers::*;

#[tokio::test]
async fn udp_answers_a_stored_record() {
    let (_server, udp, _tcp) = started_server().await;
    let reply = udp_query(udp, &query(0x1001, "example.com", RecordType::A)).await;

    assert_eq!(reply.id, 0x1001);
    assert_eq!(reply.rcode(), 0);
    assert!(!reply.is_truncated());
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(reply.answers[0].data, RData::A(Ipv4Addr::new(127, 0, 0, 1)));
}

#[tokio::test]
async fn wildcard_answers_carry_the_queried_name() {
    let (_server, udp, _tcp) = started_server().await;
    let reply = udp_query(udp, &query(7, "Deep.Sub.example.com", RecordType::A)).await;
    assert_eq!(reply.answers.len(), 1);
    assert_eq!(reply.answers[0].name, "Deep.Sub.example.com");
}

#[tokio::test]
async fn unknown_names_get_nxdomain() {
    let (_server, udp, _tcp) = started_server().await;
    let reply = udp_query(udp, &query(9, "nothing.invalid", RecordType::A)).await;
    assert_eq!(reply.rcode(), Rcode::NxDomain as u16);
    assert!(reply.answers.is_empty());
}

#[tokio::test]
async fn garbage_datagrams_get_formerr() {
    let (_server, udp, _tcp) = started_server().await;
    let reply = wire::decode(&udp_exchange(udp, &[0xAB, 0xCD, 0x01, 0x00, 0x00, 0x05]).await).unwrap();
    assert_eq!(reply.id, 0xABCD);
    assert_eq!(reply.rcode(), Rcode::FormErr as u16);
}

/// Answers with `answers` A records and pads the additional section.
struct Oversized { answers: u8, additionals: u8 }

#[async_trait::async_trait]
impl Handler for Oversized {
    fn name(&self) -> &str { "oversized" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> anyhow::Result<()> {
        let name = req.question().map(|q| q.name.clone()).unwrap_or_default();
        res.set_additionals((0..self.additionals).map(|i| a(&format!("extra-{}.example.net", i), i)).collect())?;
        res.answer((0..self.answers).map(|i| a(&name, i)).collect())?;
        next.run(req, res).await
    }
}

#[tokio::test]
async fn oversized_udp_replies_are_truncated() {
    let mut server = DnsServer::new();
    server.handle("big.example.net", Arc::new(Oversized { answers: 6, additionals: 30 })).unwrap();
    server.listen_udp(LOCALHOST.parse().unwrap());
    let udp = server.start().await.unwrap()[0];

    let raw = udp_exchange(udp, &wire::encode(&query(3, "big.example.net", RecordType::A)).unwrap()).await;
    assert!(raw.len() <= MAX_UDP_RESPONSE);
    let reply = wire::decode(&raw).unwrap();
    assert!(reply.is_truncated());
    assert_ne!(reply.flags & flags::TRUNCATED_RESPONSE, 0);
    assert!(reply.additionals.is_empty());
    assert_eq!(reply.answers.len(), 6);
}

#[tokio::test]
async fn tcp_carries_full_replies_and_several_queries_per_connection() {
    let mut server = DnsServer::new();
    server.handle("big.example.net", Arc::new(Oversized { answers: 6, additionals: 30 })).unwrap();
    server.listen_tcp(LOCALHOST.parse().unwrap());
    let tcp = server.start().await.unwrap()[0];

    let mut stream = TcpStream::connect(tcp).await.unwrap();
    tcp_send(&mut stream, &query(1, "big.example.net", RecordType::A)).await;
    let first = tcp_read_frame(&mut stream).await;
    assert!(!first.is_truncated());
    assert_eq!(first.additionals.len(), 30);

    tcp_send(&mut stream, &query(2, "elsewhere.example.org", RecordType::A)).await;
    let second = tcp_read_frame(&mut stream).await;
    assert_eq!(second.id, 2);
    assert_eq!(second.rcode(), Rcode::NxDomain as u16);
}

#[tokio::test]
async fn tcp_half_close_still_gets_answers() {
    let (_server, _udp, tcp) = started_server().await;
    let mut stream = TcpStream::connect(tcp).await.unwrap();
    tcp_send(&mut stream, &query(11, "example.com", RecordType::A)).await;
    tcp_send(&mut stream, &query(12, "www.example.com", RecordType::A)).await;
    stream.shutdown().await.unwrap();

    let mut ids = vec![tcp_read_frame(&mut stream).await.id, tcp_read_frame(&mut stream).await.id];
    ids.sort_unstable();
    assert_eq!(ids, vec![11, 12]);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn stopped_server_no_longer_answers() {
    let (server, udp, _tcp) = started_server().await;
    assert_eq!(udp_query(udp, &query(1, "example.com", RecordType::A)).await.answers.len(), 1);
    server.stop().await;

    let socket = tokio::net::UdpSocket::bind(LOCALHOST).await.unwrap();
    socket.send_to(&wire::encode(&query(2, "example.com", RecordType::A)).unwrap(), udp).await.unwrap();
    let mut buf = [0u8; 512];
    let waited = tokio::time::timeout(std::time::Duration::from_millis(300), socket.recv_from(&mut buf)).await;
    assert!(waited.is_err() || waited.unwrap().is_err());
}
