use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tower::ServiceExt;
use zonedns::plugin::store::ZoneStore;
use zonedns::transport::http::DNS_MESSAGE;
use zonedns::transport::HttpTransport;
use zonedns::types::{Rcode, RecordType};
use zonedns::{wire, DnsServer, Message};

mod helpers;
use helpers::*;

async fn served_transport() -> (DnsServer, Arc<HttpTransport>) {
    let http = Arc::new(HttpTransport::new(LOCALHOST.parse().unwrap()));
    let mut server = DnsServer::new();
    server.use_middleware(Arc::new(ZoneStore::with_trie(sample_zone())));
    server.add_transport(http.clone());
    server.start().await.unwrap();
    (server, http)
}

async fn body_of(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

#[tokio::test]
async fn post_wire_query() {
    let (_server, http) = served_transport().await;
    let request = Request::post("/dns-query")
        .header(header::CONTENT_TYPE, DNS_MESSAGE)
        .body(Body::from(wire::encode(&query(0, "example.com", RecordType::A)).unwrap()))
        .unwrap();

    let response = http.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], DNS_MESSAGE);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "max-age=300");

    let reply: Message = wire::decode(&body_of(response).await).unwrap();
    assert_eq!(reply.answers.len(), 1);
}

#[tokio::test]
async fn get_with_base64url_and_with_name_parameters() {
    let (_server, http) = served_transport().await;

    let encoded = URL_SAFE_NO_PAD.encode(wire::encode(&query(0, "www.example.com", RecordType::A)).unwrap());
    let by_dns = http.router()
        .oneshot(Request::get(format!("/dns-query?dns={}", encoded)).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(by_dns.status(), StatusCode::OK);
    assert_eq!(wire::decode(&body_of(by_dns).await).unwrap().answers[0].name, "www.example.com");

    let by_name = http.router()
        .oneshot(Request::get("/dns-query?name=missing.test&type=A").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(by_name.status(), StatusCode::OK);
    assert_eq!(wire::decode(&body_of(by_name).await).unwrap().rcode(), Rcode::NxDomain as u16);
}

#[tokio::test]
async fn malformed_input_is_a_bad_request() {
    let (_server, http) = served_transport().await;

    let garbage = Request::post("/dns-query")
        .header(header::CONTENT_TYPE, DNS_MESSAGE)
        .body(Body::from(vec![1u8, 2, 3]))
        .unwrap();
    assert_eq!(http.router().oneshot(garbage).await.unwrap().status(), StatusCode::BAD_REQUEST);

    let not_base64 = Request::get("/dns-query?dns=***").body(Body::empty()).unwrap();
    assert_eq!(http.router().oneshot(not_base64).await.unwrap().status(), StatusCode::BAD_REQUEST);

    let nothing = Request::get("/dns-query").body(Body::empty()).unwrap();
    assert_eq!(http.router().oneshot(nothing).await.unwrap().status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn posts_of_other_media_types_are_unsupported() {
    let (_server, http) = served_transport().await;
    let body = wire::encode(&query(0, "example.com", RecordType::A)).unwrap();

    let as_json = Request::post("/dns-query")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    assert_eq!(http.router().oneshot(as_json).await.unwrap().status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let untyped = Request::post("/dns-query").body(Body::from(body)).unwrap();
    assert_eq!(http.router().oneshot(untyped).await.unwrap().status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn without_a_handler_the_endpoint_is_not_implemented() {
    let http = HttpTransport::new(LOCALHOST.parse().unwrap());
    let request = Request::get("/dns-query?name=example.com").body(Body::empty()).unwrap();
    assert_eq!(http.router().oneshot(request).await.unwrap().status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn other_paths_and_methods_are_rejected() {
    let (_server, http) = served_transport().await;
    let wrong_path = Request::get("/resolve?name=example.com").body(Body::empty()).unwrap();
    assert_eq!(http.router().oneshot(wrong_path).await.unwrap().status(), StatusCode::NOT_FOUND);

    let wrong_method = Request::put("/dns-query").body(Body::empty()).unwrap();
    assert_eq!(http.router().oneshot(wrong_method).await.unwrap().status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn served_over_a_real_socket() {
    let http = Arc::new(HttpTransport::new(LOCALHOST.parse().unwrap()));
    let mut server = DnsServer::new();
    server.use_middleware(Arc::new(ZoneStore::with_trie(sample_zone())));
    server.add_transport(http);
    let addr = server.start().await.unwrap()[0];

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /dns-query?name=example.com&type=A HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    assert!(raw.starts_with(b"HTTP/1.1 200 OK"));
}
