//! UDP adapter tests: datagram request/response, event acks, the missing
//! stream surface, and the no-amplification rule.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use raffel_core::registry::{HandlerDef, Registry};
use raffel_core::router::Router;
use raffel_net::{serve_udp, UdpConfig};

async fn start_server() -> std::net::SocketAddr {
    let registry = Arc::new(Registry::new());
    registry
        .procedure(HandlerDef::procedure("greet"), |input: Value, _ctx| async move {
            let name = input.get("name").and_then(Value::as_str).unwrap_or("?");
            Ok(json!({ "message": format!("Hello, {name}!") }))
        })
        .unwrap();
    registry
        .event(HandlerDef::event("audit.log"), |_input: Value, _ctx| async {
            Ok(())
        })
        .unwrap();
    let router = Arc::new(Router::new(registry));

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        serve_udp(socket, router, UdpConfig::default(), CancellationToken::new())
            .await
            .unwrap();
    });
    addr
}

async fn exchange(server: std::net::SocketAddr, datagram: &[u8]) -> Option<Value> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(datagram, server).await.unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    match tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(serde_json::from_slice(&buf[..len]).unwrap()),
        _ => None,
    }
}

#[tokio::test]
async fn request_gets_response_datagram() {
    let server = start_server().await;
    let request = json!({"type": "request", "id": "u1", "procedure": "greet", "payload": {"name": "Ada"}});
    let reply = exchange(server, &serde_json::to_vec(&request).unwrap())
        .await
        .expect("expected a response datagram");
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "u1:response");
    assert_eq!(reply["payload"]["message"], "Hello, Ada!");
}

#[tokio::test]
async fn event_is_acknowledged() {
    let server = start_server().await;
    let event = json!({"type": "event", "id": "u2", "procedure": "audit.log", "payload": {"entry": 1}});
    let reply = exchange(server, &serde_json::to_vec(&event).unwrap())
        .await
        .expect("expected an acknowledgement");
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "u2:response");
}

#[tokio::test]
async fn stream_start_is_unimplemented() {
    let server = start_server().await;
    let start = json!({"type": "stream:start", "id": "u3", "procedure": "greet", "payload": null});
    let reply = exchange(server, &serde_json::to_vec(&start).unwrap())
        .await
        .expect("expected an error datagram");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "UNIMPLEMENTED");
}

#[tokio::test]
async fn malformed_request_gets_error_reply() {
    let server = start_server().await;
    let reply = exchange(server, b"{broken")
        .await
        .expect("expected an error datagram");
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "PARSE_ERROR");
}

#[tokio::test]
async fn malformed_event_is_silently_dropped() {
    let server = start_server().await;
    // Valid JSON, declares itself an event, but is not a usable envelope.
    let reply = exchange(server, br#"{"type":"event","id":"x"}"#).await;
    assert!(reply.is_none(), "events must not trigger error replies");
}
