//! TCP adapter tests: framing reassembly, oversize rejection, envelope
//! semantics, and per-connection ordering.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use raffel_core::registry::{HandlerDef, Registry};
use raffel_core::router::Router;
use raffel_core::stream;
use raffel_net::{serve_tcp, TcpConfig};

async fn start_server(config: TcpConfig) -> std::net::SocketAddr {
    let registry = Arc::new(Registry::new());
    registry
        .procedure(HandlerDef::procedure("greet"), |input: Value, _ctx| async move {
            let name = input.get("name").and_then(Value::as_str).unwrap_or("?");
            Ok(json!({ "message": format!("Hello, {name}!") }))
        })
        .unwrap();
    registry
        .stream(HandlerDef::stream("counter"), |input: Value, _ctx| {
            let count = input.get("count").and_then(Value::as_u64).unwrap_or(0);
            stream::from_iter((1..=count).map(|value| json!({ "value": value })))
        })
        .unwrap();
    let router = Arc::new(Router::new(registry));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve_tcp(listener, router, config, CancellationToken::new())
            .await
            .unwrap();
    });
    addr
}

fn frame(envelope: &Value) -> Vec<u8> {
    let payload = serde_json::to_vec(envelope).unwrap();
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(&payload);
    framed
}

async fn read_frame(stream: &mut TcpStream) -> Option<Value> {
    let read = async {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.ok()?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;
        serde_json::from_slice(&payload).ok()
    };
    tokio::time::timeout(Duration::from_secs(2), read)
        .await
        .expect("timed out waiting for frame")
}

#[tokio::test]
async fn request_response_round_trip() {
    let addr = start_server(TcpConfig::default()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let request = json!({"type": "request", "id": "r1", "procedure": "greet", "payload": {"name": "Ada"}});
    client.write_all(&frame(&request)).await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["id"], "r1:response");
    assert_eq!(reply["payload"]["message"], "Hello, Ada!");
}

#[tokio::test]
async fn partial_frame_reassembles_to_one_envelope() {
    let addr = start_server(TcpConfig::default()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let request = json!({"type": "request", "id": "r1", "procedure": "greet", "payload": {"name": "Slow"}});
    let bytes = frame(&request);

    // Length prefix first, then the payload in two bursts with delays.
    client.write_all(&bytes[..4]).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let middle = 4 + (bytes.len() - 4) / 2;
    client.write_all(&bytes[4..middle]).await.unwrap();
    client.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(&bytes[middle..]).await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["id"], "r1:response");

    // Exactly one envelope came out: the next read sees no stray bytes.
    let mut probe = [0u8; 1];
    let extra = tokio::time::timeout(Duration::from_millis(100), client.read(&mut probe)).await;
    assert!(extra.is_err(), "unexpected extra bytes after response");
}

#[tokio::test]
async fn arbitrary_chunking_still_decodes() {
    let addr = start_server(TcpConfig::default()).await;

    for chunk_size in [1usize, 3, 7, 64] {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = json!({"type": "request", "id": "c1", "procedure": "greet", "payload": {"name": "Chunk"}});
        let bytes = frame(&request);
        for chunk in bytes.chunks(chunk_size) {
            client.write_all(chunk).await.unwrap();
            client.flush().await.unwrap();
        }
        let reply = read_frame(&mut client).await.unwrap();
        assert_eq!(reply["id"], "c1:response", "chunk size {chunk_size}");
    }
}

#[tokio::test]
async fn oversized_frame_is_rejected_and_socket_closed() {
    let addr = start_server(TcpConfig {
        max_frame_size: 1024,
        ..TcpConfig::default()
    })
    .await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    client.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "MESSAGE_TOO_LARGE");

    // The server closes after the error frame.
    let mut probe = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut probe))
        .await
        .expect("timed out waiting for close")
        .unwrap();
    assert_eq!(n, 0, "expected EOF");
}

#[tokio::test]
async fn stream_frames_arrive_in_order_with_request_id() {
    let addr = start_server(TcpConfig::default()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let start = json!({"type": "stream:start", "id": "s1", "procedure": "counter", "payload": {"count": 5}});
    client.write_all(&frame(&start)).await.unwrap();

    for value in 1..=5 {
        let data = read_frame(&mut client).await.unwrap();
        assert_eq!(data["type"], "stream:data");
        assert_eq!(data["id"], "s1");
        assert_eq!(data["payload"]["value"], value);
    }
    let end = read_frame(&mut client).await.unwrap();
    assert_eq!(end["type"], "stream:end");
    assert_eq!(end["id"], "s1");
}

#[tokio::test]
async fn malformed_json_frame_gets_error_envelope() {
    let addr = start_server(TcpConfig::default()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let payload = b"{broken";
    let mut framed = (payload.len() as u32).to_be_bytes().to_vec();
    framed.extend_from_slice(payload);
    client.write_all(&framed).await.unwrap();

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["payload"]["code"], "PARSE_ERROR");

    // The connection stays usable afterwards.
    let request = json!({"type": "request", "id": "r2", "procedure": "greet", "payload": {"name": "Still"}});
    client.write_all(&frame(&request)).await.unwrap();
    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["id"], "r2:response");
}

#[tokio::test]
async fn unknown_procedure_maps_to_not_found_envelope() {
    let addr = start_server(TcpConfig::default()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let request = json!({"type": "request", "id": "r9", "procedure": "nope", "payload": null});
    client.write_all(&frame(&request)).await.unwrap();
    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["id"], "r9:error");
    assert_eq!(reply["payload"]["code"], "NOT_FOUND");
}
