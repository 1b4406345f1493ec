//! TCP adapter: length-prefixed envelope frames over long-lived
//! connections.
//!
//! Framing is `[4-byte big-endian payload length][UTF-8 JSON envelope]`
//! with no handshake. One task reads inbound frames in arrival order; each
//! invocation runs in its own task; a single writer task drains a bounded
//! outbound queue, so server frames reach the client in enqueue order and
//! backpressure is the socket's send buffer plus that queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::registry::StreamDirection;
use raffel_core::router::{CallOptions, Reply, Router};

pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Maximum frame payload size. Oversized frames get a
    /// `MESSAGE_TOO_LARGE` reply and the socket is closed.
    pub max_frame_size: usize,
    /// Outbound queue depth per connection.
    pub write_queue: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            write_queue: 64,
        }
    }
}

fn codec(max_frame_size: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

/// Accept loop. Returns when `shutdown` fires; connections drain through
/// their own cancellation subtrees.
pub async fn serve_tcp(
    listener: TcpListener,
    router: Arc<Router>,
    config: TcpConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let config = Arc::new(config);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (socket, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "tcp accept failed");
                        continue;
                    }
                };
                if let Err(e) = socket.set_nodelay(true) {
                    debug!(error = %e, "could not disable Nagle");
                }
                let router = router.clone();
                let config = config.clone();
                let conn_token = shutdown.child_token();
                tokio::spawn(async move {
                    debug!(%remote, "tcp connected");
                    run_connection(socket, router, config, conn_token).await;
                    debug!(%remote, "tcp closed");
                });
            }
        }
    }
    Ok(())
}

type ActiveStreams = Arc<Mutex<HashMap<String, Arc<CancellationToken>>>>;

async fn run_connection(
    socket: TcpStream,
    router: Arc<Router>,
    config: Arc<TcpConfig>,
    conn_token: CancellationToken,
) {
    let (read_half, write_half) = socket.into_split();
    let mut inbound: FramedRead<OwnedReadHalf, _> =
        FramedRead::new(read_half, codec(config.max_frame_size));
    let (tx, rx) = mpsc::channel::<Envelope>(config.write_queue);
    let writer = tokio::spawn(write_loop(write_half, rx, config.max_frame_size));
    let active: ActiveStreams = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(bytes)) => {
                    match Envelope::from_json(&bytes) {
                        Ok(envelope) => {
                            dispatch(&router, &tx, &conn_token, &active, envelope);
                        }
                        Err(error) => {
                            let id = uuid::Uuid::new_v4().to_string();
                            let _ = tx.send(Envelope::error_for(&id, None, &error)).await;
                        }
                    }
                }
                Some(Err(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                    // Length prefix beyond the configured maximum.
                    let error = Error::message_too_large(format!(
                        "frame exceeds {} bytes",
                        config.max_frame_size
                    ));
                    let id = uuid::Uuid::new_v4().to_string();
                    let _ = tx.send(Envelope::error_for(&id, None, &error)).await;
                    break;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "tcp read failed");
                    break;
                }
                None => break,
            },
            _ = conn_token.cancelled() => break,
        }
    }

    // Every active stream's cancellation controller fires on disconnect.
    conn_token.cancel();
    drop(tx);
    let _ = writer.await;
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Envelope>,
    max_frame_size: usize,
) {
    let mut outbound = FramedWrite::new(write_half, codec(max_frame_size));
    while let Some(envelope) = rx.recv().await {
        if outbound.send(Bytes::from(envelope.to_json())).await.is_err() {
            break;
        }
    }
    let _ = outbound.close().await;
}

fn dispatch(
    router: &Arc<Router>,
    tx: &mpsc::Sender<Envelope>,
    conn_token: &CancellationToken,
    active: &ActiveStreams,
    envelope: Envelope,
) {
    match envelope.kind {
        EnvelopeKind::Request | EnvelopeKind::Event => {
            let router = router.clone();
            let tx = tx.clone();
            let token = conn_token.child_token();
            tokio::spawn(async move {
                let reply = router.handle(envelope, CallOptions::cancelled_by(token)).await;
                let out = match reply {
                    Reply::Response { envelope, .. } => envelope,
                    Reply::Error(envelope) => envelope,
                    Reply::Stream(frames) => Envelope::error_for(
                        frames.request_id(),
                        None,
                        &Error::internal("unexpected stream reply"),
                    ),
                };
                let _ = tx.send(out).await;
            });
        }
        EnvelopeKind::StreamStart => start_stream(router, tx, conn_token, active, envelope),
        EnvelopeKind::StreamEnd | EnvelopeKind::StreamError => {
            let token = active
                .lock()
                .expect("active streams lock poisoned")
                .remove(&envelope.id);
            if let Some(token) = token {
                token.cancel();
            }
        }
        EnvelopeKind::StreamData => {
            debug!(request_id = %envelope.id, "discarding client stream:data frame");
        }
        EnvelopeKind::Response | EnvelopeKind::Error => {
            let error = Error::invalid_envelope(format!(
                "clients cannot send {} envelopes",
                envelope.kind
            ));
            let tx = tx.clone();
            let reply = Envelope::error_for(&envelope.id, envelope.procedure.clone(), &error);
            tokio::spawn(async move {
                let _ = tx.send(reply).await;
            });
        }
    }
}

fn start_stream(
    router: &Arc<Router>,
    tx: &mpsc::Sender<Envelope>,
    conn_token: &CancellationToken,
    active: &ActiveStreams,
    envelope: Envelope,
) {
    let request_id = envelope.id.clone();
    let direction = envelope
        .procedure
        .as_deref()
        .and_then(|name| router.registry().lookup_def(name))
        .and_then(|def| def.direction);

    let call_token = Arc::new(conn_token.child_token());
    {
        let mut streams = active.lock().expect("active streams lock poisoned");
        if let Some(existing) = streams.get(&request_id) {
            if direction == Some(StreamDirection::Server) {
                existing.cancel();
            } else {
                drop(streams);
                let error = Error::invalid_argument(format!(
                    "stream {request_id:?} is already running and not restartable"
                ));
                let reply = Envelope::error_for(&request_id, envelope.procedure.clone(), &error);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(reply).await;
                });
                return;
            }
        }
        streams.insert(request_id.clone(), call_token.clone());
    }

    let router = router.clone();
    let tx = tx.clone();
    let active = active.clone();
    tokio::spawn(async move {
        let opts = CallOptions::cancelled_by(call_token.as_ref().clone());
        match router.handle(envelope, opts).await {
            Reply::Stream(mut frames) => {
                while let Some(frame) = frames.next().await {
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            Reply::Error(error_envelope) => {
                let _ = tx.send(error_envelope).await;
            }
            Reply::Response { envelope, .. } => {
                let _ = tx.send(envelope).await;
            }
        }
        let mut streams = active.lock().expect("active streams lock poisoned");
        if let Some(current) = streams.get(&request_id) {
            if Arc::ptr_eq(current, &call_token) {
                streams.remove(&request_id);
            }
        }
    });
}
