//! UDP adapter: one datagram, one envelope.
//!
//! Requests get their response (or error) sent back to the source address.
//! Events are routed and acknowledged; their parse errors are dropped
//! silently so the adapter cannot be used for amplification. Streams have
//! no UDP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::router::{CallOptions, Reply, Router};

pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub max_datagram_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// Server-side push API: send unsolicited envelopes to an address.
#[derive(Clone)]
pub struct UdpHandle {
    socket: Arc<UdpSocket>,
}

impl UdpHandle {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub async fn send_to(&self, addr: SocketAddr, envelope: &Envelope) -> Result<(), Error> {
        self.socket
            .send_to(&envelope.to_json(), addr)
            .await
            .map_err(|e| Error::unavailable(format!("udp send failed: {e}")))?;
        Ok(())
    }
}

/// Receive loop: one task per datagram. Returns once `shutdown` fires.
pub async fn serve_udp(
    socket: UdpSocket,
    router: Arc<Router>,
    config: UdpConfig,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let socket = Arc::new(socket);
    let mut buf = vec![0u8; config.max_datagram_size];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, remote) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "udp recv failed");
                        continue;
                    }
                };
                let datagram = buf[..len].to_vec();
                let router = router.clone();
                let socket = socket.clone();
                let token = shutdown.child_token();
                tokio::spawn(async move {
                    handle_datagram(router, socket, datagram, remote, token).await;
                });
            }
        }
    }
    Ok(())
}

async fn handle_datagram(
    router: Arc<Router>,
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    remote: SocketAddr,
    token: CancellationToken,
) {
    let envelope = match Envelope::from_json(&datagram) {
        Ok(envelope) => envelope,
        Err(error) => {
            // Events never get error replies (no amplification surface).
            let is_event = serde_json::from_slice::<serde_json::Value>(&datagram)
                .ok()
                .and_then(|v| v.get("type").and_then(|t| t.as_str().map(str::to_string)))
                .is_some_and(|t| t == "event");
            if !is_event {
                let id = uuid::Uuid::new_v4().to_string();
                send(&socket, remote, &Envelope::error_for(&id, None, &error)).await;
            } else {
                debug!(%remote, "dropping malformed event datagram");
            }
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::Request | EnvelopeKind::Event => {
            let reply = router
                .handle(envelope, CallOptions::cancelled_by(token))
                .await;
            let out = match reply {
                Reply::Response { envelope, .. } => envelope,
                Reply::Error(envelope) => envelope,
                Reply::Stream(frames) => Envelope::error_for(
                    frames.request_id(),
                    None,
                    &Error::unimplemented("streams are not available over UDP"),
                ),
            };
            send(&socket, remote, &out).await;
        }
        EnvelopeKind::StreamStart | EnvelopeKind::StreamData | EnvelopeKind::StreamEnd
        | EnvelopeKind::StreamError => {
            let error = Error::unimplemented("streams are not available over UDP");
            let reply = Envelope::error_for(&envelope.id, envelope.procedure.clone(), &error);
            send(&socket, remote, &reply).await;
        }
        EnvelopeKind::Response | EnvelopeKind::Error => {
            debug!(%remote, "ignoring client-sent reply envelope");
        }
    }
}

async fn send(socket: &UdpSocket, remote: SocketAddr, envelope: &Envelope) {
    if let Err(e) = socket.send_to(&envelope.to_json(), remote).await {
        debug!(%remote, error = %e, "udp reply failed");
    }
}
