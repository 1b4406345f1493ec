//! Per-connection loop: one task reads inbound frames in arrival order, one
//! writer task drains the mailbox, and every procedure/stream invocation
//! runs in its own task so a slow handler never blocks the next frame.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use raffel_core::envelope::{Envelope, EnvelopeKind};
use raffel_core::error::Error;
use raffel_core::registry::StreamDirection;
use raffel_core::router::{CallOptions, Reply};

use crate::adapter::WsState;
use crate::channel::Peer;
use crate::frames::{parse_client_frame, ClientFrame, ServerFrame};

/// Cancellation controllers for this connection's live streams, keyed by
/// request id. `Arc` identity tells a pump whether its entry was replaced
/// by a restart.
type ActiveStreams = Arc<Mutex<HashMap<String, Arc<CancellationToken>>>>;

pub(crate) async fn run_connection(socket: WebSocket, state: WsState) {
    let peer = Peer::new(state.config.mailbox_capacity);
    let conn_token = state.shutdown.child_token();
    let active: ActiveStreams = Arc::new(Mutex::new(HashMap::new()));

    let (mut sink, mut inbound) = socket.split();
    let outbox = peer.mailbox.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbox.pop().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut missed_pongs: u32 = 0;
    let mut ping_seq: u64 = 0;
    let period = state.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(connection = %peer.id, "websocket connected");
    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&state, &peer, &conn_token, &active, text.as_str(), &mut missed_pongs)
                        .await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let error = Error::invalid_envelope("binary frames are reserved");
                    peer.mailbox.push(ServerFrame::error(&error, None).to_json());
                }
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs = 0;
                }
                Some(Ok(Message::Ping(_))) => {
                    // The protocol stack answers transport pings itself.
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            },
            _ = heartbeat.tick() => {
                if missed_pongs >= 2 {
                    debug!(connection = %peer.id, "closing after missed pongs");
                    break;
                }
                missed_pongs += 1;
                ping_seq += 1;
                peer.mailbox.push(
                    ServerFrame::Ping { id: json!(format!("hb-{ping_seq}")) }.to_json(),
                );
            },
            _ = conn_token.cancelled() => break,
        }
    }

    // Terminal teardown: leave every channel first, then fire the
    // connection's cancellation subtree and stop the writer.
    state.engine.disconnect(&peer.id);
    conn_token.cancel();
    peer.mailbox.close();
    let _ = writer.await;
    debug!(connection = %peer.id, "websocket closed");
}

async fn handle_text(
    state: &WsState,
    peer: &Peer,
    conn_token: &CancellationToken,
    active: &ActiveStreams,
    text: &str,
    missed_pongs: &mut u32,
) {
    match parse_client_frame(text) {
        Err(error) => {
            peer.mailbox.push(ServerFrame::error(&error, None).to_json());
        }
        Ok(ClientFrame::Ping { id }) => {
            peer.mailbox.push(ServerFrame::Pong { id }.to_json());
        }
        Ok(ClientFrame::Pong { .. }) => {
            *missed_pongs = 0;
        }
        Ok(ClientFrame::Subscribe(frame)) => {
            let result = state
                .engine
                .subscribe(
                    peer,
                    &frame.channel,
                    frame.id.clone(),
                    frame.auth,
                    frame.member,
                )
                .await;
            if let Err(error) = result {
                peer.mailbox.push(ServerFrame::error(&error, frame.id).to_json());
            }
        }
        Ok(ClientFrame::Unsubscribe(frame)) => {
            if let Err(error) = state.engine.unsubscribe(peer, &frame.channel, frame.id.clone()) {
                peer.mailbox.push(ServerFrame::error(&error, frame.id).to_json());
            }
        }
        Ok(ClientFrame::Publish(frame)) => {
            let result = state
                .engine
                .publish(Some(peer), &frame.channel, &frame.event, frame.data)
                .await;
            if let Err(error) = result {
                peer.mailbox.push(ServerFrame::error(&error, frame.id).to_json());
            }
        }
        Ok(ClientFrame::Envelope(envelope)) => {
            handle_envelope(state, peer, conn_token, active, envelope);
        }
    }
}

fn handle_envelope(
    state: &WsState,
    peer: &Peer,
    conn_token: &CancellationToken,
    active: &ActiveStreams,
    envelope: Envelope,
) {
    match envelope.kind {
        EnvelopeKind::Request | EnvelopeKind::Event => {
            let router = state.router.clone();
            let mailbox = peer.mailbox.clone();
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
                mailbox.push(out.to_json_string());
            });
        }
        EnvelopeKind::StreamStart => start_stream(state, peer, conn_token, active, envelope),
        EnvelopeKind::StreamEnd | EnvelopeKind::StreamError => {
            // Explicit close of a live stream by the client.
            let token = active
                .lock()
                .expect("active streams lock poisoned")
                .remove(&envelope.id);
            match token {
                Some(token) => token.cancel(),
                None => debug!(request_id = %envelope.id, "close for unknown stream"),
            }
        }
        EnvelopeKind::StreamData => {
            // Client-direction stream payloads have no handler surface;
            // they are accepted and dropped.
            debug!(request_id = %envelope.id, "discarding client stream:data frame");
        }
        EnvelopeKind::Response | EnvelopeKind::Error => {
            let error = Error::invalid_envelope(format!(
                "clients cannot send {} envelopes",
                envelope.kind
            ));
            peer.mailbox.push(ServerFrame::error(&error, None).to_json());
        }
    }
}

fn start_stream(
    state: &WsState,
    peer: &Peer,
    conn_token: &CancellationToken,
    active: &ActiveStreams,
    envelope: Envelope,
) {
    let request_id = envelope.id.clone();
    let direction = envelope
        .procedure
        .as_deref()
        .and_then(|name| state.router.registry().lookup_def(name))
        .and_then(|def| def.direction);

    let call_token = Arc::new(conn_token.child_token());
    {
        let mut streams = active.lock().expect("active streams lock poisoned");
        if let Some(existing) = streams.get(&request_id) {
            if direction == Some(StreamDirection::Server) {
                // Server streams are restartable: a second start cancels the
                // old sequence and begins a fresh one.
                existing.cancel();
            } else {
                drop(streams);
                let error = Error::invalid_argument(format!(
                    "stream {request_id:?} is already running and not restartable"
                ));
                peer.mailbox.push(
                    Envelope::error_for(&request_id, envelope.procedure.clone(), &error)
                        .to_json_string(),
                );
                return;
            }
        }
        streams.insert(request_id.clone(), call_token.clone());
    }

    let router = state.router.clone();
    let mailbox = peer.mailbox.clone();
    let active = active.clone();
    tokio::spawn(async move {
        let opts = CallOptions::cancelled_by(call_token.as_ref().clone());
        match router.handle(envelope, opts).await {
            Reply::Stream(mut frames) => {
                while let Some(frame) = frames.next().await {
                    mailbox.push(frame.to_json_string());
                }
            }
            Reply::Error(error_envelope) => {
                mailbox.push(error_envelope.to_json_string());
            }
            Reply::Response { envelope, .. } => {
                mailbox.push(envelope.to_json_string());
            }
        }
        // Only clear our own registration; a restart may have replaced it.
        let mut streams = active.lock().expect("active streams lock poisoned");
        if let Some(current) = streams.get(&request_id) {
            if Arc::ptr_eq(current, &call_token) {
                streams.remove(&request_id);
            }
        }
    });
}
