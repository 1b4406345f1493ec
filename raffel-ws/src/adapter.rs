//! Upgrade route and adapter state.

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio_util::sync::CancellationToken;

use raffel_core::router::Router;

use crate::channel::ChannelEngine;
use crate::config::WsConfig;
use crate::connection::run_connection;

/// Optional subprotocol token clients may request.
pub const SUBPROTOCOL: &str = "raffel.v1";

#[derive(Clone)]
pub(crate) struct WsState {
    pub(crate) router: Arc<Router>,
    pub(crate) engine: Arc<ChannelEngine>,
    pub(crate) config: Arc<WsConfig>,
    pub(crate) shutdown: CancellationToken,
}

/// Build the axum router exposing the WebSocket upgrade endpoint.
///
/// The connection loop speaks the JSON envelope protocol: control frames
/// (`subscribe`/`unsubscribe`/`publish`/`ping`) drive the channel engine,
/// ordinary envelopes are routed like any other transport.
pub fn ws_router(
    router: Arc<Router>,
    engine: Arc<ChannelEngine>,
    config: WsConfig,
    shutdown: CancellationToken,
) -> axum::Router {
    let path = config.path.clone();
    let state = WsState {
        router,
        engine,
        config: Arc::new(config),
        shutdown,
    };
    axum::Router::new()
        .route(&path, get(upgrade))
        .with_state(state)
}

async fn upgrade(State(state): State<WsState>, ws: WebSocketUpgrade) -> Response {
    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| run_connection(socket, state))
}
