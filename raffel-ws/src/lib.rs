//! WebSocket adapter and channel engine for Raffel.
//!
//! One upgrade endpoint carries both worlds: the pub/sub channel protocol
//! (subscribe/unsubscribe/publish with public, private, and presence
//! channels) and ordinary request/stream/event envelopes routed through the
//! same core [`Router`](raffel_core::router::Router) as every other
//! transport.
//!
//! Channels are per-process. Fan-out is best-effort with a bounded
//! per-connection mailbox (drop-oldest at the high-water mark), so a slow
//! consumer only ever loses its own frames.

mod adapter;
mod channel;
mod config;
mod connection;
mod frames;
mod mailbox;

pub use adapter::{ws_router, SUBPROTOCOL};
pub use channel::{
    AuthorizeFn, CanPublishFn, ChannelCtx, ChannelDef, ChannelEngine, ChannelKind, Peer,
    PublishCtx,
};
pub use config::WsConfig;
pub use frames::ServerFrame;
pub use mailbox::Mailbox;
