//! Raw socket adapters for Raffel.
//!
//! TCP speaks `[4-byte BE length][UTF-8 JSON envelope]` frames with the
//! same envelope semantics as the WebSocket adapter (request, stream,
//! event); UDP treats one datagram as one envelope, request/response and
//! events only.

mod tcp;
mod udp;

pub use tcp::{serve_tcp, TcpConfig};
pub use udp::{serve_udp, UdpConfig, UdpHandle};
