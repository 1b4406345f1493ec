//! Raffel — a multi-protocol service framework.
//!
//! Register typed procedures, streams, and events once; expose them
//! simultaneously over HTTP/REST, Server-Sent Events, JSON-RPC 2.0,
//! WebSocket pub/sub, raw TCP, and UDP.
//!
//! ```ignore
//! use raffel::prelude::*;
//!
//! let registry = Arc::new(Registry::new());
//! registry.procedure(HandlerDef::procedure("greet"), |input: Greeting, _ctx| async move {
//!     Ok(serde_json::json!({ "message": format!("Hello, {}!", input.name) }))
//! })?;
//!
//! let router = Arc::new(Router::new(registry));
//! let handle = ServerHandle::new(config.shutdown_grace);
//! let app = http_router(router.clone(), HttpConfig::default(), handle.token().clone());
//! axum::serve(listener, app).await?;
//! ```

pub use raffel_core::*;

#[cfg(feature = "http")]
pub use raffel_http as http;
#[cfg(feature = "net")]
pub use raffel_net as net;
#[cfg(feature = "ws")]
pub use raffel_ws as ws;

#[cfg(feature = "test-support")]
pub use raffel_test as test_support;

pub mod prelude {
    pub use raffel_core::prelude::*;

    #[cfg(feature = "http")]
    pub use raffel_http::{http_router, CorsConfig, HttpConfig};
    #[cfg(feature = "net")]
    pub use raffel_net::{serve_tcp, serve_udp, TcpConfig, UdpConfig, UdpHandle};
    #[cfg(feature = "ws")]
    pub use raffel_ws::{ws_router, ChannelDef, ChannelEngine, ChannelKind, WsConfig};
}
