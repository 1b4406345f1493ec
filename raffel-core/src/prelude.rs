//! Raffel core prelude — import everything a server assembly needs with a
//! single `use`.
//!
//! ```ignore
//! use raffel_core::prelude::*;
//!
//! let registry = Arc::new(Registry::new());
//! registry.procedure(
//!     HandlerDef::procedure("greet").input_schema(schema_of::<Greeting>()),
//!     |input: Greeting, _ctx| async move {
//!         Ok(serde_json::json!({ "message": format!("Hello, {}!", input.name) }))
//!     },
//! )?;
//! let router = Arc::new(Router::new(registry));
//! ```

pub use crate::config::{init_tracing, ServerConfig};
pub use crate::context::{AuthRecord, CancelCause, Context, Extensions, TraceContext};
pub use crate::envelope::{Envelope, EnvelopeKind};
pub use crate::error::{Error, ErrorCode};
pub use crate::interceptor::{Intercept, Next, Outcome};
pub use crate::interceptors::{Logged, RateLimit, Timed};
pub use crate::lifecycle::{shutdown_signal, ServerHandle};
pub use crate::registry::{
    EventDelivery, Handler, HandlerDef, HandlerKind, Registry, StreamDirection,
};
pub use crate::router::{CallOptions, Reply, Router};
pub use crate::stream::PayloadStream;
pub use crate::validate::{schema_of, Validator};
