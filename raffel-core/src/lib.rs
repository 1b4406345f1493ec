//! Protocol-agnostic core of the Raffel service framework.
//!
//! One registry of typed procedures, streams, and events; a router that
//! validates, runs the interceptor chain, and maps errors; a stream engine
//! owning the termination contract; and the collaborator seams (validator,
//! tracer, metrics, auth) that adapters and deployments plug into.
//!
//! Transport adapters live in their own crates (`raffel-http`, `raffel-ws`,
//! `raffel-net`) and speak to this core exclusively through
//! [`Envelope`](envelope::Envelope) and [`Router::handle`](router::Router::handle).

pub mod auth;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod interceptor;
pub mod interceptors;
pub mod lifecycle;
pub mod observe;
pub mod prelude;
pub mod registry;
pub mod router;
pub mod stream;
pub mod validate;

pub use auth::AuthStrategy;
pub use config::{init_tracing, ConfigError, ServerConfig};
pub use context::{AuthRecord, CancelCause, Context, Extensions, TraceContext};
pub use envelope::{Envelope, EnvelopeKind};
pub use error::{Error, ErrorCode};
pub use interceptor::{Intercept, InterceptorChain, Next, Outcome};
pub use interceptors::{LogLevel, Logged, RateLimit, RateLimitInfo, Timed};
pub use lifecycle::{shutdown_signal, ServerHandle};
pub use observe::{MetricSink, NoopMetricSink, Span, SpanKind, Tracer};
pub use registry::{
    EventDelivery, Handler, HandlerDef, HandlerKind, Registry, StreamDirection,
};
pub use router::{CallOptions, Reply, Router};
pub use stream::{EnvelopeFrames, PayloadStream, Producer};
pub use validate::{schema_of, Diagnostic, Validator};
