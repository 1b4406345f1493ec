//! The router: resolves a name, validates, runs the interceptor chain
//! around the handler, and maps every failure into the error taxonomy.
//!
//! Adapters hand the router an inbound envelope plus [`CallOptions`] (the
//! adapter-side cancellation source, optional deadline, pre-verified auth,
//! seeded extensions) and get back a [`Reply`] to serialize: a response
//! envelope, a lazy frame stream, or an error envelope.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::{AuthRecord, CancelCause, Context, Extensions};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{Error, ErrorCode};
use crate::interceptor::{Intercept, InterceptorChain, Outcome};
use crate::observe::{MetricSink, NoopMetricSink, Tracer};
use crate::registry::{Handler, HandlerKind, Registry};
use crate::stream::EnvelopeFrames;
use crate::validate::Validator;

/// Adapter-supplied inputs for one call.
pub struct CallOptions {
    /// Cancellation source: client disconnect, connection close, shutdown.
    pub cancellation: CancellationToken,
    /// Absolute deadline, if the adapter enforces one.
    pub deadline: Option<Instant>,
    /// Pre-verified caller identity.
    pub auth: Option<AuthRecord>,
    /// Extensions seeded by the adapter (e.g. transport headers).
    pub extensions: Extensions,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
            auth: None,
            extensions: Extensions::new(),
        }
    }
}

impl CallOptions {
    pub fn cancelled_by(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..Self::default()
        }
    }
}

/// What the adapter serializes back to its wire format.
pub enum Reply {
    /// Procedure response or event acknowledgement.
    Response { envelope: Envelope, ctx: Arc<Context> },
    /// Lazy stream of `stream:data` / `stream:end` / `stream:error` frames.
    Stream(EnvelopeFrames),
    /// Error envelope (id = `<request id>:error`).
    Error(Envelope),
}

impl Reply {
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Reply::Error(envelope) => Some(Error::from_payload(&envelope.payload).code),
            _ => None,
        }
    }
}

/// The protocol-agnostic request pipeline.
pub struct Router {
    registry: Arc<Registry>,
    chain: InterceptorChain,
    validator: Option<Arc<dyn Validator>>,
    tracer: Option<Arc<dyn Tracer>>,
    metrics: Arc<dyn MetricSink>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            chain: InterceptorChain::new(),
            validator: None,
            tracer: None,
            metrics: Arc::new(NoopMetricSink),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Append an interceptor. In-flight calls keep the chain they started
    /// with; only new calls observe the registration.
    pub fn intercept(&self, interceptor: Arc<dyn Intercept>) {
        self.chain.register(interceptor);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn error_reply(&self, envelope: &Envelope, error: Error) -> Reply {
        self.metrics.counter(
            "raffel_calls_total",
            1,
            &[
                ("procedure", envelope.procedure.as_deref().unwrap_or("")),
                ("code", error.code.as_str()),
            ],
        );
        Reply::Error(Envelope::error_for(
            &envelope.id,
            envelope.procedure.clone(),
            &error,
        ))
    }

    /// Route one inbound envelope.
    pub async fn handle(&self, envelope: Envelope, opts: CallOptions) -> Reply {
        if !envelope.kind.is_inbound() {
            return self.error_reply(
                &envelope,
                Error::invalid_envelope(format!(
                    "cannot route a {} envelope",
                    envelope.kind
                )),
            );
        }
        let procedure = match envelope.procedure.clone() {
            Some(p) => p,
            None => {
                return self.error_reply(
                    &envelope,
                    Error::invalid_envelope("inbound envelope requires a procedure"),
                )
            }
        };

        let (def, handler) = match self.registry.lookup(&procedure) {
            Some(found) => found,
            None => {
                return self.error_reply(
                    &envelope,
                    Error::not_found(format!("unknown procedure {procedure:?}")),
                )
            }
        };

        let expected = match def.kind {
            HandlerKind::Procedure => EnvelopeKind::Request,
            HandlerKind::Stream => EnvelopeKind::StreamStart,
            HandlerKind::Event => EnvelopeKind::Event,
        };
        if envelope.kind != expected {
            return self.error_reply(
                &envelope,
                Error::invalid_argument(format!(
                    "{procedure:?} is a {}; expected a {} envelope",
                    def.kind, expected
                )),
            );
        }

        // Input validation, before any handler work.
        let mut call_envelope = envelope.clone();
        if let (Some(validator), Some(schema)) = (&self.validator, &def.input_schema) {
            match validator.validate(schema, call_envelope.payload) {
                Ok(coerced) => call_envelope.payload = coerced,
                Err(diagnostic) => {
                    return self.error_reply(
                        &envelope,
                        Error::validation("payload failed validation")
                            .with_details(diagnostic.into_details()),
                    )
                }
            }
        }

        // Per-call context, linked to the adapter's cancellation source.
        let ctx = Context::for_call(envelope.id.clone(), &opts.cancellation, opts.extensions);
        let ctx = match opts.deadline {
            Some(deadline) => ctx.with_deadline(deadline),
            None => Arc::new(ctx),
        };
        if let Some(auth) = opts.auth {
            ctx.set_auth(auth);
        }
        if let Some(tracer) = &self.tracer {
            if let Some(trace) = tracer.extract(&envelope.metadata) {
                ctx.set_trace(trace);
            }
        }

        // The terminal step of the chain is the handler itself.
        let terminal: crate::interceptor::Terminal = match handler {
            Handler::Procedure(f) => Arc::new(move |env, ctx| {
                let f = f.clone();
                Box::pin(async move { f(env.payload, ctx).await.map(Outcome::Payload) })
            }),
            Handler::Stream(f) => Arc::new(move |env, ctx| {
                let f = f.clone();
                Box::pin(async move { Ok(Outcome::Stream(f(env.payload, ctx))) })
            }),
            Handler::Event(f) => Arc::new(move |env, ctx| {
                let f = f.clone();
                Box::pin(async move { f(env.payload, ctx).await.map(|_| Outcome::Ack) })
            }),
        };

        // Each invocation runs in its own task: a slow handler never blocks
        // the connection's next frame, and a panic is contained as a
        // JoinError instead of tearing down the adapter.
        let invocation = self.chain.run(call_envelope, ctx.clone(), terminal);
        let mut join = tokio::spawn(invocation);
        let outcome = tokio::select! {
            biased;
            joined = &mut join => match joined {
                Ok(result) => result,
                Err(join_error) => {
                    if join_error.is_panic() {
                        tracing::error!(procedure = %procedure, "handler panicked");
                    }
                    Err(Error::internal("handler failed"))
                }
            },
            _ = ctx.cancelled() => {
                join.abort();
                Err(cancellation_error(&ctx))
            }
        };

        match outcome {
            Ok(Outcome::Payload(value)) => {
                let value = match (&self.validator, &def.output_schema) {
                    (Some(validator), Some(schema)) => match validator.validate(schema, value) {
                        Ok(coerced) => coerced,
                        Err(diagnostic) => {
                            return self.error_reply(
                                &envelope,
                                Error::new(
                                    ErrorCode::OutputValidationError,
                                    "result failed output validation",
                                )
                                .with_details(diagnostic.into_details()),
                            )
                        }
                    },
                    _ => value,
                };
                self.count_ok(&procedure);
                Reply::Response {
                    envelope: envelope.response(value),
                    ctx,
                }
            }
            Ok(Outcome::Stream(stream)) => {
                self.count_ok(&procedure);
                Reply::Stream(EnvelopeFrames::new(
                    ctx,
                    Some(procedure),
                    stream,
                    self.validator.clone(),
                    def.output_schema.clone(),
                ))
            }
            Ok(Outcome::Ack) => {
                self.count_ok(&procedure);
                Reply::Response {
                    envelope: envelope.response(Value::Null),
                    ctx,
                }
            }
            Err(error) if def.kind == HandlerKind::Event && !error.is_cancellation() => {
                // Events are fire-and-forget: handler errors go to the log,
                // the caller still gets its acknowledgement.
                tracing::warn!(
                    procedure = %procedure,
                    code = %error.code,
                    "event handler failed: {}",
                    error.message
                );
                self.count_ok(&procedure);
                Reply::Response {
                    envelope: envelope.response(Value::Null),
                    ctx,
                }
            }
            Err(error) => self.error_reply(&envelope, error),
        }
    }

    fn count_ok(&self, procedure: &str) {
        self.metrics.counter(
            "raffel_calls_total",
            1,
            &[("procedure", procedure), ("code", "OK")],
        );
    }
}

fn cancellation_error(ctx: &Context) -> Error {
    match ctx.cancel_cause() {
        Some(CancelCause::Deadline) => Error::deadline_exceeded("call deadline exceeded"),
        Some(cause) => Error::cancelled(cause.reason()),
        None => Error::cancelled("call cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerDef;
    use crate::stream;
    use crate::validate::Diagnostic;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    fn router_with_greet() -> Router {
        let registry = Arc::new(Registry::new());
        registry
            .procedure(
                HandlerDef::procedure("greet"),
                |input: serde_json::Map<String, Value>, _ctx| async move {
                    let name = input.get("name").and_then(Value::as_str).unwrap_or("?");
                    Ok(json!({ "message": format!("Hello, {name}!") }))
                },
            )
            .unwrap();
        Router::new(registry)
    }

    #[tokio::test]
    async fn procedure_response_id_has_response_suffix() {
        let router = router_with_greet();
        let reply = router
            .handle(
                Envelope::request_with_id("r1", "greet", json!({"name": "World"})),
                CallOptions::default(),
            )
            .await;
        match reply {
            Reply::Response { envelope, .. } => {
                assert_eq!(envelope.id, "r1:response");
                assert_eq!(envelope.payload, json!({"message": "Hello, World!"}));
            }
            _ => panic!("expected response"),
        }
    }

    #[tokio::test]
    async fn unknown_procedure_is_not_found() {
        let router = router_with_greet();
        let reply = router
            .handle(
                Envelope::request_with_id("r1", "nope", json!(null)),
                CallOptions::default(),
            )
            .await;
        match reply {
            Reply::Error(envelope) => {
                assert_eq!(envelope.id, "r1:error");
                assert_eq!(envelope.payload["code"], "NOT_FOUND");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn kind_mismatch_is_invalid_argument() {
        let router = router_with_greet();
        // A stream:start for a registered procedure.
        let mut envelope = Envelope::request_with_id("r1", "greet", json!(null));
        envelope.kind = EnvelopeKind::StreamStart;
        let reply = router.handle(envelope, CallOptions::default()).await;
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidArgument));
    }

    struct RequireName;

    impl Validator for RequireName {
        fn validate(&self, _schema: &Value, value: Value) -> Result<Value, Diagnostic> {
            if value.get("name").map(|v| v.is_string()).unwrap_or(false) {
                Ok(value)
            } else {
                Err(Diagnostic::new("name is required"))
            }
        }
    }

    #[tokio::test]
    async fn input_validation_failure_reports_diagnostic() {
        let registry = Arc::new(Registry::new());
        registry
            .procedure(
                HandlerDef::procedure("greet").input_schema(json!({"type": "object"})),
                |input: Value, _ctx| async move { Ok(input) },
            )
            .unwrap();
        let router = Router::new(registry).with_validator(Arc::new(RequireName));

        let reply = router
            .handle(
                Envelope::request_with_id("r1", "greet", json!({})),
                CallOptions::default(),
            )
            .await;
        match reply {
            Reply::Error(envelope) => {
                assert_eq!(envelope.payload["code"], "VALIDATION_ERROR");
                assert_eq!(envelope.payload["details"]["message"], "name is required");
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn stream_reply_produces_frames() {
        let registry = Arc::new(Registry::new());
        registry
            .stream(HandlerDef::stream("counter"), |input: Value, _ctx| {
                let count = input.get("count").and_then(Value::as_u64).unwrap_or(0);
                stream::from_iter((1..=count).map(|v| json!({"value": v})))
            })
            .unwrap();
        let router = Router::new(registry);

        let reply = router
            .handle(
                Envelope::stream_start("counter", json!({"count": 2})),
                CallOptions::default(),
            )
            .await;
        let Reply::Stream(frames) = reply else {
            panic!("expected stream")
        };
        let collected: Vec<Envelope> = frames.collect().await;
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[2].kind, EnvelopeKind::StreamEnd);
    }

    #[tokio::test]
    async fn event_handler_errors_are_swallowed() {
        let registry = Arc::new(Registry::new());
        registry
            .event(HandlerDef::event("audit.log"), |_input: Value, _ctx| async {
                Err(Error::internal("backend down"))
            })
            .unwrap();
        let router = Router::new(registry);

        let reply = router
            .handle(
                Envelope::event("audit.log", json!({"entry": 1})),
                CallOptions::default(),
            )
            .await;
        match reply {
            Reply::Response { envelope, .. } => assert!(envelope.payload.is_null()),
            _ => panic!("expected acknowledgement"),
        }
    }

    fn boom() -> Result<Value, Error> {
        panic!("secret detail")
    }

    #[tokio::test]
    async fn panicking_handler_maps_to_internal_without_detail() {
        let registry = Arc::new(Registry::new());
        registry
            .procedure(HandlerDef::procedure("boom"), |_input: Value, _ctx| async {
                boom()
            })
            .unwrap();
        let router = Router::new(registry);

        let reply = router
            .handle(
                Envelope::request_with_id("r1", "boom", json!(null)),
                CallOptions::default(),
            )
            .await;
        match reply {
            Reply::Error(envelope) => {
                assert_eq!(envelope.payload["code"], "INTERNAL_ERROR");
                let message = envelope.payload["message"].as_str().unwrap();
                assert!(!message.contains("secret"));
            }
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn adapter_cancellation_maps_to_cancelled() {
        let registry = Arc::new(Registry::new());
        registry
            .procedure(HandlerDef::procedure("slow"), |_input: Value, ctx| async move {
                ctx.cancelled().await;
                Err::<(), Error>(Error::cancelled("observed"))
            })
            .unwrap();
        let router = Router::new(registry);

        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let reply = router
            .handle(
                Envelope::request_with_id("r1", "slow", json!(null)),
                CallOptions::cancelled_by(token),
            )
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::Cancelled));
    }

    #[tokio::test]
    async fn deadline_maps_to_deadline_exceeded() {
        let registry = Arc::new(Registry::new());
        registry
            .procedure(HandlerDef::procedure("slow"), |_input: Value, _ctx| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            })
            .unwrap();
        let router = Router::new(registry);

        let opts = CallOptions {
            deadline: Some(Instant::now() + Duration::from_millis(20)),
            ..CallOptions::default()
        };
        let reply = router
            .handle(Envelope::request_with_id("r1", "slow", json!(null)), opts)
            .await;
        assert_eq!(reply.error_code(), Some(ErrorCode::DeadlineExceeded));
    }
}
