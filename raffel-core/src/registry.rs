//! The registry — one table of typed procedures, streams, and events,
//! shared by every transport adapter.
//!
//! Names are dotted (`users.create`), unique across all three kinds, and
//! validated at registration. The registry freezes at server start; lookups
//! after that point take a read lock only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::error::Error;
use crate::stream::PayloadStream;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Boxed procedure handler: `(payload, ctx) → payload`.
pub type ProcedureFn =
    Arc<dyn Fn(Value, Arc<Context>) -> BoxFuture<Result<Value, Error>> + Send + Sync>;

/// Boxed stream handler: `(payload, ctx) → lazy sequence of payload`.
pub type StreamFn = Arc<dyn Fn(Value, Arc<Context>) -> PayloadStream + Send + Sync>;

/// Boxed event handler: `(payload, ctx) → ()`.
pub type EventFn =
    Arc<dyn Fn(Value, Arc<Context>) -> BoxFuture<Result<(), Error>> + Send + Sync>;

/// The three handler shapes, dispatched by kind in the router.
#[derive(Clone)]
pub enum Handler {
    Procedure(ProcedureFn),
    Stream(StreamFn),
    Event(EventFn),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Handler::Procedure(_) => HandlerKind::Procedure,
            Handler::Stream(_) => HandlerKind::Stream,
            Handler::Event(_) => HandlerKind::Event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Procedure,
    Stream,
    Event,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HandlerKind::Procedure => "procedure",
            HandlerKind::Stream => "stream",
            HandlerKind::Event => "event",
        })
    }
}

/// Stream direction, relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Server,
    Client,
    Bidi,
}

/// Event delivery contract. Best-effort is the default; at-least-once is a
/// registration-time promise the deployment must back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDelivery {
    BestEffort,
    AtLeastOnce,
}

/// Immutable description of a registered handler.
#[derive(Clone)]
pub struct HandlerDef {
    pub name: String,
    pub kind: HandlerKind,
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
    pub direction: Option<StreamDirection>,
    pub delivery: Option<EventDelivery>,
    pub content_type: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl HandlerDef {
    fn new(name: impl Into<String>, kind: HandlerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            input_schema: None,
            output_schema: None,
            direction: match kind {
                HandlerKind::Stream => Some(StreamDirection::Server),
                _ => None,
            },
            delivery: match kind {
                HandlerKind::Event => Some(EventDelivery::BestEffort),
                _ => None,
            },
            content_type: "application/json".to_string(),
            description: None,
            tags: Vec::new(),
        }
    }

    pub fn procedure(name: impl Into<String>) -> Self {
        Self::new(name, HandlerKind::Procedure)
    }

    pub fn stream(name: impl Into<String>) -> Self {
        Self::new(name, HandlerKind::Stream)
    }

    pub fn event(name: impl Into<String>) -> Self {
        Self::new(name, HandlerKind::Event)
    }

    pub fn input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn direction(mut self, direction: StreamDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn delivery(mut self, delivery: EventDelivery) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// `[a-zA-Z][a-zA-Z0-9_]*(\.[a-zA-Z][a-zA-Z0-9_]*)*`
pub fn valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.split('.').all(|segment| {
        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

struct Entry {
    def: HandlerDef,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Arc<Entry>>,
    /// Registration order, for stable documentation output.
    order: Vec<String>,
}

/// The name → handler table. Read-only after [`freeze`](Registry::freeze).
pub struct Registry {
    inner: RwLock<Inner>,
    frozen: AtomicBool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register a handler under its definition.
    ///
    /// Fails with `ALREADY_EXISTS` when the name is taken by any kind,
    /// `INVALID_ARGUMENT` for bad names or def/handler kind mismatches, and
    /// `FAILED_PRECONDITION` once the registry is frozen.
    pub fn register(&self, def: HandlerDef, handler: Handler) -> Result<(), Error> {
        if self.frozen.load(Ordering::Acquire) {
            return Err(Error::failed_precondition(
                "registry is frozen; register handlers before server start",
            ));
        }
        if !valid_name(&def.name) {
            return Err(Error::invalid_argument(format!(
                "invalid handler name {:?}",
                def.name
            )));
        }
        if def.kind != handler.kind() {
            return Err(Error::invalid_argument(format!(
                "definition kind {} does not match handler kind {}",
                def.kind,
                handler.kind()
            )));
        }

        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.entries.contains_key(&def.name) {
            return Err(Error::already_exists(format!(
                "handler {:?} is already registered",
                def.name
            )));
        }
        let name = def.name.clone();
        inner.order.push(name.clone());
        inner.entries.insert(name, Arc::new(Entry { def, handler }));
        Ok(())
    }

    /// Typed procedure registration: deserializes the payload into `I` and
    /// serializes the `O` result.
    pub fn procedure<I, O, F, Fut>(&self, def: HandlerDef, f: F) -> Result<(), Error>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: ProcedureFn = Arc::new(move |payload, ctx| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(payload)
                    .map_err(|e| Error::invalid_argument(format!("invalid payload: {e}")))?;
                let output = f(input, ctx).await?;
                serde_json::to_value(output)
                    .map_err(|e| Error::internal(format!("unserializable result: {e}")))
            })
        });
        self.register(def, Handler::Procedure(handler))
    }

    /// Typed stream registration: the handler returns any payload stream.
    pub fn stream<I, F>(&self, def: HandlerDef, f: F) -> Result<(), Error>
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, Arc<Context>) -> PayloadStream + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: StreamFn = Arc::new(move |payload, ctx| {
            match serde_json::from_value::<I>(payload) {
                Ok(input) => f(input, ctx),
                Err(e) => {
                    let err = Error::invalid_argument(format!("invalid payload: {e}"));
                    Box::pin(futures_util::stream::iter([Err(err)]))
                }
            }
        });
        self.register(def, Handler::Stream(handler))
    }

    /// Typed event registration.
    pub fn event<I, F, Fut>(&self, def: HandlerDef, f: F) -> Result<(), Error>
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, Arc<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: EventFn = Arc::new(move |payload, ctx| {
            let f = f.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(payload)
                    .map_err(|e| Error::invalid_argument(format!("invalid payload: {e}")))?;
                f(input, ctx).await
            })
        });
        self.register(def, Handler::Event(handler))
    }

    /// Look up a handler by name.
    pub fn lookup(&self, name: &str) -> Option<(HandlerDef, Handler)> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .entries
            .get(name)
            .map(|entry| (entry.def.clone(), entry.handler.clone()))
    }

    /// The definition only, for adapters that dispatch on kind.
    pub fn lookup_def(&self, name: &str) -> Option<HandlerDef> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner.entries.get(name).map(|entry| entry.def.clone())
    }

    /// All definitions of one kind, in registration order.
    pub fn list(&self, kind: HandlerKind) -> Vec<HandlerDef> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .order
            .iter()
            .filter_map(|name| inner.entries.get(name))
            .filter(|entry| entry.def.kind == kind)
            .map(|entry| entry.def.clone())
            .collect()
    }

    /// Freeze the registry. Called at server start; later registrations fail.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_procedure() -> Handler {
        Handler::Procedure(Arc::new(|payload, _ctx| {
            Box::pin(async move { Ok(payload) })
        }))
    }

    fn noop_event() -> Handler {
        Handler::Event(Arc::new(|_payload, _ctx| Box::pin(async { Ok(()) })))
    }

    #[test]
    fn name_grammar() {
        for ok in ["a", "users.create", "a1_b.c2", "Sys.reload_all"] {
            assert!(valid_name(ok), "{ok}");
        }
        for bad in ["", "1a", ".a", "a.", "a..b", "a-b", "a b", "a.1x"] {
            assert!(!valid_name(bad), "{bad}");
        }
    }

    #[test]
    fn duplicate_names_rejected_across_kinds() {
        let registry = Registry::new();
        registry
            .register(HandlerDef::procedure("users.create"), noop_procedure())
            .unwrap();
        let err = registry
            .register(HandlerDef::event("users.create"), noop_event())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::AlreadyExists);
    }

    #[test]
    fn kind_mismatch_rejected() {
        let registry = Registry::new();
        let err = registry
            .register(HandlerDef::event("audit.log"), noop_procedure())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidArgument);
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let registry = Registry::new();
        registry.freeze();
        let err = registry
            .register(HandlerDef::procedure("late"), noop_procedure())
            .unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::FailedPrecondition);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let registry = Registry::new();
        for name in ["c.third", "a.first", "b.second"] {
            registry
                .register(HandlerDef::procedure(name), noop_procedure())
                .unwrap();
        }
        registry
            .register(HandlerDef::event("audit.log"), noop_event())
            .unwrap();

        let names: Vec<String> = registry
            .list(HandlerKind::Procedure)
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, ["c.third", "a.first", "b.second"]);
        assert_eq!(registry.list(HandlerKind::Event).len(), 1);
    }

    #[tokio::test]
    async fn typed_procedure_deserializes_input() {
        #[derive(serde::Deserialize)]
        struct In {
            name: String,
        }
        #[derive(serde::Serialize)]
        struct Out {
            message: String,
        }

        let registry = Registry::new();
        registry
            .procedure(HandlerDef::procedure("greet"), |input: In, _ctx| async move {
                Ok(Out {
                    message: format!("Hello, {}!", input.name),
                })
            })
            .unwrap();

        let (_, handler) = registry.lookup("greet").unwrap();
        let Handler::Procedure(f) = handler else {
            panic!("expected procedure")
        };
        let ctx = Arc::new(crate::context::Context::detached("r1"));
        let out = f(json!({"name": "World"}), ctx).await.unwrap();
        assert_eq!(out, json!({"message": "Hello, World!"}));
    }
}
