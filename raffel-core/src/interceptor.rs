//! Interceptor chain — ordered middleware applied to every envelope.
//!
//! An interceptor wraps the next computation with an `around` pattern: it
//! may short-circuit by returning without calling [`Next::run`], wrap the
//! result, or attach extensions to the context. The chain is composed by
//! nesting, outermost first, in registration order.
//!
//! Contract: interceptors MUST propagate cancellation. A `CANCELLED` error
//! may be translated to another cancellation code but never swallowed.

use std::sync::{Arc, RwLock};

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::registry::BoxFuture;
use crate::stream::PayloadStream;

/// What a call produces before the adapter serializes it: a procedure
/// payload, a lazy stream, or an event acknowledgement.
pub enum Outcome {
    Payload(serde_json::Value),
    Stream(PayloadStream),
    Ack,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Payload(v) => f.debug_tuple("Payload").field(v).finish(),
            Outcome::Stream(_) => f.write_str("Stream(..)"),
            Outcome::Ack => f.write_str("Ack"),
        }
    }
}

/// The end of the chain: the handler invocation itself.
pub type Terminal =
    Arc<dyn Fn(Envelope, Arc<Context>) -> BoxFuture<Result<Outcome, Error>> + Send + Sync>;

/// The downstream remainder of a chain. Consumed by `run`; an interceptor
/// that never runs it short-circuits the call.
pub struct Next {
    chain: Arc<[Arc<dyn Intercept>]>,
    index: usize,
    terminal: Terminal,
}

impl Next {
    /// Invoke the next interceptor, or the handler at the end of the chain.
    pub fn run(self, envelope: Envelope, ctx: Arc<Context>) -> BoxFuture<Result<Outcome, Error>> {
        match self.chain.get(self.index) {
            Some(interceptor) => {
                let interceptor = interceptor.clone();
                let next = Next {
                    chain: self.chain.clone(),
                    index: self.index + 1,
                    terminal: self.terminal.clone(),
                };
                interceptor.around(envelope, ctx, next)
            }
            None => (self.terminal)(envelope, ctx),
        }
    }
}

/// Middleware wrapping every invocation.
pub trait Intercept: Send + Sync + 'static {
    fn around(
        &self,
        envelope: Envelope,
        ctx: Arc<Context>,
        next: Next,
    ) -> BoxFuture<Result<Outcome, Error>>;
}

/// Copy-on-write interceptor list. Registration swaps the snapshot; calls
/// in flight keep the chain they started with, so later registrations never
/// affect them.
pub struct InterceptorChain {
    list: RwLock<Arc<[Arc<dyn Intercept>]>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self {
            list: RwLock::new(Arc::from(Vec::<Arc<dyn Intercept>>::new())),
        }
    }

    /// Append an interceptor. Runs after all previously registered ones.
    pub fn register(&self, interceptor: Arc<dyn Intercept>) {
        let mut list = self.list.write().expect("interceptor list lock poisoned");
        let mut next: Vec<Arc<dyn Intercept>> = list.iter().cloned().collect();
        next.push(interceptor);
        *list = Arc::from(next);
    }

    /// Snapshot taken at call start.
    pub fn snapshot(&self) -> Arc<[Arc<dyn Intercept>]> {
        self.list.read().expect("interceptor list lock poisoned").clone()
    }

    /// Run `envelope` through a snapshot of the chain, ending at `terminal`.
    pub fn run(
        &self,
        envelope: Envelope,
        ctx: Arc<Context>,
        terminal: Terminal,
    ) -> BoxFuture<Result<Outcome, Error>> {
        let next = Next {
            chain: self.snapshot(),
            index: 0,
            terminal,
        };
        next.run(envelope, ctx)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InterceptorChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Tag(&'static str);

    impl Intercept for Tag {
        fn around(
            &self,
            mut envelope: Envelope,
            ctx: Arc<Context>,
            next: Next,
        ) -> BoxFuture<Result<Outcome, Error>> {
            let tag = self.0;
            envelope
                .metadata
                .insert(format!("tag-{tag}"), envelope.metadata.len().to_string());
            next.run(envelope, ctx)
        }
    }

    struct ShortCircuit;

    impl Intercept for ShortCircuit {
        fn around(
            &self,
            _envelope: Envelope,
            _ctx: Arc<Context>,
            _next: Next,
        ) -> BoxFuture<Result<Outcome, Error>> {
            Box::pin(async { Ok(Outcome::Payload(json!("short"))) })
        }
    }

    fn echo_terminal() -> Terminal {
        Arc::new(|envelope, _ctx| {
            Box::pin(async move { Ok(Outcome::Payload(json!(envelope.metadata))) })
        })
    }

    #[tokio::test]
    async fn runs_in_registration_order() {
        let chain = InterceptorChain::new();
        chain.register(Arc::new(Tag("a")));
        chain.register(Arc::new(Tag("b")));

        let ctx = Arc::new(Context::detached("r1"));
        let envelope = Envelope::request_with_id("r1", "x", json!(null));
        let out = chain.run(envelope, ctx, echo_terminal()).await.unwrap();
        let Outcome::Payload(meta) = out else {
            panic!("expected payload")
        };
        // "a" ran first (saw 0 entries), "b" second (saw 1).
        assert_eq!(meta["tag-a"], "0");
        assert_eq!(meta["tag-b"], "1");
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal() {
        let chain = InterceptorChain::new();
        chain.register(Arc::new(ShortCircuit));
        chain.register(Arc::new(Tag("never")));

        let ctx = Arc::new(Context::detached("r1"));
        let envelope = Envelope::request_with_id("r1", "x", json!(null));
        let out = chain.run(envelope, ctx, echo_terminal()).await.unwrap();
        match out {
            Outcome::Payload(v) => assert_eq!(v, json!("short")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_flight_calls_keep_their_snapshot() {
        let chain = Arc::new(InterceptorChain::new());
        chain.register(Arc::new(Tag("a")));

        let snapshot = chain.snapshot();
        chain.register(Arc::new(Tag("late")));

        // The pre-registration snapshot still has one entry.
        assert_eq!(snapshot.len(), 1);
        assert_eq!(chain.snapshot().len(), 2);
    }
}
