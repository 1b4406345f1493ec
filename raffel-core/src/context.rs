//! Per-call context: request id, cancellation, deadline, auth, tracing, and
//! typed extensions.
//!
//! A [`Context`] lives for exactly one call. Adapters create one per inbound
//! envelope (linking the connection's cancellation token), interceptors may
//! attach data for handlers via [`Extensions`], and the whole thing is
//! discarded once the response is sent or the stream closes.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// The authenticated caller, if any. Placed in the context's auth slot by
/// an auth interceptor.
#[derive(Debug, Clone)]
pub struct AuthRecord {
    pub principal: String,
    pub roles: Vec<String>,
    pub claims: Value,
}

impl AuthRecord {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            roles: Vec::new(),
            claims: Value::Null,
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = roles;
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Distributed-tracing slot. Populated by a tracing interceptor from the
/// injected `Tracer`'s `extract`.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

/// Why a context was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    Disconnect,
    Deadline,
    Shutdown,
    StreamClosed,
}

impl CancelCause {
    pub fn reason(self) -> &'static str {
        match self {
            CancelCause::Disconnect => "client disconnected",
            CancelCause::Deadline => "deadline exceeded",
            CancelCause::Shutdown => "server shutting down",
            CancelCause::StreamClosed => "stream closed",
        }
    }
}

/// Open-ended, `TypeId`-keyed extension map used by interceptors to pass
/// data to handlers. Values must be `Clone` so reads hand out copies while
/// the map stays shareable behind `Arc<Context>`.
#[derive(Default)]
pub struct Extensions {
    inner: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) {
        self.inner
            .lock()
            .expect("extensions lock poisoned")
            .insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner
            .lock()
            .expect("extensions lock poisoned")
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
            .cloned()
    }

    pub fn contains<T: Clone + Send + Sync + 'static>(&self) -> bool {
        self.inner
            .lock()
            .expect("extensions lock poisoned")
            .contains_key(&TypeId::of::<T>())
    }
}

impl std::fmt::Debug for Extensions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Extensions").field("len", &len).finish()
    }
}

/// Per-call scoped state. Two contexts are never shared across calls.
pub struct Context {
    request_id: String,
    token: CancellationToken,
    deadline: Option<Instant>,
    cancel_cause: Mutex<Option<CancelCause>>,
    auth: Mutex<Option<AuthRecord>>,
    trace: Mutex<Option<TraceContext>>,
    extensions: Extensions,
}

impl Context {
    /// Create a context whose cancellation token is a child of the adapter's
    /// token, so connection-level and server-level cancellation propagate in.
    pub fn new(request_id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self::for_call(request_id, parent, Extensions::new())
    }

    /// Create a context with adapter-seeded extensions (e.g. transport
    /// headers placed under a typed key).
    pub fn for_call(
        request_id: impl Into<String>,
        parent: &CancellationToken,
        extensions: Extensions,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            token: parent.child_token(),
            deadline: None,
            cancel_cause: Mutex::new(None),
            auth: Mutex::new(None),
            trace: Mutex::new(None),
            extensions,
        }
    }

    /// A detached context for tests and internal calls.
    pub fn detached(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            token: CancellationToken::new(),
            deadline: None,
            cancel_cause: Mutex::new(None),
            auth: Mutex::new(None),
            trace: Mutex::new(None),
            extensions: Extensions::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Arm a deadline. The returned context cancels itself (cause
    /// [`CancelCause::Deadline`]) once the deadline passes. Must be called
    /// before the context is shared.
    pub fn with_deadline(mut self, deadline: Instant) -> Arc<Self> {
        self.deadline = Some(deadline);
        let ctx = Arc::new(self);
        let watchdog = Arc::downgrade(&ctx);
        let token = ctx.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    if let Some(ctx) = watchdog.upgrade() {
                        ctx.cancel(CancelCause::Deadline);
                    }
                }
            }
        });
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Cancel this call, recording the cause. The first cause wins.
    pub fn cancel(&self, cause: CancelCause) {
        {
            let mut slot = self.cancel_cause.lock().expect("cancel cause lock poisoned");
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the call is cancelled (disconnect, deadline, stream
    /// close, or server shutdown). Handlers must observe this and stop
    /// producing promptly.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Why this context was cancelled, when the cause was recorded locally.
    /// Cancellation arriving through the parent token has no local cause.
    pub fn cancel_cause(&self) -> Option<CancelCause> {
        *self.cancel_cause.lock().expect("cancel cause lock poisoned")
    }

    /// The underlying token, for handing to spawned producer tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn auth(&self) -> Option<AuthRecord> {
        self.auth.lock().expect("auth lock poisoned").clone()
    }

    pub fn set_auth(&self, record: AuthRecord) {
        *self.auth.lock().expect("auth lock poisoned") = Some(record);
    }

    pub fn trace(&self) -> Option<TraceContext> {
        self.trace.lock().expect("trace lock poisoned").clone()
    }

    pub fn set_trace(&self, trace: TraceContext) {
        *self.trace.lock().expect("trace lock poisoned") = Some(trace);
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // The call is over; fire any outstanding cancellation so producer
        // tasks holding a clone of the token stop.
        self.token.cancel();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.request_id)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_token_propagates_parent_cancellation() {
        let parent = CancellationToken::new();
        let ctx = Context::new("r1", &parent);
        assert!(!ctx.is_cancelled());
        parent.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_cancels_with_cause() {
        let parent = CancellationToken::new();
        let ctx = Context::new("r1", &parent)
            .with_deadline(Instant::now() + Duration::from_millis(10));
        ctx.cancelled().await;
        assert_eq!(ctx.cancel_cause(), Some(CancelCause::Deadline));
    }

    #[tokio::test]
    async fn first_cancel_cause_wins() {
        let ctx = Context::detached("r1");
        ctx.cancel(CancelCause::Disconnect);
        ctx.cancel(CancelCause::Shutdown);
        assert_eq!(ctx.cancel_cause(), Some(CancelCause::Disconnect));
    }

    #[test]
    fn extensions_store_typed_values() {
        #[derive(Clone, PartialEq, Debug)]
        struct Marker(u32);

        let ctx = Context::detached("r1");
        assert!(ctx.extensions().get::<Marker>().is_none());
        ctx.extensions().insert(Marker(7));
        assert_eq!(ctx.extensions().get::<Marker>(), Some(Marker(7)));
    }

    #[test]
    fn auth_slot_is_settable_once_shared() {
        let ctx = Arc::new(Context::detached("r1"));
        ctx.set_auth(AuthRecord::new("alice").with_roles(vec!["admin".into()]));
        let auth = ctx.auth().expect("auth should be set");
        assert_eq!(auth.principal, "alice");
        assert!(auth.has_role("admin"));
    }
}
