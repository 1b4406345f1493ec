//! Built-in interceptors: structured logging, timing, and rate limiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::interceptor::{Intercept, Next, Outcome};
use crate::registry::BoxFuture;

/// Log level for `Logged` and `Timed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

fn log_at_level(level: LogLevel, procedure: &str, msg: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(procedure = procedure, "{}", msg),
        LogLevel::Debug => tracing::debug!(procedure = procedure, "{}", msg),
        LogLevel::Info => tracing::info!(procedure = procedure, "{}", msg),
        LogLevel::Warn => tracing::warn!(procedure = procedure, "{}", msg),
        LogLevel::Error => tracing::error!(procedure = procedure, "{}", msg),
    }
}

// ---------------------------------------------------------------------------
// Logged
// ---------------------------------------------------------------------------

/// Logs entry and outcome of every call at the specified level.
pub struct Logged {
    pub level: LogLevel,
}

impl Logged {
    pub fn new() -> Self {
        Logged { level: LogLevel::Info }
    }
    pub fn info() -> Self {
        Logged { level: LogLevel::Info }
    }
    pub fn debug() -> Self {
        Logged { level: LogLevel::Debug }
    }
    pub fn level(level: LogLevel) -> Self {
        Logged { level }
    }
}

impl Default for Logged {
    fn default() -> Self {
        Self::new()
    }
}

impl Intercept for Logged {
    fn around(
        &self,
        envelope: Envelope,
        ctx: Arc<Context>,
        next: Next,
    ) -> BoxFuture<Result<Outcome, Error>> {
        let level = self.level;
        Box::pin(async move {
            let procedure = envelope.procedure.clone().unwrap_or_default();
            log_at_level(level, &procedure, "entering");
            let result = next.run(envelope, ctx).await;
            match &result {
                Ok(_) => log_at_level(level, &procedure, "ok"),
                Err(e) => log_at_level(level, &procedure, &format!("error code={}", e.code)),
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Timed
// ---------------------------------------------------------------------------

/// Measures and logs call duration.
///
/// If `threshold_ms` is set, only logs when the call exceeds the threshold.
pub struct Timed {
    pub level: LogLevel,
    pub threshold_ms: Option<u64>,
}

impl Timed {
    pub fn new() -> Self {
        Timed { level: LogLevel::Info, threshold_ms: None }
    }
    pub fn threshold(ms: u64) -> Self {
        Timed { level: LogLevel::Info, threshold_ms: Some(ms) }
    }
    pub fn threshold_warn(ms: u64) -> Self {
        Timed { level: LogLevel::Warn, threshold_ms: Some(ms) }
    }
}

impl Default for Timed {
    fn default() -> Self {
        Self::new()
    }
}

impl Intercept for Timed {
    fn around(
        &self,
        envelope: Envelope,
        ctx: Arc<Context>,
        next: Next,
    ) -> BoxFuture<Result<Outcome, Error>> {
        let level = self.level;
        let threshold_ms = self.threshold_ms;
        Box::pin(async move {
            let procedure = envelope.procedure.clone().unwrap_or_default();
            let start = Instant::now();
            let result = next.run(envelope, ctx).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match threshold_ms {
                Some(threshold) if elapsed_ms <= threshold => {}
                _ => log_at_level(level, &procedure, &format!("elapsed_ms={elapsed_ms}")),
            }
            result
        })
    }
}

// ---------------------------------------------------------------------------
// RateLimit
// ---------------------------------------------------------------------------

/// Rate-limit outcome attached to the call context. The HTTP adapter turns
/// this into `X-RateLimit-*` headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Refill tokens based on elapsed time and try to consume one.
/// Returns `(consumed, remaining_whole_tokens)`.
fn refill_and_try_consume(
    tokens: &mut f64,
    last_refill: &mut Instant,
    max_tokens: f64,
    window: Duration,
) -> (bool, u64) {
    let now = Instant::now();
    let elapsed = now.duration_since(*last_refill);
    let refill = (elapsed.as_secs_f64() / window.as_secs_f64()) * max_tokens;
    *tokens = (*tokens + refill).min(max_tokens);
    *last_refill = now;

    if *tokens >= 1.0 {
        *tokens -= 1.0;
        (true, *tokens as u64)
    } else {
        (false, 0)
    }
}

/// Token-bucket rate limiter keyed by procedure plus principal.
///
/// Each key gets its own independent bucket that refills continuously over
/// the window. Denied calls fail with `RATE_LIMITED`; the `details` carry
/// `limit`, `remaining`, and `retry_after_secs` so adapters can emit
/// `Retry-After`.
pub struct RateLimit {
    buckets: DashMap<String, TokenBucket>,
    max_tokens: f64,
    window: Duration,
}

impl RateLimit {
    /// Allow `max` calls per `window` per key.
    pub fn new(max: u64, window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            max_tokens: max as f64,
            window,
        }
    }

    /// Allow `max` calls per minute per key.
    pub fn per_minute(max: u64) -> Self {
        Self::new(max, Duration::from_secs(60))
    }

    fn key(&self, envelope: &Envelope, ctx: &Context) -> String {
        let procedure = envelope.procedure.as_deref().unwrap_or("");
        match ctx.auth() {
            Some(auth) => format!("{procedure}\u{1f}{}", auth.principal),
            None => procedure.to_string(),
        }
    }

    fn try_acquire(&self, key: &str) -> (bool, u64) {
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| TokenBucket {
            tokens: self.max_tokens,
            last_refill: Instant::now(),
        });
        let bucket = entry.value_mut();
        refill_and_try_consume(
            &mut bucket.tokens,
            &mut bucket.last_refill,
            self.max_tokens,
            self.window,
        )
    }
}

impl Intercept for RateLimit {
    fn around(
        &self,
        envelope: Envelope,
        ctx: Arc<Context>,
        next: Next,
    ) -> BoxFuture<Result<Outcome, Error>> {
        let key = self.key(&envelope, &ctx);
        let (allowed, remaining) = self.try_acquire(&key);
        let limit = self.max_tokens as u64;
        let retry_after_secs = self.window.as_secs().max(1);
        Box::pin(async move {
            ctx.extensions().insert(RateLimitInfo { limit, remaining });
            if !allowed {
                return Err(Error::rate_limited("rate limit exceeded").with_details(
                    serde_json::json!({
                        "limit": limit,
                        "remaining": 0,
                        "retry_after_secs": retry_after_secs,
                    }),
                ));
            }
            next.run(envelope, ctx).await
        })
    }
}
