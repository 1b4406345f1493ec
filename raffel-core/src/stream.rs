//! Stream engine — lazy producer sequences and the envelope-frame wrapper
//! that owns the termination contract.
//!
//! A stream handler returns a [`PayloadStream`]: a lazy sequence of payload
//! items. Adapters never consume it directly; the router wraps it into
//! [`EnvelopeFrames`], which
//!
//! - emits one `stream:data` frame per produced item (validated against the
//!   output schema when one is present),
//! - emits exactly one `stream:end` frame on normal completion (an empty
//!   stream is valid and yields only the `end` frame),
//! - emits exactly one `stream:error` frame when the producer fails or an
//!   item fails output validation, and
//! - stops without emitting further frames once the call's context is
//!   cancelled.
//!
//! The engine does not buffer; backpressure is whatever the consuming
//! adapter's socket write provides.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures_core::Stream;
use futures_util::stream::{CatchUnwind, StreamExt};
use serde_json::Value;
use tokio_util::sync::{DropGuard, WaitForCancellationFutureOwned};

use crate::context::Context;
use crate::envelope::Envelope;
use crate::error::{Error, ErrorCode};
use crate::validate::Validator;

/// A lazy sequence of payload items, as produced by a stream handler.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Result<Value, Error>> + Send>>;

/// Wrap any compatible stream into a [`PayloadStream`].
pub fn from_stream<S>(stream: S) -> PayloadStream
where
    S: Stream<Item = Result<Value, Error>> + Send + 'static,
{
    Box::pin(stream)
}

/// A finite stream over in-memory items.
pub fn from_iter<I>(items: I) -> PayloadStream
where
    I: IntoIterator<Item = Value>,
    I::IntoIter: Send + 'static,
{
    Box::pin(futures_util::stream::iter(items.into_iter().map(Ok)))
}

/// A single-item stream.
pub fn once(value: Value) -> PayloadStream {
    from_iter([value])
}

/// A stream that completes immediately. Yields only a `stream:end` frame.
pub fn empty() -> PayloadStream {
    from_iter([])
}

/// A bounded producer/stream pair for handlers that push items from a task.
///
/// The channel capacity is the only buffering between the producer and the
/// consuming adapter; `send` suspends when the consumer is slow.
pub fn producer(capacity: usize) -> (Producer, PayloadStream) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    let stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    (Producer { tx }, Box::pin(stream))
}

/// Push side of a [`producer`] stream.
#[derive(Clone)]
pub struct Producer {
    tx: tokio::sync::mpsc::Sender<Result<Value, Error>>,
}

impl Producer {
    /// Push one item. Fails with `CANCELLED` once the consumer is gone.
    pub async fn send(&self, value: Value) -> Result<(), Error> {
        self.tx
            .send(Ok(value))
            .await
            .map_err(|_| Error::cancelled("stream consumer gone"))
    }

    /// Terminate the stream with an error frame.
    pub async fn fail(&self, error: Error) {
        let _ = self.tx.send(Err(error)).await;
    }
}

enum FrameState {
    Streaming,
    Done,
}

/// The envelope-frame view of a payload stream. `Stream<Item = Envelope>`.
pub struct EnvelopeFrames {
    request_id: String,
    procedure: Option<String>,
    ctx: Arc<Context>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    inner: CatchUnwind<AssertUnwindSafe<PayloadStream>>,
    validator: Option<Arc<dyn Validator>>,
    output_schema: Option<Value>,
    state: FrameState,
    _disconnect_guard: Option<DropGuard>,
}

impl EnvelopeFrames {
    pub fn new(
        ctx: Arc<Context>,
        procedure: Option<String>,
        stream: PayloadStream,
        validator: Option<Arc<dyn Validator>>,
        output_schema: Option<Value>,
    ) -> Self {
        let request_id = ctx.request_id().to_string();
        let cancelled = Box::pin(ctx.cancellation_token().cancelled_owned());
        Self {
            request_id,
            procedure,
            cancelled,
            ctx,
            inner: AssertUnwindSafe(stream).catch_unwind(),
            validator,
            output_schema,
            state: FrameState::Streaming,
            _disconnect_guard: None,
        }
    }

    /// Attach a guard that cancels the call's context when the adapter drops
    /// this stream (client disconnect before completion).
    pub fn with_disconnect_guard(mut self, guard: DropGuard) -> Self {
        self._disconnect_guard = Some(guard);
        self
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    fn data_frame(&self, value: Value) -> Envelope {
        Envelope::stream_data(&self.request_id, self.procedure.clone(), value)
    }

    fn error_frame(&self, error: &Error) -> Envelope {
        Envelope::stream_error(&self.request_id, self.procedure.clone(), error)
    }
}

impl Stream for EnvelopeFrames {
    type Item = Envelope;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Envelope>> {
        let this = self.get_mut();

        if matches!(this.state, FrameState::Done) {
            return Poll::Ready(None);
        }

        // Cancellation terminates iteration without emitting further frames.
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.state = FrameState::Done;
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(Ok(value)))) => {
                let value = match (&this.validator, &this.output_schema) {
                    (Some(validator), Some(schema)) => match validator.validate(schema, value) {
                        Ok(coerced) => coerced,
                        Err(diagnostic) => {
                            this.state = FrameState::Done;
                            let error = Error::new(
                                ErrorCode::OutputValidationError,
                                "stream item failed output validation",
                            )
                            .with_details(diagnostic.into_details());
                            return Poll::Ready(Some(this.error_frame(&error)));
                        }
                    },
                    _ => value,
                };
                Poll::Ready(Some(this.data_frame(value)))
            }
            Poll::Ready(Some(Ok(Err(error)))) => {
                this.state = FrameState::Done;
                Poll::Ready(Some(this.error_frame(&error)))
            }
            Poll::Ready(Some(Err(_panic))) => {
                this.state = FrameState::Done;
                tracing::error!(
                    request_id = %this.request_id,
                    procedure = this.procedure.as_deref().unwrap_or(""),
                    "stream producer panicked"
                );
                Poll::Ready(Some(
                    this.error_frame(&Error::internal("stream producer failed")),
                ))
            }
            Poll::Ready(None) => {
                this.state = FrameState::Done;
                Poll::Ready(Some(Envelope::stream_end(
                    &this.request_id,
                    this.procedure.clone(),
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelCause;
    use crate::envelope::EnvelopeKind;
    use futures_util::StreamExt;
    use serde_json::json;

    fn frames(ctx: Arc<Context>, stream: PayloadStream) -> EnvelopeFrames {
        EnvelopeFrames::new(ctx, Some("counter".into()), stream, None, None)
    }

    #[tokio::test]
    async fn items_then_end() {
        let ctx = Arc::new(Context::detached("r1"));
        let out: Vec<Envelope> = frames(ctx, from_iter([json!(1), json!(2)])).collect().await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].kind, EnvelopeKind::StreamData);
        assert_eq!(out[0].payload, json!(1));
        assert_eq!(out[1].payload, json!(2));
        assert_eq!(out[2].kind, EnvelopeKind::StreamEnd);
        assert!(out.iter().all(|e| e.id == "r1"));
    }

    #[tokio::test]
    async fn empty_stream_yields_single_end() {
        let ctx = Arc::new(Context::detached("r1"));
        let out: Vec<Envelope> = frames(ctx, empty()).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EnvelopeKind::StreamEnd);
    }

    #[tokio::test]
    async fn producer_error_yields_single_error_frame() {
        let ctx = Arc::new(Context::detached("r1"));
        let stream = from_stream(futures_util::stream::iter([
            Ok(json!(1)),
            Err(Error::unavailable("backend down")),
        ]));
        let out: Vec<Envelope> = frames(ctx, stream).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].kind, EnvelopeKind::StreamError);
        assert_eq!(out[1].payload["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn cancellation_stops_without_further_frames() {
        let ctx = Arc::new(Context::detached("r1"));
        let (tx, stream) = producer(4);
        let mut frames = frames(ctx.clone(), stream);

        tx.send(json!(1)).await.unwrap();
        let first = frames.next().await.expect("first frame");
        assert_eq!(first.kind, EnvelopeKind::StreamData);

        ctx.cancel(CancelCause::Disconnect);
        assert!(frames.next().await.is_none());
        drop(frames);
        // The producer now observes a gone consumer.
        assert!(tx.send(json!(2)).await.is_err());
    }

    #[tokio::test]
    async fn panicking_producer_maps_to_internal_stream_error() {
        let ctx = Arc::new(Context::detached("r1"));
        let stream = from_stream(futures_util::stream::poll_fn(|_| -> Poll<
            Option<Result<Value, Error>>,
        > {
            panic!("boom")
        }));
        let out: Vec<Envelope> = frames(ctx, stream).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, EnvelopeKind::StreamError);
        assert_eq!(out[0].payload["code"], "INTERNAL_ERROR");
        // The panic message never reaches the payload.
        assert!(!out[0].payload["message"]
            .as_str()
            .unwrap_or_default()
            .contains("boom"));
    }
}
