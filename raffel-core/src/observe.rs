//! Observability seams: tracing spans and metric sinks are injected
//! collaborators, never globals. The only ambient output is the `tracing`
//! logger.

use std::collections::BTreeMap;

use crate::context::TraceContext;

/// Span kind, mirroring the usual tracing taxonomies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Server,
    Client,
    Internal,
}

/// A started span. Ended explicitly or on drop.
pub trait Span: Send {
    fn set_attribute(&mut self, key: &str, value: &str);
    fn context(&self) -> TraceContext;
}

/// Distributed-tracing collaborator.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str, kind: SpanKind, parent: Option<&TraceContext>)
        -> Box<dyn Span>;

    /// Extract a trace context from transport metadata (e.g. headers).
    fn extract(&self, metadata: &BTreeMap<String, String>) -> Option<TraceContext>;

    /// Render a trace context as transport metadata.
    fn inject(&self, ctx: &TraceContext) -> BTreeMap<String, String>;
}

/// Metrics collaborator. Implementations are expected to be lock-free
/// (atomic counters) since sinks are hit on every call.
pub trait MetricSink: Send + Sync {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// A sink that discards everything. Default when none is injected.
#[derive(Debug, Default, Clone)]
pub struct NoopMetricSink;

impl MetricSink for NoopMetricSink {
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}
