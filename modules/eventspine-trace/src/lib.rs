//! Span-based tracing of an envelope's journey across hops.
//!
//! A [`Tracer`] owns two disjoint collections: active spans and completed
//! spans. Spans move from one to the other exactly once, in `end_span`.
//! Completed spans feed [`TelemetrySummary`] and, when configured, a
//! [`SpanExporter`].

pub mod export;
pub mod helpers;
pub mod span;
pub mod summary;
pub mod tracer;

pub use export::{exporter_from_config, LogExporter, MemoryExporter, OtlpHttpExporter, SpanExporter};
pub use helpers::CircuitState;
pub use span::{
    attributes, AttributeValue, Attributes, EndSpan, Span, SpanEvent, SpanHandle, SpanStatus,
};
pub use summary::TelemetrySummary;
pub use tracer::Tracer;
