//! Span lifecycle: created → active → completed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use eventspine_common::SpineConfig;
use eventspine_envelope::{new_span_id, EventEnvelope};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::export::{exporter_from_config, SpanExporter};
use crate::span::{AttributeValue, Attributes, EndSpan, Span, SpanEvent, SpanHandle, SpanStatus};
use crate::summary::TelemetrySummary;

#[derive(Default)]
struct SpanRegistry {
    active: HashMap<String, Span>,
    completed: Vec<Span>,
}

pub struct Tracer {
    service_name: String,
    spans: Mutex<SpanRegistry>,
    exporter: Option<Arc<dyn SpanExporter>>,
}

impl Tracer {
    /// Tracer with no exporter; completed spans stay in memory only.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            spans: Mutex::new(SpanRegistry::default()),
            exporter: None,
        }
    }

    /// Tracer named and exported per config.
    pub fn from_config(config: &SpineConfig) -> Self {
        let tracer = Self::new(config.service_name.clone());
        match exporter_from_config(config) {
            Some(exporter) => tracer.with_exporter(exporter),
            None => tracer,
        }
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create and activate a span. A known parent lends its trace id;
    /// otherwise the span starts a new trace.
    pub fn start_span(
        &self,
        name: &str,
        attributes: Attributes,
        parent_span_id: Option<&str>,
    ) -> SpanHandle {
        let trace_id = parent_span_id
            .and_then(|parent| self.trace_of(parent))
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.open_span(name, trace_id, parent_span_id.map(str::to_string), attributes)
    }

    /// Span seeded from envelope fields and nested under the envelope's
    /// `trace.span_id`, so hops sharing a correlation id link causally.
    pub fn start_event_span<T>(&self, envelope: &EventEnvelope<T>, operation: &str) -> SpanHandle {
        let mut attrs = Attributes::new();
        let mut put = |k: &str, v: AttributeValue| {
            attrs.insert(k.to_string(), v);
        };
        put("event.id", envelope.event_id.as_str().into());
        put("event.type", envelope.event_type.as_str().into());
        put("event.source", envelope.source.as_str().into());
        put("correlation.id", envelope.correlation_id.as_str().into());
        put("idempotency.key", envelope.idempotency_key.as_str().into());
        put("tenant.id", envelope.tenant_id.as_str().into());
        put("trace.id", envelope.trace.trace_id.as_str().into());
        put("trace.parent_span_id", envelope.trace.span_id.as_str().into());

        if let Some(chaos) = &envelope.chaos {
            if let Some(v) = chaos.is_duplicate {
                put("chaos.is_duplicate", v.into());
            }
            if let Some(v) = chaos.injected_delay_ms {
                put("chaos.injected_delay_ms", v.into());
            }
            if let Some(v) = chaos.out_of_order {
                put("chaos.out_of_order", v.into());
            }
            if let Some(v) = chaos.simulated_failure {
                put("chaos.simulated_failure", v.to_string().into());
            }
            if let Some(v) = chaos.retry_attempt {
                put("chaos.retry_attempt", v.into());
            }
        }

        self.open_span(
            operation,
            envelope.trace.trace_id.clone(),
            Some(envelope.trace.span_id.clone()),
            attrs,
        )
    }

    fn open_span(
        &self,
        name: &str,
        trace_id: String,
        parent_span_id: Option<String>,
        attributes: Attributes,
    ) -> SpanHandle {
        let span = Span {
            id: new_span_id(),
            trace_id,
            parent_span_id,
            name: name.to_string(),
            start_time: Utc::now(),
            end_time: None,
            attributes,
            events: Vec::new(),
            status: None,
        };
        let handle = SpanHandle {
            span_id: span.id.clone(),
            trace_id: span.trace_id.clone(),
        };
        self.spans.lock().active.insert(span.id.clone(), span);
        handle
    }

    /// Append a named event. Returns `false` when the span is not active.
    pub fn add_span_event(&self, span: &SpanHandle, name: &str, attributes: Attributes) -> bool {
        self.with_active(span, |s| {
            s.events.push(SpanEvent {
                name: name.to_string(),
                timestamp: Utc::now(),
                attributes,
            });
        })
    }

    /// Merge attributes into an active span. Returns `false` when not active.
    pub fn set_span_attributes(&self, span: &SpanHandle, attributes: Attributes) -> bool {
        self.with_active(span, |s| s.attributes.extend(attributes))
    }

    /// Append an `exception` event and force the status to `Error`.
    /// `exception.type` is the Rust type name of `E`.
    pub fn record_exception<E>(&self, span: &SpanHandle, error: &E) -> bool
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        self.record_exception_as(span, std::any::type_name::<E>(), error)
    }

    /// Like [`record_exception`](Self::record_exception) with a caller-chosen
    /// `exception.type`, for type-erased errors such as `anyhow::Error`.
    pub fn record_exception_as<E>(&self, span: &SpanHandle, exception_type: &str, error: &E) -> bool
    where
        E: fmt::Display + fmt::Debug + ?Sized,
    {
        let mut attrs = Attributes::new();
        attrs.insert("exception.type".into(), exception_type.into());
        attrs.insert("exception.message".into(), error.to_string().into());
        attrs.insert("exception.stacktrace".into(), format!("{error:?}").into());

        self.with_active(span, |s| {
            s.events.push(SpanEvent {
                name: "exception".to_string(),
                timestamp: Utc::now(),
                attributes: attrs,
            });
            s.status = Some(SpanStatus::Error);
        })
    }

    /// End an active span: stamp `end_time`, record `duration.ms`, move it to
    /// the completed set and hand it to the exporter. Returns the completed
    /// span, or `None` if it was not active (already ended or unknown).
    pub fn end_span(&self, span: &SpanHandle, options: EndSpan) -> Option<Span> {
        let completed = {
            let mut registry = self.spans.lock();
            let Some(mut s) = registry.active.remove(&span.span_id) else {
                debug!(span_id = span.span_id.as_str(), "end_span on inactive span ignored");
                return None;
            };

            let end = Utc::now();
            s.end_time = Some(end);
            s.attributes.extend(options.attributes);
            s.attributes.insert(
                "duration.ms".to_string(),
                AttributeValue::Int((end - s.start_time).num_milliseconds()),
            );
            s.status = Some(match (options.status, s.status) {
                (Some(status), _) => status,
                (None, Some(current)) => current,
                (None, None) => SpanStatus::Ok,
            });

            registry.completed.push(s.clone());
            s
        };

        self.export(completed.clone());
        Some(completed)
    }

    fn export(&self, span: Span) {
        let Some(exporter) = self.exporter.clone() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = exporter.export(std::slice::from_ref(&span)).await {
                        warn!(error = %e, span_id = span.id.as_str(), "Span export failed");
                    }
                });
            }
            Err(_) => {
                warn!(span_id = span.id.as_str(), "No async runtime, span not exported");
            }
        }
    }

    fn with_active<F>(&self, span: &SpanHandle, f: F) -> bool
    where
        F: FnOnce(&mut Span),
    {
        match self.spans.lock().active.get_mut(&span.span_id) {
            Some(s) => {
                f(s);
                true
            }
            None => {
                debug!(span_id = span.span_id.as_str(), "Span is not active, annotation dropped");
                false
            }
        }
    }

    fn trace_of(&self, span_id: &str) -> Option<String> {
        let registry = self.spans.lock();
        registry
            .active
            .get(span_id)
            .or_else(|| registry.completed.iter().find(|s| s.id == span_id))
            .map(|s| s.trace_id.clone())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_active_spans(&self) -> Vec<Span> {
        self.spans.lock().active.values().cloned().collect()
    }

    pub fn get_completed_spans(&self) -> Vec<Span> {
        self.spans.lock().completed.clone()
    }

    /// Completed spans for one trace, in completion order.
    pub fn get_spans_by_trace(&self, trace_id: &str) -> Vec<Span> {
        self.spans
            .lock()
            .completed
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect()
    }

    pub fn clear_completed_spans(&self) {
        self.spans.lock().completed.clear();
    }

    pub fn get_telemetry_summary(&self) -> TelemetrySummary {
        TelemetrySummary::from_spans(&self.spans.lock().completed)
    }
}
