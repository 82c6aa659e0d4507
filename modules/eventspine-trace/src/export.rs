//! Span sinks. The tracer hands every completed span to at most one exporter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use eventspine_common::SpineConfig;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::span::{AttributeValue, Attributes, Span, SpanStatus};

#[async_trait]
pub trait SpanExporter: Send + Sync {
    async fn export(&self, spans: &[Span]) -> Result<()>;
}

/// Pick an exporter from config: OTLP over HTTP when an endpoint is set,
/// structured log lines when export is enabled without one, otherwise none.
pub fn exporter_from_config(config: &SpineConfig) -> Option<Arc<dyn SpanExporter>> {
    if !config.otel_exporter_enabled {
        return None;
    }
    match &config.otel_exporter_endpoint {
        Some(endpoint) => Some(Arc::new(OtlpHttpExporter::new(
            endpoint.clone(),
            config.service_name.clone(),
        ))),
        None => Some(Arc::new(LogExporter)),
    }
}

// ---------------------------------------------------------------------------
// LogExporter
// ---------------------------------------------------------------------------

/// Emits each completed span as a tracing event.
pub struct LogExporter;

#[async_trait]
impl SpanExporter for LogExporter {
    async fn export(&self, spans: &[Span]) -> Result<()> {
        for span in spans {
            info!(
                span_id = span.id.as_str(),
                trace_id = span.trace_id.as_str(),
                parent_span_id = span.parent_span_id.as_deref().unwrap_or(""),
                name = span.name.as_str(),
                duration_ms = span.duration_ms().unwrap_or_default(),
                error = span.is_error(),
                events = span.events.len(),
                "span completed"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// OtlpHttpExporter
// ---------------------------------------------------------------------------

/// Posts spans as OTLP/JSON to `{endpoint}/v1/traces`.
pub struct OtlpHttpExporter {
    client: reqwest::Client,
    endpoint: String,
    service_name: String,
}

impl OtlpHttpExporter {
    pub fn new(endpoint: String, service_name: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            service_name,
        }
    }

    fn traces_url(&self) -> String {
        format!("{}/v1/traces", self.endpoint.trim_end_matches('/'))
    }

    fn request_body(&self, spans: &[Span]) -> Value {
        let spans: Vec<Value> = spans.iter().map(otlp_span).collect();
        json!({
            "resourceSpans": [{
                "resource": {
                    "attributes": [otlp_kv("service.name", &AttributeValue::from(self.service_name.as_str()))]
                },
                "scopeSpans": [{
                    "scope": { "name": "eventspine-trace" },
                    "spans": spans,
                }]
            }]
        })
    }
}

#[async_trait]
impl SpanExporter for OtlpHttpExporter {
    async fn export(&self, spans: &[Span]) -> Result<()> {
        if spans.is_empty() {
            return Ok(());
        }
        let url = self.traces_url();
        let resp = self
            .client
            .post(&url)
            .json(&self.request_body(spans))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("OTLP collector returned {status}: {body}");
        }
        Ok(())
    }
}

fn otlp_span(span: &Span) -> Value {
    let nanos = |t: chrono::DateTime<chrono::Utc>| {
        t.timestamp_nanos_opt().unwrap_or_default().to_string()
    };
    let end = span.end_time.unwrap_or(span.start_time);
    let events: Vec<Value> = span
        .events
        .iter()
        .map(|e| {
            json!({
                "timeUnixNano": nanos(e.timestamp),
                "name": e.name,
                "attributes": otlp_attributes(&e.attributes),
            })
        })
        .collect();
    // STATUS_CODE_OK = 1, STATUS_CODE_ERROR = 2
    let code = match span.status {
        Some(SpanStatus::Error) => 2,
        Some(SpanStatus::Ok) => 1,
        None => 0,
    };

    let mut out = json!({
        "traceId": otlp_trace_id(&span.trace_id),
        "spanId": span.id,
        "name": span.name,
        "kind": 1,
        "startTimeUnixNano": nanos(span.start_time),
        "endTimeUnixNano": nanos(end),
        "attributes": otlp_attributes(&span.attributes),
        "events": events,
        "status": { "code": code },
    });
    if let Some(parent) = &span.parent_span_id {
        out["parentSpanId"] = json!(parent);
    }
    out
}

fn otlp_attributes(attributes: &Attributes) -> Vec<Value> {
    attributes.iter().map(|(k, v)| otlp_kv(k, v)).collect()
}

fn otlp_kv(key: &str, value: &AttributeValue) -> Value {
    let value = match value {
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Float(f) => json!({ "doubleValue": f }),
        AttributeValue::String(s) => json!({ "stringValue": s }),
    };
    json!({ "key": key, "value": value })
}

/// OTLP wants 32 hex chars. Hyphenated UUIDs collapse to that directly;
/// anything else is hashed down to 16 bytes.
fn otlp_trace_id(trace_id: &str) -> String {
    let compact: String = trace_id.chars().filter(|c| *c != '-').collect();
    if compact.len() == 32 && compact.chars().all(|c| c.is_ascii_hexdigit()) {
        return compact.to_ascii_lowercase();
    }
    let digest = Sha256::digest(trace_id.as_bytes());
    hex::encode(&digest[..16])
}

// ---------------------------------------------------------------------------
// MemoryExporter
// ---------------------------------------------------------------------------

/// Collects exported spans in memory. Test double for [`SpanExporter`].
#[derive(Default)]
pub struct MemoryExporter {
    spans: Mutex<Vec<Span>>,
    failing: AtomicBool,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Make subsequent exports fail without recording anything.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpanExporter for MemoryExporter {
    async fn export(&self, spans: &[Span]) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("memory exporter set to fail");
        }
        self.spans.lock().extend_from_slice(spans);
        Ok(())
    }
}
