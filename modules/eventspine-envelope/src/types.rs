//! Wire types for the event envelope. Field names are camelCase on the wire.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schema version stamped on every envelope produced by the builder.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// The unit of work exchanged between participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    pub event_id: String,
    /// Stable across every hop of one logical operation. Equals `trace.trace_id`.
    pub correlation_id: String,
    /// `{tenant_id}-{event_type}-{timestamp_millis}-{nonce}`.
    pub idempotency_key: String,
    pub tenant_id: String,
    pub event_type: String,
    /// Producing participant.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    pub payload: T,
    /// RFC 3339 instant. Kept as text so envelopes read off the wire can be
    /// validated rather than rejected at parse time.
    pub timestamp: String,
    pub schema_version: String,
    pub trace: TraceContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<ChaosMetadata>,
}

impl<T> EventEnvelope<T> {
    /// Parsed `timestamp`, or `None` when it is not a valid instant.
    pub fn timestamp_instant(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// Injected delay from chaos metadata, if the fault injector applied one.
    pub fn injected_delay_ms(&self) -> Option<u64> {
        self.chaos.as_ref().and_then(|c| c.injected_delay_ms)
    }
}

/// Consumer of an event: a single participant or a fan-out set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    One(String),
    Many(Vec<String>),
}

impl Target {
    pub fn participants(&self) -> Vec<&str> {
        match self {
            Target::One(p) => vec![p.as_str()],
            Target::Many(ps) => ps.iter().map(String::as_str).collect(),
        }
    }
}

/// Trace context carried across hops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baggage: Option<BTreeMap<String, String>>,
}

impl TraceContext {
    /// Fresh root context with random trace and span ids.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            baggage: None,
        }
    }
}

/// 16 lowercase hex chars, the width of an OTLP span id.
pub fn new_span_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..16].to_string()
}

/// Perturbations applied by an external fault injector. Read-only to the spine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaosMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_duplicate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injected_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_of_order: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_failure: Option<SimulatedFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
}

impl ChaosMetadata {
    /// Short label for the perturbation that dominates this delivery.
    /// A simulated failure outranks duplication, which outranks reordering and delay.
    pub fn decision_label(&self) -> String {
        if let Some(failure) = self.simulated_failure {
            return format!("failure:{failure}");
        }
        if self.is_duplicate == Some(true) {
            return "duplicate".to_string();
        }
        if self.out_of_order == Some(true) {
            return "reorder".to_string();
        }
        if self.injected_delay_ms.is_some() {
            return "delay".to_string();
        }
        "pass".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulatedFailure {
    Timeout,
    Network,
    Server,
    Validation,
}

impl fmt::Display for SimulatedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SimulatedFailure::Timeout => "timeout",
            SimulatedFailure::Network => "network",
            SimulatedFailure::Server => "server",
            SimulatedFailure::Validation => "validation",
        };
        f.write_str(s)
    }
}
