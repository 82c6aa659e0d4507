//! Fluent envelope builder.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{ChaosMetadata, EventEnvelope, Target, TraceContext, SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("event envelope is missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

/// Start an envelope for `tenant_id` / `event_type`.
///
/// `event_id`, `timestamp`, `schema_version` and a fresh trace context are
/// stamped here. The caller supplies the rest before [`EventBuilder::build`].
pub fn create_event<T>(tenant_id: impl Into<String>, event_type: impl Into<String>) -> EventBuilder<T> {
    EventBuilder {
        event_id: Uuid::new_v4().to_string(),
        tenant_id: tenant_id.into(),
        event_type: event_type.into(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        trace: TraceContext::new_root(),
        correlation_id: None,
        idempotency_key: None,
        source: None,
        target: None,
        payload: None,
        chaos: None,
    }
}

#[derive(Debug, Clone)]
pub struct EventBuilder<T> {
    event_id: String,
    tenant_id: String,
    event_type: String,
    timestamp: String,
    trace: TraceContext,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    source: Option<String>,
    target: Option<Target>,
    payload: Option<T>,
    chaos: Option<ChaosMetadata>,
}

impl<T> EventBuilder<T> {
    /// Also re-points `trace.trace_id` so trace and correlation stay aligned.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        let correlation_id = correlation_id.into();
        self.trace.trace_id = correlation_id.clone();
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(Target::One(target.into()));
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target = Some(Target::Many(targets.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_payload(mut self, payload: T) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_chaos(mut self, chaos: ChaosMetadata) -> Self {
        self.chaos = Some(chaos);
        self
    }

    /// Nest this envelope's trace under a span from the previous hop.
    pub fn with_parent_span_id(mut self, parent_span_id: impl Into<String>) -> Self {
        self.trace.parent_span_id = Some(parent_span_id.into());
        self
    }

    pub fn with_baggage(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.trace
            .baggage
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Fails when `correlationId`, `idempotencyKey`, `source` or `payload`
    /// was never supplied. Every missing field is reported.
    ///
    /// Only presence is checked here. A supplied payload that serializes to
    /// `null` still fails [`validate_event`](crate::validate_event).
    pub fn build(self) -> Result<EventEnvelope<T>, BuildError> {
        let mut missing = Vec::new();
        if self.correlation_id.is_none() {
            missing.push("correlationId");
        }
        if self.idempotency_key.is_none() {
            missing.push("idempotencyKey");
        }
        if self.source.is_none() {
            missing.push("source");
        }
        if self.payload.is_none() {
            missing.push("payload");
        }

        match (self.correlation_id, self.idempotency_key, self.source, self.payload) {
            (Some(correlation_id), Some(idempotency_key), Some(source), Some(payload)) => {
                Ok(EventEnvelope {
                    event_id: self.event_id,
                    correlation_id,
                    idempotency_key,
                    tenant_id: self.tenant_id,
                    event_type: self.event_type,
                    source,
                    target: self.target,
                    payload,
                    timestamp: self.timestamp,
                    schema_version: SCHEMA_VERSION.to_string(),
                    trace: self.trace,
                    chaos: self.chaos,
                })
            }
            _ => Err(BuildError::MissingFields(missing)),
        }
    }
}
