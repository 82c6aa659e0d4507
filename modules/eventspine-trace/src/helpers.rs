//! Typed span events with standardized names, so runs can be aggregated.

use std::fmt;

use eventspine_envelope::ChaosMetadata;
use serde::{Deserialize, Serialize};

use crate::span::{AttributeValue, Attributes, SpanHandle};
use crate::tracer::Tracer;

pub const CHAOS_DECISION_EVENT: &str = "chaos.decision";
pub const IDEMPOTENCY_CHECK_EVENT: &str = "idempotency.check";
pub const CIRCUIT_BREAKER_EVENT: &str = "circuit_breaker.state_change";
pub const RETRY_EVENT: &str = "retry.attempt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

impl Tracer {
    /// Record which perturbation was applied to a delivery.
    pub fn trace_chaos_decision(
        &self,
        span: &SpanHandle,
        decision: &str,
        chaos: &ChaosMetadata,
    ) -> bool {
        let mut attrs = Attributes::new();
        attrs.insert("chaos.decision".into(), decision.into());
        if let Some(v) = chaos.is_duplicate {
            attrs.insert("chaos.is_duplicate".into(), v.into());
        }
        if let Some(v) = chaos.injected_delay_ms {
            attrs.insert("chaos.injected_delay_ms".into(), v.into());
        }
        if let Some(v) = chaos.out_of_order {
            attrs.insert("chaos.out_of_order".into(), v.into());
        }
        if let Some(v) = chaos.simulated_failure {
            attrs.insert("chaos.simulated_failure".into(), v.to_string().into());
        }
        if let Some(v) = chaos.retry_attempt {
            attrs.insert("chaos.retry_attempt".into(), v.into());
        }
        self.add_span_event(span, CHAOS_DECISION_EVENT, attrs)
    }

    pub fn trace_idempotency_check(
        &self,
        span: &SpanHandle,
        idempotency_key: &str,
        was_cached: bool,
        attempt_count: u32,
    ) -> bool {
        let attrs = Attributes::from([
            ("idempotency.key".to_string(), AttributeValue::from(idempotency_key)),
            ("idempotency.was_cached".to_string(), was_cached.into()),
            ("idempotency.attempt_count".to_string(), attempt_count.into()),
        ]);
        self.add_span_event(span, IDEMPOTENCY_CHECK_EVENT, attrs)
    }

    pub fn trace_circuit_breaker(
        &self,
        span: &SpanHandle,
        service: &str,
        state: CircuitState,
        failure_count: u32,
    ) -> bool {
        let attrs = Attributes::from([
            ("circuit_breaker.service".to_string(), AttributeValue::from(service)),
            ("circuit_breaker.state".to_string(), state.to_string().into()),
            ("circuit_breaker.failure_count".to_string(), failure_count.into()),
        ]);
        self.add_span_event(span, CIRCUIT_BREAKER_EVENT, attrs)
    }

    pub fn trace_retry(
        &self,
        span: &SpanHandle,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: Option<&str>,
    ) -> bool {
        let mut attrs = Attributes::from([
            ("retry.attempt".to_string(), AttributeValue::from(attempt)),
            ("retry.max_attempts".to_string(), max_attempts.into()),
            ("retry.delay_ms".to_string(), delay_ms.into()),
        ]);
        if let Some(error) = error {
            attrs.insert("retry.error".into(), error.into());
        }
        self.add_span_event(span, RETRY_EVENT, attrs)
    }
}
