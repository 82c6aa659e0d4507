//! Structural validation, independent of the builder.
//!
//! Envelopes deserialized from the wire never passed through the builder, so
//! everything the builder guarantees is checked again here. Validation
//! reports problems; it never panics and never enforces.

use serde::Serialize;
use serde_json::Value;

use crate::key::KEY_SEPARATOR;
use crate::participants::is_known_participant;
use crate::types::EventEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Top-level string fields that must be present and non-empty, by wire name.
const REQUIRED_STRINGS: &[&str] = &[
    "eventId",
    "correlationId",
    "idempotencyKey",
    "tenantId",
    "eventType",
    "source",
    "timestamp",
    "schemaVersion",
];

/// Full structural pass over a typed envelope.
///
/// A payload that serializes to JSON `null` counts as missing. This covers
/// `()` and `None` payloads, which [`build`](crate::EventBuilder::build)
/// accepts because it only checks that a payload was supplied.
pub fn validate_event<T: Serialize>(envelope: &EventEnvelope<T>) -> ValidationResult {
    let mut errors = Vec::new();

    let required = [
        ("eventId", &envelope.event_id),
        ("correlationId", &envelope.correlation_id),
        ("idempotencyKey", &envelope.idempotency_key),
        ("tenantId", &envelope.tenant_id),
        ("eventType", &envelope.event_type),
        ("source", &envelope.source),
        ("timestamp", &envelope.timestamp),
        ("schemaVersion", &envelope.schema_version),
        ("trace.traceId", &envelope.trace.trace_id),
        ("trace.spanId", &envelope.trace.span_id),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            errors.push(format!("{name} is required"));
        }
    }

    match serde_json::to_value(&envelope.payload) {
        Ok(Value::Null) => errors.push("payload is required".to_string()),
        Ok(_) => {}
        Err(e) => errors.push(format!("payload is not serializable: {e}")),
    }

    if !envelope.timestamp.trim().is_empty() && envelope.timestamp_instant().is_none() {
        errors.push(format!(
            "timestamp '{}' is not a valid ISO-8601 instant",
            envelope.timestamp
        ));
    }

    if !envelope.source.trim().is_empty() && !is_known_participant(&envelope.source) {
        errors.push(format!(
            "source '{}' is not a recognized participant",
            envelope.source
        ));
    }

    if let Some(target) = &envelope.target {
        let participants = target.participants();
        if participants.is_empty() {
            errors.push("target must name at least one participant".to_string());
        }
        for participant in participants {
            if !is_known_participant(participant) {
                errors.push(format!(
                    "target '{participant}' is not a recognized participant"
                ));
            }
        }
    }

    if !envelope.idempotency_key.trim().is_empty()
        && !envelope.idempotency_key.contains(KEY_SEPARATOR)
    {
        errors.push(format!(
            "idempotencyKey '{}' is malformed: expected {{tenantId}}-{{eventType}}-{{timestampMillis}}-{{nonce}}",
            envelope.idempotency_key
        ));
    }

    ValidationResult::from_errors(errors)
}

/// Validate a raw JSON envelope. Missing fields are reported by name instead
/// of surfacing as a deserialization failure.
pub fn validate_event_json(raw: &Value) -> ValidationResult {
    let Some(object) = raw.as_object() else {
        return ValidationResult::from_errors(vec!["envelope must be a JSON object".to_string()]);
    };

    let mut errors = Vec::new();
    for name in REQUIRED_STRINGS {
        match object.get(*name) {
            Some(Value::String(s)) if !s.trim().is_empty() => {}
            Some(Value::String(_)) | None | Some(Value::Null) => {
                errors.push(format!("{name} is required"))
            }
            Some(_) => errors.push(format!("{name} must be a string")),
        }
    }
    match object.get("payload") {
        None | Some(Value::Null) => errors.push("payload is required".to_string()),
        Some(_) => {}
    }
    match object.get("trace") {
        Some(Value::Object(_)) => {}
        None | Some(Value::Null) => errors.push("trace is required".to_string()),
        Some(_) => errors.push("trace must be an object".to_string()),
    }
    if !errors.is_empty() {
        return ValidationResult::from_errors(errors);
    }

    match serde_json::from_value::<EventEnvelope<Value>>(raw.clone()) {
        Ok(envelope) => validate_event(&envelope),
        Err(e) => ValidationResult::from_errors(vec![format!(
            "envelope does not match the event contract: {e}"
        )]),
    }
}
