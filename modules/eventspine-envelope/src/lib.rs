//! Canonical event envelope shared by every participant on the spine.
//!
//! The envelope carries identity (`event_id`), correlation, the idempotency
//! key, trace context and optional chaos metadata around an opaque payload.
//! Envelopes are assembled with [`create_event`] and checked with
//! [`validate_event`] before they enter the idempotency or tracing pipeline.

pub mod builder;
pub mod key;
pub mod participants;
pub mod types;
pub mod validate;

pub use builder::{create_event, BuildError, EventBuilder};
pub use key::{generate_deterministic_key, generate_idempotency_key, KEY_SEPARATOR};
pub use participants::{is_known_participant, KNOWN_PARTICIPANTS};
pub use types::{
    new_span_id, ChaosMetadata, EventEnvelope, SimulatedFailure, Target, TraceContext,
    SCHEMA_VERSION,
};
pub use validate::{validate_event, validate_event_json, ValidationResult};
