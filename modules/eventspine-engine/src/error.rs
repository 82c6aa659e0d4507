//! Typed errors for orchestrated event processing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpineError {
    /// Envelope failed structural validation; no handler ran.
    #[error("invalid envelope {event_id}: {}", errors.join("; "))]
    InvalidEnvelope { event_id: String, errors: Vec<String> },

    /// Two envelopes in one batch share an idempotency key.
    #[error("duplicate idempotency key in batch: {key}")]
    DuplicateIdempotencyKey { key: String },

    /// The handler (or receipt serialization) failed. Passed through unchanged.
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

pub type SpineResult<T> = std::result::Result<T, SpineError>;
