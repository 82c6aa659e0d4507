//! Orchestration over the envelope, idempotency and tracing layers.
//!
//! [`EventSpine`] composes "run idempotently" with "trace the run": every
//! processed envelope is validated, wrapped in an event span, executed through
//! the idempotency store and annotated with the outcome.

pub mod error;
pub mod spine;

pub use error::{SpineError, SpineResult};
pub use spine::{EventSpine, ProcessedEvent, PROCESS_OPERATION};
