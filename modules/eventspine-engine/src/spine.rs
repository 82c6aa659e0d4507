//! Validate → span → idempotent run → annotate → end span.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use eventspine_common::SpineConfig;
use eventspine_envelope::{validate_event, EventEnvelope};
use eventspine_idempotency::{IdempotencyStore, IdempotentOutcome};
use eventspine_trace::{EndSpan, SpanHandle, Tracer};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{SpineError, SpineResult};

/// Span name for envelopes run through [`EventSpine::process_event`].
pub const PROCESS_OPERATION: &str = "event.process";

/// Result of one processed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent<R> {
    pub outcome: IdempotentOutcome<R>,
    pub span_id: String,
    pub trace_id: String,
}

/// Shared idempotency store and tracer, passed explicitly to whoever
/// dispatches envelopes.
#[derive(Clone)]
pub struct EventSpine {
    store: Arc<IdempotencyStore>,
    tracer: Arc<Tracer>,
}

impl EventSpine {
    pub fn new(store: Arc<IdempotencyStore>, tracer: Arc<Tracer>) -> Self {
        Self { store, tracer }
    }

    /// In-memory store and tracer configured from `config`. Durable storage
    /// is attached by the caller through [`IdempotencyStore::with_repository`].
    pub fn from_config(config: &SpineConfig) -> Self {
        Self::new(
            Arc::new(IdempotencyStore::from_config(config)),
            Arc::new(Tracer::from_config(config)),
        )
    }

    pub fn store(&self) -> &Arc<IdempotencyStore> {
        &self.store
    }

    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.tracer
    }

    /// Validate `envelope`, then run `handler` at most once for its
    /// idempotency key inside an event span.
    ///
    /// The span records an `idempotency.check` event and, when the envelope
    /// carries chaos metadata, a `chaos.decision` event. Handler errors are
    /// recorded on the span and returned as [`SpineError::Handler`].
    pub async fn process_event<'a, T, R, F, Fut>(
        &self,
        envelope: &'a EventEnvelope<T>,
        handler: F,
    ) -> SpineResult<ProcessedEvent<R>>
    where
        T: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&'a EventEnvelope<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        ensure_valid(envelope)?;
        self.run_traced(envelope, handler).await
    }

    /// Process a batch concurrently.
    ///
    /// Every envelope is validated and keys are checked for duplicates before
    /// any handler runs; either failure rejects the whole batch. After that,
    /// each envelope gets its own result.
    pub async fn execute_batch<'a, T, R, F, Fut>(
        &self,
        envelopes: &'a [EventEnvelope<T>],
        handler: F,
    ) -> SpineResult<Vec<SpineResult<ProcessedEvent<R>>>>
    where
        T: Serialize,
        R: Serialize + DeserializeOwned,
        F: Fn(&'a EventEnvelope<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let mut seen = HashSet::with_capacity(envelopes.len());
        for envelope in envelopes {
            ensure_valid(envelope)?;
            if !seen.insert(envelope.idempotency_key.as_str()) {
                return Err(SpineError::DuplicateIdempotencyKey {
                    key: envelope.idempotency_key.clone(),
                });
            }
        }

        debug!(count = envelopes.len(), "Executing batch");
        let handler = &handler;
        let runs = envelopes
            .iter()
            .map(|envelope| self.run_traced(envelope, handler));
        Ok(join_all(runs).await)
    }

    async fn run_traced<'a, T, R, F, Fut>(
        &self,
        envelope: &'a EventEnvelope<T>,
        handler: F,
    ) -> SpineResult<ProcessedEvent<R>>
    where
        T: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&'a EventEnvelope<T>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let span = self.tracer.start_event_span(envelope, PROCESS_OPERATION);

        match self.store.execute_event_idempotently(envelope, handler).await {
            Ok(outcome) => {
                self.tracer.trace_idempotency_check(
                    &span,
                    &envelope.idempotency_key,
                    outcome.was_cached,
                    outcome.attempt_count,
                );
                self.annotate_chaos(&span, envelope);
                self.tracer.end_span(
                    &span,
                    EndSpan::ok().with_attribute("idempotency.was_cached", outcome.was_cached),
                );
                Ok(ProcessedEvent {
                    outcome,
                    span_id: span.span_id,
                    trace_id: span.trace_id,
                })
            }
            Err(e) => {
                warn!(
                    event_id = envelope.event_id.as_str(),
                    event_type = envelope.event_type.as_str(),
                    idempotency_key = envelope.idempotency_key.as_str(),
                    error = %e,
                    "Event handler failed"
                );
                self.annotate_chaos(&span, envelope);
                self.tracer
                    .record_exception_as(&span, &failure_label(envelope), &e);
                self.tracer.end_span(&span, EndSpan::error());
                Err(SpineError::Handler(e))
            }
        }
    }

    fn annotate_chaos<T>(&self, span: &SpanHandle, envelope: &EventEnvelope<T>) {
        if let Some(chaos) = &envelope.chaos {
            self.tracer
                .trace_chaos_decision(span, &chaos.decision_label(), chaos);
        }
    }
}

/// `exception.type` for a failed handler: the injected failure kind when the
/// delivery carried one, otherwise the event type.
fn failure_label<T>(envelope: &EventEnvelope<T>) -> String {
    match envelope.chaos.as_ref().and_then(|c| c.simulated_failure) {
        Some(failure) => format!("simulated_failure.{failure}"),
        None => format!("{}.handler_error", envelope.event_type),
    }
}

fn ensure_valid<T: Serialize>(envelope: &EventEnvelope<T>) -> SpineResult<()> {
    let result = validate_event(envelope);
    if result.valid {
        return Ok(());
    }
    Err(SpineError::InvalidEnvelope {
        event_id: envelope.event_id.clone(),
        errors: result.errors,
    })
}
