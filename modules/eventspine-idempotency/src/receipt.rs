//! Receipt and outcome types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached outcome of the first successful execution of one key.
///
/// Only `attempt_count` and `last_attempt_at` change after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyReceipt {
    pub idempotency_key: String,
    pub correlation_id: String,
    pub event_type: String,
    pub tenant_id: Option<String>,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

impl IdempotencyReceipt {
    /// A receipt stops being honored once `now` reaches `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Everything the store needs to run or replay one keyed operation.
#[derive(Debug, Clone)]
pub struct IdempotencyRequest {
    pub key: String,
    pub correlation_id: String,
    pub event_type: String,
    pub tenant_id: Option<String>,
    /// Recorded on the receipt for auditing; never interpreted.
    pub request: serde_json::Value,
    /// Falls back to the store's default TTL.
    pub ttl: Option<Duration>,
}

impl IdempotencyRequest {
    pub fn new(
        key: impl Into<String>,
        correlation_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            correlation_id: correlation_id.into(),
            event_type: event_type.into(),
            tenant_id: None,
            request: serde_json::Value::Null,
            ttl: None,
        }
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_request(mut self, request: serde_json::Value) -> Self {
        self.request = request;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Result of an idempotent call.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentOutcome<R> {
    pub result: R,
    /// `true` when the operation was skipped and the stored response replayed.
    pub was_cached: bool,
    pub attempt_count: u32,
}

/// Derived on demand from the receipt map and the lifetime hit/miss counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdempotencyStats {
    pub total_receipts: usize,
    pub active_receipts: usize,
    pub expired_receipts: usize,
    pub dedupe_hits: u64,
    pub dedupe_misses: u64,
    /// `hits / (hits + misses)`, or 0 before the first lookup.
    pub hit_rate: f64,
}
