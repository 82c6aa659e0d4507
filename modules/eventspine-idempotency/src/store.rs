//! IdempotencyStore: the shared receipt cache.
//!
//! Constructed explicitly and shared by `Arc`; there is no process-wide
//! instance. Receipts live in memory; a [`ReceiptRepository`] may be injected
//! for best-effort snapshots.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use eventspine_common::{SpineConfig, DEFAULT_CHAOS_TTL, DEFAULT_RECEIPT_TTL, DEFAULT_TENANT};
use eventspine_envelope::EventEnvelope;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::locks::KeyLocks;
use crate::receipt::{IdempotencyReceipt, IdempotencyRequest, IdempotencyStats, IdempotentOutcome};
use crate::repository::ReceiptRepository;

const MIN_TTL: Duration = Duration::from_millis(1);

pub struct IdempotencyStore {
    receipts: Mutex<HashMap<String, IdempotencyReceipt>>,
    locks: KeyLocks,
    hits: AtomicU64,
    misses: AtomicU64,
    default_ttl: Duration,
    chaos_ttl: Duration,
    sim_mode: bool,
    default_tenant: String,
    repository: Option<Arc<dyn ReceiptRepository>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IdempotencyStore {
    /// In-memory store with default TTLs and no durable backing.
    pub fn new() -> Self {
        Self {
            receipts: Mutex::new(HashMap::new()),
            locks: KeyLocks::default(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            default_ttl: DEFAULT_RECEIPT_TTL,
            chaos_ttl: DEFAULT_CHAOS_TTL,
            sim_mode: false,
            default_tenant: DEFAULT_TENANT.to_string(),
            repository: None,
            sweeper: Mutex::new(None),
        }
    }

    /// TTLs, tenant scope and simulation mode taken from config. The
    /// repository is still injected separately.
    pub fn from_config(config: &SpineConfig) -> Self {
        Self::new()
            .with_default_ttl(config.receipt_ttl)
            .with_chaos_ttl(config.chaos_ttl)
            .with_default_tenant(config.sandbox_tenant.clone())
            .with_sim_mode(config.sim_mode)
    }

    pub fn with_repository(mut self, repository: Arc<dyn ReceiptRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl.max(MIN_TTL);
        self
    }

    pub fn with_chaos_ttl(mut self, ttl: Duration) -> Self {
        self.chaos_ttl = ttl.max(MIN_TTL);
        self
    }

    pub fn with_default_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.default_tenant = tenant.into();
        self
    }

    /// In simulation mode every durable operation is a no-op.
    pub fn with_sim_mode(mut self, sim_mode: bool) -> Self {
        self.sim_mode = sim_mode;
        self
    }

    // -----------------------------------------------------------------------
    // Idempotent execution
    // -----------------------------------------------------------------------

    /// Run `operation` at most once (successfully) for `key`.
    ///
    /// A live receipt short-circuits: its attempt count is bumped and the
    /// stored response is returned without calling `operation`. Otherwise the
    /// operation runs and its result becomes the receipt. Errors from the
    /// operation propagate unchanged and leave no receipt behind.
    pub async fn with_idempotency<R, F, Fut>(
        &self,
        key: &str,
        correlation_id: &str,
        event_type: &str,
        operation: F,
        ttl: Option<Duration>,
    ) -> Result<IdempotentOutcome<R>>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut request = IdempotencyRequest::new(key, correlation_id, event_type);
        request.ttl = ttl;
        self.run(request, operation).await
    }

    /// Full form of [`with_idempotency`](Self::with_idempotency).
    pub async fn run<R, F, Fut>(
        &self,
        request: IdempotencyRequest,
        operation: F,
    ) -> Result<IdempotentOutcome<R>>
    where
        R: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let _guard = self.locks.lock(&request.key).await;

        if let Some((result, attempt_count)) = self.replay::<R>(&request.key)? {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = request.key.as_str(),
                attempt_count, "Idempotency hit, replaying stored response"
            );
            return Ok(IdempotentOutcome {
                result,
                was_cached: true,
                attempt_count,
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = operation().await?;
        let response = serde_json::to_value(&result)?;

        let ttl = request.ttl.unwrap_or(self.default_ttl);
        self.receipts
            .lock()
            .insert(request.key.clone(), new_receipt(request, response, ttl, Utc::now()));

        Ok(IdempotentOutcome {
            result,
            was_cached: false,
            attempt_count: 1,
        })
    }

    /// Envelope-aware wrapper: key, correlation, event type and tenant come
    /// from the envelope. Envelopes with injected delay use the chaos TTL.
    pub async fn execute_event_idempotently<'a, T, R, F, Fut>(
        &self,
        envelope: &'a EventEnvelope<T>,
        handler: F,
    ) -> Result<IdempotentOutcome<R>>
    where
        T: Serialize,
        R: Serialize + DeserializeOwned,
        F: FnOnce(&'a EventEnvelope<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let request = self.request_for(envelope)?;
        self.run(request, || handler(envelope)).await
    }

    /// Register a receipt for work performed elsewhere, without running a
    /// handler. Returns `false` when a live receipt already exists; that
    /// receipt is left untouched.
    pub async fn mark_event_processed<T: Serialize>(
        &self,
        envelope: &EventEnvelope<T>,
        response: Option<serde_json::Value>,
    ) -> Result<bool> {
        let request = self.request_for(envelope)?;
        let _guard = self.locks.lock(&request.key).await;

        let now = Utc::now();
        let mut receipts = self.receipts.lock();
        if receipts
            .get(&request.key)
            .is_some_and(|r| !r.is_expired_at(now))
        {
            return Ok(false);
        }

        let response = response.unwrap_or_else(|| serde_json::json!({ "processed": true }));
        let ttl = request.ttl.unwrap_or(self.default_ttl);
        receipts.insert(request.key.clone(), new_receipt(request, response, ttl, now));
        Ok(true)
    }

    fn request_for<T: Serialize>(&self, envelope: &EventEnvelope<T>) -> Result<IdempotencyRequest> {
        let ttl = if envelope.injected_delay_ms().is_some() {
            self.chaos_ttl
        } else {
            self.default_ttl
        };
        Ok(IdempotencyRequest::new(
            &envelope.idempotency_key,
            &envelope.correlation_id,
            &envelope.event_type,
        )
        .with_tenant_id(&envelope.tenant_id)
        .with_request(serde_json::to_value(&envelope.payload)?)
        .with_ttl(ttl))
    }

    /// Decode a live receipt's response and count the attempt. The attempt is
    /// only counted once the response decodes as `R`. Expired receipts are
    /// removed on sight. Caller must hold the key lock.
    fn replay<R: DeserializeOwned>(&self, key: &str) -> Result<Option<(R, u32)>> {
        let now = Utc::now();
        let mut receipts = self.receipts.lock();

        if receipts.get(key).is_some_and(|r| r.is_expired_at(now)) {
            receipts.remove(key);
            debug!(key, "Removed expired receipt on lookup");
            return Ok(None);
        }

        let Some(receipt) = receipts.get_mut(key) else {
            return Ok(None);
        };
        let result: R = serde_json::from_value(receipt.response.clone())?;
        receipt.attempt_count = receipt.attempt_count.saturating_add(1);
        receipt.last_attempt_at = now;
        Ok(Some((result, receipt.attempt_count)))
    }

    // -----------------------------------------------------------------------
    // Receipt access
    // -----------------------------------------------------------------------

    /// Live receipt for `key`, without counting an attempt.
    pub fn get_receipt(&self, key: &str) -> Option<IdempotencyReceipt> {
        let now = Utc::now();
        self.receipts
            .lock()
            .get(key)
            .filter(|r| !r.is_expired_at(now))
            .cloned()
    }

    /// Snapshot of every stored receipt, expired ones included.
    pub fn receipts(&self) -> Vec<IdempotencyReceipt> {
        self.receipts.lock().values().cloned().collect()
    }

    /// Explicitly forget `key`. Waits for any in-flight execution of the key.
    pub async fn delete_receipt(&self, key: &str) -> bool {
        let _guard = self.locks.lock(key).await;
        self.receipts.lock().remove(key).is_some()
    }

    /// Remove every receipt and reset the hit/miss counters.
    pub fn clear_all_receipts(&self) {
        self.receipts.lock().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> IdempotencyStats {
        let now = Utc::now();
        let receipts = self.receipts.lock();
        let total = receipts.len();
        let expired = receipts.values().filter(|r| r.is_expired_at(now)).count();
        drop(receipts);

        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        IdempotencyStats {
            total_receipts: total,
            active_receipts: total - expired,
            expired_receipts: expired,
            dedupe_hits: hits,
            dedupe_misses: misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    // -----------------------------------------------------------------------
    // Expiry sweep
    // -----------------------------------------------------------------------

    /// Remove expired receipts. Keys currently locked by an execution are
    /// skipped; the next sweep or lookup handles them. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .receipts
            .lock()
            .iter()
            .filter(|(_, r)| r.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            let Some(_guard) = self.locks.try_lock(&key) else {
                continue;
            };
            let mut receipts = self.receipts.lock();
            if receipts.get(&key).is_some_and(|r| r.is_expired_at(now)) {
                receipts.remove(&key);
                removed += 1;
            }
        }
        self.locks.prune();

        if removed > 0 {
            debug!(removed, "Swept expired receipts");
        }
        removed
    }

    /// Start the background sweep. Restarts it if already running. The task
    /// holds only a weak reference and ends when the store is dropped.
    ///
    /// Returns `false` without starting anything when called outside a
    /// tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, receipt cleanup not started");
            return false;
        };
        let store: Weak<Self> = Arc::downgrade(self);
        let interval = interval.max(MIN_TTL);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.cleanup_expired();
            }
        });

        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "Receipt cleanup started");
        true
    }

    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("Receipt cleanup stopped");
        }
    }

    pub fn cleanup_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    // -----------------------------------------------------------------------
    // Durable snapshots
    // -----------------------------------------------------------------------

    /// Upsert every live receipt into the repository. Returns the number
    /// written; 0 in simulation mode, without a repository, or on failure.
    pub async fn persist_to_database(&self) -> u64 {
        let Some(repository) = self.durable_repository("persist") else {
            return 0;
        };

        let now = Utc::now();
        let snapshot: Vec<IdempotencyReceipt> = self
            .receipts
            .lock()
            .values()
            .filter(|r| !r.is_expired_at(now))
            .cloned()
            .map(|mut r| {
                r.tenant_id.get_or_insert_with(|| self.default_tenant.clone());
                r
            })
            .collect();

        if snapshot.is_empty() {
            return 0;
        }

        match repository.save(&snapshot).await {
            Ok(written) => {
                info!(written, "Persisted idempotency receipts");
                written
            }
            Err(e) => {
                warn!(error = %e, "Failed to persist idempotency receipts");
                0
            }
        }
    }

    /// Restore non-expired receipts for `tenant` (default tenant when `None`).
    /// Live local receipts and keys mid-execution are left alone. Returns the
    /// number restored.
    pub async fn load_from_database(&self, tenant: Option<&str>) -> u64 {
        let Some(repository) = self.durable_repository("load") else {
            return 0;
        };
        let tenant = tenant.unwrap_or(&self.default_tenant);

        let rows = match repository.load_active(tenant).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, tenant, "Failed to load idempotency receipts");
                return 0;
            }
        };

        let now = Utc::now();
        let mut restored = 0;
        for receipt in rows {
            if receipt.is_expired_at(now) {
                continue;
            }
            let Some(_guard) = self.locks.try_lock(&receipt.idempotency_key) else {
                continue;
            };
            let mut receipts = self.receipts.lock();
            if receipts
                .get(&receipt.idempotency_key)
                .is_some_and(|r| !r.is_expired_at(now))
            {
                continue;
            }
            debug!(
                key = receipt.idempotency_key.as_str(),
                remaining_ms = receipt.remaining_ttl(now).as_millis() as u64,
                "Restored receipt"
            );
            receipts.insert(receipt.idempotency_key.clone(), receipt);
            restored += 1;
        }

        info!(restored, tenant, "Loaded idempotency receipts");
        restored
    }

    /// Purge expired rows from the repository. Returns rows deleted.
    pub async fn cleanup_database_expired(&self) -> u64 {
        let Some(repository) = self.durable_repository("cleanup") else {
            return 0;
        };
        match repository.delete_expired().await {
            Ok(deleted) => {
                info!(deleted, "Purged expired receipts from durable store");
                deleted
            }
            Err(e) => {
                warn!(error = %e, "Failed to purge expired receipts");
                0
            }
        }
    }

    fn durable_repository(&self, operation: &str) -> Option<&Arc<dyn ReceiptRepository>> {
        if self.sim_mode {
            debug!(operation, "SIM_MODE enabled, skipping durable receipt I/O");
            return None;
        }
        if self.repository.is_none() {
            warn!(operation, "No receipt repository configured, skipping durable receipt I/O");
        }
        self.repository.as_ref()
    }
}

impl Drop for IdempotencyStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

fn new_receipt(
    request: IdempotencyRequest,
    response: serde_json::Value,
    ttl: Duration,
    now: DateTime<Utc>,
) -> IdempotencyReceipt {
    IdempotencyReceipt {
        idempotency_key: request.key,
        correlation_id: request.correlation_id,
        event_type: request.event_type,
        tenant_id: request.tenant_id,
        request: request.request,
        response,
        created_at: now,
        expires_at: expiry_after(now, ttl),
        attempt_count: 1,
        first_attempt_at: now,
        last_attempt_at: now,
    }
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl.max(MIN_TTL))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
