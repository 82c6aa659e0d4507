//! Durable receipt storage.
//!
//! The store depends only on [`ReceiptRepository`]. Postgres is the
//! production adapter; [`MemoryReceiptRepository`] backs tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;

use crate::receipt::IdempotencyReceipt;

/// Save / load-active / delete-expired over some durable backend.
#[async_trait]
pub trait ReceiptRepository: Send + Sync {
    /// Upsert receipts keyed by `idempotency_key`. Every receipt carries its
    /// tenant. Returns the number of rows written.
    async fn save(&self, receipts: &[IdempotencyReceipt]) -> Result<u64>;

    /// Receipts for `tenant_id` whose `expires_at` is still in the future.
    async fn load_active(&self, tenant_id: &str) -> Result<Vec<IdempotencyReceipt>>;

    /// Delete rows past `expires_at`. Returns the number deleted.
    async fn delete_expired(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// PgReceiptRepository (production, postgres)
// ---------------------------------------------------------------------------

/// Receipts in the `idempotency_receipts` table.
#[derive(Clone)]
pub struct PgReceiptRepository {
    pool: PgPool,
}

impl PgReceiptRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReceiptRepository for PgReceiptRepository {
    async fn save(&self, receipts: &[IdempotencyReceipt]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for receipt in receipts {
            let result = sqlx::query(
                r#"
                INSERT INTO idempotency_receipts (
                    idempotency_key, correlation_id, event_type, request_payload,
                    response_payload, attempt_count, created_at, expires_at, tenant_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (idempotency_key) DO UPDATE
                SET attempt_count = EXCLUDED.attempt_count,
                    expires_at    = EXCLUDED.expires_at
                "#,
            )
            .bind(&receipt.idempotency_key)
            .bind(&receipt.correlation_id)
            .bind(&receipt.event_type)
            .bind(&receipt.request)
            .bind(&receipt.response)
            .bind(i32::try_from(receipt.attempt_count).unwrap_or(i32::MAX))
            .bind(receipt.created_at)
            .bind(receipt.expires_at)
            .bind(receipt.tenant_id.as_deref().unwrap_or_default())
            .execute(&mut *tx)
            .await?;

            written += result.rows_affected();
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn load_active(&self, tenant_id: &str) -> Result<Vec<IdempotencyReceipt>> {
        let rows = sqlx::query_as::<_, ReceiptRow>(
            r#"
            SELECT idempotency_key, correlation_id, event_type, request_payload,
                   response_payload, attempt_count, created_at, expires_at, tenant_id
            FROM idempotency_receipts
            WHERE tenant_id = $1 AND expires_at > now()
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(IdempotencyReceipt::from).collect())
    }

    async fn delete_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_receipts WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    idempotency_key: String,
    correlation_id: String,
    event_type: String,
    request_payload: serde_json::Value,
    response_payload: serde_json::Value,
    attempt_count: i32,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    tenant_id: String,
}

impl From<ReceiptRow> for IdempotencyReceipt {
    /// Per-attempt timestamps are not stored; both collapse to `created_at`.
    fn from(row: ReceiptRow) -> Self {
        Self {
            idempotency_key: row.idempotency_key,
            correlation_id: row.correlation_id,
            event_type: row.event_type,
            tenant_id: Some(row.tenant_id),
            request: row.request_payload,
            response: row.response_payload,
            created_at: row.created_at,
            expires_at: row.expires_at,
            attempt_count: u32::try_from(row.attempt_count).unwrap_or(1).max(1),
            first_attempt_at: row.created_at,
            last_attempt_at: row.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryReceiptRepository (tests, no database required)
// ---------------------------------------------------------------------------

/// In-memory repository with the same upsert and expiry semantics as the
/// Postgres adapter. Can be switched into a failing mode to exercise the
/// store's degraded paths.
#[derive(Default)]
pub struct MemoryReceiptRepository {
    rows: Mutex<HashMap<String, IdempotencyReceipt>>,
    failing: AtomicBool,
}

impl MemoryReceiptRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call errors until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Insert a row directly, bypassing the store.
    pub fn insert(&self, receipt: IdempotencyReceipt) {
        self.rows
            .lock()
            .insert(receipt.idempotency_key.clone(), receipt);
    }

    /// All stored rows (for test assertions).
    pub fn rows(&self) -> Vec<IdempotencyReceipt> {
        self.rows.lock().values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("receipt repository unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ReceiptRepository for MemoryReceiptRepository {
    async fn save(&self, receipts: &[IdempotencyReceipt]) -> Result<u64> {
        self.check_available()?;
        let mut rows = self.rows.lock();
        for receipt in receipts {
            match rows.get_mut(&receipt.idempotency_key) {
                Some(existing) => {
                    existing.attempt_count = receipt.attempt_count;
                    existing.expires_at = receipt.expires_at;
                }
                None => {
                    rows.insert(receipt.idempotency_key.clone(), receipt.clone());
                }
            }
        }
        Ok(receipts.len() as u64)
    }

    async fn load_active(&self, tenant_id: &str) -> Result<Vec<IdempotencyReceipt>> {
        self.check_available()?;
        let now = Utc::now();
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|r| r.tenant_id.as_deref() == Some(tenant_id) && r.expires_at > now)
            .cloned()
            .collect())
    }

    async fn delete_expired(&self) -> Result<u64> {
        self.check_available()?;
        let now = Utc::now();
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, r| r.expires_at > now);
        Ok((before - rows.len()) as u64)
    }
}
