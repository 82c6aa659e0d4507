//! Durable snapshot behavior against the in-memory repository.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use eventspine_idempotency::{
    IdempotencyReceipt, IdempotencyRequest, IdempotencyStore, MemoryReceiptRepository,
};
use serde_json::json;

fn receipt(key: &str, tenant: &str, ttl_ms: i64) -> IdempotencyReceipt {
    let now = Utc::now();
    IdempotencyReceipt {
        idempotency_key: key.to_string(),
        correlation_id: "corr".to_string(),
        event_type: "crm:lead.created".to_string(),
        tenant_id: Some(tenant.to_string()),
        request: json!({"lead": key}),
        response: json!({"stored": key}),
        created_at: now - chrono::Duration::seconds(5),
        expires_at: now + chrono::Duration::milliseconds(ttl_ms),
        attempt_count: 2,
        first_attempt_at: now - chrono::Duration::seconds(5),
        last_attempt_at: now,
    }
}

#[tokio::test]
async fn persist_writes_live_receipts_with_default_tenant() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    let store = IdempotencyStore::new()
        .with_default_tenant("sandbox")
        .with_repository(repo.clone());

    store
        .run(IdempotencyRequest::new("k-1", "c", "t"), || async { Ok(1) })
        .await
        .unwrap();
    store
        .run(
            IdempotencyRequest::new("k-2", "c", "t").with_tenant_id("t9"),
            || async { Ok(2) },
        )
        .await
        .unwrap();

    assert_eq!(store.persist_to_database().await, 2);

    let mut rows = repo.rows();
    rows.sort_by(|a, b| a.idempotency_key.cmp(&b.idempotency_key));
    assert_eq!(rows[0].tenant_id.as_deref(), Some("sandbox"));
    assert_eq!(rows[1].tenant_id.as_deref(), Some("t9"));
    assert_eq!(rows[1].response, json!(2));
}

#[tokio::test]
async fn load_restores_active_receipts_for_tenant() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    repo.insert(receipt("live", "sandbox", 60_000));
    repo.insert(receipt("other-tenant", "t2", 60_000));
    repo.insert(receipt("stale", "sandbox", -1_000));

    let store = IdempotencyStore::new().with_repository(repo.clone());
    assert_eq!(store.load_from_database(None).await, 1);

    let outcome = store
        .run(IdempotencyRequest::new("live", "c", "t"), || async {
            Ok(json!("should not run"))
        })
        .await
        .unwrap();
    assert!(outcome.was_cached);
    assert_eq!(outcome.attempt_count, 3);
    assert_eq!(outcome.result, json!({"stored": "live"}));

    assert_eq!(store.load_from_database(Some("t2")).await, 1);
    assert!(store.get_receipt("other-tenant").is_some());
}

#[tokio::test]
async fn load_keeps_newer_local_receipt() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    repo.insert(receipt("shared", "sandbox", 60_000));

    let store = IdempotencyStore::new().with_repository(repo);
    store
        .run(IdempotencyRequest::new("shared", "c", "t"), || async {
            Ok(json!("local"))
        })
        .await
        .unwrap();

    assert_eq!(store.load_from_database(None).await, 0);
    assert_eq!(store.get_receipt("shared").unwrap().response, json!("local"));
}

#[tokio::test]
async fn cleanup_database_purges_expired_rows() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    repo.insert(receipt("stale-1", "sandbox", -10));
    repo.insert(receipt("stale-2", "sandbox", -10));
    repo.insert(receipt("live", "sandbox", 60_000));

    let store = IdempotencyStore::new().with_repository(repo.clone());

    assert_eq!(store.cleanup_database_expired().await, 2);
    assert_eq!(repo.rows().len(), 1);
}

#[tokio::test]
async fn sim_mode_skips_all_durable_io() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    repo.insert(receipt("live", "sandbox", 60_000));
    repo.insert(receipt("stale", "sandbox", -10));

    let store = IdempotencyStore::new()
        .with_sim_mode(true)
        .with_repository(repo.clone());
    store
        .run(IdempotencyRequest::new("k", "c", "t"), || async { Ok(1) })
        .await
        .unwrap();

    assert_eq!(store.persist_to_database().await, 0);
    assert_eq!(store.load_from_database(None).await, 0);
    assert_eq!(store.cleanup_database_expired().await, 0);
    assert_eq!(repo.rows().len(), 2);
}

#[tokio::test]
async fn missing_repository_degrades_to_zero() {
    let store = IdempotencyStore::new();
    store
        .run(IdempotencyRequest::new("k", "c", "t"), || async { Ok(1) })
        .await
        .unwrap();

    assert_eq!(store.persist_to_database().await, 0);
    assert_eq!(store.load_from_database(Some("t1")).await, 0);
    assert_eq!(store.cleanup_database_expired().await, 0);
}

#[tokio::test]
async fn repository_failure_leaves_memory_cache_intact() {
    let repo = Arc::new(MemoryReceiptRepository::new());
    let store = IdempotencyStore::new().with_repository(repo.clone());
    store
        .run(
            IdempotencyRequest::new("k", "c", "t").with_ttl(Duration::from_secs(30)),
            || async { Ok("kept".to_string()) },
        )
        .await
        .unwrap();

    repo.set_failing(true);
    assert_eq!(store.persist_to_database().await, 0);
    assert_eq!(store.load_from_database(None).await, 0);
    assert_eq!(store.cleanup_database_expired().await, 0);

    assert_eq!(store.get_receipt("k").unwrap().response, json!("kept"));

    repo.set_failing(false);
    assert_eq!(store.persist_to_database().await, 1);
}
