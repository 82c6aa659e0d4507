//! IdempotencyStore behavior: replay, expiry, failure, stats and races.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use eventspine_envelope::{create_event, ChaosMetadata, EventEnvelope};
use eventspine_idempotency::{IdempotencyRequest, IdempotencyStore};
use serde_json::{json, Value};

fn envelope(key: &str, chaos: Option<ChaosMetadata>) -> EventEnvelope<Value> {
    let builder = create_event("t1", "flowbills:invoice.created")
        .with_correlation_id("corr-1")
        .with_idempotency_key(key)
        .with_source("flowbills")
        .with_payload(json!({"invoiceId": "inv-1"}));
    match chaos {
        Some(chaos) => builder.with_chaos(chaos),
        None => builder,
    }
    .build()
    .unwrap()
}

// =========================================================================
// Replay
// =========================================================================

#[tokio::test]
async fn second_call_replays_without_running_operation() {
    let store = IdempotencyStore::new();
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let run = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"charged": 1200}))
    };

    let first = store
        .with_idempotency("t1-billing:charge-1-aa", "corr-1", "billing:charge", run, None)
        .await
        .unwrap();
    let second = store
        .with_idempotency("t1-billing:charge-1-aa", "corr-1", "billing:charge", run, None)
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!first.was_cached);
    assert_eq!(first.attempt_count, 1);
    assert!(second.was_cached);
    assert_eq!(second.attempt_count, 2);
    assert_eq!(second.result, json!({"charged": 1200}));
}

#[tokio::test]
async fn receipt_tracks_attempts_and_keeps_response() {
    let store = IdempotencyStore::new();
    for _ in 0..3 {
        store
            .with_idempotency("k-1", "corr-1", "crm:lead.created", || async { Ok(7u32) }, None)
            .await
            .unwrap();
    }

    let receipt = store.get_receipt("k-1").unwrap();
    assert_eq!(receipt.attempt_count, 3);
    assert_eq!(receipt.response, json!(7));
    assert_eq!(receipt.correlation_id, "corr-1");
    assert!(receipt.expires_at > receipt.created_at);
    assert!(receipt.last_attempt_at >= receipt.first_attempt_at);
}

#[tokio::test]
async fn default_ttl_is_a_day() {
    let store = IdempotencyStore::new();
    store
        .with_idempotency("k-day", "c", "t", || async { Ok(()) }, None)
        .await
        .unwrap();

    let receipt = store.get_receipt("k-day").unwrap();
    let ttl = receipt.expires_at - receipt.created_at;
    assert_eq!(ttl.num_hours(), 24);
}

// =========================================================================
// Expiry
// =========================================================================

#[tokio::test]
async fn expired_receipt_is_a_miss_and_reexecutes() {
    let store = IdempotencyStore::new();
    let calls = AtomicUsize::new(0);
    let calls = &calls;
    let run = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok("done".to_string())
    };

    store
        .with_idempotency("k-ttl", "c", "t", run, Some(Duration::from_millis(1)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.get_receipt("k-ttl").is_none());
    let again = store
        .with_idempotency("k-ttl", "c", "t", run, Some(Duration::from_millis(1)))
        .await
        .unwrap();

    assert!(!again.was_cached);
    assert_eq!(again.attempt_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn cleanup_expired_removes_only_stale_receipts() {
    let store = IdempotencyStore::new();
    store
        .with_idempotency("short", "c", "t", || async { Ok(1) }, Some(Duration::from_millis(1)))
        .await
        .unwrap();
    store
        .with_idempotency("long", "c", "t", || async { Ok(2) }, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let before = store.get_stats();
    assert_eq!(before.total_receipts, 2);
    assert_eq!(before.expired_receipts, 1);

    assert_eq!(store.cleanup_expired(), 1);
    assert_eq!(store.cleanup_expired(), 0);

    let after = store.get_stats();
    assert_eq!(after.total_receipts, 1);
    assert_eq!(after.active_receipts, 1);
    // sweeping does not reset lifetime counters
    assert_eq!(after.dedupe_misses, 2);
}

#[tokio::test]
async fn background_sweep_removes_expired_receipts() {
    let store = Arc::new(IdempotencyStore::new());
    store
        .with_idempotency("swept", "c", "t", || async { Ok(1) }, Some(Duration::from_millis(1)))
        .await
        .unwrap();

    assert!(store.start_cleanup(Duration::from_millis(10)));
    assert!(store.cleanup_running());
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(store.get_stats().total_receipts, 0);

    store.stop_cleanup();
    assert!(!store.cleanup_running());
}

#[test]
fn start_cleanup_without_runtime_is_refused() {
    let store = Arc::new(IdempotencyStore::new());

    assert!(!store.start_cleanup(Duration::from_secs(1)));
    assert!(!store.cleanup_running());
}

// =========================================================================
// Failure
// =========================================================================

#[tokio::test]
async fn failed_operation_stores_nothing_and_retry_reexecutes() {
    let store = IdempotencyStore::new();
    let calls = AtomicUsize::new(0);
    let calls = &calls;

    let err = store
        .with_idempotency::<Value, _, _>(
            "k-fail",
            "c",
            "t",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("downstream exploded"))
            },
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "downstream exploded");
    assert!(store.get_receipt("k-fail").is_none());

    let retry = store
        .with_idempotency(
            "k-fail",
            "c",
            "t",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"ok": true}))
            },
            None,
        )
        .await
        .unwrap();

    assert!(!retry.was_cached);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =========================================================================
// Stats
// =========================================================================

#[tokio::test]
async fn stats_count_hits_and_misses() {
    let store = IdempotencyStore::new();
    assert_eq!(store.get_stats().hit_rate, 0.0);

    // 3 misses on distinct keys, then 5 hits spread across them
    for key in ["a", "b", "c"] {
        store
            .with_idempotency(key, "c", "t", move || async move { Ok(key.len()) }, None)
            .await
            .unwrap();
    }
    for key in ["a", "a", "b", "c", "c"] {
        store
            .with_idempotency(key, "c", "t", || async { Ok(0usize) }, None)
            .await
            .unwrap();
    }

    let stats = store.get_stats();
    assert_eq!(stats.dedupe_misses, 3);
    assert_eq!(stats.dedupe_hits, 5);
    assert_eq!(stats.hit_rate, 5.0 / 8.0);
    assert_eq!(stats.active_receipts, 3);

    store.clear_all_receipts();
    let cleared = store.get_stats();
    assert_eq!(cleared.total_receipts, 0);
    assert_eq!(cleared.dedupe_hits, 0);
    assert_eq!(cleared.dedupe_misses, 0);
}

#[tokio::test]
async fn undecodable_replay_counts_nothing() {
    let store = IdempotencyStore::new();
    store
        .with_idempotency("k-text", "c", "t", || async { Ok("text".to_string()) }, None)
        .await
        .unwrap();

    let err = store
        .with_idempotency("k-text", "c", "t", || async { Ok(7u32) }, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expected u32"));

    let stats = store.get_stats();
    assert_eq!(stats.dedupe_hits, 0);
    assert_eq!(stats.dedupe_misses, 1);
    assert_eq!(store.get_receipt("k-text").unwrap().attempt_count, 1);
}

// =========================================================================
// Envelope helpers
// =========================================================================

#[tokio::test]
async fn envelope_execution_records_tenant_and_payload() {
    let store = IdempotencyStore::new();
    let env = envelope("t1-flowbills:invoice.created-1-aaaa", None);

    let outcome = store
        .execute_event_idempotently(&env, |e| async move {
            Ok(json!({"seen": e.payload["invoiceId"]}))
        })
        .await
        .unwrap();

    assert_eq!(outcome.result, json!({"seen": "inv-1"}));
    let receipt = store.get_receipt(&env.idempotency_key).unwrap();
    assert_eq!(receipt.tenant_id.as_deref(), Some("t1"));
    assert_eq!(receipt.event_type, "flowbills:invoice.created");
    assert_eq!(receipt.request, json!({"invoiceId": "inv-1"}));
}

#[tokio::test]
async fn injected_delay_selects_chaos_ttl() {
    let store = IdempotencyStore::new().with_chaos_ttl(Duration::from_secs(60));
    let env = envelope(
        "t1-flowbills:invoice.created-1-bbbb",
        Some(ChaosMetadata {
            injected_delay_ms: Some(300),
            ..Default::default()
        }),
    );

    store
        .execute_event_idempotently(&env, |_| async { Ok(1) })
        .await
        .unwrap();

    let receipt = store.get_receipt(&env.idempotency_key).unwrap();
    assert_eq!((receipt.expires_at - receipt.created_at).num_seconds(), 60);
}

#[tokio::test]
async fn mark_processed_suppresses_later_execution() {
    let store = IdempotencyStore::new();
    let env = envelope("t1-flowbills:invoice.created-1-cccc", None);

    assert!(store.mark_event_processed(&env, None).await.unwrap());
    assert!(!store
        .mark_event_processed(&env, Some(json!("ignored")))
        .await
        .unwrap());

    let calls = AtomicUsize::new(0);
    let calls = &calls;
    let outcome = store
        .execute_event_idempotently(&env, move |_| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"processed": false}))
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(outcome.was_cached);
    assert_eq!(outcome.result, json!({"processed": true}));
}

#[tokio::test]
async fn delete_receipt_allows_reexecution() {
    let store = IdempotencyStore::new();
    let request = IdempotencyRequest::new("k-del", "c", "t").with_tenant_id("t1");
    store
        .run(request.clone(), || async { Ok(1) })
        .await
        .unwrap();

    assert!(store.delete_receipt("k-del").await);
    assert!(!store.delete_receipt("k-del").await);

    let outcome = store.run(request, || async { Ok(2) }).await.unwrap();
    assert!(!outcome.was_cached);
    assert_eq!(outcome.result, 2);
}

// =========================================================================
// Concurrency
// =========================================================================

#[tokio::test]
async fn concurrent_duplicates_execute_handler_once() {
    let store = IdempotencyStore::new();
    let env = envelope("t1-flowbills:invoice.created-1700000000000-abc1", None);
    let counter = AtomicUsize::new(0);
    let counter = &counter;

    let handler = move |_: &EventEnvelope<Value>| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"status": "created"}))
    };

    let (a, b) = tokio::join!(
        store.execute_event_idempotently(&env, handler),
        store.execute_event_idempotently(&env, handler),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!([a.was_cached, b.was_cached].iter().filter(|c| !**c).count(), 1);
    assert_eq!(a.result, b.result);
}

#[tokio::test]
async fn concurrent_duplicates_across_tasks_execute_once() {
    let store = Arc::new(IdempotencyStore::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let store = store.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                store
                    .with_idempotency(
                        "t1-crm:lead.created-1-race",
                        "corr",
                        "crm:lead.created",
                        || async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(counter.fetch_add(1, Ordering::SeqCst))
                        },
                        None,
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| !o.was_cached).count(), 1);
    assert!(outcomes.iter().all(|o| o.result == 0));
    assert_eq!(store.get_stats().dedupe_hits, 15);
}
