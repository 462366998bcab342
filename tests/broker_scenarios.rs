//! End-to-end broker behaviour on the in-memory store: delivery order,
//! visibility redelivery, heartbeats, concurrency caps, nack backoff and
//! in-place replacement.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use marqs::{DefaultKeyProducer, KeyProducer, Marqs, MarqsConfig, MemoryStore, TenantEnvironment};

fn test_config() -> MarqsConfig {
    MarqsConfig {
        visibility_timeout_ms: 500,
        workers: 1,
        default_queue_concurrency: 10,
        default_env_concurrency: 10,
        default_org_concurrency: 10,
        requeue_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn test_env() -> TenantEnvironment {
    TenantEnvironment {
        id: "env-test".to_string(),
        organization_id: "org-test".to_string(),
        env_concurrency_limit: 10,
        org_concurrency_limit: 10,
    }
}

async fn test_broker() -> Marqs {
    Marqs::builder(test_config())
        .store(Arc::new(MemoryStore::new()))
        .build()
        .await
        .expect("memory-backed broker")
}

/// Spread sequential enqueues over distinct millisecond timestamps.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn messages_deliver_in_enqueue_order() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "fifo", "a", json!({"n": 1}), None)
        .await
        .unwrap();
    settle().await;
    broker
        .enqueue(&env, "fifo", "b", json!({"n": 2}), None)
        .await
        .unwrap();

    let first = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(first.message_id, "a");

    // The payload's queue is the fully resolved child key.
    let keys = DefaultKeyProducer::default();
    assert_eq!(first.queue, keys.queue_key(&env, "fifo", None));
    assert_eq!(first.data["n"], 1);

    let second = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(second.message_id, "b");

    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn shared_and_env_parents_see_the_same_messages() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "either", "a", json!({}), None)
        .await
        .unwrap();

    let message = broker.dequeue_from_shared().await.unwrap().unwrap();
    assert_eq!(message.message_id, "a");
    broker.acknowledge("a").await.unwrap();

    // And the env path no longer sees it either.
    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn unacked_message_redelivers_after_visibility_timeout() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "redeliver", "a", json!({}), None)
        .await
        .unwrap();

    let first = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(first.message_id, "a");

    // Lease is 500 ms; the requeue worker polls every 100 ms.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let again = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(again.message_id, "a");

    broker.shutdown().await;
}

#[tokio::test]
async fn heartbeats_hold_the_lease_until_they_stop() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "beat", "a", json!({}), None)
        .await
        .unwrap();
    broker.dequeue_from_env(&env).await.unwrap().unwrap();

    // Beat every 200 ms for 3 s; the lease never lapses.
    for i in 0..15 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.heartbeat("a", 1).await.unwrap();

        if i == 7 {
            assert!(
                broker.dequeue_from_env(&env).await.unwrap().is_none(),
                "message redelivered mid-heartbeat"
            );
        }
    }

    // Stop beating; the lease lapses and the message comes back.
    tokio::time::sleep(Duration::from_millis(900)).await;
    let again = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(again.message_id, "a");

    broker.shutdown().await;
}

#[tokio::test]
async fn queue_concurrency_cap_blocks_until_ack() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .update_queue_concurrency_limit(&env, "capped", 1)
        .await
        .unwrap();

    broker
        .enqueue(&env, "capped", "a", json!({}), None)
        .await
        .unwrap();
    settle().await;
    broker
        .enqueue(&env, "capped", "b", json!({}), None)
        .await
        .unwrap();

    let first = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(first.message_id, "a");

    // "a" is in flight and the cap is 1.
    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    broker.acknowledge("a").await.unwrap();

    let second = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(second.message_id, "b");

    broker.shutdown().await;
}

#[tokio::test]
async fn nack_with_future_retry_delays_redelivery() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "backoff", "a", json!({}), None)
        .await
        .unwrap();
    broker.dequeue_from_env(&env).await.unwrap().unwrap();

    let retry_at = chrono::Utc::now().timestamp_millis() + 1000;
    broker.nack("a", Some(retry_at)).await.unwrap();

    // Queued but not yet due.
    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let again = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(again.message_id, "a");

    broker.shutdown().await;
}

#[tokio::test]
async fn replace_rewrites_data_and_keeps_identity() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "swap", "a", json!({"x": 1}), None)
        .await
        .unwrap();

    broker.replace("a", json!({"x": 2}), None).await.unwrap();

    let message = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(message.message_id, "a");
    assert_eq!(message.data["x"], 2);

    // Still exactly one message.
    broker.acknowledge("a").await.unwrap();
    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn acked_message_is_gone_for_good() {
    let broker = test_broker().await;
    let env = test_env();

    broker
        .enqueue(&env, "done", "a", json!({}), None)
        .await
        .unwrap();
    broker.dequeue_from_env(&env).await.unwrap().unwrap();
    broker.acknowledge("a").await.unwrap();

    // Late heartbeats and nacks on an ack'd id change nothing.
    broker.heartbeat("a", 1).await.unwrap();
    broker.nack("a", None).await.unwrap();
    broker.acknowledge("a").await.unwrap();

    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(
        broker.dequeue_from_env(&env).await.unwrap().is_none(),
        "requeue worker resurrected an ack'd message"
    );

    broker.shutdown().await;
}

#[tokio::test]
async fn concurrency_keyed_subqueues_are_capped_per_shard() {
    let broker = test_broker().await;
    let env = test_env();

    // One limit value for the logical queue; each shard tracks its own
    // in-flight set against it.
    broker
        .update_queue_concurrency_limit(&env, "sharded", 1)
        .await
        .unwrap();

    broker
        .enqueue(&env, "sharded", "a", json!({}), Some("user-1"))
        .await
        .unwrap();
    settle().await;
    broker
        .enqueue(&env, "sharded", "b", json!({}), Some("user-1"))
        .await
        .unwrap();
    settle().await;
    broker
        .enqueue(&env, "sharded", "c", json!({}), Some("user-2"))
        .await
        .unwrap();

    let first = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(first.message_id, "a");
    assert_eq!(first.concurrency_key.as_deref(), Some("user-1"));

    // user-1 is at its cap, so the only deliverable message is user-2's.
    let second = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(second.message_id, "c");
    assert_eq!(second.concurrency_key.as_deref(), Some("user-2"));

    // Both shards at cap now.
    assert!(broker.dequeue_from_env(&env).await.unwrap().is_none());

    broker.acknowledge("a").await.unwrap();
    let third = broker.dequeue_from_env(&env).await.unwrap().unwrap();
    assert_eq!(third.message_id, "b");

    broker.shutdown().await;
}
