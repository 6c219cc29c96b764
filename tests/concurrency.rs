//! Concurrency tests for the registry, router, and send queue.
//!
//! These exercise the shared-state invariants: per-sender FIFO under
//! concurrent broadcast, username-index consistency under register/kick
//! churn, and multi-producer enqueue against the single consumer.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;

use securechat::config::SendConfig;
use securechat::protocol::message::{new_message_id, ChatMessage, MessageKind};
use securechat::service::connection::{ConnState, ConnectionHandle};
use securechat::service::registry::Registry;
use securechat::service::send_queue::{Priority, QueuedMessage, SendQueue};

fn authed(registry: &Registry, id: u64, name: &str) -> Arc<ConnectionHandle> {
    let handle = ConnectionHandle::new(id, &SendConfig::default());
    registry.insert(handle.clone());
    handle.set_state(ConnState::Authenticated);
    handle.set_username(name);
    registry.bind_username(id, name);
    handle
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn broadcast_is_per_sender_fifo_under_concurrency() {
    let registry = Arc::new(Registry::new());

    let senders = 4u64;
    let per_sender = 200usize;
    let receiver_a = authed(&registry, 100, "receiver_a");
    let receiver_b = authed(&registry, 101, "receiver_b");
    for s in 0..senders {
        authed(&registry, s + 1, &format!("sender_{s}"));
    }

    let mut tasks = JoinSet::new();
    for s in 0..senders {
        let registry = registry.clone();
        tasks.spawn(async move {
            for i in 0..per_sender {
                let mut msg = ChatMessage::new(MessageKind::Text);
                msg.id = Some(new_message_id());
                msg.content = Some(format!("{s}:{i}"));
                let outcome = registry.broadcast(&msg, s + 1);
                assert_eq!(outcome.failed, 0);
                if i % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    for receiver in [&receiver_a, &receiver_b] {
        // Each receiver saw every message from every sender.
        let mut last_seen: HashMap<String, i64> = HashMap::new();
        let mut total = 0usize;
        while let Some(entry) = receiver.queue.try_pop() {
            let msg = ChatMessage::decode(&entry.payload).unwrap();
            let content = msg.content.unwrap();
            let (sender, index) = content.split_once(':').unwrap();
            let index: i64 = index.parse().unwrap();

            // Per-sender order at the recipient matches submission order.
            let last = last_seen.entry(sender.to_string()).or_insert(-1);
            assert!(index > *last, "sender {sender} reordered: {index} after {last}");
            *last = index;
            total += 1;
        }
        assert_eq!(total, senders as usize * per_sender);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn registry_indices_stay_consistent_under_churn() {
    let registry = Arc::new(Registry::new());
    let users = 16u64;
    let rounds = 50u64;

    let mut tasks = JoinSet::new();
    for u in 0..users {
        let registry = registry.clone();
        tasks.spawn(async move {
            let name = format!("user_{u}");
            for round in 0..rounds {
                let id = u * rounds + round + 1;
                let handle = ConnectionHandle::new(id, &SendConfig::default());
                registry.insert(handle.clone());
                handle.set_state(ConnState::Authenticated);
                handle.set_username(&name);

                // Re-login: the previous round's connection is displaced.
                if let Some(displaced) = registry.bind_username(id, &name) {
                    displaced.begin_disconnect();
                    registry.unregister(displaced.id());
                    // Idempotent.
                    registry.unregister(displaced.id());
                }
                tokio::task::yield_now().await;
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    // One live connection per username, and every bound name resolves to a
    // live entry.
    let directory = registry.directory();
    assert_eq!(directory.len(), users as usize);
    for name in directory {
        let handle = registry.lookup(&name).expect("bound name resolves");
        assert!(registry.get(handle.id()).is_some());
    }
    assert_eq!(registry.len(), users as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn queue_survives_many_producers_one_consumer() {
    let queue = Arc::new(SendQueue::new(10_000));
    let producers = 8usize;
    let per_producer = 500usize;

    let consumer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut received = 0usize;
            while let Some(entry) = queue.pop().await {
                assert!(!entry.payload.is_empty());
                received += 1;
            }
            received
        })
    };

    let mut tasks = JoinSet::new();
    for p in 0..producers {
        let queue = queue.clone();
        tasks.spawn(async move {
            for i in 0..per_producer {
                let mut msg = ChatMessage::new(MessageKind::Text);
                msg.id = Some(new_message_id());
                msg.content = Some(format!("{p}:{i}"));
                let entry = QueuedMessage::from_message(&msg, None).unwrap();
                queue.push(entry).unwrap();
                if i % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }

    // Producers done; wait for the consumer to drain, then close.
    while queue.depth() > 0 {
        tokio::task::yield_now().await;
    }
    let _ = queue.close();
    let received = consumer.await.unwrap();
    assert_eq!(received, producers * per_producer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_broadcast_and_directory_reads() {
    let registry = Arc::new(Registry::new());
    for i in 0..8 {
        authed(&registry, i + 1, &format!("user_{i}"));
    }

    let mut tasks = JoinSet::new();
    // Writers broadcasting.
    for s in 0..4u64 {
        let registry = registry.clone();
        tasks.spawn(async move {
            for _ in 0..200 {
                let mut msg = ChatMessage::new(MessageKind::Typing);
                msg.extra.insert("typing".into(), serde_json::json!(true));
                registry.broadcast(&msg, s + 1);
            }
        });
    }
    // Readers taking snapshots.
    for _ in 0..4 {
        let registry = registry.clone();
        tasks.spawn(async move {
            for _ in 0..200 {
                let names = registry.directory();
                assert_eq!(names.len(), 8);
                tokio::task::yield_now().await;
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap();
    }
}

#[test]
fn queue_priorities_hold_regardless_of_arrival_order() {
    let queue = SendQueue::new(64);
    let mk = |priority: Priority, tag: &str| QueuedMessage {
        payload: bytes::Bytes::copy_from_slice(tag.as_bytes()),
        priority,
        message_id: None,
        origin: None,
        enqueued_at: std::time::Instant::now(),
        retries: 0,
    };

    queue.push(mk(Priority::Low, "l")).unwrap();
    queue.push(mk(Priority::Critical, "c1")).unwrap();
    queue.push(mk(Priority::Normal, "n")).unwrap();
    queue.push(mk(Priority::Critical, "c2")).unwrap();
    queue.push(mk(Priority::High, "h")).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| queue.try_pop())
        .map(|e| String::from_utf8(e.payload.to_vec()).unwrap())
        .collect();
    assert_eq!(order, vec!["c1", "c2", "h", "n", "l"]);
}
