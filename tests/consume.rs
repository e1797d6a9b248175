// tests/consume.rs

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mom_broker::{
    // ---
    BrokerConfig,
    BrokerState,
    Compression,
    ConsumerRegistration,
    Error,
    MemoryHub,
    MessageEnvelope,
    MessageManager,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use common::{memory_broker_with, ready_broker, wait_for_state, TestBroker};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    n: u32,
}

fn job(n: u32) -> MessageEnvelope {
    MessageEnvelope::from_serializable(&Job { n }).unwrap()
}

/// Registration forwarding `(consumer_id, envelope)` and acking.
fn forwarding(
    topic: &str,
    consumer_id: &str,
    group_id: &str,
    tx: mpsc::UnboundedSender<(String, MessageEnvelope)>,
) -> ConsumerRegistration {
    // ---
    let id = consumer_id.to_string();
    ConsumerRegistration::new(
        topic,
        consumer_id,
        group_id,
        move |envelope: MessageEnvelope, manager: MessageManager| {
            let tx = tx.clone();
            let id = id.clone();
            async move {
                let _ = tx.send((id, envelope));
                manager.ack().await
            }
        },
    )
}

async fn collect(
    rx: &mut mpsc::UnboundedReceiver<(String, MessageEnvelope)>,
    count: usize,
) -> Vec<(String, MessageEnvelope)> {
    // ---
    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        let item = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for records")
            .expect("channel closed");
        received.push(item);
    }
    received
}

async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<(String, MessageEnvelope)>) {
    let extra = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(extra.is_err(), "unexpected extra record: {extra:?}");
}

fn spawn_loop(test: &TestBroker) -> tokio::task::JoinHandle<mom_broker::Result<()>> {
    let broker = test.broker.clone();
    tokio::spawn(async move { broker.start_consuming().await })
}

async fn stop_loop(test: &TestBroker, handle: tokio::task::JoinHandle<mom_broker::Result<()>>) {
    test.broker.stop_consuming();
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("consume loop did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_publish_then_consume_in_order() {
    // ---
    let hub = MemoryHub::new();
    let producer = ready_broker(&hub, "producer", &["jobs"], &[]).await;
    let worker = ready_broker(&hub, "worker", &["jobs"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    worker.broker.add_consumer(forwarding("jobs", "w1", "workers", tx)).unwrap();
    let handle = spawn_loop(&worker);

    let sent: Vec<MessageEnvelope> = (0..5).map(job).collect();
    producer.broker.publish("jobs", &sent).await.unwrap();

    let received = collect(&mut rx, 5).await;
    let ids: Vec<Uuid> = received.iter().map(|(_, env)| env.id()).collect();
    let expected: Vec<Uuid> = sent.iter().map(|env| env.id()).collect();
    assert_eq!(ids, expected);

    let first: Job = received[0].1.payload_as().unwrap();
    assert_eq!(first, Job { n: 0 });
    assert!(received[0].1.parent_id().is_none());

    stop_loop(&worker, handle).await;
    assert_eq!(producer.broker.get_topic_approximate_size("jobs").await, 0);
    assert!(worker.reporter.warnings().is_empty());

    producer.broker.close().await.unwrap();
    worker.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_parent_linkage_survives_the_wire() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "lineage", &["derived"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("derived", "c", "g", tx)).unwrap();
    let handle = spawn_loop(&test);

    let parent = job(1);
    let child = parent.create_child(job(2).payload().clone());
    test.broker.publish("derived", &[child.clone()]).await.unwrap();

    let received = collect(&mut rx, 1).await;
    assert_eq!(received[0].1.id(), child.id());
    assert_eq!(received[0].1.parent_id(), Some(parent.id()));

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_same_group_competes() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "competition", &["work"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("work", "a", "pool", tx.clone())).unwrap();
    test.broker.add_consumer(forwarding("work", "b", "pool", tx)).unwrap();
    let handle = spawn_loop(&test);

    let sent: Vec<MessageEnvelope> = (0..20).map(job).collect();
    test.broker.publish("work", &sent).await.unwrap();

    let received = collect(&mut rx, 20).await;
    assert_quiet(&mut rx).await;

    let ids: HashSet<Uuid> = received.iter().map(|(_, env)| env.id()).collect();
    let expected: HashSet<Uuid> = sent.iter().map(|env| env.id()).collect();
    assert_eq!(ids.len(), 20, "a record was delivered twice within the group");
    assert_eq!(ids, expected);

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_distinct_groups_each_receive_everything() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "broadcast", &["events"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("events", "audit", "audit", tx.clone())).unwrap();
    test.broker.add_consumer(forwarding("events", "mailer", "mailer", tx)).unwrap();
    let handle = spawn_loop(&test);

    let sent: Vec<MessageEnvelope> = (0..10).map(job).collect();
    test.broker.publish("events", &sent).await.unwrap();

    let received = collect(&mut rx, 20).await;
    assert_quiet(&mut rx).await;

    let expected: HashSet<Uuid> = sent.iter().map(|env| env.id()).collect();
    for group in ["audit", "mailer"] {
        let ids: HashSet<Uuid> = received
            .iter()
            .filter(|(id, _)| id == group)
            .map(|(_, env)| env.id())
            .collect();
        assert_eq!(ids, expected, "group {group} missed records");
    }

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_unacked_record_is_redelivered_after_resubscribe() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "crashy", &["jobs"], &[]).await;

    // Forwards but never settles: a crashed worker.
    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker
        .add_consumer(ConsumerRegistration::new(
            "jobs",
            "c",
            "g",
            move |envelope: MessageEnvelope, _manager: MessageManager| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(("c".to_string(), envelope));
                    Ok(())
                }
            },
        ))
        .unwrap();

    let sent = job(7);
    test.broker.publish("jobs", &[sent.clone()]).await.unwrap();

    let handle = spawn_loop(&test);
    let first = collect(&mut rx, 1).await;
    assert_eq!(first[0].1.id(), sent.id());
    stop_loop(&test, handle).await;

    assert!(test
        .reporter
        .warnings()
        .iter()
        .any(|w| w.contains("neither acked nor rejected")));

    let handle = spawn_loop(&test);
    let second = collect(&mut rx, 1).await;
    assert_eq!(second[0].1.id(), sent.id());
    assert_eq!(second[0].1.payload(), sent.payload());
    stop_loop(&test, handle).await;

    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_record_is_skipped() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "poison", &["raw"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("raw", "c", "g", tx)).unwrap();
    let handle = spawn_loop(&test);

    test.backend
        .send("raw", "bad", Bytes::from_static(b"\x00not json"))
        .await
        .unwrap();
    let good = job(1);
    test.broker.publish("raw", &[good.clone()]).await.unwrap();

    let received = collect(&mut rx, 1).await;
    assert_eq!(received[0].1.id(), good.id());
    assert_quiet(&mut rx).await;

    let warnings = test.reporter.warnings();
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(warnings[0].contains("undecodable"));

    stop_loop(&test, handle).await;
    assert_eq!(test.broker.get_topic_approximate_size("raw").await, 0);
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_external_payload_is_wrapped_in_fresh_envelope() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "external", &["inbox"], &[]).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("inbox", "c", "g", tx)).unwrap();
    let handle = spawn_loop(&test);

    test.backend
        .send("inbox", "k", Bytes::from_static(br#"{"n": 42}"#))
        .await
        .unwrap();

    let received = collect(&mut rx, 1).await;
    let envelope = &received[0].1;
    assert!(envelope.parent_id().is_none());
    assert!(!envelope.id().is_nil());
    assert_eq!(envelope.payload_as::<Job>().unwrap(), Job { n: 42 });

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_rejects_and_loop_continues() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "failing", &["jobs"], &[]).await;

    let calls = Arc::new(AtomicU32::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let seen = calls.clone();
    test.broker
        .add_consumer(ConsumerRegistration::new(
            "jobs",
            "c",
            "g",
            move |envelope: MessageEnvelope, manager: MessageManager| {
                let tx = tx.clone();
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(Error::Backend("database unavailable".into()));
                    }
                    let _ = tx.send(("c".to_string(), envelope));
                    manager.ack().await
                }
            },
        ))
        .unwrap();
    let handle = spawn_loop(&test);

    let sent = job(3);
    test.broker.publish("jobs", &[sent.clone()]).await.unwrap();

    let received = collect(&mut rx, 1).await;
    assert_eq!(received[0].1.id(), sent.id());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let errors = test.reporter.errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("database unavailable"));

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_handler_panic_is_isolated() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "panicky", &["jobs"], &[]).await;

    let calls = Arc::new(AtomicU32::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let seen = calls.clone();
    test.broker
        .add_consumer(ConsumerRegistration::new(
            "jobs",
            "c",
            "g",
            move |envelope: MessageEnvelope, manager: MessageManager| {
                let tx = tx.clone();
                let seen = seen.clone();
                async move {
                    if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("handler bug");
                    }
                    let _ = tx.send(("c".to_string(), envelope));
                    manager.ack().await
                }
            },
        ))
        .unwrap();
    let handle = spawn_loop(&test);

    test.broker.publish("jobs", &[job(1)]).await.unwrap();

    collect(&mut rx, 1).await;
    assert!(test.reporter.errors().iter().any(|e| e.contains("panicked")));
    assert_eq!(test.broker.state(), BrokerState::Consuming);

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_explicit_reject_redelivers() {
    // ---
    let hub = MemoryHub::new();
    let test = ready_broker(&hub, "rejecting", &["jobs"], &[]).await;

    let calls = Arc::new(AtomicU32::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let seen = calls.clone();
    test.broker
        .add_consumer(ConsumerRegistration::new(
            "jobs",
            "c",
            "g",
            move |envelope: MessageEnvelope, manager: MessageManager| {
                let tx = tx.clone();
                let seen = seen.clone();
                async move {
                    let attempt = seen.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send((attempt.to_string(), envelope));
                    if attempt == 0 {
                        manager.reject().await
                    } else {
                        manager.ack().await
                    }
                }
            },
        ))
        .unwrap();
    let handle = spawn_loop(&test);

    let sent = job(9);
    test.broker.publish("jobs", &[sent.clone()]).await.unwrap();

    let received = collect(&mut rx, 2).await;
    assert!(received.iter().all(|(_, env)| env.id() == sent.id()));
    assert_quiet(&mut rx).await;
    assert!(test.reporter.errors().is_empty());

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}

#[tokio::test]
async fn test_compressed_broker_round_trip() {
    // ---
    let hub = MemoryHub::new();
    let config = BrokerConfig::memory("gzip").with_compression(Compression::Gzip);
    let test = memory_broker_with(&hub, config);
    test.broker.connect().await.unwrap();
    test.broker
        .initialize(["packed"], Vec::<String>::new())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    test.broker.add_consumer(forwarding("packed", "c", "g", tx)).unwrap();
    let handle = spawn_loop(&test);
    wait_for_state(&test.broker, BrokerState::Consuming).await;

    let sent = job(5);
    test.broker.publish("packed", &[sent.clone()]).await.unwrap();

    let received = collect(&mut rx, 1).await;
    assert_eq!(received[0].1, sent);

    stop_loop(&test, handle).await;
    test.broker.close().await.unwrap();
}
