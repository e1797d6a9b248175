//! In-memory backend implementation.
//!
//! This module provides a pure in-process implementation of the [`Backend`]
//! boundary. It is intended for testing, local execution, and as the
//! reference for adapter semantics.
//!
//! ## Reference Semantics
//!
//! - Every consumer group of a topic receives every record published to it.
//! - Consumers sharing a group compete: each record goes to exactly one of
//!   them at a time.
//! - A group created after records were published starts from the oldest
//!   retained record of a regular topic, and from "now" on an answer topic.
//! - Delivered records stay *in flight* until acknowledged. Rejected records
//!   go back to the head of the group's queue. Records still in flight when
//!   their consumer is dropped or closed are requeued the same way.
//! - A group of an answer topic is removed once its last consumer leaves,
//!   the way an auto-delete queue disappears on a real broker.
//! - Publishing fails once any group's backlog reaches the configured capacity.
//!
//! ## Non-Goals
//!
//! This backend does not emulate persistence, partitions, or the failure
//! modes of a real broker.

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::broker::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_info,
    Backend,
    BackendPtr,
    Error,
    MemoryConfig,
    Record,
    RecordStream,
    RecordStreamBox,
    Result,
    TopicKind,
    TopicSpec,
};

#[derive(Clone)]
struct Stored {
    offset: i64,
    key: Option<String>,
    payload: Bytes,
}

#[derive(Default)]
struct GroupInner {
    ready: VecDeque<Stored>,
    in_flight: HashMap<i64, (u64, Stored)>,
    members: usize,
}

impl GroupInner {
    fn backlog(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }

    /// Move the given in-flight offsets back to the head of the queue,
    /// oldest first.
    fn requeue(&mut self, mut offsets: Vec<i64>) {
        // ---
        offsets.sort_unstable();
        for offset in offsets.into_iter().rev() {
            if let Some((_, stored)) = self.in_flight.remove(&offset) {
                self.ready.push_front(stored);
            }
        }
    }

    fn owned_by(&self, consumer: u64) -> Vec<i64> {
        self.in_flight
            .iter()
            .filter(|(_, (owner, _))| *owner == consumer)
            .map(|(offset, _)| *offset)
            .collect()
    }
}

#[derive(Default)]
struct GroupState {
    inner: Mutex<GroupInner>,
    notify: Notify,
}

struct TopicInner {
    kind: TopicKind,
    next_offset: i64,
    retained: VecDeque<Stored>,
    groups: HashMap<String, Arc<GroupState>>,
}

struct TopicState {
    inner: Mutex<TopicInner>,
}

impl TopicState {
    fn new(kind: TopicKind) -> Arc<Self> {
        // ---
        Arc::new(Self {
            inner: Mutex::new(TopicInner {
                kind,
                next_offset: 0,
                retained: VecDeque::new(),
                groups: HashMap::new(),
            }),
        })
    }
}

/// Shared message bus for the in-memory backend.
///
/// Simulates a broker within a single process. All [`MemoryBackend`]s that
/// share a hub see each other's topics, exactly as clients connected to one
/// real broker would.
///
/// Tests that must not interfere with each other construct their own hub and
/// pass it to [`create_memory_backend_with_hub`]; everything else uses the
/// process-global hub through [`create_memory_backend`].
pub struct MemoryHub {
    // ---
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    next_consumer: AtomicU64,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn declare(&self, spec: &TopicSpec) {
        // ---
        let mut topics = lock_ignore_poison(&self.topics);
        topics
            .entry(spec.name.clone())
            .or_insert_with(|| TopicState::new(spec.kind));
    }

    fn topic(&self, name: &str) -> Arc<TopicState> {
        // ---
        let mut topics = lock_ignore_poison(&self.topics);
        topics
            .entry(name.to_string())
            .or_insert_with(|| TopicState::new(TopicKind::Regular))
            .clone()
    }

    fn find_group(&self, topic: &str, group_id: &str) -> Option<Arc<GroupState>> {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        let topic = topics.get(topic)?;
        let inner = lock_ignore_poison(&topic.inner);
        inner.groups.get(group_id).cloned()
    }

    fn publish(&self, topic: &str, key: &str, payload: Bytes, capacity: usize) -> Result<()> {
        // ---
        let topic_state = self.topic(topic);
        let mut inner = lock_ignore_poison(&topic_state.inner);

        let groups: Vec<Arc<GroupState>> = inner.groups.values().cloned().collect();
        let mut guards = Vec::with_capacity(groups.len());
        for group in &groups {
            let guard = lock_ignore_poison(&group.inner);
            if guard.backlog() >= capacity {
                return Err(Error::Publish(format!(
                    "memory: backlog of {topic} reached capacity {capacity}"
                )));
            }
            guards.push(guard);
        }

        let stored = Stored {
            offset: inner.next_offset,
            key: Some(key.to_string()),
            payload,
        };
        inner.next_offset += 1;

        for guard in guards.iter_mut() {
            guard.ready.push_back(stored.clone());
        }
        drop(guards);

        if inner.kind == TopicKind::Regular {
            inner.retained.push_back(stored);
            while inner.retained.len() > capacity {
                inner.retained.pop_front();
            }
        }
        drop(inner);

        for group in groups {
            group.notify.notify_waiters();
        }
        Ok(())
    }

    fn join_group(&self, topic: &str, group_id: &str) -> (Arc<TopicState>, Arc<GroupState>) {
        // ---
        let topic_state = self.topic(topic);
        let mut inner = lock_ignore_poison(&topic_state.inner);

        let group = match inner.groups.get(group_id) {
            Some(group) => group.clone(),
            None => {
                let group = Arc::new(GroupState::default());
                lock_ignore_poison(&group.inner)
                    .ready
                    .extend(inner.retained.iter().cloned());
                inner.groups.insert(group_id.to_string(), group.clone());
                group
            }
        };
        lock_ignore_poison(&group.inner).members += 1;
        drop(inner);

        (topic_state, group)
    }

    fn approximate_size(&self, topic: &str) -> u64 {
        // ---
        let topics = lock_ignore_poison(&self.topics);
        let Some(topic) = topics.get(topic) else {
            return 0;
        };
        let inner = lock_ignore_poison(&topic.inner);

        if inner.groups.is_empty() {
            return inner.retained.len() as u64;
        }

        inner
            .groups
            .values()
            .map(|g| lock_ignore_poison(&g.inner).backlog())
            .max()
            .unwrap_or(0) as u64
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_consumer: AtomicU64::new(1),
        }
    }
}

/// Process-global hub used by [`create_memory_backend`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// One consumer's place in a group, shared by its stream and the backend
/// so that either `close()` or dropping the stream can end it.
struct Membership {
    consumer: u64,
    group_id: String,
    topic: Arc<TopicState>,
    group: Arc<GroupState>,
    closed: AtomicBool,
    left: AtomicBool,
}

impl Membership {
    /// Requeue what this consumer still holds and leave the group.
    ///
    /// Runs once; later calls are no-ops.
    fn leave(&self) {
        // ---
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut topic = lock_ignore_poison(&self.topic.inner);
            let mut inner = lock_ignore_poison(&self.group.inner);

            let owned = inner.owned_by(self.consumer);
            inner.requeue(owned);
            inner.members = inner.members.saturating_sub(1);

            let abandoned = inner.members == 0
                && topic.kind == TopicKind::Answer
                && topic
                    .groups
                    .get(&self.group_id)
                    .is_some_and(|g| Arc::ptr_eq(g, &self.group));
            drop(inner);

            if abandoned {
                topic.groups.remove(&self.group_id);
                log_debug!("memory: answer group {} removed", self.group_id);
            }
        }
        self.group.notify.notify_waiters();
    }
}

/// In-memory backend bound to one [`MemoryHub`].
pub struct MemoryBackend {
    // ---
    hub: Arc<MemoryHub>,
    capacity: usize,
    connected: AtomicBool,
    closed: AtomicBool,
    consumers: Mutex<Vec<Arc<Membership>>>,
}

impl MemoryBackend {
    pub fn new(config: &MemoryConfig, hub: Arc<MemoryHub>) -> Self {
        // ---
        Self {
            hub,
            capacity: config.capacity,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState("memory backend is closed".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    // ---
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_producer(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Connection("memory backend is closed".into()));
        }
        if !self.connected.swap(true, Ordering::AcqRel) {
            log_debug!("memory: producer opened");
        }
        Ok(())
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        // ---
        self.ensure_open()?;
        for spec in topics {
            self.hub.declare(spec);
        }
        Ok(())
    }

    /// Append to the topic and fan out to every group of it.
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Publish("memory backend is closed".into()));
        }
        self.hub.publish(topic, key, payload, self.capacity)
    }

    async fn open_consumer(&self, topic: &str, group_id: &str) -> Result<RecordStreamBox> {
        // ---
        self.ensure_open()?;

        let (topic_state, group) = self.hub.join_group(topic, group_id);
        let consumer = self.hub.next_consumer.fetch_add(1, Ordering::Relaxed);

        let membership = Arc::new(Membership {
            consumer,
            group_id: group_id.to_string(),
            topic: topic_state,
            group,
            closed: AtomicBool::new(false),
            left: AtomicBool::new(false),
        });

        let mut consumers = lock_ignore_poison(&self.consumers);
        consumers.retain(|m| !m.left.load(Ordering::Acquire));
        consumers.push(membership.clone());
        drop(consumers);

        log_debug!("memory: consumer {consumer} joined {topic}/{group_id}");

        Ok(Box::new(MemoryRecordStream {
            topic: topic.to_string(),
            membership,
        }))
    }

    async fn ack(&self, record: &Record) -> Result<()> {
        // ---
        if let Some(group) = self.hub.find_group(&record.topic, &record.group_id) {
            let removed = lock_ignore_poison(&group.inner)
                .in_flight
                .remove(&record.offset);
            if removed.is_none() {
                log_debug!("memory: ack of untracked record {record:?}");
            }
        }
        Ok(())
    }

    async fn reject(&self, record: &Record) -> Result<()> {
        // ---
        if let Some(group) = self.hub.find_group(&record.topic, &record.group_id) {
            lock_ignore_poison(&group.inner).requeue(vec![record.offset]);
            group.notify.notify_waiters();
        }
        Ok(())
    }

    async fn topic_size(&self, topic: &str) -> Option<u64> {
        Some(self.hub.approximate_size(topic))
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let memberships = std::mem::take(&mut *lock_ignore_poison(&self.consumers));
        for membership in memberships {
            membership.closed.store(true, Ordering::Release);
            membership.leave();
        }

        log_info!("memory: backend closed");
        Ok(())
    }
}

struct MemoryRecordStream {
    topic: String,
    membership: Arc<Membership>,
}

#[async_trait::async_trait]
impl RecordStream for MemoryRecordStream {
    async fn next(&mut self) -> Option<Result<Record>> {
        // ---
        let membership = self.membership.clone();
        let group = &membership.group;

        loop {
            // Register interest before looking at the queue so a publish
            // between the check and the await still wakes us.
            let mut notified = pin!(group.notify.notified());
            notified.as_mut().enable();

            if membership.closed.load(Ordering::Acquire) {
                return None;
            }

            {
                let mut inner = lock_ignore_poison(&group.inner);
                if let Some(stored) = inner.ready.pop_front() {
                    inner
                        .in_flight
                        .insert(stored.offset, (membership.consumer, stored.clone()));

                    return Some(Ok(Record {
                        topic: self.topic.clone(),
                        group_id: membership.group_id.clone(),
                        partition: 0,
                        offset: stored.offset,
                        source: membership.consumer,
                        key: stored.key,
                        payload: stored.payload,
                    }));
                }
            }

            notified.await;
        }
    }
}

impl Drop for MemoryRecordStream {
    fn drop(&mut self) {
        self.membership.leave();
    }
}

/// Create an in-memory backend on the process-global hub.
pub fn create_memory_backend(config: &MemoryConfig) -> BackendPtr {
    create_memory_backend_with_hub(config, global_hub())
}

/// Create an in-memory backend on the provided hub.
///
/// Brokers built on the same hub exchange messages; separate hubs are fully
/// isolated, which keeps parallel tests independent.
pub fn create_memory_backend_with_hub(config: &MemoryConfig, hub: Arc<MemoryHub>) -> BackendPtr {
    Arc::new(MemoryBackend::new(config, hub))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::time::{timeout, Duration};

    fn backend(hub: &Arc<MemoryHub>, capacity: usize) -> BackendPtr {
        create_memory_backend_with_hub(&MemoryConfig { capacity }, hub.clone())
    }

    async fn next(stream: &mut RecordStreamBox) -> Record {
        timeout(Duration::from_millis(200), stream.next())
            .await
            .expect("timed out waiting for record")
            .expect("stream closed")
            .expect("stream error")
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 16);
        b.open_producer().await.unwrap();

        let mut stream = b.open_consumer("t", "g").await.unwrap();
        b.send("t", "k1", Bytes::from_static(b"hello")).await.unwrap();

        let record = next(&mut stream).await;
        assert_eq!(record.payload, Bytes::from_static(b"hello"));
        assert_eq!(record.key.as_deref(), Some("k1"));
        assert_eq!(record.group_id, "g");
    }

    #[tokio::test]
    async fn test_late_group_reads_retained_records_of_regular_topics_only() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 16);
        b.create_topics(&[TopicSpec::regular("work"), TopicSpec::answer("answers")])
            .await
            .unwrap();

        b.send("work", "k", Bytes::from_static(b"early")).await.unwrap();
        b.send("answers", "k", Bytes::from_static(b"early")).await.unwrap();

        let mut work = b.open_consumer("work", "late").await.unwrap();
        assert_eq!(next(&mut work).await.payload, Bytes::from_static(b"early"));

        let mut answers = b.open_consumer("answers", "late").await.unwrap();
        let nothing = timeout(Duration::from_millis(50), answers.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_reject_redelivers_in_order() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 16);
        let mut stream = b.open_consumer("t", "g").await.unwrap();

        b.send("t", "a", Bytes::from_static(b"1")).await.unwrap();
        b.send("t", "b", Bytes::from_static(b"2")).await.unwrap();

        let first = next(&mut stream).await;
        b.reject(&first).await.unwrap();

        let again = next(&mut stream).await;
        assert_eq!(again.offset, first.offset);
        b.ack(&again).await.unwrap();

        let second = next(&mut stream).await;
        assert_eq!(second.payload, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_dropped_stream_requeues_unacked() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 16);

        let mut stream = b.open_consumer("t", "g").await.unwrap();
        b.send("t", "k", Bytes::from_static(b"x")).await.unwrap();
        let record = next(&mut stream).await;
        drop(stream);

        let mut resubscribed = b.open_consumer("t", "g").await.unwrap();
        let again = next(&mut resubscribed).await;
        assert_eq!(again.offset, record.offset);
    }

    #[tokio::test]
    async fn test_capacity_rejects_publish() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 2);
        let _stream = b.open_consumer("t", "g").await.unwrap();

        b.send("t", "1", Bytes::new()).await.unwrap();
        b.send("t", "2", Bytes::new()).await.unwrap();
        let err = b.send("t", "3", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
        assert_eq!(b.topic_size("t").await, Some(2));
    }

    #[tokio::test]
    async fn test_answer_group_is_removed_when_its_last_consumer_leaves() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 2);
        b.create_topics(&[TopicSpec::regular("work"), TopicSpec::answer("answers")])
            .await
            .unwrap();

        let first = b.open_consumer("answers", "requester").await.unwrap();
        let second = b.open_consumer("answers", "requester").await.unwrap();
        let work = b.open_consumer("work", "workers").await.unwrap();

        drop(first);
        assert!(hub.find_group("answers", "requester").is_some());
        drop(second);
        assert!(hub.find_group("answers", "requester").is_none());

        // Nobody left to fill up, so answers keep flowing past capacity.
        for key in ["1", "2", "3", "4"] {
            b.send("answers", key, Bytes::new()).await.unwrap();
        }

        drop(work);
        assert!(hub.find_group("work", "workers").is_some());
    }

    #[tokio::test]
    async fn test_close_leaves_answer_groups() {
        // ---
        let hub = MemoryHub::new();
        let requester = backend(&hub, 2);
        let worker = backend(&hub, 2);
        requester
            .create_topics(&[TopicSpec::answer("answers")])
            .await
            .unwrap();

        let stream = requester.open_consumer("answers", "requester").await.unwrap();
        requester.close().await.unwrap();
        assert!(hub.find_group("answers", "requester").is_none());

        // Dropping the already closed stream must not leave twice.
        drop(stream);
        let _live = worker.open_consumer("answers", "requester").await.unwrap();
        assert!(hub.find_group("answers", "requester").is_some());
    }

    #[tokio::test]
    async fn test_close_ends_streams_and_is_idempotent() {
        // ---
        let hub = MemoryHub::new();
        let b = backend(&hub, 16);
        let mut stream = b.open_consumer("t", "g").await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.is_none() });
        tokio::task::yield_now().await;

        b.close().await.unwrap();
        b.close().await.unwrap();

        assert!(timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap());
        assert!(matches!(
            b.open_producer().await,
            Err(Error::Connection(_))
        ));
    }
}
