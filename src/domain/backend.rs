// src/domain/backend.rs

//! Backend adapter boundary.
//!
//! This module defines the narrow set of primitives a concrete message-broker
//! client must provide so that [`Broker`](crate::Broker) can run on top of it.
//! It intentionally avoids any reference to concrete protocols or client
//! libraries; adapters live under `src/backend/`.
//!
//! The adapter only moves opaque bytes. Envelope encoding, topic bookkeeping,
//! the consume loop and the answer protocol are all handled by the broker.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::Result;

/// Role of a topic, passed to [`Backend::create_topics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// Regular work topic, retained until consumed by every group.
    Regular,
    /// Answer topic: short retention, consumers start from the newest record.
    Answer,
}

/// A topic to declare on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicSpec {
    pub name: String,
    pub kind: TopicKind,
}

impl TopicSpec {
    pub fn regular(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Regular,
        }
    }

    pub fn answer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TopicKind::Answer,
        }
    }
}

/// A raw record received from the backend.
///
/// `partition`, `offset` and `source` are adapter-defined coordinates that
/// let the adapter find the record again in [`Backend::ack`] and
/// [`Backend::reject`]:
///
/// - memory: `offset` is the per-group sequence number, `source` the consumer
/// - kafka: partition/offset of the message, `source` the consumer slot
/// - amqp: `offset` is the delivery tag, `source` the channel slot
#[derive(Clone)]
pub struct Record {
    pub topic: String,
    pub group_id: String,
    pub partition: i32,
    pub offset: i64,
    pub source: u64,
    pub key: Option<String>,
    pub payload: Bytes,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("source", &self.source)
            .field("key", &self.key)
            .field("len", &self.payload.len())
            .finish()
    }
}

/// Stream of records for one `(topic, group)` subscription.
///
/// Dropping the stream closes the underlying consumer. Records that were
/// handed out but never acknowledged become eligible for redelivery.
#[async_trait::async_trait]
pub trait RecordStream: Send {
    /// Wait for the next record.
    ///
    /// Returns `None` once the consumer is closed. `Some(Err(_))` reports a
    /// transient receive failure; the stream stays usable.
    ///
    /// Implementations must be cancel safe: dropping the future before it
    /// resolves must not lose a record.
    async fn next(&mut self) -> Option<Result<Record>>;
}

/// Boxed record stream returned by [`Backend::open_consumer`].
pub type RecordStreamBox = Box<dyn RecordStream>;

/// Backend adapter.
///
/// One adapter instance is owned by exactly one broker and holds that
/// broker's physical connections.
///
/// Implementations must ensure that:
/// - `open_producer()` is idempotent.
/// - `send()` returns only after the backend accepted the record.
/// - Every `ack`/`reject` is a no-op for records the adapter no longer tracks.
/// - `close()` is idempotent and releases producer and consumer clients.
///
/// The in-memory adapter is the reference implementation of these semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    // ---
    /// Short adapter name used in logs (`"memory"`, `"kafka"`, `"amqp"`).
    fn name(&self) -> &str;

    /// Establish the producer connection.
    async fn open_producer(&self) -> Result<()>;

    /// Declare topics; existing topics are left as they are.
    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()>;

    /// Send one record, keyed for partition routing.
    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()>;

    /// Open a consumer for `topic` within `group_id`.
    ///
    /// Consumers sharing a group compete for records; distinct groups each
    /// see every record.
    async fn open_consumer(&self, topic: &str, group_id: &str) -> Result<RecordStreamBox>;

    /// Mark a record as processed.
    async fn ack(&self, record: &Record) -> Result<()>;

    /// Make a record eligible for redelivery.
    async fn reject(&self, record: &Record) -> Result<()>;

    /// Approximate backlog of `topic`, `None` if the adapter cannot tell.
    async fn topic_size(&self, topic: &str) -> Option<u64>;

    /// Release every client held by the adapter.
    async fn close(&self) -> Result<()>;
}

/// Shared backend pointer.
///
/// `.clone()` is cheap; every clone refers to the same physical connection.
pub type BackendPtr = Arc<dyn Backend>;
