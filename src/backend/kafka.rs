//! Kafka backend implementation using `rdkafka`.
//!
//! ## Mapping
//!
//! - topic → Kafka topic, created through the admin API
//! - consumer group → Kafka consumer group (`group.id`)
//! - `ack` → synchronous commit of `offset + 1` for the record's partition
//! - `reject` → seek the partition back to the record's offset
//!
//! Auto commit is disabled: an offset only moves when the handler acks.
//! Regular topics are subscribed and read from the earliest uncommitted
//! offset. Answer topics are created with a short `retention.ms`; their
//! consumers skip the group protocol and are assigned every partition at
//! the high watermark read while `open_consumer()` runs, so any answer
//! produced after it returns is seen.
//!
//! Every `open_consumer()` creates its own `StreamConsumer`. Dropping the
//! returned stream drops the client, the group rebalances, and uncommitted
//! records are delivered again.
//!
//! The metadata calls of `librdkafka` block, so connectivity checks and
//! backlog queries run on the blocking pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaResult, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;

use crate::broker::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    Backend,
    BackendPtr,
    Error,
    KafkaConfig,
    Record,
    RecordStream,
    RecordStreamBox,
    Result,
    TopicKind,
    TopicSpec,
};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type ConsumerMap = Arc<Mutex<HashMap<u64, Arc<StreamConsumer>>>>;

/// Kafka adapter.
pub struct KafkaBackend {
    // ---
    config: KafkaConfig,
    producer: Mutex<Option<FutureProducer>>,
    topic_kinds: Mutex<HashMap<String, TopicKind>>,
    consumers: ConsumerMap,
    next_slot: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl KafkaBackend {
    fn new(config: KafkaConfig) -> Self {
        // ---
        let (closed_tx, _) = watch::channel(false);
        Self {
            config,
            producer: Mutex::new(None),
            topic_kinds: Mutex::new(HashMap::new()),
            consumers: Arc::new(Mutex::new(HashMap::new())),
            next_slot: AtomicU64::new(1),
            closed_tx,
        }
    }

    /// Settings shared by producer, admin and consumer clients.
    fn client_config(&self) -> ClientConfig {
        // ---
        let mut client = ClientConfig::new();
        client.set("bootstrap.servers", self.config.brokers_string());

        if let Some(client_id) = &self.config.client_id {
            client.set("client.id", client_id);
        }

        if let Some(version) = &self.config.api_version {
            client
                .set("api.version.request", "false")
                .set("broker.version.fallback", version);
        }

        if let Some(security) = &self.config.security {
            client.set("security.protocol", &security.protocol);
            if let Some(mechanism) = &security.mechanism {
                client.set("sasl.mechanism", mechanism);
            }
            if let Some(username) = &security.username {
                client.set("sasl.username", username);
            }
            if let Some(password) = &security.password {
                client.set("sasl.password", password);
            }
        }

        client
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn producer(&self) -> Result<FutureProducer> {
        // ---
        lock_ignore_poison(&self.producer)
            .clone()
            .ok_or_else(|| Error::InvalidState("kafka: producer is not open".into()))
    }

    fn consumer(&self, record: &Record) -> Option<Arc<StreamConsumer>> {
        lock_ignore_poison(&self.consumers)
            .get(&record.source)
            .cloned()
    }
}

#[async_trait::async_trait]
impl Backend for KafkaBackend {
    // ---
    fn name(&self) -> &str {
        "kafka"
    }

    async fn open_producer(&self) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(Error::Connection("kafka: backend is closed".into()));
        }
        if lock_ignore_poison(&self.producer).is_some() {
            return Ok(());
        }

        let producer: FutureProducer = self
            .client_config()
            .set("message.timeout.ms", self.config.send_timeout_ms.to_string())
            .create()
            .map_err(|e| Error::Connection(format!("kafka: producer creation failed: {e}")))?;

        // Clients connect lazily; a metadata round trip proves the cluster is reachable.
        let metadata_client = producer.clone();
        tokio::task::spawn_blocking(move || {
            metadata_client
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
        })
        .await
        .map_err(|e| Error::Connection(format!("kafka: metadata task failed: {e}")))?
        .map_err(|e| {
            let msg = format!(
                "kafka: brokers {} unreachable: {e}",
                self.config.brokers_string()
            );
            log_error!("{msg}");
            Error::Connection(msg)
        })?;

        *lock_ignore_poison(&self.producer) = Some(producer);
        log_info!("kafka: connected to {}", self.config.brokers_string());
        Ok(())
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        // ---
        if topics.is_empty() {
            return Ok(());
        }

        let admin: AdminClient<DefaultClientContext> = self
            .client_config()
            .create()
            .map_err(|e| Error::Connection(format!("kafka: admin client creation failed: {e}")))?;

        let retention = self.config.answer_retention_ms.to_string();
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|spec| {
                let topic = NewTopic::new(
                    &spec.name,
                    self.config.partitions,
                    TopicReplication::Fixed(self.config.replication_factor),
                );
                match spec.kind {
                    TopicKind::Answer => topic.set("retention.ms", &retention),
                    TopicKind::Regular => topic,
                }
            })
            .collect();

        let results = admin
            .create_topics(new_topics.iter(), &AdminOptions::new())
            .await
            .map_err(|e| Error::Backend(format!("kafka: create topics failed: {e}")))?;

        for result in results {
            match result {
                Ok(name) => log_debug!("kafka: created topic {name}"),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(Error::Backend(format!(
                        "kafka: create topic {name} failed: {code}"
                    )))
                }
            }
        }

        let mut kinds = lock_ignore_poison(&self.topic_kinds);
        for spec in topics {
            kinds.insert(spec.name.clone(), spec.kind);
        }
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        // ---
        let producer = self.producer().map_err(|e| Error::Publish(e.to_string()))?;
        let record = FutureRecord::to(topic).key(key).payload(&payload[..]);

        producer
            .send(record, self.config.send_timeout())
            .await
            .map_err(|(err, _)| Error::Publish(format!("kafka: send to {topic} failed: {err}")))?;

        Ok(())
    }

    async fn open_consumer(&self, topic: &str, group_id: &str) -> Result<RecordStreamBox> {
        // ---
        if self.is_closed() {
            return Err(Error::InvalidState("kafka: backend is closed".into()));
        }

        let kind = lock_ignore_poison(&self.topic_kinds)
            .get(topic)
            .copied()
            .unwrap_or(TopicKind::Regular);
        let offset_reset = match kind {
            TopicKind::Regular => "earliest",
            TopicKind::Answer => "latest",
        };

        let consumer: StreamConsumer = self
            .client_config()
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "30000")
            .create()
            .map_err(|e| Error::Connection(format!("kafka: consumer creation failed: {e}")))?;
        let consumer = Arc::new(consumer);

        match kind {
            TopicKind::Regular => consumer
                .subscribe(&[topic])
                .map_err(|e| Error::Backend(format!("kafka: subscribe to {topic} failed: {e}")))?,
            TopicKind::Answer => {
                let watermarks = high_watermarks(consumer.clone(), topic).await?;
                let assignment = answer_assignment(topic, &watermarks)?;
                consumer
                    .assign(&assignment)
                    .map_err(|e| Error::Backend(format!("kafka: assign {topic} failed: {e}")))?;
            }
        }

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        lock_ignore_poison(&self.consumers).insert(slot, consumer.clone());

        log_debug!("kafka: consumer {slot} reading {topic} as {group_id}");

        Ok(Box::new(KafkaRecordStream {
            group_id: group_id.to_string(),
            slot,
            consumer,
            consumers: self.consumers.clone(),
            closed: self.closed_tx.subscribe(),
        }))
    }

    async fn ack(&self, record: &Record) -> Result<()> {
        // ---
        let Some(consumer) = self.consumer(record) else {
            return Ok(());
        };

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )
        .map_err(|e| Error::Backend(format!("kafka: commit failed: {e}")))?;

        consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| Error::Backend(format!("kafka: commit failed: {e}")))
    }

    async fn reject(&self, record: &Record) -> Result<()> {
        // ---
        let Some(consumer) = self.consumer(record) else {
            return Ok(());
        };

        consumer
            .seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| Error::Backend(format!("kafka: seek failed: {e}")))
    }

    /// Sum of `high - low` watermarks over every partition.
    async fn topic_size(&self, topic: &str) -> Option<u64> {
        // ---
        let producer = self.producer().ok()?;
        let topic_name = topic;
        let topic = topic.to_string();

        let size = tokio::task::spawn_blocking(move || -> rdkafka::error::KafkaResult<u64> {
            let client = producer.client();
            let metadata = client.fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;

            let mut total = 0u64;
            for partition in metadata.topics().iter().flat_map(|t| t.partitions()) {
                let (low, high) = client.fetch_watermarks(&topic, partition.id(), METADATA_TIMEOUT)?;
                total += (high - low).max(0) as u64;
            }
            Ok(total)
        })
        .await
        .ok()?;

        match size {
            Ok(size) => Some(size),
            Err(e) => {
                log_debug!("kafka: size of {topic_name} unavailable: {e}");
                None
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        lock_ignore_poison(&self.consumers).clear();

        let producer = lock_ignore_poison(&self.producer).take();
        if let Some(producer) = producer {
            tokio::task::spawn_blocking(move || producer.flush(METADATA_TIMEOUT))
                .await
                .map_err(|e| Error::Backend(format!("kafka: flush task failed: {e}")))?
                .map_err(|e| Error::Backend(format!("kafka: flush failed: {e}")))?;
        }

        log_info!("kafka: backend closed");
        Ok(())
    }
}

struct KafkaRecordStream {
    group_id: String,
    slot: u64,
    consumer: Arc<StreamConsumer>,
    consumers: ConsumerMap,
    closed: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl RecordStream for KafkaRecordStream {
    async fn next(&mut self) -> Option<Result<Record>> {
        // ---
        if *self.closed.borrow() {
            return None;
        }

        let consumer = self.consumer.clone();
        tokio::select! {
            _ = self.closed.changed() => None,
            received = consumer.recv() => Some(
                received
                    .map(|msg| Record {
                        topic: msg.topic().to_string(),
                        group_id: self.group_id.clone(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        source: self.slot,
                        key: msg.key().map(|k| String::from_utf8_lossy(k).into_owned()),
                        payload: Bytes::copy_from_slice(msg.payload().unwrap_or_default()),
                    })
                    .map_err(|e| Error::Backend(format!("kafka: receive failed: {e}"))),
            ),
        }
    }
}

impl Drop for KafkaRecordStream {
    fn drop(&mut self) {
        lock_ignore_poison(&self.consumers).remove(&self.slot);
    }
}

/// `(partition, high watermark)` for every partition of `topic`.
async fn high_watermarks(consumer: Arc<StreamConsumer>, topic: &str) -> Result<Vec<(i32, i64)>> {
    // ---
    let topic_name = topic.to_string();

    tokio::task::spawn_blocking(move || -> KafkaResult<Vec<(i32, i64)>> {
        let metadata = consumer.fetch_metadata(Some(&topic_name), METADATA_TIMEOUT)?;
        let mut watermarks = Vec::new();
        for partition in metadata.topics().iter().flat_map(|t| t.partitions()) {
            let (_, high) = consumer.fetch_watermarks(&topic_name, partition.id(), METADATA_TIMEOUT)?;
            watermarks.push((partition.id(), high));
        }
        Ok(watermarks)
    })
    .await
    .map_err(|e| Error::Backend(format!("kafka: metadata task failed: {e}")))?
    .map_err(|e| Error::Backend(format!("kafka: watermarks of {topic} unavailable: {e}")))
}

/// Explicit assignment starting each partition at its high watermark.
fn answer_assignment(topic: &str, watermarks: &[(i32, i64)]) -> Result<TopicPartitionList> {
    // ---
    if watermarks.is_empty() {
        return Err(Error::Backend(format!(
            "kafka: answer topic {topic} has no partitions"
        )));
    }

    let mut assignment = TopicPartitionList::with_capacity(watermarks.len());
    for &(partition, high) in watermarks {
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(high))
            .map_err(|e| Error::Backend(format!("kafka: assignment of {topic} failed: {e}")))?;
    }
    Ok(assignment)
}

/// Creates a Kafka backend from the given configuration.
///
/// No connection is made here; it happens in `open_producer()`.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the configuration is invalid.
pub fn create_backend(config: &KafkaConfig) -> Result<BackendPtr> {
    // ---
    config.validate()?;
    Ok(Arc::new(KafkaBackend::new(config.clone())))
}
