//! AMQP backend implementation using `lapin`.
//!
//! ## Topology
//!
//! - every topic is a durable **fanout exchange** of the same name
//! - every consumer group is a queue `{topic}.{group}` bound to that exchange,
//!   so each group receives every record and the consumers of a group
//!   compete for the queue
//! - answer-topic queues are non-durable, auto-delete and carry
//!   `x-message-ttl`, so unread answers expire
//!
//! A group only receives records published after its queue was first
//! declared; the exchange itself retains nothing.
//!
//! ## Channels
//!
//! The producer owns one channel in confirm mode: `send()` returns once the
//! broker confirmed the record. Each `open_consumer()` gets its own channel
//! with `basic_qos(prefetch_count)`. Delivery tags are channel scoped, so
//! `ack`/`reject` look the channel up by the record's `source` slot.
//! Dropping a stream closes its channel and the broker requeues every
//! unacknowledged delivery.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_lite::stream::StreamExt;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicNackOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ConfirmSelectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    Consumer,
    ExchangeKind,
};
use tokio::sync::watch;

use crate::broker::lock_ignore_poison;
use crate::{
    //
    log_debug,
    log_error,
    log_info,
    AmqpConfig,
    Backend,
    BackendPtr,
    Error,
    Record,
    RecordStream,
    RecordStreamBox,
    Result,
    TopicKind,
    TopicSpec,
};

type ChannelMap = Arc<Mutex<HashMap<u64, Channel>>>;

struct Link {
    connection: Arc<Connection>,
    publisher: Channel,
}

/// AMQP adapter.
pub struct AmqpBackend {
    // ---
    config: AmqpConfig,
    link: tokio::sync::Mutex<Option<Link>>,
    topic_kinds: Mutex<HashMap<String, TopicKind>>,
    group_queues: Mutex<HashMap<String, HashSet<String>>>,
    channels: ChannelMap,
    next_slot: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

impl AmqpBackend {
    fn new(config: AmqpConfig) -> Self {
        // ---
        let (closed_tx, _) = watch::channel(false);
        Self {
            config,
            link: tokio::sync::Mutex::new(None),
            topic_kinds: Mutex::new(HashMap::new()),
            group_queues: Mutex::new(HashMap::new()),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_slot: AtomicU64::new(1),
            closed_tx,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        // ---
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.connection.clone())
            .ok_or_else(|| Error::InvalidState("amqp: not connected".into()))
    }

    async fn publisher(&self) -> Result<Channel> {
        // ---
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.publisher.clone())
            .ok_or_else(|| Error::InvalidState("amqp: not connected".into()))
    }

    fn channel(&self, record: &Record) -> Option<Channel> {
        lock_ignore_poison(&self.channels)
            .get(&record.source)
            .cloned()
    }

    fn queue_args(&self, kind: TopicKind) -> (QueueDeclareOptions, FieldTable) {
        // ---
        let mut args = FieldTable::default();
        match kind {
            TopicKind::Regular => (
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args,
            ),
            TopicKind::Answer => {
                args.insert(
                    "x-message-ttl".into(),
                    AMQPValue::LongUInt(self.config.answer_ttl_ms),
                );
                (
                    QueueDeclareOptions {
                        auto_delete: true,
                        ..QueueDeclareOptions::default()
                    },
                    args,
                )
            }
        }
    }
}

#[async_trait::async_trait]
impl Backend for AmqpBackend {
    // ---
    fn name(&self) -> &str {
        "amqp"
    }

    async fn open_producer(&self) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(Error::Connection("amqp: backend is closed".into()));
        }

        let mut link = self.link.lock().await;
        if link.is_some() {
            return Ok(());
        }

        let connection = Connection::connect(&self.config.uri, ConnectionProperties::default())
            .await
            .map_err(|e| {
                let msg = format!("amqp: connection failed: {e}");
                log_error!("{msg}");
                Error::Connection(msg)
            })?;

        let publisher = connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(format!("amqp: channel creation failed: {e}")))?;

        publisher
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Connection(format!("amqp: confirm mode failed: {e}")))?;

        *link = Some(Link {
            connection: Arc::new(connection),
            publisher,
        });

        log_info!("amqp: connected");
        Ok(())
    }

    async fn create_topics(&self, topics: &[TopicSpec]) -> Result<()> {
        // ---
        let channel = self.publisher().await?;

        for spec in topics {
            channel
                .exchange_declare(
                    spec.name.clone().into(),
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    Error::Backend(format!("amqp: exchange declare {} failed: {e}", spec.name))
                })?;

            log_debug!("amqp: declared exchange {}", spec.name);
        }

        let mut kinds = lock_ignore_poison(&self.topic_kinds);
        for spec in topics {
            kinds.insert(spec.name.clone(), spec.kind);
        }
        Ok(())
    }

    async fn send(&self, topic: &str, key: &str, payload: Bytes) -> Result<()> {
        // ---
        let channel = self
            .publisher()
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        let properties = BasicProperties::default()
            .with_message_id(key.into())
            .with_delivery_mode(2);

        let confirmation = channel
            .basic_publish(
                topic.into(),
                "".into(),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| Error::Publish(format!("amqp: publish to {topic} failed: {e}")))?
            .await
            .map_err(|e| Error::Publish(format!("amqp: confirm for {topic} failed: {e}")))?;

        if confirmation.is_nack() {
            return Err(Error::Publish(format!(
                "amqp: broker refused record for {topic}"
            )));
        }
        Ok(())
    }

    async fn open_consumer(&self, topic: &str, group_id: &str) -> Result<RecordStreamBox> {
        // ---
        if self.is_closed() {
            return Err(Error::InvalidState("amqp: backend is closed".into()));
        }

        let connection = self.connection().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(format!("amqp: channel creation failed: {e}")))?;

        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| Error::Backend(format!("amqp: qos failed: {e}")))?;

        let kind = lock_ignore_poison(&self.topic_kinds)
            .get(topic)
            .copied()
            .unwrap_or(TopicKind::Regular);
        let queue = format!("{topic}.{group_id}");
        let (options, args) = self.queue_args(kind);

        channel
            .queue_declare(queue.clone().into(), options, args)
            .await
            .map_err(|e| Error::Backend(format!("amqp: queue declare {queue} failed: {e}")))?;

        channel
            .queue_bind(
                queue.clone().into(),
                topic.into(),
                "".into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Backend(format!("amqp: bind {queue} failed: {e}")))?;

        lock_ignore_poison(&self.group_queues)
            .entry(topic.to_string())
            .or_default()
            .insert(queue.clone());

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let consumer = channel
            .basic_consume(
                queue.clone().into(),
                format!("{group_id}-{slot}").into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::Backend(format!("amqp: consume {queue} failed: {e}")))?;

        lock_ignore_poison(&self.channels).insert(slot, channel);
        log_debug!("amqp: consumer {slot} started on {queue}");

        Ok(Box::new(AmqpRecordStream {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            slot,
            consumer,
            channels: self.channels.clone(),
            closed: self.closed_tx.subscribe(),
        }))
    }

    async fn ack(&self, record: &Record) -> Result<()> {
        // ---
        let Some(channel) = self.channel(record) else {
            return Ok(());
        };

        channel
            .basic_ack(record.offset as u64, BasicAckOptions::default())
            .await
            .map_err(|e| Error::Backend(format!("amqp: ack failed: {e}")))
    }

    async fn reject(&self, record: &Record) -> Result<()> {
        // ---
        let Some(channel) = self.channel(record) else {
            return Ok(());
        };

        let options = BasicNackOptions {
            requeue: true,
            ..BasicNackOptions::default()
        };
        channel
            .basic_nack(record.offset as u64, options)
            .await
            .map_err(|e| Error::Backend(format!("amqp: nack failed: {e}")))
    }

    /// Largest ready-message count among the group queues of `topic`.
    async fn topic_size(&self, topic: &str) -> Option<u64> {
        // ---
        let queues: Vec<String> = lock_ignore_poison(&self.group_queues)
            .get(topic)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        if queues.is_empty() {
            return Some(0);
        }

        // A passive declare of a vanished queue kills the channel, so use a throwaway one.
        let connection = self.connection().await.ok()?;
        let channel = connection.create_channel().await.ok()?;

        let mut largest = 0u64;
        for queue in queues {
            let options = QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            };
            match channel
                .queue_declare(queue.clone().into(), options, FieldTable::default())
                .await
            {
                Ok(declared) => largest = largest.max(u64::from(declared.message_count())),
                Err(e) => {
                    log_debug!("amqp: size of {queue} unavailable: {e}");
                    return None;
                }
            }
        }

        let _ = channel.close(200, "size query done".into()).await;
        Some(largest)
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed_tx.send_replace(true) {
            return Ok(());
        }

        let channels: Vec<Channel> = lock_ignore_poison(&self.channels)
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in channels {
            let _ = channel.close(200, "Normal shutdown".into()).await;
        }

        if let Some(link) = self.link.lock().await.take() {
            let _ = link.publisher.close(200, "Normal shutdown".into()).await;
            let _ = link.connection.close(200, "Normal shutdown".into()).await;
        }

        log_info!("amqp: backend closed");
        Ok(())
    }
}

struct AmqpRecordStream {
    topic: String,
    group_id: String,
    slot: u64,
    consumer: Consumer,
    channels: ChannelMap,
    closed: watch::Receiver<bool>,
}

#[async_trait::async_trait]
impl RecordStream for AmqpRecordStream {
    async fn next(&mut self) -> Option<Result<Record>> {
        // ---
        if *self.closed.borrow() {
            return None;
        }

        let delivery = tokio::select! {
            _ = self.closed.changed() => return None,
            delivery = self.consumer.next() => delivery?,
        };

        Some(
            delivery
                .map(|delivery| Record {
                    topic: self.topic.clone(),
                    group_id: self.group_id.clone(),
                    partition: 0,
                    offset: delivery.delivery_tag as i64,
                    source: self.slot,
                    key: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|id| id.as_str().to_string()),
                    payload: Bytes::from(delivery.data),
                })
                .map_err(|e| Error::Backend(format!("amqp: delivery failed: {e}"))),
        )
    }
}

impl Drop for AmqpRecordStream {
    fn drop(&mut self) {
        // ---
        let channel = lock_ignore_poison(&self.channels).remove(&self.slot);

        // Closing the channel hands unacked deliveries back to the queue.
        if let (Some(channel), Ok(runtime)) = (channel, tokio::runtime::Handle::try_current()) {
            runtime.spawn(async move {
                let _ = channel.close(200, "consumer dropped".into()).await;
            });
        }
    }
}

/// Creates an AMQP backend from the given configuration.
///
/// # Connection Behavior
///
/// The connection is established by `open_producer()`, not here.
pub fn create_backend(config: &AmqpConfig) -> Result<BackendPtr> {
    // ---
    config.validate()?;
    Ok(Arc::new(AmqpBackend::new(config.clone())))
}
