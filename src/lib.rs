//! Broker-agnostic messaging over asynchronous message brokers.
//!
//! This library provides one [`Broker`] interface for publishing envelopes,
//! consuming them with explicit acknowledgment, and running request/reply
//! ("answer") exchanges on top of pub/sub. The concrete broker (Kafka,
//! RabbitMQ, or the in-process memory backend) sits behind the [`Backend`]
//! trait and is selected by configuration.
//!

// Import all sub modules once...
mod backend;
mod broker;
mod broker_builder;
mod domain;
mod macros;

mod codec;
mod config;
mod correlation;
mod error;
mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use broker::{AnswerWaiter, Broker, BrokerState, ConsumerRegistration, MessageManager};
pub use broker_builder::BrokerBuilder;

pub use codec::{codec_for, Codec, CodecPtr, Compression, JsonCodec, CONTENT_TYPE_JSON};
pub use config::{AmqpConfig, BackendConfig, BrokerConfig, KafkaConfig, KafkaSecurity, MemoryConfig};
pub use correlation::CorrelationId;
pub use error::{Error, Result};
pub use retry::RetryConfig;

pub use backend::{
    //
    create_backend,
    create_memory_backend,
    create_memory_backend_with_hub,
    MemoryBackend,
    MemoryHub,
};

#[cfg(feature = "backend_rdkafka")]
pub use backend::create_kafka_backend;

#[cfg(feature = "backend_lapin")]
pub use backend::create_amqp_backend;

// --- public re-exports
pub use domain::{
    //
    to_payload,
    AnswerParams,
    Backend,
    BackendPtr,
    MessageEnvelope,
    Payload,
    Record,
    RecordStream,
    RecordStreamBox,
    Reporter,
    ReporterPtr,
    TopicKind,
    TopicSpec,
    TracingReporter,
};
