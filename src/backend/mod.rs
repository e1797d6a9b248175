//! Backend adapters.
//!
//! This module provides concrete implementations of the domain-level
//! `Backend` trait. Adapters for external brokers sit behind feature flags
//! and are exposed only through constructor functions.
//!
//! Domain code must not depend on adapter-specific types.

mod memory;

#[cfg(feature = "backend_lapin")]
mod amqp;

#[cfg(feature = "backend_rdkafka")]
mod kafka;

pub use memory::{create_memory_backend, create_memory_backend_with_hub, MemoryBackend, MemoryHub};

#[cfg(feature = "backend_lapin")]
pub use amqp::create_backend as create_amqp_backend;

#[cfg(feature = "backend_rdkafka")]
pub use kafka::create_backend as create_kafka_backend;

use crate::{BackendConfig, BackendPtr, Result};

/// Create the adapter selected by `config`.
///
/// # Errors
///
/// Returns [`Error::Configuration`](crate::Error::Configuration) when the
/// backend's cargo feature is not enabled.
pub fn create_backend(config: &BackendConfig) -> Result<BackendPtr> {
    // ---
    match config {
        BackendConfig::Memory(memory) => Ok(create_memory_backend(memory)),

        #[cfg(feature = "backend_rdkafka")]
        BackendConfig::Kafka(kafka) => create_kafka_backend(kafka),

        #[cfg(not(feature = "backend_rdkafka"))]
        BackendConfig::Kafka(_) => Err(disabled("kafka", "backend_rdkafka")),

        #[cfg(feature = "backend_lapin")]
        BackendConfig::Amqp(amqp) => create_amqp_backend(amqp),

        #[cfg(not(feature = "backend_lapin"))]
        BackendConfig::Amqp(_) => Err(disabled("amqp", "backend_lapin")),
    }
}

#[cfg(any(not(feature = "backend_rdkafka"), not(feature = "backend_lapin")))]
fn disabled(backend: &str, feature: &str) -> crate::Error {
    crate::Error::Configuration(format!(
        "{backend} backend requires the `{feature}` cargo feature"
    ))
}
