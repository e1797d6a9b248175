//! Broker builder.
//!
//! Validates the broker definition eagerly and wires the backend adapter,
//! codec and reporter into a [`Broker`].

use crate::backend::create_backend;
use crate::codec::{codec_for, CodecPtr};
use crate::{BackendPtr, Broker, BrokerConfig, ReporterPtr, Result, TracingReporter};
use std::sync::Arc;

/// Builder for [`Broker`] instances.
///
/// By default the backend is created from `config.backend`, the codec from
/// `config.content_type` and `config.compression`, and failures inside the
/// consume loop are reported through a [`TracingReporter`].
///
/// # Examples
///
/// ## In-memory broker
/// ```
/// use mom_broker::{BrokerBuilder, BrokerConfig};
///
/// # fn example() -> mom_broker::Result<()> {
/// let broker = BrokerBuilder::new(BrokerConfig::memory("jobs")).build()?;
/// assert_eq!(broker.name(), "jobs");
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
///
/// ## Isolated hub for tests
/// ```
/// use mom_broker::{create_memory_backend_with_hub, BrokerBuilder, BrokerConfig, MemoryConfig, MemoryHub};
///
/// # fn example() -> mom_broker::Result<()> {
/// let hub = MemoryHub::new();
/// let backend = create_memory_backend_with_hub(&MemoryConfig::default(), hub.clone());
///
/// let broker = BrokerBuilder::new(BrokerConfig::memory("worker"))
///     .backend(backend)
///     .build()?;
/// # Ok(())
/// # }
/// # example().unwrap();
/// ```
pub struct BrokerBuilder {
    // ---
    config: BrokerConfig,
    backend: Option<BackendPtr>,
    codec: Option<CodecPtr>,
    reporter: Option<ReporterPtr>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        // ---
        Self {
            config,
            backend: None,
            codec: None,
            reporter: None,
        }
    }

    /// Use an already constructed backend adapter instead of creating one
    /// from `config.backend`.
    ///
    /// The adapter must not be shared with another broker.
    pub fn backend(mut self, backend: BackendPtr) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Override the codec derived from the configured content type.
    pub fn codec(mut self, codec: CodecPtr) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Route consume-loop failures to a custom reporter.
    pub fn reporter(mut self, reporter: ReporterPtr) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Build the broker (consumes self).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::Error::Configuration) for an
    /// invalid definition, an unsupported codec, or a backend whose cargo
    /// feature is disabled.
    pub fn build(self) -> Result<Broker> {
        // ---
        self.config.validate()?;

        let codec = match self.codec {
            Some(codec) => codec,
            None => codec_for(&self.config.content_type, self.config.compression)?,
        };

        let backend = match self.backend {
            Some(backend) => backend,
            None => create_backend(&self.config.backend)?,
        };

        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter::new(self.config.name.clone())));

        Ok(Broker::new(self.config, backend, codec, reporter))
    }
}
