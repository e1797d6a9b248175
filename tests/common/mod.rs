// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mom_broker::{
    // ---
    create_memory_backend_with_hub,
    BackendConfig,
    BackendPtr,
    Broker,
    BrokerBuilder,
    BrokerConfig,
    BrokerState,
    MemoryConfig,
    MemoryHub,
    Reporter,
};

/// Reporter that keeps every line for assertions.
#[derive(Default)]
pub struct RecordingReporter {
    warnings: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingReporter {
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn log_warning(&self, msg: &str) {
        self.warnings.lock().unwrap().push(msg.to_string());
    }

    fn log_error(&self, msg: &str) {
        self.errors.lock().unwrap().push(msg.to_string());
    }
}

pub struct TestBroker {
    pub broker: Broker,
    pub backend: BackendPtr,
    pub reporter: Arc<RecordingReporter>,
}

/// Broker on `hub` with a recording reporter, not yet connected.
pub fn memory_broker(hub: &Arc<MemoryHub>, name: &str) -> TestBroker {
    // ---
    memory_broker_with(hub, BrokerConfig::memory(name))
}

pub fn memory_broker_with(hub: &Arc<MemoryHub>, config: BrokerConfig) -> TestBroker {
    // ---
    init_logging();

    let memory = match &config.backend {
        BackendConfig::Memory(memory) => memory.clone(),
        _ => MemoryConfig::default(),
    };
    let backend = create_memory_backend_with_hub(&memory, hub.clone());
    let reporter = Arc::new(RecordingReporter::default());

    let broker = BrokerBuilder::new(config)
        .backend(backend.clone())
        .reporter(reporter.clone())
        .build()
        .expect("failed to build broker");

    TestBroker {
        broker,
        backend,
        reporter,
    }
}

/// Connected broker with `topics` and `answer_topics` initialized.
pub async fn ready_broker(
    hub: &Arc<MemoryHub>,
    name: &str,
    topics: &[&str],
    answer_topics: &[&str],
) -> TestBroker {
    // ---
    ready_broker_with(hub, BrokerConfig::memory(name), topics, answer_topics).await
}

pub async fn ready_broker_with(
    hub: &Arc<MemoryHub>,
    config: BrokerConfig,
    topics: &[&str],
    answer_topics: &[&str],
) -> TestBroker {
    // ---
    let test = memory_broker_with(hub, config);
    test.broker.connect().await.expect("connect failed");
    test.broker
        .initialize(topics.iter().copied(), answer_topics.iter().copied())
        .await
        .expect("initialize failed");
    test
}

/// Poll until the broker reaches `state`.
pub async fn wait_for_state(broker: &Broker, state: BrokerState) {
    // ---
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("broker never reached {state}"));
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;
    use tracing_subscriber::EnvFilter;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
