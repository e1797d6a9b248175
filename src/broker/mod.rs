//! Broker-agnostic messaging facade.
//!
//! A [`Broker`] owns one backend adapter and layers on top of it the
//! envelope codec, topic bookkeeping, the consume loop and the
//! request/reply ("answer") protocol.
//!
//! Lifecycle: `Uninitialized -> Connected -> Consuming -> Closed`.
//! `close()` is valid from any state and idempotent.

mod answer;
mod consumer;
mod manager;

pub use answer::AnswerWaiter;
pub use consumer::ConsumerRegistration;
pub use manager::MessageManager;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::codec::CodecPtr;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    AnswerParams,
    BackendPtr,
    BrokerConfig,
    CorrelationId,
    Error,
    MessageEnvelope,
    ReporterPtr,
    Result,
    TopicSpec,
};
use answer::AnswerRoute;
use consumer::{run_registration, LoopContext};

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Connection lifecycle of a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Uninitialized,
    Connected,
    Consuming,
    Closed,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BrokerState::Uninitialized => "uninitialized",
            BrokerState::Connected => "connected",
            BrokerState::Consuming => "consuming",
            BrokerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Topics {
    regular: HashSet<String>,
    answer: HashSet<String>,
}

/// Broker handle.
///
/// Cheap to clone; all clones share the same backend connection, topic set,
/// registrations and answer routes. Build one with
/// [`BrokerBuilder`](crate::BrokerBuilder).
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    backend: BackendPtr,
    codec: CodecPtr,
    reporter: ReporterPtr,

    // Distinguishes this instance's answer consumers from every other's.
    instance_id: Uuid,

    state: Mutex<BrokerState>,
    topics: Mutex<Topics>,
    registrations: Mutex<Vec<ConsumerRegistration>>,

    consuming: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,

    answer_routes: tokio::sync::Mutex<HashMap<String, AnswerRoute>>,
}

impl Broker {
    pub(crate) fn new(
        config: BrokerConfig,
        backend: BackendPtr,
        codec: CodecPtr,
        reporter: ReporterPtr,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(Inner {
                config,
                backend,
                codec,
                reporter,
                instance_id: Uuid::new_v4(),
                state: Mutex::new(BrokerState::Uninitialized),
                topics: Mutex::new(Topics::default()),
                registrations: Mutex::new(Vec::new()),
                consuming: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
                answer_routes: tokio::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Broker name from its configuration.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> BrokerState {
        *lock_ignore_poison(&self.inner.state)
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Establish the producer connection.
    ///
    /// Idempotent. Performs no retries; see
    /// [`wait_for_connection`](Self::wait_for_connection).
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the backend is unreachable
    /// - [`Error::InvalidState`] if the broker was closed
    pub async fn connect(&self) -> Result<()> {
        // ---
        match self.state() {
            BrokerState::Connected | BrokerState::Consuming => return Ok(()),
            BrokerState::Closed => {
                return Err(Error::InvalidState(format!(
                    "broker {} is closed",
                    self.name()
                )))
            }
            BrokerState::Uninitialized => {}
        }

        self.inner.backend.open_producer().await?;

        let mut state = lock_ignore_poison(&self.inner.state);
        match *state {
            BrokerState::Uninitialized => {
                *state = BrokerState::Connected;
                log_info!(
                    "broker {} connected ({})",
                    self.name(),
                    self.inner.backend.name()
                );
                Ok(())
            }
            // Closed while the producer was opening.
            BrokerState::Closed => Err(Error::InvalidState(format!(
                "broker {} is closed",
                self.name()
            ))),
            _ => Ok(()),
        }
    }

    /// Call [`connect`](Self::connect) until it succeeds, retrying connection
    /// failures up to `retry_max_count` attempts spaced by `retry_delay_ms`.
    pub async fn wait_for_connection(&self) -> Result<()> {
        // ---
        let retry = RetryConfig::from(&self.inner.config);
        retry_with_backoff(&retry, || self.connect()).await
    }

    /// Release every backend resource. Idempotent, valid from any state.
    ///
    /// Stops the consume loop, fails outstanding answer waiters and closes
    /// the backend adapter.
    pub async fn close(&self) -> Result<()> {
        // ---
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state == BrokerState::Closed {
                return Ok(());
            }
            *state = BrokerState::Closed;
        }

        self.stop_consuming();

        let routes: Vec<AnswerRoute> = {
            let mut routes = self.inner.answer_routes.lock().await;
            routes.drain().map(|(_, route)| route).collect()
        };
        for route in routes {
            route.shutdown().await;
        }

        self.inner.backend.close().await?;
        log_info!("broker {} closed", self.name());
        Ok(())
    }

    // ------------------------------------------------------------------
    // topics
    // ------------------------------------------------------------------

    /// Declare the topics this broker will use.
    ///
    /// Every publish, consume or answer operation must reference a topic
    /// declared here. Calling it again adds to the known sets.
    pub async fn initialize<T, A>(&self, topics: T, answer_topics: A) -> Result<()>
    where
        T: IntoIterator,
        T::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        // ---
        self.ensure_connected()?;

        let regular: Vec<String> = topics.into_iter().map(Into::into).collect();
        let answer: Vec<String> = answer_topics.into_iter().map(Into::into).collect();

        if let Some(name) = regular.iter().chain(answer.iter()).find(|t| t.is_empty()) {
            return Err(Error::UnknownTopic(format!("invalid topic name {name:?}")));
        }

        let specs: Vec<TopicSpec> = regular
            .iter()
            .map(TopicSpec::regular)
            .chain(answer.iter().map(TopicSpec::answer))
            .collect();

        self.inner.backend.create_topics(&specs).await?;

        let mut known = lock_ignore_poison(&self.inner.topics);
        known.regular.extend(regular);
        known.answer.extend(answer);

        log_debug!(
            "broker {}: topics {:?}, answer topics {:?}",
            self.name(),
            known.regular,
            known.answer
        );
        Ok(())
    }

    fn ensure_connected(&self) -> Result<()> {
        // ---
        match self.state() {
            BrokerState::Connected | BrokerState::Consuming => Ok(()),
            state => Err(Error::InvalidState(format!(
                "broker {} is {state}, connect() first",
                self.name()
            ))),
        }
    }

    fn ensure_topic(&self, topic: &str) -> Result<()> {
        // ---
        let known = lock_ignore_poison(&self.inner.topics);
        if known.regular.contains(topic) || known.answer.contains(topic) {
            Ok(())
        } else {
            Err(Error::UnknownTopic(topic.to_string()))
        }
    }

    fn ensure_answer_topic(&self, topic: &str) -> Result<()> {
        // ---
        if lock_ignore_poison(&self.inner.topics).answer.contains(topic) {
            Ok(())
        } else {
            Err(Error::UnknownTopic(format!("{topic} is not an answer topic")))
        }
    }

    /// Best-effort backlog depth of `topic`; `0` when the backend cannot tell.
    pub async fn get_topic_approximate_size(&self, topic: &str) -> u64 {
        self.inner.backend.topic_size(topic).await.unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // publish
    // ------------------------------------------------------------------

    /// Encode and send `envelopes` to `topic`, in list order, each keyed by
    /// its id. Returns once the backend accepted every record.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownTopic`] if `topic` was never initialized
    /// - [`Error::Serialization`] if an envelope cannot be encoded
    /// - [`Error::Publish`] if the backend rejects a record
    pub async fn publish(&self, topic: &str, envelopes: &[MessageEnvelope]) -> Result<()> {
        // ---
        self.ensure_topic(topic)?;
        self.ensure_connected()?;

        // Encode the whole batch before the first send.
        let mut encoded = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            encoded.push((envelope.key(), envelope.encode(self.inner.codec.as_ref())?));
        }

        for (key, bytes) in encoded {
            self.inner.backend.send(topic, &key, bytes).await?;
        }

        log_debug!(
            "broker {}: published {} record(s) to {topic}",
            self.name(),
            envelopes.len()
        );
        Ok(())
    }

    /// Publish only if `topic` currently looks empty.
    ///
    /// Returns `false` (and sends nothing) when the approximate size is
    /// non-zero.
    pub async fn publish_alone(&self, topic: &str, envelopes: &[MessageEnvelope]) -> Result<bool> {
        // ---
        self.ensure_topic(topic)?;
        self.ensure_connected()?;

        let size = self.get_topic_approximate_size(topic).await;
        if size > 0 {
            log_debug!("broker {}: {topic} holds {size} record(s), skipped", self.name());
            return Ok(false);
        }

        self.publish(topic, envelopes).await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // consume
    // ------------------------------------------------------------------

    /// Register a handler. Must happen before [`start_consuming`](Self::start_consuming).
    pub fn add_consumer(&self, registration: ConsumerRegistration) -> Result<()> {
        // ---
        if self.state() == BrokerState::Closed {
            return Err(Error::InvalidState(format!(
                "broker {} is closed",
                self.name()
            )));
        }
        if self.inner.consuming.load(Ordering::Acquire) {
            return Err(Error::InvalidState(
                "consumers cannot be added while consuming".into(),
            ));
        }
        self.ensure_topic(registration.topic())?;

        log_debug!("broker {}: registered {registration:?}", self.name());
        lock_ignore_poison(&self.inner.registrations).push(registration);
        Ok(())
    }

    /// Run the consume loop until [`stop_consuming`](Self::stop_consuming)
    /// or [`close`](Self::close).
    ///
    /// Every registration is served by its own task; records of one
    /// registration are handled sequentially. The registrations are
    /// snapshotted here and not read again.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyConsuming`] if a loop is already running
    /// - [`Error::InvalidState`] without a connection or registrations
    /// - adapter errors from opening the consumers
    pub async fn start_consuming(&self) -> Result<()> {
        // ---
        self.ensure_connected()?;

        if self
            .inner
            .consuming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyConsuming);
        }

        let result = self.consume().await;

        *lock_ignore_poison(&self.inner.stop_tx) = None;
        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state == BrokerState::Consuming {
                *state = BrokerState::Connected;
            }
        }
        self.inner.consuming.store(false, Ordering::Release);

        result
    }

    async fn consume(&self) -> Result<()> {
        // ---
        let registrations = lock_ignore_poison(&self.inner.registrations).clone();
        if registrations.is_empty() {
            return Err(Error::InvalidState(
                "start_consuming() needs at least one consumer".into(),
            ));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *lock_ignore_poison(&self.inner.stop_tx) = Some(stop_tx);

        // Open every consumer before serving any of them.
        let mut streams = Vec::with_capacity(registrations.len());
        for registration in &registrations {
            let stream = self
                .inner
                .backend
                .open_consumer(registration.topic(), registration.group_id())
                .await?;
            streams.push(stream);
        }

        {
            let mut state = lock_ignore_poison(&self.inner.state);
            if *state != BrokerState::Connected {
                return Ok(());
            }
            *state = BrokerState::Consuming;
        }

        let ctx = LoopContext {
            backend: self.inner.backend.clone(),
            codec: self.inner.codec.clone(),
            reporter: self.inner.reporter.clone(),
        };

        let mut tasks = JoinSet::new();
        for (registration, stream) in registrations.into_iter().zip(streams) {
            tasks.spawn(run_registration(
                ctx.clone(),
                registration,
                stream,
                stop_rx.clone(),
            ));
        }

        log_info!(
            "broker {}: consuming with {} consumer(s)",
            self.name(),
            tasks.len()
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                self.inner
                    .reporter
                    .log_error(&format!("consumer task aborted: {err}"));
            }
        }

        log_info!("broker {}: consuming stopped", self.name());
        Ok(())
    }

    /// Ask the consume loop to exit once in-flight records are handled.
    ///
    /// Does not close the connection. No-op when not consuming.
    pub fn stop_consuming(&self) {
        // ---
        if let Some(tx) = lock_ignore_poison(&self.inner.stop_tx).as_ref() {
            let _ = tx.send(true);
        }
    }

    // ------------------------------------------------------------------
    // answers
    // ------------------------------------------------------------------

    /// Register interest in the answer tagged `correlation_id` on
    /// `answer_topic`.
    ///
    /// Starts the topic's answer consumer on first use. Register before
    /// publishing the request so a fast reply cannot be missed.
    pub async fn expect_answer(
        &self,
        answer_topic: &str,
        correlation_id: CorrelationId,
    ) -> Result<AnswerWaiter> {
        // ---
        self.ensure_connected()?;
        self.ensure_answer_topic(answer_topic)?;

        let mut routes = self.inner.answer_routes.lock().await;

        if !routes.contains_key(answer_topic) {
            let group_id = format!("{}-answers-{}", self.name(), self.inner.instance_id.simple());
            let stream = self
                .inner
                .backend
                .open_consumer(answer_topic, &group_id)
                .await?;

            let route = AnswerRoute::spawn(
                answer_topic.to_string(),
                stream,
                self.inner.backend.clone(),
                self.inner.codec.clone(),
                self.inner.reporter.clone(),
            );
            routes.insert(answer_topic.to_string(), route);
        }

        let pending = match routes.get(answer_topic) {
            Some(route) => route.pending.clone(),
            None => return Err(Error::InvalidState("answer route vanished".into())),
        };
        drop(routes);

        let rx = lock_ignore_poison(&pending)
            .register(correlation_id.clone())
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "an answer for {correlation_id} on {answer_topic} is already awaited"
                ))
            })?;

        Ok(AnswerWaiter::new(
            answer_topic.to_string(),
            correlation_id,
            rx,
            pending,
        ))
    }

    /// Wait up to `max_delay` for the answer tagged `correlation_id`.
    ///
    /// Only sees answers published after this call registered. Use
    /// [`expect_answer`](Self::expect_answer) or [`request`](Self::request)
    /// when the request is published by the caller.
    pub async fn get_answer(
        &self,
        answer_topic: &str,
        correlation_id: CorrelationId,
        max_delay: Duration,
    ) -> Result<MessageEnvelope> {
        // ---
        let waiter = self.expect_answer(answer_topic, correlation_id).await?;
        waiter.wait(max_delay).await
    }

    /// Publish `envelope` to `answer_topic` as the answer for `correlation_id`.
    pub async fn publish_answer(
        &self,
        answer_topic: &str,
        correlation_id: CorrelationId,
        envelope: &MessageEnvelope,
    ) -> Result<()> {
        // ---
        self.ensure_answer_topic(answer_topic)?;
        let answer = envelope.as_answer(correlation_id);
        self.publish(answer_topic, std::slice::from_ref(&answer)).await
    }

    /// Publish `envelope` to `topic` asking for a reply on `answer_topic`,
    /// and wait up to `max_delay` for it.
    pub async fn request(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
        answer_topic: &str,
        max_delay: Duration,
    ) -> Result<MessageEnvelope> {
        // ---
        self.ensure_topic(topic)?;

        let correlation_id = CorrelationId::generate();
        let waiter = self
            .expect_answer(answer_topic, correlation_id.clone())
            .await?;

        let request = envelope.with_answer_params(AnswerParams {
            topic: answer_topic.to_string(),
            correlation_id,
        });
        self.publish(topic, std::slice::from_ref(&request)).await?;

        waiter.wait(max_delay).await
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("name", &self.inner.config.name)
            .field("backend", &self.inner.backend.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if matches!(state, BrokerState::Connected | BrokerState::Consuming) {
            log_warn!("broker {} dropped while {state}, call close()", self.config.name);
        }
    }
}
