//! Request/reply demultiplexing.
//!
//! Each answer topic gets exactly one consumer per broker instance. That
//! consumer acknowledges every record it reads and hands it to the waiter
//! registered under the record's correlation id. Answers nobody waits for
//! are discarded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::lock_ignore_poison;
use crate::codec::CodecPtr;
use crate::{
    // ---
    log_debug,
    BackendPtr,
    CorrelationId,
    Error,
    MessageEnvelope,
    RecordStreamBox,
    ReporterPtr,
    Result,
};

/// Waiters of one answer topic, keyed by correlation id.
pub(super) struct PendingAnswers {
    // ---
    waiters: HashMap<CorrelationId, oneshot::Sender<MessageEnvelope>>,
}

impl PendingAnswers {
    // ---

    pub fn new() -> Self {
        Self {
            waiters: HashMap::new(),
        }
    }

    /// Register interest in `correlation_id`.
    ///
    /// Returns `None` if somebody already waits for the same id.
    pub fn register(
        &mut self,
        correlation_id: CorrelationId,
    ) -> Option<oneshot::Receiver<MessageEnvelope>> {
        // ---
        if self.waiters.contains_key(&correlation_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id, tx);
        Some(rx)
    }

    /// Deliver an answer. Returns false when no waiter was registered.
    pub fn complete(&mut self, correlation_id: &CorrelationId, answer: MessageEnvelope) -> bool {
        // ---
        match self.waiters.remove(correlation_id) {
            // The receiver may already be gone after a timeout.
            Some(tx) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Drop every waiter; their `wait()` fails immediately.
    pub fn clear(&mut self) {
        self.waiters.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

pub(super) type SharedPending = Arc<Mutex<PendingAnswers>>;

/// A registered interest in one answer.
///
/// Obtained from [`Broker::expect_answer`](crate::Broker::expect_answer)
/// before the request is published, so an answer arriving quickly cannot be
/// missed. Dropping the waiter withdraws the registration.
pub struct AnswerWaiter {
    topic: String,
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<MessageEnvelope>,
    pending: SharedPending,
}

impl std::fmt::Debug for AnswerWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerWaiter")
            .field("topic", &self.topic)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

impl AnswerWaiter {
    pub(super) fn new(
        topic: String,
        correlation_id: CorrelationId,
        rx: oneshot::Receiver<MessageEnvelope>,
        pending: SharedPending,
    ) -> Self {
        Self {
            topic,
            correlation_id,
            rx,
            pending,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Block until the answer arrives or `max_delay` elapses.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] when no matching answer arrived in time
    /// - [`Error::InvalidState`] when the broker closed while waiting
    pub async fn wait(mut self, max_delay: Duration) -> Result<MessageEnvelope> {
        // ---
        match tokio::time::timeout(max_delay, &mut self.rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(Error::InvalidState(format!(
                "answer route for {} closed while waiting for {}",
                self.topic, self.correlation_id
            ))),
            Err(_) => Err(Error::Timeout {
                topic: self.topic.clone(),
                correlation_id: self.correlation_id.to_string(),
                waited: max_delay,
            }),
        }
    }
}

impl Drop for AnswerWaiter {
    fn drop(&mut self) {
        lock_ignore_poison(&self.pending).remove(&self.correlation_id);
    }
}

/// Running consumer of one answer topic.
pub(super) struct AnswerRoute {
    pub pending: SharedPending,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AnswerRoute {
    /// Spawn the dispatch task over an already opened stream.
    pub fn spawn(
        topic: String,
        stream: RecordStreamBox,
        backend: BackendPtr,
        codec: CodecPtr,
        reporter: ReporterPtr,
    ) -> Self {
        // ---
        let pending: SharedPending = Arc::new(Mutex::new(PendingAnswers::new()));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(dispatch_answers(
            topic,
            stream,
            backend,
            codec,
            reporter,
            pending.clone(),
            shutdown_rx,
        ));

        Self {
            pending,
            shutdown,
            task,
        }
    }

    /// Stop the dispatch task and fail every outstanding waiter.
    pub async fn shutdown(self) {
        // ---
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        lock_ignore_poison(&self.pending).clear();
    }
}

async fn dispatch_answers(
    topic: String,
    mut stream: RecordStreamBox,
    backend: BackendPtr,
    codec: CodecPtr,
    reporter: ReporterPtr,
    pending: SharedPending,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    log_debug!("answer route started for {topic}");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            next = stream.next() => next,
        };

        let record = match next {
            None => break,
            Some(Ok(record)) => record,
            Some(Err(err)) => {
                reporter.log_warning(&format!("answer consumer on {topic}: {err}"));
                continue;
            }
        };

        // Answers are read once whatever their fate.
        if let Err(err) = backend.ack(&record).await {
            reporter.log_warning(&format!("failed to ack answer on {topic}: {err}"));
        }

        let envelope = match MessageEnvelope::decode(codec.as_ref(), record.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                reporter.log_warning(&format!("skipping undecodable answer on {topic}: {err}"));
                continue;
            }
        };

        let Some(correlation_id) = envelope.correlation_id().cloned() else {
            log_debug!("answer without correlation id on {topic}, discarded");
            continue;
        };

        let delivered = lock_ignore_poison(&pending).complete(&correlation_id, envelope);
        if !delivered {
            log_debug!("no waiter for answer {correlation_id} on {topic}, discarded");
        }
    }

    lock_ignore_poison(&pending).clear();
    log_debug!("answer route stopped for {topic}");
}
