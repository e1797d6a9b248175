//! Consumer registrations and the per-registration consume loop.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use super::MessageManager;
use crate::codec::CodecPtr;
use crate::{
    // ---
    log_debug,
    BackendPtr,
    MessageEnvelope,
    Record,
    RecordStreamBox,
    ReporterPtr,
    Result,
};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// Handler trait for type-erased async callbacks
trait HandlerFn: Send + Sync {
    fn call(&self, envelope: MessageEnvelope, manager: MessageManager)
        -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> HandlerFn for F
where
    F: Fn(MessageEnvelope, MessageManager) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(
        &self,
        envelope: MessageEnvelope,
        manager: MessageManager,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(envelope, manager))
    }
}

/// A handler bound to a topic and a consumer group.
///
/// Registrations sharing `group_id` on a topic compete for its records;
/// registrations with distinct group ids each receive every record.
#[derive(Clone)]
pub struct ConsumerRegistration {
    topic: String,
    consumer_id: String,
    group_id: String,
    handler: Arc<dyn HandlerFn>,
}

impl ConsumerRegistration {
    /// Create a registration.
    ///
    /// The handler is responsible for settling the record through the
    /// [`MessageManager`]; the consume loop never acknowledges on its behalf.
    ///
    /// ```
    /// use mom_broker::{ConsumerRegistration, MessageEnvelope, MessageManager};
    ///
    /// let registration = ConsumerRegistration::new(
    ///     "orders",
    ///     "billing-1",
    ///     "billing",
    ///     |envelope: MessageEnvelope, manager: MessageManager| async move {
    ///         println!("order {}", envelope.id());
    ///         manager.ack().await
    ///     },
    /// );
    /// assert_eq!(registration.group_id(), "billing");
    /// ```
    pub fn new<F, Fut>(
        topic: impl Into<String>,
        consumer_id: impl Into<String>,
        group_id: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(MessageEnvelope, MessageManager) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            topic: topic.into(),
            consumer_id: consumer_id.into(),
            group_id: group_id.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("topic", &self.topic)
            .field("consumer_id", &self.consumer_id)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

/// Collaborators shared by every registration loop of one broker.
#[derive(Clone)]
pub(super) struct LoopContext {
    pub backend: BackendPtr,
    pub codec: CodecPtr,
    pub reporter: ReporterPtr,
}

/// Serve one registration until shutdown is signalled or the stream ends.
///
/// Records are handled one at a time, in delivery order. Shutdown is only
/// observed between records, so the in-flight record always finishes.
pub(super) async fn run_registration(
    ctx: LoopContext,
    registration: ConsumerRegistration,
    mut stream: RecordStreamBox,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    let label = format!(
        "{}/{}/{}",
        registration.topic, registration.group_id, registration.consumer_id
    );
    log_debug!("consumer {label} started");

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

        match next {
            None => break,
            Some(Ok(record)) => handle_record(&ctx, &registration, &label, record).await,
            Some(Err(err)) => ctx
                .reporter
                .log_warning(&format!("consumer {label}: receive failed: {err}")),
        }
    }

    log_debug!("consumer {label} stopped");
}

async fn handle_record(
    ctx: &LoopContext,
    registration: &ConsumerRegistration,
    label: &str,
    record: Record,
) {
    // ---
    let envelope = match MessageEnvelope::decode(ctx.codec.as_ref(), record.payload.clone()) {
        Ok(envelope) => envelope,
        Err(err) => {
            // Acked so a poison record cannot come back forever.
            ctx.reporter.log_warning(&format!(
                "consumer {label}: skipping undecodable record at offset {}: {err}",
                record.offset
            ));
            if let Err(err) = ctx.backend.ack(&record).await {
                ctx.reporter
                    .log_error(&format!("consumer {label}: failed to skip record: {err}"));
            }
            return;
        }
    };

    let record = Arc::new(record);
    let settled = Arc::new(AtomicBool::new(false));
    let manager = MessageManager::new(ctx.backend.clone(), record.clone(), settled.clone());
    let envelope_id = envelope.id();

    // A separate task turns a handler panic into a JoinError.
    let outcome = tokio::spawn(registration.handler.call(envelope, manager)).await;

    let failure = match outcome {
        Ok(Ok(())) => {
            if !settled.load(Ordering::Acquire) {
                ctx.reporter.log_warning(&format!(
                    "consumer {label}: handler neither acked nor rejected {envelope_id}"
                ));
            }
            return;
        }
        Ok(Err(err)) => format!("consumer {label}: handler failed on {envelope_id}: {err}"),
        Err(join_err) => format!("consumer {label}: handler panicked on {envelope_id}: {join_err}"),
    };

    ctx.reporter.log_error(&failure);

    if !settled.swap(true, Ordering::AcqRel) {
        if let Err(err) = ctx.backend.reject(&record).await {
            ctx.reporter
                .log_error(&format!("consumer {label}: failed to reject {envelope_id}: {err}"));
        }
    }
}
