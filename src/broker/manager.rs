//! Per-record acknowledgment handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{BackendPtr, Record, Result};

/// Handle passed to a consumer handler together with the decoded envelope.
///
/// Exactly one of [`ack`](Self::ack) or [`reject`](Self::reject) settles the
/// record; both consume the manager. A handler that fails (returns `Err` or
/// panics) before settling gets its record rejected by the consume loop.
pub struct MessageManager {
    backend: BackendPtr,
    record: Arc<Record>,
    settled: Arc<AtomicBool>,
}

impl MessageManager {
    pub(super) fn new(backend: BackendPtr, record: Arc<Record>, settled: Arc<AtomicBool>) -> Self {
        Self {
            backend,
            record,
            settled,
        }
    }

    /// Topic the record was read from.
    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    /// Consumer group the record was delivered to.
    pub fn group_id(&self) -> &str {
        &self.record.group_id
    }

    /// Backend coordinates of the record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Mark the record as processed; it will not be delivered again.
    pub async fn ack(self) -> Result<()> {
        // ---
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.ack(&self.record).await
    }

    /// Hand the record back for redelivery according to backend policy.
    pub async fn reject(self) -> Result<()> {
        // ---
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.reject(&self.record).await
    }
}

impl fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageManager")
            .field("backend", &self.backend.name())
            .field("record", &self.record)
            .field("settled", &self.settled.load(Ordering::Acquire))
            .finish()
    }
}
