// src/domain/reporter.rs

//! Observability collaborator.
//!
//! The broker never prints. Per-record failures inside the consume loop
//! (undecodable records, handler errors, panics) are handed to a [`Reporter`]
//! injected at construction time.

use std::sync::Arc;

use crate::{log_error, log_warn};

/// Sink for consume-loop failures.
pub trait Reporter: Send + Sync {
    fn log_warning(&self, msg: &str);
    fn log_error(&self, msg: &str);
}

/// Shared reporter pointer.
pub type ReporterPtr = Arc<dyn Reporter>;

/// Default reporter, forwards to the crate's tracing macros.
#[derive(Debug, Clone)]
pub struct TracingReporter {
    broker: String,
}

impl TracingReporter {
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
        }
    }
}

impl Reporter for TracingReporter {
    fn log_warning(&self, msg: &str) {
        log_warn!("[{}] {msg}", self.broker);
    }

    fn log_error(&self, msg: &str) {
        log_error!("[{}] {msg}", self.broker);
    }
}
