//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! backend implementations, client libraries or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod backend;
mod envelope;
mod reporter;

// --- Backend boundary re-exports ---

pub use backend::{
    //
    Backend,
    BackendPtr,
    Record,
    RecordStream,
    RecordStreamBox,
    TopicKind,
    TopicSpec,
};

// --- Envelope re-exports ---

pub use envelope::{
    //
    to_payload,
    AnswerParams,
    MessageEnvelope,
    Payload,
};

// --- Observability re-exports ---

pub use reporter::{
    //
    Reporter,
    ReporterPtr,
    TracingReporter,
};
