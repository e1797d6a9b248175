use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during broker operations
#[derive(Error, Debug)]
pub enum Error {
    /// The backend could not be reached. `connect()` never retries on its own.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed broker configuration, detected at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation referenced a topic that was never passed to `initialize()`.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// Codec failure while encoding or decoding an envelope.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backend rejected a publish.
    #[error("publish error: {0}")]
    Publish(String),

    /// No matching answer arrived before the deadline.
    #[error("no answer on {topic} for {correlation_id} within {waited:?}")]
    Timeout {
        topic: String,
        correlation_id: String,
        waited: Duration,
    },

    /// `start_consuming()` was called while a consume loop is already active.
    #[error("broker is already consuming")]
    AlreadyConsuming,

    /// The operation is not valid in the broker's current lifecycle state.
    #[error("invalid broker state: {0}")]
    InvalidState(String),

    /// Adapter failure that does not fit any of the above (ack, reject, topic admin).
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, Error>;
