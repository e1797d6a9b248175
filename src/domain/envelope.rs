// src/domain/envelope.rs

//! Message envelope, the unit of data exchanged through a broker.
//!
//! An envelope carries an identity, an optional link to the envelope that
//! caused it, and a structured payload. Envelopes are immutable; every
//! transformation (child creation, answer tagging, re-keying) returns a new
//! value and leaves the original untouched.
//!
//! # Wire format
//!
//! On the wire an envelope is the record
//!
//! ```text
//! { "id": "<uuid>", "parent_id": "<uuid>" | null, "payload": { ... },
//!   "answer_params"?: { "topic": "...", "correlation_id": "..." },
//!   "correlation_id"?: "..." }
//! ```
//!
//! serialized and compressed by the broker's [`Codec`]. A received record that
//! carries a `parent_id` key is reconstructed faithfully. Anything else that
//! decodes to an object is treated as an externally produced payload and
//! wrapped in a fresh root envelope.

use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::codec::Codec;
use crate::{CorrelationId, Error, Result};

/// Business data carried by an envelope.
pub type Payload = Map<String, Value>;

/// Where and how a worker must reply to a request.
///
/// Attached to request envelopes by [`Broker::request`](crate::Broker::request)
/// or explicitly through [`MessageEnvelope::with_answer_params`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerParams {
    /// Answer topic the producer is listening on.
    pub topic: String,
    /// Correlation id the producer is waiting for.
    pub correlation_id: CorrelationId,
}

/// Immutable message envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEnvelope {
    id: Uuid,
    parent_id: Option<Uuid>,
    payload: Arc<Payload>,
    answer_params: Option<AnswerParams>,
    correlation_id: Option<CorrelationId>,
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    id: Uuid,
    parent_id: Option<Uuid>,
    payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer_params: Option<AnswerParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    correlation_id: Option<CorrelationId>,
}

impl MessageEnvelope {
    // ---

    /// Create a root envelope with a freshly generated id.
    pub fn new(payload: Payload) -> Self {
        Self::with_id(Uuid::new_v4(), None, payload)
    }

    /// Create an envelope with an explicit identity.
    pub fn with_id(id: Uuid, parent_id: Option<Uuid>, payload: Payload) -> Self {
        // ---
        Self {
            id,
            parent_id,
            payload: Arc::new(payload),
            answer_params: None,
            correlation_id: None,
        }
    }

    /// Create a root envelope from any serializable value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the value cannot be serialized or
    /// does not serialize to a JSON object.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(to_payload(value)?))
    }

    /// Create a child envelope caused by this one.
    ///
    /// The child gets a fresh id and records `self.id()` as its parent.
    pub fn create_child(&self, payload: Payload) -> Self {
        Self::with_id(Uuid::new_v4(), Some(self.id), payload)
    }

    /// Same payload and parent under a freshly generated id.
    pub fn rekeyed(&self) -> Self {
        // ---
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    /// Copy of this envelope asking the worker to reply on `params.topic`.
    pub fn with_answer_params(&self, params: AnswerParams) -> Self {
        // ---
        Self {
            answer_params: Some(params),
            ..self.clone()
        }
    }

    /// Copy of this envelope tagged as the answer for `correlation_id`.
    pub(crate) fn as_answer(&self, correlation_id: CorrelationId) -> Self {
        // ---
        Self {
            correlation_id: Some(correlation_id),
            ..self.clone()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Reply routing for request envelopes, `None` for plain messages.
    pub fn answer_params(&self) -> Option<&AnswerParams> {
        self.answer_params.as_ref()
    }

    /// Correlation id of an answer envelope, `None` for anything else.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Deserialize the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(
            self.payload.as_ref().clone(),
        ))?)
    }

    /// Partition / routing key: the envelope id as text.
    pub fn key(&self) -> String {
        self.id.to_string()
    }

    /// Encode to wire bytes: `compress(dumps(record))`.
    pub fn encode(&self, codec: &dyn Codec) -> Result<Bytes> {
        // ---
        let record = WireRecord {
            id: self.id,
            parent_id: self.parent_id,
            payload: self.payload.as_ref().clone(),
            answer_params: self.answer_params.clone(),
            correlation_id: self.correlation_id.clone(),
        };

        let value = serde_json::to_value(record)?;
        codec.compress(codec.dumps(&value)?)
    }

    /// Decode wire bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] when the bytes cannot be decompressed
    /// or parsed, or when they do not describe a JSON object.
    pub fn decode(codec: &dyn Codec, bytes: Bytes) -> Result<Self> {
        // ---
        let value = codec.loads(&codec.decompress(bytes)?)?;

        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(Error::Serialization(format!(
                    "expected a JSON object, got {}",
                    kind_of(&other)
                )))
            }
        };

        if !object.contains_key("parent_id") {
            return Ok(Self::new(object));
        }

        let record: WireRecord = serde_json::from_value(Value::Object(object))?;

        Ok(Self {
            id: record.id,
            parent_id: record.parent_id,
            payload: Arc::new(record.payload),
            answer_params: record.answer_params,
            correlation_id: record.correlation_id,
        })
    }
}

/// Serialize a value into a payload map.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Payload> {
    // ---
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Serialization(format!(
            "payload must serialize to a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
