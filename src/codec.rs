//! Payload codecs.
//!
//! A codec turns a structured value into bytes suitable for network
//! transmission and back, with an optional compression stage on top:
//!
//! ```text
//! wire = compress(dumps(value))
//! value = loads(decompress(wire))
//! ```
//!
//! Codecs are pure and stateless; a single instance is shared by every task
//! of a broker through [`CodecPtr`].

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Content type of the JSON codec, the only structured format shipped.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Compression applied on top of the serialized payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// Identity, bytes go out as serialized.
    #[default]
    None,
    /// gzip container (flate2)
    Gzip,
    /// zlib container (flate2)
    Zlib,
    /// LZ4 block with the uncompressed size prepended (lz4_flex)
    Lz4,
}

impl Compression {
    /// Canonical lower-case name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
            Compression::Lz4 => "lz4",
        }
    }

    /// Compress `data`.
    pub fn compress(&self, data: Bytes) -> Result<Bytes> {
        // ---
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
                encoder.write_all(&data)?;
                Ok(Bytes::from(encoder.finish()?))
            }
            Compression::Zlib => {
                let mut encoder =
                    flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&data)?;
                Ok(Bytes::from(encoder.finish()?))
            }
            Compression::Lz4 => Ok(Bytes::from(lz4_flex::compress_prepend_size(&data))),
        }
    }

    /// Inverse of [`compress`](Self::compress).
    pub fn decompress(&self, data: Bytes) -> Result<Bytes> {
        // ---
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => {
                let mut out = Vec::with_capacity(data.len() * 2);
                flate2::read::GzDecoder::new(&data[..]).read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
            Compression::Zlib => {
                let mut out = Vec::with_capacity(data.len() * 2);
                flate2::read::ZlibDecoder::new(&data[..]).read_to_end(&mut out)?;
                Ok(Bytes::from(out))
            }
            Compression::Lz4 => lz4_flex::decompress_size_prepended(&data)
                .map(Bytes::from)
                .map_err(|e| Error::Serialization(format!("lz4: {e}"))),
        }
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Compression::None),
            "gzip" | "application/x-gzip" => Ok(Compression::Gzip),
            "zlib" | "application/zlib" => Ok(Compression::Zlib),
            "lz4" | "application/x-lz4" => Ok(Compression::Lz4),
            other => Err(Error::Configuration(format!(
                "unsupported compression: {other}, valid values: none, gzip, zlib, lz4"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializes and compresses envelope records.
///
/// Implementations must be pure: no I/O, no shared mutable state. For every
/// serializable value `v`,
/// `loads(&decompress(compress(dumps(&v)?)?)?)? == v`.
pub trait Codec: Send + Sync {
    /// MIME type describing the serialized form.
    fn content_type(&self) -> &str;

    /// Deterministic structured serialization.
    fn dumps(&self, value: &Value) -> Result<Bytes>;

    /// Inverse of [`dumps`](Codec::dumps).
    fn loads(&self, bytes: &[u8]) -> Result<Value>;

    /// Identity by default.
    fn compress(&self, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }

    /// Identity by default.
    fn decompress(&self, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

/// Shared codec pointer, cloned into every consume task.
pub type CodecPtr = Arc<dyn Codec>;

/// JSON codec with optional compression.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec {
    compression: Compression,
}

impl JsonCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        CONTENT_TYPE_JSON
    }

    fn dumps(&self, value: &Value) -> Result<Bytes> {
        // serde_json::Map is ordered by key unless `preserve_order` is on, so
        // equal values always produce equal bytes.
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn loads(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn compress(&self, bytes: Bytes) -> Result<Bytes> {
        self.compression.compress(bytes)
    }

    fn decompress(&self, bytes: Bytes) -> Result<Bytes> {
        self.compression.decompress(bytes)
    }
}

/// Build the codec for a broker definition.
///
/// # Errors
///
/// Returns [`Error::Configuration`] for any content type other than JSON.
pub fn codec_for(content_type: &str, compression: Compression) -> Result<CodecPtr> {
    // ---
    match content_type.trim() {
        CONTENT_TYPE_JSON => Ok(Arc::new(JsonCodec::new(compression))),
        other => Err(Error::Configuration(format!(
            "unsupported content type: {other}, valid values: {CONTENT_TYPE_JSON}"
        ))),
    }
}
