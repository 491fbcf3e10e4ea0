//! Codecs for encoding and decoding envelopes.
//!
//! JSON text is the default wire format. MessagePack (named fields) is offered
//! for binary WebSocket frames.

use bytes::Bytes;
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the size limit.
    #[error("Envelope size {size} exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Unknown serializer name.
    #[error("Unknown serializer: {0}")]
    UnknownSerializer(String),
}

/// Encode an envelope as JSON text.
///
/// # Errors
///
/// Returns an error if encoding fails or the result is too large.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;
    check_size(text.len(), MAX_ENVELOPE_SIZE)?;
    Ok(text)
}

/// Decode an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a complete envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    check_size(data.len(), MAX_ENVELOPE_SIZE)?;
    Ok(serde_json::from_slice(data)?)
}

/// Encode a batch of envelopes as a JSON array, preserving order.
///
/// # Errors
///
/// Returns an error if encoding fails.
pub fn encode_batch(envelopes: &[Envelope]) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelopes)?)
}

fn check_size(size: usize, max: usize) -> Result<(), ProtocolError> {
    if size > max {
        return Err(ProtocolError::TooLarge { size, max });
    }
    Ok(())
}

/// Wire serializer negotiated per connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Codec {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MessagePack,
}

/// An encoded envelope, tagged by frame kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Codec {
    /// Parse a serializer name as given in the `serializer` connect parameter.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown names.
    pub fn from_name(name: &str) -> Result<Self, ProtocolError> {
        match name {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MessagePack),
            other => Err(ProtocolError::UnknownSerializer(other.to_string())),
        }
    }

    /// Encode an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the result is too large.
    pub fn encode(&self, envelope: &Envelope) -> Result<Encoded, ProtocolError> {
        match self {
            Codec::Json => encode(envelope).map(Encoded::Text),
            Codec::MessagePack => {
                let data = rmp_serde::to_vec_named(envelope)?;
                check_size(data.len(), MAX_ENVELOPE_SIZE)?;
                Ok(Encoded::Binary(Bytes::from(data)))
            }
        }
    }

    /// Decode an envelope received in a frame of either kind.
    ///
    /// Text frames are always JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, data: &[u8], binary: bool) -> Result<Envelope, ProtocolError> {
        match (self, binary) {
            (Codec::MessagePack, true) => {
                check_size(data.len(), MAX_ENVELOPE_SIZE)?;
                Ok(rmp_serde::from_slice(data)?)
            }
            _ => decode(data),
        }
    }
}
