//! Tagged message envelopes.
//!
//! Wire format: `{"type": "<tag>", "payload": <value>}`
//!
//! The tag names the payload's shape but the envelope carries no schema.
//! A receiver can only rebuild the typed value if it already knows which
//! [`Message`] type to expect.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A typed message that can travel inside an [`Envelope`].
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Stable discriminator written into the envelope's `type` field.
    const TAG: &'static str;
}

/// A message wrapped with its type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed message.
    pub fn make<T: Message>(message: &T) -> Result<Self, CodecError> {
        let payload = serde_json::to_value(message).map_err(|source| CodecError::Serialize {
            tag: T::TAG,
            source,
        })?;
        Ok(Self {
            tag: T::TAG.to_string(),
            payload,
        })
    }

    /// The message-type discriminator.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The still-encoded payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Decode the payload as `T`, rejecting envelopes tagged for another type.
    pub fn decode_payload<T: Message>(&self) -> Result<T, CodecError> {
        if self.tag != T::TAG {
            return Err(CodecError::TagMismatch {
                expected: T::TAG,
                actual: self.tag.clone(),
            });
        }
        T::deserialize(&self.payload).map_err(|source| CodecError::Payload {
            tag: T::TAG,
            source,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Envelope)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Envelope)
    }
}

/// Wrap and serialize a message in one step.
pub fn encode<T: Message>(message: &T) -> Result<Vec<u8>, CodecError> {
    Envelope::make(message)?.to_bytes()
}

/// Parse raw bytes as an envelope, then its payload as `T`.
pub fn decode<T: Message>(bytes: &[u8]) -> Result<T, CodecError> {
    Envelope::from_bytes(bytes)?.decode_payload()
}

/// Error encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("cannot serialize `{tag}` message: {source}")]
    Serialize {
        tag: &'static str,
        source: serde_json::Error,
    },
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("expected `{expected}` envelope, got `{actual}`")]
    TagMismatch {
        expected: &'static str,
        actual: String,
    },
    #[error("cannot decode `{tag}` payload: {source}")]
    Payload {
        tag: &'static str,
        source: serde_json::Error,
    },
}
