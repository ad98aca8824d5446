//! Handshake payloads as they travel over the ledger
//!
//! The plaintext [`SignalPayload`] is postcard-encoded, sealed for the
//! recipient (see [`crate::crypto`]) and wrapped in a length-prefixed
//! envelope:
//! - 2 bytes: sealed length (big-endian)
//! - N bytes: sealed payload

use crate::types::HandshakeBlob;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest sealed payload an envelope can carry
pub const MAX_ENVELOPE_PAYLOAD: usize = u16::MAX as usize;

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Sealed payload too large: {0} bytes (max {MAX_ENVELOPE_PAYLOAD})")]
    TooLarge(usize),
    #[error("Envelope truncated: declared {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Plaintext carried inside an offer or answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Engine description, passed through untouched
    pub blob: HandshakeBlob,
    /// Optional greeting shown to the recipient of an offer
    pub welcome: Option<String>,
}

impl SignalPayload {
    pub fn new(blob: HandshakeBlob) -> Self {
        Self { blob, welcome: None }
    }

    pub fn with_welcome(mut self, welcome: impl Into<String>) -> Self {
        self.welcome = Some(welcome.into());
        self
    }

    /// Serialize to postcard bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize from postcard bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Wrap sealed bytes in a length-prefixed envelope
pub fn wrap(sealed: &[u8]) -> Result<Bytes, EnvelopeError> {
    if sealed.len() > MAX_ENVELOPE_PAYLOAD {
        return Err(EnvelopeError::TooLarge(sealed.len()));
    }

    let mut buf = BytesMut::with_capacity(2 + sealed.len());
    buf.put_u16(sealed.len() as u16);
    buf.put_slice(sealed);
    Ok(buf.freeze())
}

/// Extract the sealed bytes from an envelope. Trailing bytes are ignored.
pub fn unwrap(envelope: &[u8]) -> Result<Bytes, EnvelopeError> {
    let mut buf = envelope;
    if buf.remaining() < 2 {
        return Err(EnvelopeError::Truncated {
            declared: 2,
            available: buf.remaining(),
        });
    }

    let declared = buf.get_u16() as usize;
    if buf.remaining() < declared {
        return Err(EnvelopeError::Truncated {
            declared,
            available: buf.remaining(),
        });
    }
    Ok(Bytes::copy_from_slice(&buf[..declared]))
}
