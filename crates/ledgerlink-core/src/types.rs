//! Core protocol types for LedgerLink
//!
//! Identities, roles and the opaque handshake blob exchanged over the ledger.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// =============================================================================
// IDENTITY
// =============================================================================

/// Peer identifier (the peer's static x25519 public key)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from a public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding (the short form is used for `Display`)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidPeerId(s.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPeerId(s.to_string()))?;
        Ok(Self(key))
    }
}

// =============================================================================
// SESSION ROLE
// =============================================================================

/// Which side of the handshake a session plays. Fixed at session creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Creates the offer and the outbound data channel
    Initiator,
    /// Answers an inbound offer and adopts the announced channel
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

// =============================================================================
// SIGNALING
// =============================================================================

/// Kind of handshake record published on the ledger
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SignalKind {
    Offer = 0,
    Answer = 1,
}

impl TryFrom<u8> for SignalKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Offer),
            1 => Ok(Self::Answer),
            _ => Err(Error::UnknownSignalKind(value)),
        }
    }
}

/// Opaque handshake token produced by the connectivity engine.
///
/// The protocol never inspects it; it is carried verbatim from one engine to
/// the other.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandshakeBlob(pub String);

impl HandshakeBlob {
    pub fn new(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for HandshakeBlob {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_hex_roundtrip() {
        let id = PeerId([7u8; 32]);
        let parsed: PeerId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.to_string(), "0707070707070707");
    }

    #[test]
    fn test_peer_id_rejects_short_hex() {
        assert!(matches!("abcd".parse::<PeerId>(), Err(Error::InvalidPeerId(s)) if s == "abcd"));
        assert!(matches!("not hex".parse::<PeerId>(), Err(Error::InvalidPeerId(_))));
    }

    #[test]
    fn test_peer_id_ordering() {
        assert!(PeerId([1u8; 32]) < PeerId([2u8; 32]));
    }

    #[test]
    fn test_signal_kind_from_u8() {
        assert_eq!(SignalKind::try_from(0).unwrap(), SignalKind::Offer);
        assert_eq!(SignalKind::try_from(1).unwrap(), SignalKind::Answer);
        assert!(matches!(SignalKind::try_from(9), Err(Error::UnknownSignalKind(9))));
    }
}
