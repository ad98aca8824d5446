//! Error types for LedgerLink core types

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while parsing core protocol types
#[derive(Debug, Error)]
pub enum Error {
    /// Peer id is not 32 bytes of hex
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// Signal kind discriminant out of range
    #[error("unknown signal kind: {0}")]
    UnknownSignalKind(u8),
}
