//! LedgerLink Core Library
//!
//! Protocol pieces that do not depend on an async runtime: identities,
//! the data channel frame codec, message reassembly, and the sealed
//! envelope used to carry handshakes over a public ledger.
//!
//! # Modules
//!
//! - [`types`]: Identities, roles, handshake blobs
//! - [`framing`]: 12-byte frame header codec and message splitting
//! - [`reassembly`]: Out-of-order, duplicate-tolerant reassembly table
//! - [`envelope`]: Signal payloads and the ledger length prefix
//! - [`crypto`]: Identity keys and sealed payloads
//! - [`error`]: Error types

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod reassembly;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use framing::{Frame, FrameCodec, FrameError, FRAME_HEADER_LEN, FRAME_PAYLOAD_SIZE};
pub use reassembly::{Reassembled, ReassemblyConfig, ReassemblyTable};
pub use types::*;
