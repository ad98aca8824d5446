//! Connectivity engine contract
//!
//! The engine performs candidate gathering and transport negotiation and
//! hands back one unordered, unreliable, MTU-bounded byte channel. The
//! protocol only drives it through this interface.

use async_trait::async_trait;
use bytes::Bytes;
use ledgerlink_core::types::{HandshakeBlob, PeerId, Role};
use std::sync::Arc;
use thiserror::Error;

/// Label of the single data channel opened per session
pub const SYSTEM_CHANNEL_LABEL: &str = "<system>";

/// Handshake errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Malformed description: {0}")]
    Malformed(String),
    #[error("Description not applicable: {0}")]
    Inapplicable(String),
    #[error("Candidate gathering failed: {0}")]
    Gathering(String),
    #[error("Engine closed")]
    EngineClosed,
}

/// Raw channel errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel closed")]
    Closed,
    #[error("Channel failed: {0}")]
    Failed(String),
    #[error("Datagram of {len} bytes exceeds channel MTU {mtu}")]
    TooLarge { len: usize, mtu: usize },
    #[error("Message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },
    #[error("Channel MTU {mtu} cannot carry a {required} byte frame")]
    MtuTooSmall { mtu: usize, required: usize },
    #[error("Framing error: {0}")]
    Framing(String),
}

/// Handler for an opened channel
pub type ChannelOpenHandler = Box<dyn Fn(Arc<dyn RawChannel>) + Send + Sync>;
/// Handler for channel failure or closure
pub type ChannelErrorHandler = Box<dyn Fn(ChannelError) + Send + Sync>;
/// Handler for inbound datagrams
pub type DatagramHandler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Unordered, unreliable datagram channel
pub trait RawChannel: Send + Sync {
    /// Channel label
    fn label(&self) -> &str;

    /// Largest datagram accepted by `send`
    fn max_datagram_size(&self) -> usize;

    /// Submit one datagram (fire-and-forget; may be reordered or lost)
    fn send(&self, datagram: Bytes) -> Result<(), ChannelError>;

    /// Install the inbound datagram handler
    fn on_message(&self, handler: DatagramHandler);

    /// Close the channel
    fn close(&self);
}

/// Per-session connectivity engine (one peer connection)
#[async_trait]
pub trait ConnectivityEngine: Send + Sync {
    /// Produce the local description. Settles once candidate gathering is
    /// complete: the result is a single blob, never a stream of candidates.
    async fn create_local_description(&self) -> Result<HandshakeBlob, HandshakeError>;

    /// Apply the remote party's description
    async fn apply_remote_description(&self, blob: &HandshakeBlob) -> Result<(), HandshakeError>;

    /// Called once the data channel is open (outbound for the initiator,
    /// announced by the remote side for the responder)
    fn on_channel_open(&self, handler: ChannelOpenHandler);

    /// Called when the channel or the connection fails or closes
    fn on_channel_error(&self, handler: ChannelErrorHandler);

    /// Tear down the connection
    fn close(&self);
}

/// Creates one engine per session
pub trait EngineFactory: Send + Sync {
    fn create(&self, remote: PeerId, role: Role) -> Result<Arc<dyn ConnectivityEngine>, HandshakeError>;
}
