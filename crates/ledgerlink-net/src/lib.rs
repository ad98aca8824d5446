//! Session layer for the LedgerLink protocol
//!
//! This crate provides:
//! - Connectivity engine and signaling transport contracts
//! - Framed message transport over an unreliable data channel
//! - Peer session state machine and connection registry
//! - A node that dispatches inbound offers and answers
//! - An in-process ledger and loopback engine

pub mod config;
pub mod engine;
pub mod memory;
pub mod node;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

pub use config::{NodeConfig, SessionConfig, TransportConfig};
pub use engine::{ChannelError, ConnectivityEngine, EngineFactory, HandshakeError, RawChannel};
pub use memory::{LoopbackConfig, LoopbackNetwork, MemoryLedger};
pub use node::{IncomingRequest, Node, NodeError, NodeEvent};
pub use registry::{ConnectionRegistry, RegistryError};
pub use session::{DisconnectReason, PeerSession, SessionError, SessionState};
pub use signaling::{Signaler, SignalingError, SignalingTransport};
pub use transport::{ChannelTransport, TransportStats};
