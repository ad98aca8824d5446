//! Library settings
//!
//! Plain structs with defaults; hosts may deserialize them from any format.

use ledgerlink_core::reassembly::ReassemblyConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Channel transport settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Id given to the first outbound message
    pub first_message_id: u32,
    /// Completed messages held while no handler is installed
    pub max_backlog: usize,
    /// Inbound reassembly limits
    pub reassembly: ReassemblyConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            first_message_id: 1,
            max_backlog: 1024,
            reassembly: ReassemblyConfig::default(),
        }
    }
}

/// Session and registry settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on `connect()` waiting for readiness (None = wait forever)
    pub connect_timeout_secs: Option<u64>,
    /// Sessions still handshaking after this long are pruned (None = never)
    pub handshake_timeout_secs: Option<u64>,
    /// Transport settings for connected sessions
    pub transport: TransportConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: None,
            handshake_timeout_secs: Some(300),
            transport: TransportConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }
}

/// Node settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Answer inbound offers without surfacing a connection request
    pub auto_accept: bool,
    /// Welcome message sent with offers when the caller gives none
    pub default_welcome: String,
    /// Interval between maintenance passes
    pub maintenance_interval_secs: u64,
    /// Capacity of the node event channel
    pub event_capacity: usize,
    /// Session settings
    pub session: SessionConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            auto_accept: false,
            default_welcome: "hello".to_string(),
            maintenance_interval_secs: 30,
            event_capacity: 64,
            session: SessionConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}
