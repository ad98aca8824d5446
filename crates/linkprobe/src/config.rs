//! linkprobe configuration

use clap::Parser;
use ledgerlink_net::config::NodeConfig;
use ledgerlink_net::memory::LoopbackConfig;
use std::time::Duration;

/// LedgerLink session probe
#[derive(Parser, Debug, Clone)]
#[command(name = "linkprobe")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Size of each probe message in bytes
    #[arg(long, default_value = "3145728")]
    pub message_size: usize,

    /// Number of probe messages
    #[arg(long, default_value = "4")]
    pub messages: usize,

    /// Simulated candidate gathering time (milliseconds)
    #[arg(long, default_value = "50")]
    pub gather_delay_ms: u64,

    /// Simulated ledger block time (milliseconds)
    #[arg(long, default_value = "0")]
    pub block_time_ms: u64,

    /// Shuffle datagrams in flight
    #[arg(long)]
    pub shuffle: bool,

    /// Phrase for the dialing identity (random if absent)
    #[arg(long, env = "LINKPROBE_ALICE_PHRASE")]
    pub alice_phrase: Option<String>,

    /// Phrase for the listening identity (random if absent)
    #[arg(long, env = "LINKPROBE_BOB_PHRASE")]
    pub bob_phrase: Option<String>,

    /// Username registered by the listening identity
    #[arg(long, default_value = "bob")]
    pub username: String,

    /// Welcome message carried by the offer
    #[arg(long, default_value = "hello")]
    pub welcome: String,

    /// Overall timeout (seconds)
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.messages == 0 {
            anyhow::bail!("At least one probe message is required");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("Timeout must be at least one second");
        }
        if self.username.trim().is_empty() {
            anyhow::bail!("Username cannot be empty");
        }
        if let (Some(alice), Some(bob)) = (&self.alice_phrase, &self.bob_phrase) {
            if alice.trim() == bob.trim() {
                anyhow::bail!("Both identities would be derived from the same phrase");
            }
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn loopback(&self) -> LoopbackConfig {
        LoopbackConfig {
            gather_delay: Duration::from_millis(self.gather_delay_ms),
            shuffle: self.shuffle,
            ..Default::default()
        }
    }

    pub fn node(&self) -> NodeConfig {
        let mut config = NodeConfig {
            default_welcome: self.welcome.clone(),
            ..Default::default()
        };
        config.session.connect_timeout_secs = Some(self.timeout_secs);
        config
    }
}
