//! Probe run: two nodes, one ledger, one loopback network

use crate::config::Config;
use bytes::Bytes;
use ledgerlink_core::crypto::KeyPair;
use ledgerlink_core::types::PeerId;
use ledgerlink_net::engine::ChannelError;
use ledgerlink_net::memory::{LoopbackNetwork, MemoryLedger};
use ledgerlink_net::node::{Node, NodeError, NodeEvent};
use ledgerlink_net::transport::{ChannelTransport, TransportStats};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Listener stopped before accepting")]
    ListenerGone,
    #[error("Received a message that was never sent ({0} bytes)")]
    Unexpected(usize),
}

/// Result of one probe run
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub dialer: PeerId,
    pub listener: PeerId,
    pub messages: usize,
    pub bytes: usize,
    pub connect_time: Duration,
    pub transfer_time: Duration,
    pub sender: TransportStats,
    pub receiver: TransportStats,
}

impl ProbeReport {
    /// Payload throughput in MiB/s
    pub fn throughput_mib_s(&self) -> f64 {
        let secs = self.transfer_time.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

fn identity(phrase: Option<&str>) -> KeyPair {
    match phrase {
        Some(phrase) => KeyPair::from_phrase(phrase),
        None => KeyPair::generate(),
    }
}

/// Deterministic probe message `index`
fn probe_message(index: usize, size: usize) -> Bytes {
    Bytes::from(
        (0..size)
            .map(|j| (index.wrapping_mul(131) + j) as u8)
            .collect::<Vec<u8>>(),
    )
}

/// Accept the first connection request and hand back the transport
async fn listen(mut events: broadcast::Receiver<NodeEvent>, ready: oneshot::Sender<Arc<ChannelTransport>>) {
    while let Ok(event) = events.recv().await {
        if let NodeEvent::ConnectionRequest(request) = event {
            info!(
                "Connection request from {} ({})",
                request.from(),
                request.welcome().unwrap_or("no welcome")
            );
            match request.accept().await {
                Ok(transport) => {
                    let _ = ready.send(transport);
                }
                Err(e) => warn!("Failed to accept request: {}", e),
            }
            return;
        }
    }
}

/// Run the probe described by `config`
pub async fn run(config: &Config) -> Result<ProbeReport, ProbeError> {
    let mut ledger = MemoryLedger::new();
    if config.block_time_ms > 0 {
        ledger = ledger.with_block_time(Duration::from_millis(config.block_time_ms));
    }
    let ledger = Arc::new(ledger);
    let network = LoopbackNetwork::new(config.loopback());

    let dialer = Node::start(
        identity(config.alice_phrase.as_deref()),
        ledger.clone(),
        network.clone(),
        config.node(),
    )
    .await?;
    let listener = Node::start(
        identity(config.bob_phrase.as_deref()),
        ledger.clone(),
        network.clone(),
        config.node(),
    )
    .await?;
    listener.register_username(&config.username).await?;
    info!("Dialer {} -> listener {} ('{}')", dialer.local_id(), listener.local_id(), config.username);

    let (ready_tx, ready_rx) = oneshot::channel();
    let accept_task = tokio::spawn(listen(listener.subscribe_events(), ready_tx));

    let started = Instant::now();
    let outbound = tokio::time::timeout(config.timeout(), dialer.connect_username(&config.username))
        .await
        .map_err(|_| ProbeError::Timeout("connection"))??;
    let inbound = tokio::time::timeout(config.timeout(), ready_rx)
        .await
        .map_err(|_| ProbeError::Timeout("listener"))?
        .map_err(|_| ProbeError::ListenerGone)?;
    let connect_time = started.elapsed();
    info!("Connected in {:?}", connect_time);
    let _ = accept_task.await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.on_message(move |message| {
        let _ = tx.send(message);
    });

    let mut expected: Vec<Bytes> = (0..config.messages)
        .map(|i| probe_message(i, config.message_size))
        .collect();

    let started = Instant::now();
    for message in &expected {
        let id = outbound.send_message(message.clone())?;
        debug!("Sent probe message {} ({} bytes)", id, message.len());
    }

    let deadline = tokio::time::Instant::now() + config.timeout();
    while !expected.is_empty() {
        let message = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .map_err(|_| ProbeError::Timeout("probe messages"))?
            .ok_or(ChannelError::Closed)?;
        let index = expected
            .iter()
            .position(|m| *m == message)
            .ok_or(ProbeError::Unexpected(message.len()))?;
        expected.swap_remove(index);
    }
    let transfer_time = started.elapsed();

    let report = ProbeReport {
        dialer: dialer.local_id(),
        listener: listener.local_id(),
        messages: config.messages,
        bytes: config.messages * config.message_size,
        connect_time,
        transfer_time,
        sender: outbound.stats(),
        receiver: inbound.stats(),
    };

    dialer.shutdown().await;
    listener.shutdown().await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn test_probe_round_trip() {
        let config = Config::parse_from([
            "linkprobe",
            "--message-size",
            "40000",
            "--messages",
            "3",
            "--gather-delay-ms",
            "5",
            "--shuffle",
            "--timeout-secs",
            "10",
        ]);

        let report = run(&config).await.unwrap();
        assert_eq!(report.messages, 3);
        assert_eq!(report.bytes, 120_000);
        assert_eq!(report.sender.messages_sent, 3);
        assert_eq!(report.receiver.messages_received, 3);
        // 40000 bytes = 3 frames per message
        assert_eq!(report.sender.frames_sent, 9);
        assert_ne!(report.dialer, report.listener);
    }

    #[tokio::test]
    async fn test_probe_with_phrases_and_empty_messages() {
        let config = Config::parse_from([
            "linkprobe",
            "--message-size",
            "0",
            "--messages",
            "2",
            "--gather-delay-ms",
            "1",
            "--alice-phrase",
            "alpha words",
            "--bob-phrase",
            "beta words",
            "--timeout-secs",
            "10",
        ]);

        let report = run(&config).await.unwrap();
        assert_eq!(report.dialer, KeyPair::from_phrase("alpha words").peer_id());
        assert_eq!(report.receiver.messages_received, 2);
    }

    #[test]
    fn test_probe_messages_differ() {
        assert_ne!(probe_message(0, 16), probe_message(1, 16));
        assert_eq!(probe_message(2, 0).len(), 0);
    }
}
