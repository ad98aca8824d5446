//! Signaling transport contract and the sealing adapter on top of it
//!
//! The signaling transport is a public, slow, asynchronous ledger. Handshake
//! payloads are sealed for the recipient before publication and opened with
//! the sender's identity on receipt.

use async_trait::async_trait;
use bytes::Bytes;
use ledgerlink_core::crypto::{CryptoError, KeyPair};
use ledgerlink_core::envelope::{self, EnvelopeError, SignalPayload};
use ledgerlink_core::types::{PeerId, SignalKind};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("Signaling transport unavailable: {0}")]
    Unavailable(String),
    #[error("Publication rejected: {0}")]
    Rejected(String),
    #[error("Username already registered: {0}")]
    UsernameTaken(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Subscription closed")]
    Closed,
}

/// A signal addressed to us
#[derive(Clone, Debug)]
pub struct InboundSignal {
    /// Publisher identity
    pub from: PeerId,
    /// Enveloped, sealed payload
    pub payload: Bytes,
}

/// Live subscription to one kind of signal.
///
/// Yields signals published after the subscription was opened, in ledger
/// order. It cannot be restarted: once it ends, subscribe again.
pub struct Subscription {
    rx: mpsc::Receiver<InboundSignal>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<InboundSignal>) -> Self {
        Self { rx }
    }

    /// Next signal, or `None` once the transport dropped the subscription
    pub async fn next(&mut self) -> Option<InboundSignal> {
        self.rx.recv().await
    }
}

/// External rendezvous channel
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Publish a payload for `to`
    async fn publish(
        &self,
        kind: SignalKind,
        to: PeerId,
        from: PeerId,
        payload: Bytes,
    ) -> Result<(), SignalingError>;

    /// Subscribe to signals of `kind` addressed to `self_id`
    async fn subscribe(&self, kind: SignalKind, self_id: PeerId) -> Result<Subscription, SignalingError>;

    /// Look up the identity registered under a username
    async fn resolve_address(&self, username: &str) -> Result<Option<PeerId>, SignalingError>;

    /// Register a username for an identity
    async fn register_username(&self, username: &str, identity: PeerId) -> Result<(), SignalingError>;
}

/// Seals, envelopes and publishes handshake payloads for the local identity
pub struct Signaler {
    keypair: KeyPair,
    transport: Arc<dyn SignalingTransport>,
}

impl Signaler {
    pub fn new(keypair: KeyPair, transport: Arc<dyn SignalingTransport>) -> Self {
        Self { keypair, transport }
    }

    /// Our identity
    pub fn local_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    /// Encrypt a plaintext for `recipient`
    pub fn encrypt(&self, plaintext: &[u8], recipient: &PeerId) -> Result<Vec<u8>, SignalingError> {
        Ok(self.keypair.seal(plaintext, recipient)?)
    }

    /// Decrypt a ciphertext from `sender`
    pub fn decrypt(&self, ciphertext: &[u8], sender: &PeerId) -> Result<Vec<u8>, SignalingError> {
        Ok(self.keypair.open(ciphertext, sender)?)
    }

    /// Seal and publish a handshake payload
    pub async fn send(&self, kind: SignalKind, to: PeerId, payload: &SignalPayload) -> Result<(), SignalingError> {
        let sealed = self.encrypt(&payload.to_bytes()?, &to)?;
        let wrapped = envelope::wrap(&sealed)?;

        debug!("Publishing {:?} to {} ({} bytes)", kind, to, wrapped.len());
        self.transport.publish(kind, to, self.local_id(), wrapped).await
    }

    /// Open an inbound signal
    pub fn open(&self, signal: &InboundSignal) -> Result<SignalPayload, SignalingError> {
        let sealed = envelope::unwrap(&signal.payload)?;
        let plaintext = self.decrypt(&sealed, &signal.from)?;
        Ok(SignalPayload::from_bytes(&plaintext)?)
    }

    /// Subscribe to signals of `kind` addressed to us
    pub async fn subscribe(&self, kind: SignalKind) -> Result<Subscription, SignalingError> {
        self.transport.subscribe(kind, self.local_id()).await
    }

    pub async fn resolve_address(&self, username: &str) -> Result<Option<PeerId>, SignalingError> {
        self.transport.resolve_address(username).await
    }

    /// Register a username for our identity
    pub async fn register_username(&self, username: &str) -> Result<(), SignalingError> {
        self.transport.register_username(username, self.local_id()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedger;
    use ledgerlink_core::types::HandshakeBlob;

    #[tokio::test]
    async fn test_send_and_open() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = Signaler::new(KeyPair::generate(), ledger.clone());
        let bob = Signaler::new(KeyPair::generate(), ledger.clone());

        let mut offers = bob.subscribe(SignalKind::Offer).await.unwrap();
        let payload = SignalPayload::new(HandshakeBlob::new("blob-1")).with_welcome("hi");
        alice
            .send(SignalKind::Offer, bob.local_id(), &payload)
            .await
            .unwrap();

        let signal = offers.next().await.unwrap();
        assert_eq!(signal.from, alice.local_id());
        assert_eq!(bob.open(&signal).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_published_record_is_sealed() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = Signaler::new(KeyPair::generate(), ledger.clone());
        let bob_id = KeyPair::generate().peer_id();

        let payload = SignalPayload::new(HandshakeBlob::new("very-recognizable-blob"));
        alice.send(SignalKind::Offer, bob_id, &payload).await.unwrap();

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        let needle = b"very-recognizable-blob";
        assert!(!records[0]
            .payload
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[tokio::test]
    async fn test_open_rejects_forged_sender() {
        let ledger = Arc::new(MemoryLedger::new());
        let alice = Signaler::new(KeyPair::generate(), ledger.clone());
        let bob = Signaler::new(KeyPair::generate(), ledger.clone());
        let mallory = KeyPair::generate().peer_id();

        let mut offers = bob.subscribe(SignalKind::Offer).await.unwrap();
        alice
            .send(
                SignalKind::Offer,
                bob.local_id(),
                &SignalPayload::new(HandshakeBlob::new("x")),
            )
            .await
            .unwrap();

        let mut signal = offers.next().await.unwrap();
        signal.from = mallory;
        assert!(matches!(bob.open(&signal), Err(SignalingError::Crypto(_))));
    }
}
