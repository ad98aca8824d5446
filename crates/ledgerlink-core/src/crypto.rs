//! Identity keys and sealed signaling payloads
//!
//! Handshake payloads are public on the ledger, so they are sealed for the
//! recipient and bound to the sender:
//! - 32 bytes: ephemeral x25519 public key
//! - 12 bytes: nonce
//! - N bytes: ChaCha20-Poly1305 ciphertext
//!
//! Key = HKDF-SHA256(salt = ephemeral, ikm = DH(eph, recipient) || DH(sender, recipient)).

use crate::types::PeerId;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Domain separation for phrase-derived identities
pub const DOMAIN_IDENTITY: &str = "ledgerlink identity v1";
/// Domain separation for sealing keys
pub const DOMAIN_SEAL: &[u8] = b"ledgerlink-seal-v1";

const EPHEMERAL_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SEAL_OVERHEAD: usize = EPHEMERAL_LEN + NONCE_LEN + 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Sealed payload too short: {0} bytes")]
    Truncated(usize),
    #[error("Key exchange produced a non-contributory secret")]
    NonContributory,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD decryption failed")]
    DecryptionFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Static x25519 identity keypair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(*seed))
    }

    /// Derive a keypair from a secret phrase
    pub fn from_phrase(phrase: &str) -> Self {
        let seed = blake3::derive_key(DOMAIN_IDENTITY, phrase.trim().as_bytes());
        Self::from_seed(&seed)
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Identity derived from the public key
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key())
    }

    /// Seal a plaintext for `recipient`
    pub fn seal(&self, plaintext: &[u8], recipient: &PeerId) -> Result<Vec<u8>, CryptoError> {
        let recipient_pub = PublicKey::from(*recipient.as_bytes());

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = PublicKey::from(&ephemeral);

        let dh_ephemeral = ephemeral.diffie_hellman(&recipient_pub);
        let dh_static = self.secret.diffie_hellman(&recipient_pub);
        if !dh_ephemeral.was_contributory() || !dh_static.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let key = derive_key(
            ephemeral_pub.as_bytes(),
            dh_ephemeral.as_bytes(),
            dh_static.as_bytes(),
            &self.peer_id(),
            recipient,
        )?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let aad = associated_data(&self.peer_id(), recipient, ephemeral_pub.as_bytes());
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload {
                msg: plaintext,
                aad: &aad,
            })
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(EPHEMERAL_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(ephemeral_pub.as_bytes());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a payload sealed for us by `sender`
    pub fn open(&self, sealed: &[u8], sender: &PeerId) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Truncated(sealed.len()));
        }

        let (ephemeral_bytes, rest) = sealed.split_at(EPHEMERAL_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        let ephemeral: [u8; 32] = ephemeral_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let ephemeral_pub = PublicKey::from(ephemeral);
        let sender_pub = PublicKey::from(*sender.as_bytes());

        let dh_ephemeral = self.secret.diffie_hellman(&ephemeral_pub);
        let dh_static = self.secret.diffie_hellman(&sender_pub);
        if !dh_ephemeral.was_contributory() || !dh_static.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let key = derive_key(
            &ephemeral,
            dh_ephemeral.as_bytes(),
            dh_static.as_bytes(),
            sender,
            &self.peer_id(),
        )?;

        let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let aad = associated_data(sender, &self.peer_id(), &ephemeral);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload {
                msg: ciphertext,
                aad: &aad,
            })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn derive_key(
    ephemeral_pub: &[u8; 32],
    dh_ephemeral: &[u8; 32],
    dh_static: &[u8; 32],
    sender: &PeerId,
    recipient: &PeerId,
) -> Result<[u8; 32], CryptoError> {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(dh_ephemeral);
    ikm[32..].copy_from_slice(dh_static);
    let hkdf = Hkdf::<Sha256>::new(Some(ephemeral_pub), &ikm);

    let mut info = Vec::with_capacity(DOMAIN_SEAL.len() + 64);
    info.extend_from_slice(DOMAIN_SEAL);
    info.extend_from_slice(sender.as_bytes());
    info.extend_from_slice(recipient.as_bytes());

    let mut key = [0u8; 32];
    hkdf.expand(&info, &mut key)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(key)
}

fn associated_data(sender: &PeerId, recipient: &PeerId, ephemeral_pub: &[u8; 32]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(96);
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(recipient.as_bytes());
    aad.extend_from_slice(ephemeral_pub);
    aad
}
