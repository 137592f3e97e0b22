//! Diffie-Hellman key agreement and token decryption for encrypted sinks.
//!
//! The client publishes an ephemeral curve25519 public key; the agent
//! answers by writing tokens sealed with AES-256-GCM under the raw X25519
//! shared secret. Associated data is always empty.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use vaultwire_common::SinkEnvelope;

use crate::error::CryptoError;

/// AES-GCM nonce length.
pub const NONCE_SIZE: usize = 12;

/// curve25519 key length.
pub const KEY_SIZE: usize = 32;

/// A symmetric key that is wiped on drop.
pub type SharedKey = Zeroizing<[u8; KEY_SIZE]>;

/// An ephemeral curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("secret", &"[REDACTED]")
            .field("public", &self.public.as_bytes())
            .finish()
    }
}

impl KeyPair {
    /// Generate a fresh key pair from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half, as sent to the agent.
    #[must_use]
    pub fn public_key(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Derive the shared key with a peer.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] when `peer_public` is not
    /// 32 bytes and [`CryptoError::NonContributory`] when the peer key is a
    /// low-order point.
    pub fn shared_key(&self, peer_public: &[u8]) -> Result<SharedKey, CryptoError> {
        let peer = peer_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

fn peer_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::InvalidPublicKey(bytes.len()))
}

/// Encrypt `plaintext` under `key` with a random nonce.
///
/// Returns the ciphertext (tag appended) and the nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encrypt`] if the cipher rejects the input.
pub fn encrypt_aes(
    key: &[u8; KEY_SIZE],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Encrypt)?;

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;
    Ok((ciphertext, nonce))
}

/// Decrypt and authenticate `ciphertext` under `key`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidNonce`] for a nonce that is not 12 bytes
/// and [`CryptoError::Decrypt`] when authentication fails.
pub fn decrypt_aes(
    key: &[u8; KEY_SIZE],
    ciphertext: &[u8],
    nonce: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(nonce.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::Decrypt)
}

/// Key exchange progress for an encrypted sink.
///
/// A session without any exchange has no `DhState` at all. Initiating an
/// exchange yields [`DhState::Keyed`]; the first successful decrypt moves it
/// to [`DhState::Shared`], after which the derived key is reused.
#[derive(Clone)]
pub enum DhState {
    /// Our key pair is published, no peer key seen yet.
    Keyed(KeyPair),
    /// The shared key with a specific peer has been derived.
    Shared {
        /// Our key pair.
        keypair: KeyPair,
        /// The peer key the shared key was derived from.
        peer_public: [u8; KEY_SIZE],
        /// The derived key.
        key: SharedKey,
    },
}

impl fmt::Debug for DhState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyed(keypair) => f.debug_tuple("Keyed").field(keypair).finish(),
            Self::Shared {
                keypair,
                peer_public,
                ..
            } => f
                .debug_struct("Shared")
                .field("keypair", keypair)
                .field("peer_public", peer_public)
                .field("key", &"[REDACTED]")
                .finish(),
        }
    }
}

impl DhState {
    /// Our key pair.
    #[must_use]
    pub const fn keypair(&self) -> &KeyPair {
        match self {
            Self::Keyed(keypair) | Self::Shared { keypair, .. } => keypair,
        }
    }

    /// Whether a shared key has been derived.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        matches!(self, Self::Shared { .. })
    }

    /// Decrypt a sink envelope.
    ///
    /// Returns the plaintext and, when a new shared key had to be derived,
    /// the state to store for later calls. A cached key is reused as long as
    /// the envelope comes from the same peer key.
    ///
    /// # Errors
    ///
    /// Fails if key agreement or decryption fails; the current state stays
    /// valid in that case.
    pub fn open(
        &self,
        envelope: &SinkEnvelope,
    ) -> Result<(Zeroizing<Vec<u8>>, Option<Self>), CryptoError> {
        if let Self::Shared {
            peer_public, key, ..
        } = self
            && peer_public.as_slice() == envelope.curve25519_public_key.as_slice()
        {
            let plaintext = decrypt_aes(key, &envelope.encrypted_payload, &envelope.nonce)?;
            return Ok((plaintext, None));
        }

        let keypair = self.keypair();
        let peer_public = peer_key(&envelope.curve25519_public_key)?;
        let key = keypair.shared_key(&peer_public)?;
        let plaintext = decrypt_aes(&key, &envelope.encrypted_payload, &envelope.nonce)?;

        Ok((
            plaintext,
            Some(Self::Shared {
                keypair: keypair.clone(),
                peer_public,
                key,
            }),
        ))
    }
}
