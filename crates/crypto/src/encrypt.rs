use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

use signalcraft_core::NONCE_LENGTH;

use crate::keys::{hash, EncryptionKeypair, KeyError};

/// Poly1305 tag length
pub const TAG_LENGTH: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptError {
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Decryption failed")]
    DecryptionFailed,
    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("Ciphertext too short")]
    CiphertextTooShort,
}

/// Authenticated box between two X25519 keys
///
/// 1. Perform X25519 Diffie-Hellman to derive shared secret
/// 2. Hash the shared secret to get a symmetric key
/// 3. Encrypt with XChaCha20-Poly1305 under the caller's 24-byte nonce
pub struct SharedBox {
    cipher: XChaCha20Poly1305,
}

impl SharedBox {
    /// Derive the box between our keypair and the peer's public key
    pub fn new(ours: &EncryptionKeypair, their_public: &[u8; 32]) -> Result<Self, EncryptError> {
        let shared = ours.diffie_hellman(their_public)?;
        Ok(Self::from_shared_secret(&shared))
    }

    /// Build the box from an already agreed shared secret
    pub fn from_shared_secret(shared: &[u8; 32]) -> Self {
        let symmetric_key = hash(shared);
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&symmetric_key)),
        }
    }

    pub fn seal(&self, nonce: &[u8; NONCE_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, EncryptError> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| EncryptError::EncryptionFailed)
    }

    /// Fails closed: a bad tag never yields any plaintext
    pub fn open(&self, nonce: &[u8; NONCE_LENGTH], ciphertext: &[u8]) -> Result<Vec<u8>, EncryptError> {
        if ciphertext.len() < TAG_LENGTH {
            return Err(EncryptError::CiphertextTooShort);
        }
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| EncryptError::DecryptionFailed)
    }
}
