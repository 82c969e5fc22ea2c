use std::fmt;

use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid secret key length")]
    InvalidSecretKey,
    #[error("Key agreement produced a non-contributory shared secret")]
    NonContributory,
}

/// X25519 keypair used for the relay's long-term identity and for
/// per-connection session keys
pub struct EncryptionKeypair {
    pub secret: StaticSecret,
    pub public: X25519PublicKey,
}

impl Clone for EncryptionKeypair {
    fn clone(&self) -> Self {
        let secret_bytes = self.secret.as_bytes();
        let secret = StaticSecret::from(*secret_bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }
}

impl fmt::Debug for EncryptionKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeypair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

impl EncryptionKeypair {
    /// Generate a new random encryption keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        *self.secret.as_bytes()
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*secret);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from a secret key slice of unchecked length
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, KeyError> {
        let secret: [u8; 32] = secret.try_into().map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// Low-order peer keys yield an all-zero secret and are rejected.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Result<[u8; 32], KeyError> {
        let their_public = X25519PublicKey::from(*their_public);
        let shared = self.secret.diffie_hellman(&their_public);
        if !shared.was_contributory() {
            return Err(KeyError::NonContributory);
        }
        Ok(*shared.as_bytes())
    }
}

/// The relay's long-term keys. The first key is the default one.
#[derive(Debug, Clone)]
pub struct ServerKeys {
    keys: Vec<EncryptionKeypair>,
}

impl ServerKeys {
    /// Returns `None` when no key is given
    pub fn new(keys: Vec<EncryptionKeypair>) -> Option<Self> {
        if keys.is_empty() {
            return None;
        }
        Some(Self { keys })
    }

    pub fn single(key: EncryptionKeypair) -> Self {
        Self { keys: vec![key] }
    }

    pub fn primary(&self) -> &EncryptionKeypair {
        &self.keys[0]
    }

    /// Look up a key by its public half
    pub fn find(&self, public: &[u8; 32]) -> Option<&EncryptionKeypair> {
        self.keys.iter().find(|k| &k.public_key_bytes() == public)
    }

    pub fn public_keys(&self) -> impl Iterator<Item = [u8; 32]> + '_ {
        self.keys.iter().map(|k| k.public_key_bytes())
    }
}

/// Hash data using SHA-256
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_keypair() {
        let kp = EncryptionKeypair::generate();
        let pubkey = kp.public_key_bytes();
        let secret = kp.secret_key_bytes();

        let restored = EncryptionKeypair::from_secret_bytes(&secret);
        assert_eq!(restored.public_key_bytes(), pubkey);
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = EncryptionKeypair::generate();
        let bob = EncryptionKeypair::generate();

        let alice_shared = alice.diffie_hellman(&bob.public_key_bytes()).unwrap();
        let bob_shared = bob.diffie_hellman(&alice.public_key_bytes()).unwrap();

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_server_keys_lookup() {
        let first = EncryptionKeypair::generate();
        let second = EncryptionKeypair::generate();
        let second_public = second.public_key_bytes();
        let keys = ServerKeys::new(vec![first.clone(), second]).unwrap();

        assert_eq!(keys.primary().public_key_bytes(), first.public_key_bytes());
        assert!(keys.find(&second_public).is_some());
        assert!(keys.find(&[9u8; 32]).is_none());
        assert_eq!(keys.public_keys().count(), 2);
    }

    #[test]
    fn test_debug_hides_secret() {
        let kp = EncryptionKeypair::generate();
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(&hex::encode(kp.secret_key_bytes())));
    }

    // ==================== NEGATIVE TESTS ====================

    #[test]
    fn test_low_order_key_rejected() {
        let kp = EncryptionKeypair::generate();
        assert!(matches!(
            kp.diffie_hellman(&[0u8; 32]),
            Err(KeyError::NonContributory)
        ));
    }

    #[test]
    fn test_secret_slice_wrong_length() {
        assert!(EncryptionKeypair::from_secret_slice(&[1u8; 31]).is_err());
    }

    #[test]
    fn test_server_keys_empty() {
        assert!(ServerKeys::new(vec![]).is_none());
    }
}
