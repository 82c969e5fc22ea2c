//! Per-connection crypto session
//!
//! Owns the relay's ephemeral key for one connection, the peer's declared
//! key, both cookies and both combined sequence counters. Every inbound
//! nonce is checked against the cookie rules and the strict `+1` sequence
//! rule before it is accepted; state only changes once all checks pass.

use thiserror::Error;
use tracing::debug;

use signalcraft_core::{
    Address, CombinedSequenceNumber, Cookie, Nonce, PublicKey, CSN_MAX,
};

use crate::encrypt::{EncryptError, SharedBox};
use crate::keys::{EncryptionKeypair, KeyError};

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Authentication tag check failed")]
    AuthenticationFailure,

    #[error("Sequence violation: expected {expected}, got {got}")]
    SequenceViolation { expected: u64, got: u64 },

    #[error("Initial sequence number {0} has non-zero overflow bits")]
    InvalidInitialSequence(u64),

    #[error("Combined sequence number exhausted")]
    SequenceOverflow,

    #[error("Peer reused our cookie")]
    CookieReuse,

    #[error("Peer changed its cookie")]
    CookieMismatch,

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("No shared secret derived yet")]
    MissingKey,

    #[error("Encryption failed")]
    EncryptionFailed,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// State of the counter for one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Counter {
    /// Inbound only: the peer has not sent anything yet
    Unset,
    Next(CombinedSequenceNumber),
    Exhausted,
}

impl Counter {
    fn after(csn: CombinedSequenceNumber) -> Self {
        csn.next().map_or(Counter::Exhausted, Counter::Next)
    }
}

/// Crypto state of one relay ↔ client connection
pub struct CryptoSession {
    session_key: EncryptionKeypair,
    peer_key: Option<PublicKey>,
    shared_box: Option<SharedBox>,
    local_address: Address,
    peer_address: Address,
    cookie_out: Cookie,
    cookie_in: Option<Cookie>,
    csn_out: Counter,
    csn_in: Counter,
}

impl CryptoSession {
    /// Fresh session with a random ephemeral key, cookie and initial csn
    pub fn new() -> Self {
        Self::with_keypair(EncryptionKeypair::generate())
    }

    pub fn with_keypair(session_key: EncryptionKeypair) -> Self {
        Self::with_initial_state(
            session_key,
            Cookie::random(),
            CombinedSequenceNumber::random_initial(),
        )
    }

    /// Fully deterministic construction
    pub fn with_initial_state(
        session_key: EncryptionKeypair,
        cookie_out: Cookie,
        csn_out: CombinedSequenceNumber,
    ) -> Self {
        Self {
            session_key,
            peer_key: None,
            shared_box: None,
            local_address: Address::SERVER,
            peer_address: Address::SERVER,
            cookie_out,
            cookie_in: None,
            csn_out: Counter::Next(csn_out),
            csn_in: Counter::Unset,
        }
    }

    pub fn session_public_key(&self) -> PublicKey {
        self.session_key.public_key_bytes()
    }

    pub fn cookie_out(&self) -> Cookie {
        self.cookie_out
    }

    /// The peer's cookie, once its first message has been accepted
    pub fn cookie_in(&self) -> Option<Cookie> {
        self.cookie_in
    }

    pub fn peer_key(&self) -> Option<&PublicKey> {
        self.peer_key.as_ref()
    }

    pub fn local_address(&self) -> Address {
        self.local_address
    }

    pub fn peer_address(&self) -> Address {
        self.peer_address
    }

    /// Address the peer was assigned on its path
    pub fn set_peer_address(&mut self, address: Address) {
        self.peer_address = address;
    }

    /// Agree on a shared secret with the peer's declared public key
    pub fn derive_shared_secret(&mut self, peer_key: &PublicKey) -> Result<()> {
        let shared_box = SharedBox::new(&self.session_key, peer_key).map_err(|e| match e {
            EncryptError::InvalidKey(key_error) => CryptoError::InvalidKey(key_error),
            _ => CryptoError::MissingKey,
        })?;
        self.peer_key = Some(*peer_key);
        self.shared_box = Some(shared_box);
        debug!("Derived shared secret with peer key");
        Ok(())
    }

    /// Reserve the next outgoing nonce towards the peer
    pub fn next_nonce(&mut self) -> Result<Nonce> {
        let csn = match self.csn_out {
            Counter::Next(csn) => csn,
            Counter::Unset | Counter::Exhausted => return Err(CryptoError::SequenceOverflow),
        };
        self.csn_out = Counter::after(csn);
        Ok(Nonce::new(
            self.cookie_out,
            self.local_address,
            self.peer_address,
            csn,
        ))
    }

    /// Encrypt a payload under a fresh nonce
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        if self.shared_box.is_none() {
            return Err(CryptoError::MissingKey);
        }
        let nonce = self.next_nonce()?;
        let ciphertext = self.seal(&nonce, plaintext)?;
        Ok((nonce, ciphertext))
    }

    /// Encrypt under a nonce previously reserved with [`Self::next_nonce`]
    pub fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        let shared_box = self.shared_box.as_ref().ok_or(CryptoError::MissingKey)?;
        shared_box
            .seal(&nonce.to_bytes(), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Box `session key ‖ client key` under the relay's long-term key.
    ///
    /// Uses the nonce of the message carrying the result, so the client can
    /// verify that the relay owns `permanent`.
    pub fn signed_keys(&self, permanent: &EncryptionKeypair, nonce: &Nonce) -> Result<Vec<u8>> {
        let client_key = self.peer_key.ok_or(CryptoError::MissingKey)?;
        let signing_box = SharedBox::new(permanent, &client_key).map_err(|e| match e {
            EncryptError::InvalidKey(key_error) => CryptoError::InvalidKey(key_error),
            _ => CryptoError::EncryptionFailed,
        })?;
        let mut keys = Vec::with_capacity(64);
        keys.extend_from_slice(&self.session_public_key());
        keys.extend_from_slice(&client_key);
        signing_box
            .seal(&nonce.to_bytes(), &keys)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt a payload, enforcing the cookie and sequence rules
    pub fn decrypt(&mut self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_cookie(nonce)?;
        let shared_box = self.shared_box.as_ref().ok_or(CryptoError::MissingKey)?;
        let plaintext = shared_box
            .open(&nonce.to_bytes(), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailure)?;
        let next = self.check_sequence(nonce)?;
        self.commit(nonce, next);
        Ok(plaintext)
    }

    /// Accept the nonce of an unencrypted message
    pub fn accept_plaintext(&mut self, nonce: &Nonce) -> Result<()> {
        self.check_cookie(nonce)?;
        let next = self.check_sequence(nonce)?;
        self.commit(nonce, next);
        Ok(())
    }

    fn check_cookie(&self, nonce: &Nonce) -> Result<()> {
        if nonce.cookie == self.cookie_out {
            return Err(CryptoError::CookieReuse);
        }
        match self.cookie_in {
            Some(cookie) if cookie != nonce.cookie => Err(CryptoError::CookieMismatch),
            _ => Ok(()),
        }
    }

    fn check_sequence(&self, nonce: &Nonce) -> Result<Counter> {
        let got = nonce.csn;
        match self.csn_in {
            Counter::Unset => {
                if got.overflow() != 0 {
                    return Err(CryptoError::InvalidInitialSequence(got.value()));
                }
                Ok(Counter::after(got))
            }
            Counter::Next(expected) if expected == got => Ok(Counter::after(got)),
            Counter::Next(expected) => Err(CryptoError::SequenceViolation {
                expected: expected.value(),
                got: got.value(),
            }),
            Counter::Exhausted => Err(CryptoError::SequenceOverflow),
        }
    }

    fn commit(&mut self, nonce: &Nonce, next: Counter) {
        if self.cookie_in.is_none() {
            self.cookie_in = Some(nonce.cookie);
        }
        self.csn_in = next;
    }
}

impl Default for CryptoSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer-side mirror of [`CryptoSession`], used by clients and tests to talk
/// to the relay.
pub struct PeerSession {
    inner: CryptoSession,
}

impl PeerSession {
    /// `address` is the client's own address in outgoing nonces
    pub fn new(keypair: EncryptionKeypair, address: Address) -> Self {
        let mut inner = CryptoSession::with_keypair(keypair);
        inner.local_address = address;
        inner.peer_address = Address::SERVER;
        Self { inner }
    }

    /// Start with a specific outgoing csn
    pub fn with_initial_csn(
        keypair: EncryptionKeypair,
        address: Address,
        csn: CombinedSequenceNumber,
    ) -> Self {
        let mut inner = CryptoSession::with_initial_state(keypair, Cookie::random(), csn);
        inner.local_address = address;
        inner.peer_address = Address::SERVER;
        Self { inner }
    }

    pub fn session(&mut self) -> &mut CryptoSession {
        &mut self.inner
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.session_public_key()
    }

    pub fn session_key(&self) -> &EncryptionKeypair {
        &self.inner.session_key
    }

    pub fn cookie(&self) -> Cookie {
        self.inner.cookie_out
    }

    pub fn set_address(&mut self, address: Address) {
        self.inner.local_address = address;
    }

    pub fn derive_shared_secret(&mut self, relay_key: &PublicKey) -> Result<()> {
        self.inner.derive_shared_secret(relay_key)
    }

    pub fn next_nonce(&mut self) -> Result<Nonce> {
        self.inner.next_nonce()
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        self.inner.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.inner.decrypt(nonce, ciphertext)
    }

    pub fn accept_plaintext(&mut self, nonce: &Nonce) -> Result<()> {
        self.inner.accept_plaintext(nonce)
    }
}
