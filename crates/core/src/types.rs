use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{Result, SignalError};

/// 32-byte X25519 public key
pub type PublicKey = [u8; 32];

/// Length of a cookie in bytes
pub const COOKIE_LENGTH: usize = 16;

/// Largest value a 48-bit combined sequence number can hold
pub const CSN_MAX: u64 = (1 << 48) - 1;

/// Address of a party on a path (the `source`/`destination` byte of a nonce)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(pub u8);

impl Address {
    /// The relay itself. Also used by clients before they are authenticated.
    pub const SERVER: Address = Address(0x00);
    /// The single initiator slot of a path
    pub const INITIATOR: Address = Address(0x01);
    /// First responder slot
    pub const FIRST_RESPONDER: Address = Address(0x02);
    /// Last responder slot
    pub const LAST_RESPONDER: Address = Address(0xff);

    pub fn is_server(&self) -> bool {
        *self == Self::SERVER
    }

    pub fn is_initiator(&self) -> bool {
        *self == Self::INITIATOR
    }

    pub fn is_responder(&self) -> bool {
        self.0 >= Self::FIRST_RESPONDER.0
    }

    /// Iterate over every responder slot in ascending order
    pub fn responder_slots() -> impl Iterator<Item = Address> {
        (Self::FIRST_RESPONDER.0..=Self::LAST_RESPONDER.0).map(Address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// Role a client declares in its `client-hello`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Initiator,
    Responder,
}

impl ClientRole {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRole::Initiator => "initiator",
            ClientRole::Responder => "responder",
        }
    }
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Path identifier: the initiator's long-term public key.
///
/// Appears on the wire as 64 hex characters in the WebSocket URL path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId(PublicKey);

impl PathId {
    pub fn new(initiator_key: PublicKey) -> Self {
        Self(initiator_key)
    }

    /// Parse a path id from its hex representation
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(SignalError::InvalidPath(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| SignalError::InvalidPath(e.to_string()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Parse a path id from a request URL path such as `/ab12...`
    pub fn from_url_path(path: &str) -> Result<Self> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        Self::from_hex(trimmed)
    }

    /// The initiator's long-term public key
    pub fn initiator_key(&self) -> &PublicKey {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for PathId {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.short())
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Per-connection random value that binds a message sequence to one session
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cookie(#[serde(with = "crate::hex_serde::fixed")] pub [u8; COOKIE_LENGTH]);

impl Cookie {
    pub fn random() -> Self {
        let mut bytes = [0u8; COOKIE_LENGTH];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cookie({})", hex::encode(&self.0[..4]))
    }
}

/// 48-bit combined sequence number: `overflow (16 bit) | sequence (32 bit)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CombinedSequenceNumber(u64);

impl CombinedSequenceNumber {
    /// Build from a raw value. Values wider than 48 bits are rejected.
    pub fn new(value: u64) -> Result<Self> {
        if value > CSN_MAX {
            return Err(SignalError::MalformedNonce(format!(
                "combined sequence number {} exceeds 48 bits",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn from_parts(overflow: u16, sequence: u32) -> Self {
        Self((u64::from(overflow) << 32) | u64::from(sequence))
    }

    /// Fresh outgoing counter: random lower 32 bits, overflow number zero
    pub fn random_initial() -> Self {
        Self(u64::from(OsRng.next_u32()))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn overflow(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn sequence(&self) -> u32 {
        self.0 as u32
    }

    /// The following number, or `None` once the 48-bit range is exhausted
    pub fn next(&self) -> Option<Self> {
        let next = self.0 + 1;
        (next <= CSN_MAX).then_some(Self(next))
    }
}

impl fmt::Display for CombinedSequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
