//! Nonce layout shared by every frame on the wire
//!
//! ```text
//! | cookie (16) | source (1) | destination (1) | overflow (2) | sequence (4) |
//! ```
//!
//! Overflow and sequence are big endian and together form the 48-bit
//! combined sequence number.

use crate::{Address, CombinedSequenceNumber, Cookie, Result, SignalError, COOKIE_LENGTH};

/// Length of a serialized nonce
pub const NONCE_LENGTH: usize = 24;

/// Decoded nonce header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    pub cookie: Cookie,
    pub source: Address,
    pub destination: Address,
    pub csn: CombinedSequenceNumber,
}

impl Nonce {
    pub fn new(
        cookie: Cookie,
        source: Address,
        destination: Address,
        csn: CombinedSequenceNumber,
    ) -> Self {
        Self {
            cookie,
            source,
            destination,
            csn,
        }
    }

    pub fn to_bytes(&self) -> [u8; NONCE_LENGTH] {
        let mut out = [0u8; NONCE_LENGTH];
        out[..COOKIE_LENGTH].copy_from_slice(self.cookie.as_bytes());
        out[16] = self.source.0;
        out[17] = self.destination.0;
        out[18..20].copy_from_slice(&self.csn.overflow().to_be_bytes());
        out[20..24].copy_from_slice(&self.csn.sequence().to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_LENGTH {
            return Err(SignalError::MalformedNonce(format!(
                "expected {} bytes, got {}",
                NONCE_LENGTH,
                bytes.len()
            )));
        }
        let mut cookie = [0u8; COOKIE_LENGTH];
        cookie.copy_from_slice(&bytes[..COOKIE_LENGTH]);
        let overflow = u16::from_be_bytes([bytes[18], bytes[19]]);
        let sequence = u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);
        Ok(Self {
            cookie: Cookie(cookie),
            source: Address(bytes[16]),
            destination: Address(bytes[17]),
            csn: CombinedSequenceNumber::from_parts(overflow, sequence),
        })
    }

    /// The 8 bytes following the cookie. Identifies a frame in `send-error`.
    pub fn message_id(&self) -> [u8; 8] {
        let bytes = self.to_bytes();
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[COOKIE_LENGTH..]);
        id
    }
}

/// Split a frame into its nonce header and the payload that follows
pub fn split_frame(frame: &[u8]) -> Result<(Nonce, &[u8])> {
    if frame.len() <= NONCE_LENGTH {
        return Err(SignalError::MalformedNonce(format!(
            "frame of {} bytes carries no payload",
            frame.len()
        )));
    }
    let (header, payload) = frame.split_at(NONCE_LENGTH);
    Ok((Nonce::from_bytes(header)?, payload))
}

/// Prepend a nonce to a payload
pub fn join_frame(nonce: &Nonce, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(NONCE_LENGTH + payload.len());
    frame.extend_from_slice(&nonce.to_bytes());
    frame.extend_from_slice(payload);
    frame
}
