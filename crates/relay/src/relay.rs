//! Relay mode
//!
//! After pairing, frames not addressed to the relay are forwarded to the
//! partner byte for byte. Only the nonce header is inspected: the source must
//! be the sender's own address, the destination its partner, and within one
//! pairing the cookie stays fixed and the csn grows by exactly one.

use signalcraft_core::{Address, CombinedSequenceNumber, Cookie, Nonce};
use signalcraft_crypto::CryptoError;

use crate::{RelayError, Result};

/// Where an inspected frame goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Peer(Address),
    /// Valid destination, but no active pairing with it
    Unpaired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    First,
    Next(CombinedSequenceNumber),
    Exhausted,
}

/// Outbound relay state of one connection
#[derive(Debug, Clone)]
pub struct RelayChannel {
    own: Address,
    peer: Option<Address>,
    /// Registry generation of the current pairing
    generation: u64,
    cookie: Option<Cookie>,
    expect: Expect,
}

impl RelayChannel {
    pub fn new(own: Address) -> Self {
        Self {
            own,
            peer: None,
            generation: 0,
            cookie: None,
            expect: Expect::First,
        }
    }

    pub fn peer(&self) -> Option<Address> {
        self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new pairing. Cookie and csn tracking restart.
    pub fn pair(&mut self, peer: Address, generation: u64) {
        self.peer = Some(peer);
        self.generation = generation;
        self.cookie = None;
        self.expect = Expect::First;
    }

    /// End the pairing with `peer`, if it is the current one
    pub fn unpair(&mut self, peer: Address) -> bool {
        if self.peer == Some(peer) {
            self.peer = None;
            return true;
        }
        false
    }

    /// Validate the header of a frame to relay
    pub fn inspect(&mut self, nonce: &Nonce) -> Result<Route> {
        if nonce.source != self.own {
            return Err(RelayError::Protocol(format!(
                "source {} does not match own address {}",
                nonce.source, self.own
            )));
        }
        let destination = nonce.destination;
        if destination.is_server() || destination == self.own {
            return Err(RelayError::Protocol(format!(
                "cannot relay to {}",
                destination
            )));
        }
        if self.own.is_responder() && !destination.is_initiator() {
            return Err(RelayError::Protocol(format!(
                "responder cannot address {}",
                destination
            )));
        }
        if self.peer != Some(destination) {
            return Ok(Route::Unpaired);
        }

        if let Some(cookie) = self.cookie {
            if cookie != nonce.cookie {
                return Err(CryptoError::CookieMismatch.into());
            }
        }
        let got = nonce.csn;
        match self.expect {
            Expect::First => {}
            Expect::Next(expected) if expected == got => {}
            Expect::Next(expected) => {
                return Err(CryptoError::SequenceViolation {
                    expected: expected.value(),
                    got: got.value(),
                }
                .into())
            }
            Expect::Exhausted => return Err(CryptoError::SequenceOverflow.into()),
        }

        self.cookie = Some(nonce.cookie);
        self.expect = got.next().map_or(Expect::Exhausted, Expect::Next);
        Ok(Route::Peer(destination))
    }
}
