//! Connection timers
//!
//! Pure bookkeeping over [`tokio::time::Instant`]: the connection task asks
//! for the next deadline, sleeps until then and calls [`Supervisor::poll`].

use std::time::Duration;

use tokio::time::Instant;

use signalcraft_core::{RelayConfig, MIN_KEEPALIVE_INTERVAL};

/// A timer that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// The connection did not reach relay mode in time
    HandshakeExpired,
    /// Time to send a keepalive ping
    SendPing,
    /// The last ping was not answered in time
    PongMissing,
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    handshake_deadline: Option<Instant>,
    ping_interval: Duration,
    next_ping: Instant,
    pong_timeout: Duration,
    pong_deadline: Option<Instant>,
}

impl Supervisor {
    pub fn new(now: Instant, config: &RelayConfig) -> Self {
        Self {
            handshake_deadline: Some(now + config.handshake_timeout),
            ping_interval: config.keepalive_interval,
            next_ping: now + config.keepalive_interval,
            pong_timeout: config.pong_timeout,
            pong_deadline: None,
        }
    }

    /// Relay mode reached
    pub fn handshake_complete(&mut self) {
        self.handshake_deadline = None;
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Apply a client-requested interval. Returns `false` if it was ignored.
    pub fn set_ping_interval(&mut self, now: Instant, interval: Duration) -> bool {
        if interval < MIN_KEEPALIVE_INTERVAL {
            return false;
        }
        self.ping_interval = interval;
        self.next_ping = now + interval;
        true
    }

    pub fn pong_received(&mut self) {
        self.pong_deadline = None;
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Instant {
        [self.handshake_deadline, self.pong_deadline]
            .into_iter()
            .flatten()
            .fold(self.next_ping, Instant::min)
    }

    /// Fire the most urgent due timer, if any
    pub fn poll(&mut self, now: Instant) -> Option<Tick> {
        if self.handshake_deadline.map_or(false, |deadline| now >= deadline) {
            self.handshake_deadline = None;
            return Some(Tick::HandshakeExpired);
        }
        if self.pong_deadline.map_or(false, |deadline| now >= deadline) {
            self.pong_deadline = None;
            return Some(Tick::PongMissing);
        }
        if now >= self.next_ping {
            self.next_ping = now + self.ping_interval;
            if self.pong_deadline.is_none() {
                self.pong_deadline = Some(now + self.pong_timeout);
                return Some(Tick::SendPing);
            }
        }
        None
    }
}
