//! Runtime relay configuration

use std::time::Duration;

use crate::{Result, SignalError, TaskPolicy};

/// Default time a connection has to reach relay mode
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default keepalive ping interval
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3600);

/// Shortest keepalive interval a client may request
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Default time to wait for a pong
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Default largest accepted frame (nonce included)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default bound of a connection's outbound queue
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Number of responder addresses (`0x02..=0xff`)
pub const MAX_RESPONDER_SLOTS: usize = 254;

/// Tunables shared by every connection of a relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Deadline for reaching relay mode after accept
    pub handshake_timeout: Duration,
    /// Ping interval used until a client asks for another one
    pub keepalive_interval: Duration,
    /// How long to wait for a pong before dropping the connection
    pub pong_timeout: Duration,
    /// Largest inbound frame in bytes
    pub max_frame_size: usize,
    /// Frames that may wait in one connection's outbound queue
    pub outbound_queue: usize,
    /// Responders a single path may hold at once
    pub max_responders: usize,
    /// Task selection policy applied at pairing
    pub task_policy: TaskPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_responders: MAX_RESPONDER_SLOTS,
            task_policy: TaskPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.outbound_queue == 0 {
            return Err(SignalError::InvalidConfig(
                "outbound queue length must be positive".to_string(),
            ));
        }
        if self.max_responders == 0 || self.max_responders > MAX_RESPONDER_SLOTS {
            return Err(SignalError::InvalidConfig(format!(
                "max responders must be between 1 and {}",
                MAX_RESPONDER_SLOTS
            )));
        }
        if self.max_frame_size <= crate::NONCE_LENGTH {
            return Err(SignalError::InvalidConfig(format!(
                "max frame size must exceed {} bytes",
                crate::NONCE_LENGTH
            )));
        }
        if self.handshake_timeout.is_zero() || self.pong_timeout.is_zero() {
            return Err(SignalError::InvalidConfig(
                "timeouts must be positive".to_string(),
            ));
        }
        if self.keepalive_interval < MIN_KEEPALIVE_INTERVAL {
            return Err(SignalError::InvalidConfig(format!(
                "keepalive interval must be at least {:?}",
                MIN_KEEPALIVE_INTERVAL
            )));
        }
        Ok(())
    }
}
