//! SignalCraft Daemon
//!
//! WebSocket front end for the relay.
//!
//! ## Components
//!
//! - **RelayDaemon**: TCP accept loop, WebSocket upgrade, graceful shutdown
//! - **websocket**: adapts tungstenite messages to relay [`Frame`]s
//!
//! The upgrade request path must be `/<64 hex chars>`, the initiator's
//! public key. Anything else is refused with HTTP 400 before the relay
//! sees the connection.
//!
//! [`Frame`]: signalcraft_relay::Frame

mod server;
mod websocket;

pub use server::{RelayDaemon, SHUTDOWN_GRACE};
pub use websocket::{frame_to_message, message_to_frame, split_socket};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
