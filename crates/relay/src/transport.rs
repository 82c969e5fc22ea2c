//! Transport-neutral frames
//!
//! The relay never touches sockets. A connection is driven by any
//! `Stream<Item = Result<Frame, TransportError>>` paired with a
//! `Sink<Frame, Error = TransportError>`; the daemon adapts WebSocket
//! messages, tests use in-memory channels.

use thiserror::Error;

/// One message-oriented transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Vec<u8>),
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Close with an optional numeric cause, never a reason string
    Close(Option<u16>),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Binary(_) => "binary",
            Frame::Text(_) => "text",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Close(_) => "close",
        }
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,

    #[error("Frame too large: {0}")]
    TooLarge(String),

    #[error("Transport failure: {0}")]
    Failure(String),
}
