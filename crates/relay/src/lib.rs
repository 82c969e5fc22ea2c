//! SignalCraft Relay
//!
//! Handshake, path pairing and frame relaying for the signalling server.
//! Transport-agnostic: connections are driven through [`Frame`] sinks and
//! streams by [`RelayServer::serve`].

mod connection;
mod error;
mod handshake;
mod registry;
mod relay;
mod server;
mod supervisor;
mod transport;

pub use error::{RelayError, Result};
pub use handshake::{ClientAuthenticated, Handshake, HandshakeState, PathSummary};
pub use registry::{
    ActivePair, ClientHandle, ConnectionId, DeliveryError, Event, InitiatorAdmission,
    PathRegistry, ResponderAdmission,
};
pub use relay::{RelayChannel, Route};
pub use server::RelayServer;
pub use supervisor::{Supervisor, Tick};
pub use transport::{Frame, TransportError};
