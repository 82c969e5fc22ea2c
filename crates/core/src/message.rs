//! Signalling messages
//!
//! Every payload the relay produces or consumes is a JSON object whose `type`
//! field selects one of the variants below. Binary fields are hex strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Address, ClientRole, Cookie, PublicKey, Result, SignalError};

/// Closed set of message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    ServerHello(ServerHello),
    ClientHello(ClientHello),
    ClientAuth(ClientAuth),
    ServerAuth(ServerAuth),
    NewInitiator(NewInitiator),
    NewResponder(NewResponder),
    DropResponder(DropResponder),
    SendError(SendError),
    Disconnected(Disconnected),
    Application(Application),
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ServerHello(_) => "server-hello",
            Message::ClientHello(_) => "client-hello",
            Message::ClientAuth(_) => "client-auth",
            Message::ServerAuth(_) => "server-auth",
            Message::NewInitiator(_) => "new-initiator",
            Message::NewResponder(_) => "new-responder",
            Message::DropResponder(_) => "drop-responder",
            Message::SendError(_) => "send-error",
            Message::Disconnected(_) => "disconnected",
            Message::Application(_) => "application",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SignalError::Serialization(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| SignalError::Serialization(e.to_string()))
    }
}

/// First message of every connection, sent by the relay in plaintext
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerHello {
    /// The relay's ephemeral public key for this connection
    #[serde(with = "crate::hex_serde::fixed")]
    pub key: PublicKey,
}

/// Role declaration, sent by the client in plaintext
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientHello {
    pub role: ClientRole,
    /// The client's public key. For initiators this must be the path key.
    #[serde(with = "crate::hex_serde::fixed")]
    pub key: PublicKey,
}

/// Client authentication, encrypted towards the relay's session key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAuth {
    /// Echo of the relay's cookie
    pub your_cookie: Cookie,
    /// Long-term relay key the client expects to talk to
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::hex_serde::option_fixed"
    )]
    pub your_key: Option<PublicKey>,
    /// Requested keepalive interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval: Option<u32>,
    /// Supported tasks in order of preference
    pub tasks: Vec<String>,
    /// Per-task negotiation data
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Relay authentication, answers `client-auth`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAuth {
    /// Echo of the client's cookie
    pub your_cookie: Cookie,
    /// `server session key || client key`, boxed with the relay's long-term key
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "crate::hex_serde::option_bytes"
    )]
    pub signed_keys: Option<Vec<u8>>,
    /// Responders only: whether an initiator is on the path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_connected: Option<bool>,
    /// Initiators only: responders currently on the path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responders: Option<Vec<Address>>,
}

/// Sent to a responder when an initiator becomes available or is paired.
/// `task` is set once the pairing has been negotiated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewInitiator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Sent to the initiator when a responder becomes available or is paired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewResponder {
    pub id: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Initiator asks the relay to drop one of its responders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropResponder {
    pub id: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<u16>,
}

/// A relayed frame could not be delivered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendError {
    /// `source | destination | csn` of the undeliverable frame
    #[serde(with = "crate::hex_serde::fixed")]
    pub id: [u8; 8],
}

/// A client left the path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disconnected {
    pub id: Address,
}

/// Task payload exchanged end-to-end between peers. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub data: Value,
}
