//! Handshake state machine
//!
//! ```text
//! AwaitingClientHello -> AwaitingClientAuth -> Authenticated -> Open
//!          \                    \                   \            \
//!           +--------------------+-------------------+------------+--> Closed
//! ```
//!
//! The relay sends `server-hello` as soon as the connection starts. The
//! client answers with `client-hello` (role and key, plaintext) and then
//! `client-auth` (cookie echo and task offer, encrypted). Once the registry
//! has admitted the client, `server-auth` carries its address and moves the
//! connection to `Authenticated`; pairing with a peer moves it to `Open`.
//! A failed step always closes the state machine.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use signalcraft_core::{
    join_frame, split_frame, Address, ClientRole, Message, Nonce, PathId, ServerAuth,
    ServerHello, TaskOffer,
};
use signalcraft_crypto::{CryptoSession, EncryptionKeypair, ServerKeys};

use crate::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingClientHello,
    AwaitingClientAuth,
    Authenticated,
    Open,
    Closed,
}

impl HandshakeState {
    /// The only state a successful step may move to
    pub fn next(&self) -> Option<Self> {
        match self {
            HandshakeState::AwaitingClientHello => Some(HandshakeState::AwaitingClientAuth),
            HandshakeState::AwaitingClientAuth => Some(HandshakeState::Authenticated),
            HandshakeState::Authenticated => Some(HandshakeState::Open),
            HandshakeState::Open => Some(HandshakeState::Closed),
            HandshakeState::Closed => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HandshakeState::AwaitingClientHello => "awaiting-client-hello",
            HandshakeState::AwaitingClientAuth => "awaiting-client-auth",
            HandshakeState::Authenticated => "authenticated",
            HandshakeState::Open => "open",
            HandshakeState::Closed => "closed",
        }
    }

    /// Past `server-auth`: encrypted traffic in both directions
    pub fn is_authenticated(&self) -> bool {
        matches!(self, HandshakeState::Authenticated | HandshakeState::Open)
    }
}

/// What the client asked for in `client-auth`
#[derive(Debug, Clone)]
pub struct ClientAuthenticated {
    pub offer: TaskOffer,
    /// Requested keepalive interval
    pub ping_interval: Option<Duration>,
}

/// Path state reported in `server-auth`
#[derive(Debug, Clone, PartialEq)]
pub enum PathSummary {
    Initiator { responders: Vec<Address> },
    Responder { initiator_connected: bool },
}

pub struct Handshake {
    state: HandshakeState,
    path: PathId,
    role: Option<ClientRole>,
    session: CryptoSession,
    keys: Arc<ServerKeys>,
    hello_sent: bool,
    /// Long-term key chosen by the client, set once `client-auth` verified
    permanent_key: Option<EncryptionKeypair>,
}

impl Handshake {
    pub fn new(path: PathId, keys: Arc<ServerKeys>) -> Self {
        Self::with_session(path, keys, CryptoSession::new())
    }

    pub fn with_session(path: PathId, keys: Arc<ServerKeys>, session: CryptoSession) -> Self {
        Self {
            state: HandshakeState::AwaitingClientHello,
            path,
            role: None,
            session,
            keys,
            hello_sent: false,
            permanent_key: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn role(&self) -> Option<ClientRole> {
        self.role
    }

    pub fn path(&self) -> &PathId {
        &self.path
    }

    /// Address assigned to the client, `0x00` until `server-auth`
    pub fn address(&self) -> Address {
        self.session.peer_address()
    }

    pub fn session(&self) -> &CryptoSession {
        &self.session
    }

    /// Build the plaintext `server-hello` frame. Only valid once.
    pub fn server_hello(&mut self) -> Result<Vec<u8>> {
        self.expect(HandshakeState::AwaitingClientHello)?;
        if self.hello_sent {
            return self.fail(RelayError::Protocol("server-hello already sent".to_string()));
        }
        let message = Message::ServerHello(ServerHello {
            key: self.session.session_public_key(),
        });
        let frame = self.guard(|hs| {
            let nonce = hs.session.next_nonce()?;
            Ok(join_frame(&nonce, &message.to_bytes()?))
        })?;
        self.hello_sent = true;
        Ok(frame)
    }

    /// Process `client-hello`: role declaration and key agreement
    pub fn on_client_hello(&mut self, frame: &[u8]) -> Result<ClientRole> {
        self.expect(HandshakeState::AwaitingClientHello)?;
        if !self.hello_sent {
            return self.fail(RelayError::Protocol("client-hello before server-hello".to_string()));
        }
        let role = self.guard(|hs| hs.client_hello(frame))?;
        self.advance()?;
        Ok(role)
    }

    fn client_hello(&mut self, frame: &[u8]) -> Result<ClientRole> {
        let (nonce, payload) = split_frame(frame)?;
        check_unassigned(&nonce)?;
        self.session.accept_plaintext(&nonce)?;

        let hello = match Message::from_bytes(payload)? {
            Message::ClientHello(hello) => hello,
            other => {
                return Err(RelayError::Protocol(format!(
                    "expected client-hello, got {}",
                    other.type_name()
                )))
            }
        };
        if hello.role == ClientRole::Initiator && &hello.key != self.path.initiator_key() {
            return Err(RelayError::InvalidKey(
                "initiator key does not match path".to_string(),
            ));
        }
        self.session.derive_shared_secret(&hello.key)?;
        self.role = Some(hello.role);
        debug!("Path {}: client-hello from {}", self.path.short(), hello.role.name());
        Ok(hello.role)
    }

    /// Verify `client-auth`. The state only advances in [`Self::server_auth`],
    /// after the registry has admitted the client.
    pub fn on_client_auth(&mut self, frame: &[u8]) -> Result<ClientAuthenticated> {
        self.expect(HandshakeState::AwaitingClientAuth)?;
        if self.permanent_key.is_some() {
            return self.fail(RelayError::Protocol("duplicate client-auth".to_string()));
        }
        self.guard(|hs| hs.client_auth(frame))
    }

    fn client_auth(&mut self, frame: &[u8]) -> Result<ClientAuthenticated> {
        let (nonce, payload) = split_frame(frame)?;
        check_unassigned(&nonce)?;
        let plaintext = self.session.decrypt(&nonce, payload)?;

        let auth = match Message::from_bytes(&plaintext)? {
            Message::ClientAuth(auth) => auth,
            other => {
                return Err(RelayError::Protocol(format!(
                    "expected client-auth, got {}",
                    other.type_name()
                )))
            }
        };
        if auth.your_cookie != self.session.cookie_out() {
            return Err(RelayError::Protocol("cookie echo mismatch".to_string()));
        }
        let permanent = match auth.your_key {
            Some(key) => self
                .keys
                .find(&key)
                .ok_or_else(|| RelayError::InvalidKey("unknown server key".to_string()))?,
            None => self.keys.primary(),
        };
        let offer = TaskOffer::new(auth.tasks, auth.data)?;

        self.permanent_key = Some(permanent.clone());
        Ok(ClientAuthenticated {
            offer,
            ping_interval: auth
                .ping_interval
                .map(|secs| Duration::from_secs(u64::from(secs))),
        })
    }

    /// Build `server-auth` for the admitted client and move to `Authenticated`
    pub fn server_auth(&mut self, address: Address, summary: PathSummary) -> Result<Vec<u8>> {
        self.expect(HandshakeState::AwaitingClientAuth)?;
        let frame = self.guard(|hs| {
            let permanent = hs
                .permanent_key
                .as_ref()
                .ok_or_else(|| RelayError::Protocol("client-auth not verified".to_string()))?;
            let your_cookie = hs
                .session
                .cookie_in()
                .ok_or_else(|| RelayError::Internal("client cookie unknown".to_string()))?;

            hs.session.set_peer_address(address);
            let nonce = hs.session.next_nonce()?;
            let signed_keys = hs.session.signed_keys(permanent, &nonce)?;
            let (initiator_connected, responders) = match summary {
                PathSummary::Initiator { responders } => (None, Some(responders)),
                PathSummary::Responder { initiator_connected } => (Some(initiator_connected), None),
            };
            let message = Message::ServerAuth(ServerAuth {
                your_cookie,
                signed_keys: Some(signed_keys),
                initiator_connected,
                responders,
            });
            let ciphertext = hs.session.seal(&nonce, &message.to_bytes()?)?;
            Ok(join_frame(&nonce, &ciphertext))
        })?;
        self.advance()?;
        Ok(frame)
    }

    /// First pairing: `Authenticated -> Open`. Returns `false` when already open.
    pub fn open(&mut self) -> Result<bool> {
        match self.state {
            HandshakeState::Open => Ok(false),
            HandshakeState::Authenticated => {
                self.advance()?;
                Ok(true)
            }
            other => self.fail(RelayError::Protocol(format!(
                "cannot open from state {}",
                other.name()
            ))),
        }
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }

    /// Encrypt a relay-originated message towards the client
    pub fn seal_message(&mut self, message: &Message) -> Result<Vec<u8>> {
        if !self.state.is_authenticated() {
            return self.fail(RelayError::Protocol(format!(
                "cannot send {} in state {}",
                message.type_name(),
                self.state.name()
            )));
        }
        self.guard(|hs| {
            let (nonce, ciphertext) = hs.session.encrypt(&message.to_bytes()?)?;
            Ok(join_frame(&nonce, &ciphertext))
        })
    }

    /// Decrypt a client message addressed to the relay after `server-auth`
    pub fn open_message(&mut self, frame: &[u8]) -> Result<Message> {
        if !self.state.is_authenticated() {
            return self.fail(RelayError::Protocol(format!(
                "unexpected message in state {}",
                self.state.name()
            )));
        }
        self.guard(|hs| {
            let (nonce, payload) = split_frame(frame)?;
            if nonce.source != hs.session.peer_address() {
                return Err(RelayError::Protocol(format!(
                    "source {} does not match assigned address {}",
                    nonce.source,
                    hs.session.peer_address()
                )));
            }
            if !nonce.destination.is_server() {
                return Err(RelayError::Protocol("message not addressed to relay".to_string()));
            }
            let plaintext = hs.session.decrypt(&nonce, payload)?;
            Ok(Message::from_bytes(&plaintext)?)
        })
    }

    fn expect(&mut self, state: HandshakeState) -> Result<()> {
        if self.state != state {
            let err = RelayError::Protocol(format!(
                "expected state {}, in {}",
                state.name(),
                self.state.name()
            ));
            return self.fail(err);
        }
        Ok(())
    }

    fn advance(&mut self) -> Result<()> {
        match self.state.next() {
            Some(next) => {
                self.state = next;
                Ok(())
            }
            None => self.fail(RelayError::Internal("no state after closed".to_string())),
        }
    }

    fn guard<T>(&mut self, step: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = step(self);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn fail<T>(&mut self, err: RelayError) -> Result<T> {
        self.close();
        Err(err)
    }
}

/// Handshake frames travel between the relay and a client without an address
fn check_unassigned(nonce: &Nonce) -> Result<()> {
    if !nonce.source.is_server() || !nonce.destination.is_server() {
        return Err(RelayError::Protocol(format!(
            "unexpected handshake addressing {} -> {}",
            nonce.source, nonce.destination
        )));
    }
    Ok(())
}
