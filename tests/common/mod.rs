//! In-memory client harness
//!
//! Each [`Client`] drives one `RelayServer::serve` task over unbounded
//! `futures` channels and speaks the client side of the protocol.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use signalcraft_core::{
    join_frame, split_frame, Address, ClientAuth, ClientHello, ClientRole, CloseCode,
    CombinedSequenceNumber, Cookie, Message, Nonce, PathId, ServerAuth,
};
use signalcraft_crypto::{EncryptionKeypair, PeerSession, ServerKeys};
use signalcraft_relay::{Frame, RelayServer, TransportError};

/// Upper bound on any single wait, so a broken relay fails the test
pub const WAIT: Duration = Duration::from_secs(5);

pub fn relay(config: signalcraft_core::RelayConfig) -> Arc<RelayServer> {
    let keys = ServerKeys::single(EncryptionKeypair::generate());
    Arc::new(RelayServer::new(config, keys).unwrap())
}

pub fn default_relay() -> Arc<RelayServer> {
    relay(Default::default())
}

/// A fresh initiator key and the path it owns
pub fn new_path() -> (EncryptionKeypair, PathId) {
    let keypair = EncryptionKeypair::generate();
    let path = PathId::new(keypair.public_key_bytes());
    (keypair, path)
}

pub struct Client {
    pub keypair: EncryptionKeypair,
    pub session: PeerSession,
    pub relay_cookie: Option<Cookie>,
    pub address: Address,
    to_relay: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_relay: BoxStream<'static, Frame>,
    task: Option<JoinHandle<Option<CloseCode>>>,
}

impl Client {
    pub fn connect(server: &Arc<RelayServer>, path: PathId, keypair: EncryptionKeypair) -> Self {
        let (to_relay, inbound) = mpsc::unbounded();
        let (outbound, from_relay) = mpsc::unbounded();
        let sink = outbound.sink_map_err(|_| TransportError::Closed);
        let task = tokio::spawn(server.clone().serve(path, sink, inbound));
        Self::with_parts(keypair, to_relay, from_relay.boxed(), task)
    }

    /// Like [`Client::connect`], but the relay can only hand one frame to
    /// this client at a time; unread frames stall the relay's writer
    pub fn connect_slow_reader(
        server: &Arc<RelayServer>,
        path: PathId,
        keypair: EncryptionKeypair,
    ) -> Self {
        let (to_relay, inbound) = mpsc::unbounded();
        let (outbound, from_relay) = mpsc::channel(0);
        let sink = outbound.sink_map_err(|_| TransportError::Closed);
        let task = tokio::spawn(server.clone().serve(path, sink, inbound));
        Self::with_parts(keypair, to_relay, from_relay.boxed(), task)
    }

    fn with_parts(
        keypair: EncryptionKeypair,
        to_relay: mpsc::UnboundedSender<Result<Frame, TransportError>>,
        from_relay: BoxStream<'static, Frame>,
        task: JoinHandle<Option<CloseCode>>,
    ) -> Self {
        Self {
            session: PeerSession::new(keypair.clone(), Address::SERVER),
            keypair,
            relay_cookie: None,
            address: Address::SERVER,
            to_relay,
            from_relay,
            task: Some(task),
        }
    }

    /// Run the handshake up to `server-auth`
    pub async fn handshake(&mut self, role: ClientRole, tasks: &[&str]) -> ServerAuth {
        self.read_server_hello().await;
        self.send_client_hello(role);
        self.send_client_auth(tasks);
        self.read_server_auth().await
    }

    pub async fn read_server_hello(&mut self) {
        let frame = self.recv_binary().await;
        let (nonce, payload) = split_frame(&frame).unwrap();
        self.session.accept_plaintext(&nonce).unwrap();
        self.relay_cookie = Some(nonce.cookie);
        match Message::from_bytes(payload).unwrap() {
            Message::ServerHello(hello) => self.session.derive_shared_secret(&hello.key).unwrap(),
            other => panic!("expected server-hello, got {:?}", other),
        }
    }

    /// Returns the nonce the hello went out with
    pub fn send_client_hello(&mut self, role: ClientRole) -> Nonce {
        let message = Message::ClientHello(ClientHello {
            role,
            key: self.keypair.public_key_bytes(),
        });
        let nonce = self.session.next_nonce().unwrap();
        self.send_raw(join_frame(&nonce, &message.to_bytes().unwrap()));
        nonce
    }

    pub fn client_auth(&self, tasks: &[&str]) -> Message {
        let data: Map<String, Value> = tasks
            .iter()
            .map(|task| (task.to_string(), json!({ "offered": task })))
            .collect();
        Message::ClientAuth(ClientAuth {
            your_cookie: self.relay_cookie.unwrap(),
            your_key: None,
            ping_interval: None,
            tasks: tasks.iter().map(|task| task.to_string()).collect(),
            data,
        })
    }

    pub fn send_client_auth(&mut self, tasks: &[&str]) {
        let message = self.client_auth(tasks);
        self.send_message(&message);
    }

    pub async fn read_server_auth(&mut self) -> ServerAuth {
        let (nonce, message) = self.recv_message_with_nonce().await;
        self.address = nonce.destination;
        self.session.set_address(nonce.destination);
        match message {
            Message::ServerAuth(auth) => auth,
            other => panic!("expected server-auth, got {:?}", other),
        }
    }

    pub fn send_message(&mut self, message: &Message) {
        let (nonce, ciphertext) = self
            .session
            .encrypt(&message.to_bytes().unwrap())
            .unwrap();
        self.send_raw(join_frame(&nonce, &ciphertext));
    }

    pub fn send_raw(&self, data: Vec<u8>) {
        let _ = self.to_relay.unbounded_send(Ok(Frame::Binary(data)));
    }

    pub fn send_frame(&self, frame: Frame) {
        let _ = self.to_relay.unbounded_send(Ok(frame));
    }

    /// Next frame from the relay, `None` once the relay closed the sink
    pub async fn try_recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, self.from_relay.next())
            .await
            .expect("timed out waiting for the relay")
    }

    pub async fn recv(&mut self) -> Frame {
        self.try_recv().await.expect("relay hung up")
    }

    pub async fn recv_binary(&mut self) -> Vec<u8> {
        match self.recv().await {
            Frame::Binary(data) => data,
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    pub async fn recv_message_with_nonce(&mut self) -> (Nonce, Message) {
        let frame = self.recv_binary().await;
        let (nonce, payload) = split_frame(&frame).unwrap();
        let plaintext = self.session.decrypt(&nonce, payload).unwrap();
        (nonce, Message::from_bytes(&plaintext).unwrap())
    }

    pub async fn recv_message(&mut self) -> Message {
        self.recv_message_with_nonce().await.1
    }

    /// Skip relay messages until a close frame arrives
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            match self.recv().await {
                Frame::Close(code) => return code,
                Frame::Binary(_) | Frame::Ping(_) => {}
                other => panic!("unexpected frame {:?}", other),
            }
        }
    }

    /// Close from the client side
    pub fn hang_up(&self) {
        let _ = self.to_relay.unbounded_send(Ok(Frame::Close(Some(1000))));
    }

    /// Wait for the relay task to finish
    pub async fn finished(&mut self) -> Option<CloseCode> {
        let task = self.task.take().expect("already awaited");
        tokio::time::timeout(WAIT, task)
            .await
            .expect("connection task did not finish")
            .unwrap()
    }
}

/// Outgoing nonce chain of a client talking to its peer
pub struct PeerChannel {
    cookie: Cookie,
    source: Address,
    destination: Address,
    csn: CombinedSequenceNumber,
}

impl PeerChannel {
    pub fn new(source: Address, destination: Address) -> Self {
        Self {
            cookie: Cookie::random(),
            source,
            destination,
            csn: CombinedSequenceNumber::random_initial(),
        }
    }

    pub fn starting_at(source: Address, destination: Address, csn: u64) -> Self {
        Self {
            csn: CombinedSequenceNumber::new(csn).unwrap(),
            ..Self::new(source, destination)
        }
    }

    /// Next frame on the chain, payload opaque to the relay
    pub fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        let nonce = Nonce::new(self.cookie, self.source, self.destination, self.csn);
        self.csn = self.csn.next().unwrap();
        join_frame(&nonce, payload)
    }
}

/// Initiator and responder, both authenticated and paired on a new path
pub async fn paired(server: &Arc<RelayServer>, task: &str) -> (Client, Client, PathId) {
    let (initiator_key, path) = new_path();
    let mut initiator = Client::connect(server, path, initiator_key);
    initiator.handshake(ClientRole::Initiator, &[task]).await;

    let mut responder = Client::connect(server, path, EncryptionKeypair::generate());
    responder.handshake(ClientRole::Responder, &[task]).await;

    match initiator.recv_message().await {
        Message::NewResponder(notice) => assert_eq!(notice.task.as_deref(), Some(task)),
        other => panic!("expected new-responder, got {:?}", other),
    }
    match responder.recv_message().await {
        Message::NewInitiator(notice) => assert_eq!(notice.task.as_deref(), Some(task)),
        other => panic!("expected new-initiator, got {:?}", other),
    }
    (initiator, responder, path)
}
