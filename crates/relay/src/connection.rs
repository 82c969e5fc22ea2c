//! Per-connection task
//!
//! One task per client. It owns the handshake, the relay channel and the
//! timers, and waits on four sources in priority order: drop requests from
//! the registry, inbound frames, queued events, and the next timer deadline.
//! Whatever ends the task, the connection leaves the registry before the
//! close frame is sent. A client that stops reading cannot pin the task:
//! every write still yields to drop requests, shutdown and a stall bound.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use signalcraft_core::{
    split_frame, Address, ClientRole, CloseCode, Disconnected, DropResponder, Message, Nonce,
    PathId, SendError,
};

use crate::handshake::{Handshake, HandshakeState, PathSummary};
use crate::registry::{ClientHandle, ConnectionId, DeliveryError, Event};
use crate::relay::{RelayChannel, Route};
use crate::server::RelayServer;
use crate::supervisor::{Supervisor, Tick};
use crate::transport::{Frame, TransportError};
use crate::{RelayError, Result};

/// Upper bound on writing the close frame to a stalled client
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How the task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Close(CloseCode),
    /// The client closed or the transport failed; nothing left to send
    PeerGone,
}

enum Flow {
    Continue,
    Exit(Exit),
}

pub(crate) struct Connection<Si, St> {
    server: Arc<RelayServer>,
    id: ConnectionId,
    handshake: Handshake,
    supervisor: Supervisor,
    channel: RelayChannel,
    handle: ClientHandle,
    events: mpsc::Receiver<Event>,
    control: mpsc::UnboundedReceiver<CloseCode>,
    shutdown: watch::Receiver<bool>,
    /// Address held in the registry, until released
    registered: Option<Address>,
    pings_sent: u64,
    sink: Si,
    stream: St,
}

impl<Si, St> Connection<Si, St>
where
    Si: Sink<Frame, Error = TransportError> + Unpin,
    St: Stream<Item = std::result::Result<Frame, TransportError>> + Unpin,
{
    pub(crate) fn new(
        server: Arc<RelayServer>,
        id: ConnectionId,
        path: PathId,
        sink: Si,
        stream: St,
    ) -> Self {
        let config = server.config();
        let (events_tx, events) = mpsc::channel(config.outbound_queue);
        let (control_tx, control) = mpsc::unbounded_channel();
        let handshake = Handshake::new(path, server.keys());
        let supervisor = Supervisor::new(Instant::now(), config);
        let shutdown = server.subscribe_shutdown();
        Self {
            id,
            handshake,
            supervisor,
            channel: RelayChannel::new(Address::SERVER),
            handle: ClientHandle::new(id, events_tx, control_tx),
            events,
            control,
            shutdown,
            registered: None,
            pings_sent: 0,
            sink,
            stream,
            server,
        }
    }

    /// Drive the connection to completion. Returns the close code sent.
    pub(crate) async fn run(mut self) -> Option<CloseCode> {
        info!(
            "Connection {} opened on path {}",
            self.id,
            self.handshake.path().short()
        );
        let stopping = *self.shutdown.borrow();
        let exit = if stopping {
            Exit::Close(CloseCode::GoingAway)
        } else {
            match self.start().await {
                Ok(()) => self.event_loop().await,
                Err(e) => Exit::Close(self.fail(e)),
            }
        };
        self.teardown(exit).await
    }

    async fn start(&mut self) -> Result<()> {
        let hello = self.handshake.server_hello()?;
        self.send(Frame::Binary(hello)).await
    }

    async fn event_loop(&mut self) -> Exit {
        loop {
            let deadline = self.supervisor.next_deadline();
            let step = tokio::select! {
                biased;

                Some(code) = self.control.recv() => {
                    self.flush_events().await;
                    Ok(Flow::Exit(Exit::Close(code)))
                }

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        Ok(Flow::Exit(Exit::Close(CloseCode::GoingAway)))
                    } else {
                        Ok(Flow::Continue)
                    }
                }

                frame = self.stream.next() => match frame {
                    Some(Ok(frame)) => self.on_frame(frame).await,
                    Some(Err(e @ TransportError::TooLarge(_))) => Err(e.into()),
                    Some(Err(e)) => {
                        debug!("Connection {}: transport error: {}", self.id, e);
                        Ok(Flow::Exit(Exit::PeerGone))
                    }
                    None => Ok(Flow::Exit(Exit::PeerGone)),
                },

                Some(event) = self.events.recv() => self.on_event(event).await,

                _ = tokio::time::sleep_until(deadline) => self.on_timer().await,
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit(exit)) => return exit,
                Err(e) => return Exit::Close(self.fail(e)),
            }
        }
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<Flow> {
        match frame {
            Frame::Binary(data) => {
                let limit = self.server.config().max_frame_size;
                if data.len() > limit {
                    return Err(RelayError::Protocol(format!(
                        "frame of {} bytes exceeds limit of {}",
                        data.len(),
                        limit
                    )));
                }
                self.on_binary(data).await
            }
            Frame::Text(_) => Err(RelayError::Protocol("text frames are not supported".to_string())),
            // Answered by the transport
            Frame::Ping(_) => Ok(Flow::Continue),
            Frame::Pong(_) => {
                self.supervisor.pong_received();
                Ok(Flow::Continue)
            }
            Frame::Close(code) => {
                debug!("Connection {}: client closed with {:?}", self.id, code);
                Ok(Flow::Exit(Exit::PeerGone))
            }
        }
    }

    async fn on_binary(&mut self, data: Vec<u8>) -> Result<Flow> {
        match self.handshake.state() {
            HandshakeState::AwaitingClientHello => {
                self.handshake.on_client_hello(&data)?;
                Ok(Flow::Continue)
            }
            HandshakeState::AwaitingClientAuth => self.authenticate(&data).await,
            HandshakeState::Authenticated | HandshakeState::Open => {
                let (nonce, _) = split_frame(&data)?;
                if nonce.destination.is_server() {
                    let message = self.handshake.open_message(&data)?;
                    self.on_message(message).await
                } else {
                    self.forward(nonce, data).await
                }
            }
            HandshakeState::Closed => Err(RelayError::Protocol("connection closed".to_string())),
        }
    }

    async fn authenticate(&mut self, data: &[u8]) -> Result<Flow> {
        let auth = self.handshake.on_client_auth(data)?;
        let role = self
            .handshake
            .role()
            .ok_or_else(|| RelayError::Internal("role unknown after client-hello".to_string()))?;
        if let Some(interval) = auth.ping_interval {
            if !self.supervisor.set_ping_interval(Instant::now(), interval) {
                debug!(
                    "Connection {}: ignoring ping interval of {:?}",
                    self.id, interval
                );
            }
        }

        let path = *self.handshake.path();
        let registry = self.server.registry();
        let (address, summary) = match role {
            ClientRole::Initiator => {
                let admission =
                    registry.register_initiator(&path, self.handle.clone(), auth.offer);
                (
                    Address::INITIATOR,
                    PathSummary::Initiator {
                        responders: admission.responders,
                    },
                )
            }
            ClientRole::Responder => {
                let admission =
                    registry.enqueue_responder(&path, self.handle.clone(), auth.offer)?;
                (
                    admission.address,
                    PathSummary::Responder {
                        initiator_connected: admission.initiator_connected,
                    },
                )
            }
        };
        self.registered = Some(address);
        self.channel = RelayChannel::new(address);

        let frame = self.handshake.server_auth(address, summary)?;
        self.send(Frame::Binary(frame)).await?;
        info!(
            "Connection {}: {} authenticated as {} on path {}",
            self.id,
            role.name(),
            address,
            path.short()
        );
        Ok(Flow::Continue)
    }

    async fn on_message(&mut self, message: Message) -> Result<Flow> {
        match message {
            Message::DropResponder(request)
                if self.handshake.role() == Some(ClientRole::Initiator) =>
            {
                self.drop_responder(request);
                Ok(Flow::Continue)
            }
            other => Err(RelayError::Protocol(format!(
                "unexpected {} from client",
                other.type_name()
            ))),
        }
    }

    fn drop_responder(&mut self, request: DropResponder) {
        let code = match request.reason {
            None => Some(CloseCode::DropByInitiator),
            Some(reason) => CloseCode::from_u16(reason).filter(CloseCode::is_valid_drop_reason),
        };
        match code {
            Some(code) if request.id.is_responder() => {
                let path = *self.handshake.path();
                if !self
                    .server
                    .registry()
                    .drop_responder(&path, self.id, request.id, code)
                {
                    debug!(
                        "Connection {}: drop-responder for unknown {}",
                        self.id, request.id
                    );
                }
            }
            _ => warn!(
                "Connection {}: ignoring invalid drop-responder for {} ({:?})",
                self.id, request.id, request.reason
            ),
        }
    }

    async fn forward(&mut self, nonce: Nonce, data: Vec<u8>) -> Result<Flow> {
        if self.handshake.state() != HandshakeState::Open {
            return Err(RelayError::Protocol(
                "relayed frame before pairing".to_string(),
            ));
        }
        let destination = match self.channel.inspect(&nonce)? {
            Route::Peer(destination) => destination,
            Route::Unpaired => return self.send_error(&nonce).await,
        };

        let path = *self.handshake.path();
        let registry = self.server.registry();
        let peer = registry.peer_of(
            &path,
            self.id,
            self.handshake.address(),
            self.channel.generation(),
        );
        match peer {
            Some((address, peer)) if address == destination => {
                match peer.deliver(Event::Relay(data)) {
                    Ok(()) => Ok(Flow::Continue),
                    Err(e) => {
                        debug!(
                            "Connection {}: relay to {} failed: {:?}",
                            self.id, destination, e
                        );
                        if e == DeliveryError::Full {
                            // Unpair now; the stalled task may not wake for a while
                            registry.release(&path, peer.id(), destination);
                        }
                        self.send_error(&nonce).await
                    }
                }
            }
            _ => self.send_error(&nonce).await,
        }
    }

    async fn send_error(&mut self, nonce: &Nonce) -> Result<Flow> {
        let message = Message::SendError(SendError {
            id: nonce.message_id(),
        });
        self.notify(&message).await
    }

    async fn on_event(&mut self, event: Event) -> Result<Flow> {
        match event {
            Event::Notify(message) => self.notify(&message).await,
            Event::Paired {
                peer,
                generation,
                notice,
            } => {
                self.channel.pair(peer, generation);
                if self.handshake.open()? {
                    self.supervisor.handshake_complete();
                }
                self.notify(&notice).await
            }
            Event::PeerLeft(address) => {
                self.channel.unpair(address);
                let message = Message::Disconnected(Disconnected { id: address });
                self.notify(&message).await
            }
            Event::Relay(frame) => {
                self.send(Frame::Binary(frame)).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn on_timer(&mut self) -> Result<Flow> {
        match self.supervisor.poll(Instant::now()) {
            Some(Tick::HandshakeExpired) => {
                debug!(
                    "Connection {}: handshake deadline in state {}",
                    self.id,
                    self.handshake.state().name()
                );
                Err(RelayError::Timeout)
            }
            Some(Tick::PongMissing) => {
                debug!("Connection {}: no pong", self.id);
                Err(RelayError::Timeout)
            }
            Some(Tick::SendPing) => {
                self.pings_sent += 1;
                let payload = self.pings_sent.to_be_bytes().to_vec();
                self.send(Frame::Ping(payload)).await?;
                Ok(Flow::Continue)
            }
            None => Ok(Flow::Continue),
        }
    }

    async fn notify(&mut self, message: &Message) -> Result<Flow> {
        debug!("Connection {}: sending {}", self.id, message.type_name());
        let frame = self.handshake.seal_message(message)?;
        self.send(Frame::Binary(frame)).await?;
        Ok(Flow::Continue)
    }

    /// Write one frame. A client that accepts nothing for a whole pong
    /// timeout is treated as gone.
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let stall = self.server.config().pong_timeout;
        tokio::select! {
            biased;

            written = self.sink.send(frame) => {
                written?;
                Ok(())
            }

            Some(code) = self.control.recv() => Err(RelayError::Dropped(code)),

            Ok(()) = self.shutdown.changed() => Err(RelayError::Dropped(CloseCode::GoingAway)),

            _ = tokio::time::sleep(stall) => {
                debug!("Connection {}: write stalled for {:?}", self.id, stall);
                Err(RelayError::Timeout)
            }
        }
    }

    /// Deliver everything queued before a drop request
    async fn flush_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Err(e) = self.on_event(event).await {
                debug!("Connection {}: flush stopped: {}", self.id, e);
                break;
            }
        }
    }

    fn fail(&self, err: RelayError) -> CloseCode {
        let code = err.close_code();
        warn!(
            "Connection {} on path {}: {} (closing with {})",
            self.id,
            self.handshake.path().short(),
            err,
            code
        );
        code
    }

    async fn teardown(mut self, exit: Exit) -> Option<CloseCode> {
        self.handshake.close();
        self.release();
        let sent = match exit {
            Exit::Close(code) => Some(code),
            Exit::PeerGone => None,
        };
        let id = self.id;
        let sink = &mut self.sink;
        let closing = async move {
            if let Some(code) = sent {
                if let Err(e) = sink.send(Frame::Close(Some(code.as_u16()))).await {
                    debug!("Connection {}: close frame not sent: {}", id, e);
                }
            }
            let _ = sink.close().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, closing).await.is_err() {
            debug!("Connection {}: client stalled while closing", id);
        }
        info!("Connection {} closed ({:?})", self.id, sent);
        sent
    }
}

impl<Si, St> Connection<Si, St> {
    fn release(&mut self) {
        if let Some(address) = self.registered.take() {
            let path = *self.handshake.path();
            self.server.registry().release(&path, self.id, address);
        }
    }
}

impl<Si, St> Drop for Connection<Si, St> {
    fn drop(&mut self) {
        // Task cancelled mid-flight
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::channel::mpsc as channel;
    use signalcraft_core::{join_frame, RelayConfig};
    use signalcraft_crypto::{EncryptionKeypair, ServerKeys};

    use super::*;
    use crate::handshake::tests::TestClient;

    struct Wire {
        to_relay: channel::UnboundedSender<std::result::Result<Frame, TransportError>>,
        from_relay: channel::UnboundedReceiver<Frame>,
    }

    impl Wire {
        async fn recv(&mut self) -> Frame {
            self.from_relay.next().await.expect("relay hung up")
        }

        async fn recv_binary(&mut self) -> Vec<u8> {
            match self.recv().await {
                Frame::Binary(data) => data,
                other => panic!("expected binary frame, got {:?}", other),
            }
        }

        fn send(&self, data: Vec<u8>) {
            self.to_relay.unbounded_send(Ok(Frame::Binary(data))).unwrap();
        }
    }

    fn server(config: RelayConfig) -> Arc<RelayServer> {
        let keys = ServerKeys::single(EncryptionKeypair::generate());
        Arc::new(RelayServer::new(config, keys).unwrap())
    }

    fn connect(
        server: &Arc<RelayServer>,
        path: PathId,
    ) -> (Wire, tokio::task::JoinHandle<Option<CloseCode>>) {
        let (to_relay, inbound) = channel::unbounded();
        let (outbound, from_relay) = channel::unbounded();
        let sink = outbound.sink_map_err(|_| TransportError::Closed);
        let task = tokio::spawn(server.clone().serve(path, sink, inbound));
        (Wire { to_relay, from_relay }, task)
    }

    async fn authenticate(
        wire: &mut Wire,
        client: &mut TestClient,
        role: ClientRole,
        tasks: &[&str],
    ) -> Message {
        client.read_server_hello(&wire.recv_binary().await);
        wire.send(client.client_hello(role));
        wire.send(client.client_auth(tasks));
        let (nonce, message) = client.decrypt(&wire.recv_binary().await);
        client.session.set_address(nonce.destination);
        message
    }

    #[tokio::test]
    async fn test_initiator_handshake_over_task() {
        let server = server(RelayConfig::default());
        let keypair = EncryptionKeypair::generate();
        let path = PathId::new(keypair.public_key_bytes());
        let (mut wire, _task) = connect(&server, path);
        let mut client = TestClient::new(keypair);

        let message = authenticate(&mut wire, &mut client, ClientRole::Initiator, &["t"]).await;
        assert!(matches!(message, Message::ServerAuth(_)));
        assert_eq!(server.registry().connection_count(), 1);
    }

    #[tokio::test]
    async fn test_pairing_and_relay() {
        let server = server(RelayConfig::default());
        let initiator_key = EncryptionKeypair::generate();
        let path = PathId::new(initiator_key.public_key_bytes());

        let (mut i_wire, _i_task) = connect(&server, path);
        let mut initiator = TestClient::new(initiator_key);
        authenticate(&mut i_wire, &mut initiator, ClientRole::Initiator, &["t"]).await;

        let (mut r_wire, _r_task) = connect(&server, path);
        let mut responder = TestClient::new(EncryptionKeypair::generate());
        authenticate(&mut r_wire, &mut responder, ClientRole::Responder, &["t"]).await;

        let (_, notice) = initiator.decrypt(&i_wire.recv_binary().await);
        assert!(matches!(notice, Message::NewResponder(ref n) if n.task.as_deref() == Some("t")));
        let (_, notice) = responder.decrypt(&r_wire.recv_binary().await);
        assert!(matches!(notice, Message::NewInitiator(ref n) if n.task.as_deref() == Some("t")));

        let nonce = Nonce::new(
            signalcraft_core::Cookie::random(),
            Address(0x02),
            Address::INITIATOR,
            signalcraft_core::CombinedSequenceNumber::from_parts(0, 1),
        );
        let frame = join_frame(&nonce, b"opaque task payload");
        r_wire.send(frame.clone());
        assert_eq!(i_wire.recv_binary().await, frame);
    }

    #[tokio::test]
    async fn test_peer_close_releases_registry() {
        let server = server(RelayConfig::default());
        let keypair = EncryptionKeypair::generate();
        let path = PathId::new(keypair.public_key_bytes());
        let (mut wire, task) = connect(&server, path);
        let mut client = TestClient::new(keypair);
        authenticate(&mut wire, &mut client, ClientRole::Initiator, &["t"]).await;

        wire.to_relay.unbounded_send(Ok(Frame::Close(Some(1000)))).unwrap();
        assert_eq!(task.await.unwrap(), None);
        assert_eq!(server.registry().path_count(), 0);
    }

    // ==================== NEGATIVE TESTS ====================

    #[tokio::test]
    async fn test_text_frame_is_protocol_error() {
        let server = server(RelayConfig::default());
        let (mut wire, task) = connect(&server, PathId::new([1; 32]));
        wire.recv_binary().await;
        wire.to_relay
            .unbounded_send(Ok(Frame::Text("hello".to_string())))
            .unwrap();
        assert_eq!(
            wire.recv().await,
            Frame::Close(Some(CloseCode::ProtocolError.as_u16()))
        );
        assert_eq!(task.await.unwrap(), Some(CloseCode::ProtocolError));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_protocol_error() {
        let config = RelayConfig {
            max_frame_size: 64,
            ..Default::default()
        };
        let server = server(config);
        let (mut wire, task) = connect(&server, PathId::new([1; 32]));
        wire.recv_binary().await;
        wire.send(vec![0u8; 65]);
        assert_eq!(task.await.unwrap(), Some(CloseCode::ProtocolError));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let config = RelayConfig {
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let server = server(config);
        let (mut wire, task) = connect(&server, PathId::new([1; 32]));
        wire.recv_binary().await;
        assert_eq!(
            wire.recv().await,
            Frame::Close(Some(CloseCode::Timeout.as_u16()))
        );
        assert_eq!(task.await.unwrap(), Some(CloseCode::Timeout));
    }

    #[tokio::test]
    async fn test_responder_cannot_drop() {
        let server = server(RelayConfig::default());
        let initiator_key = EncryptionKeypair::generate();
        let path = PathId::new(initiator_key.public_key_bytes());
        let (mut wire, task) = connect(&server, path);
        let mut responder = TestClient::new(EncryptionKeypair::generate());
        authenticate(&mut wire, &mut responder, ClientRole::Responder, &["t"]).await;

        let request = Message::DropResponder(DropResponder {
            id: Address(0x03),
            reason: None,
        });
        wire.send(responder.encrypt(&request));
        assert_eq!(task.await.unwrap(), Some(CloseCode::ProtocolError));
        assert_eq!(server.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_with_going_away() {
        let server = server(RelayConfig::default());
        let (mut wire, task) = connect(&server, PathId::new([1; 32]));
        wire.recv_binary().await;
        server.shutdown();
        assert_eq!(
            wire.recv().await,
            Frame::Close(Some(CloseCode::GoingAway.as_u16()))
        );
        assert_eq!(task.await.unwrap(), Some(CloseCode::GoingAway));
    }
}
