//! WebSocket accept loop

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use signalcraft_core::PathId;
use signalcraft_relay::RelayServer;

use crate::websocket::split_socket;
use crate::{DaemonError, Result};

/// How long shutdown waits for connections to send their close frames
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct RelayDaemon {
    listener: TcpListener,
    relay: Arc<RelayServer>,
}

impl RelayDaemon {
    pub async fn bind(addr: &str, relay: Arc<RelayServer>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> &Arc<RelayServer> {
        &self.relay
    }

    /// Accept connections until `shutdown` resolves, then close every live
    /// connection with `GoingAway` and wait for them to finish
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Relay listening on {}", self.local_addr()?);
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let relay = self.relay.clone();
                            connections.spawn(async move {
                                if let Err(e) = handle_socket(stream, peer, relay).await {
                                    debug!("Connection from {} rejected: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = &mut shutdown => {
                    break;
                }
            }
        }

        drop(self.listener);
        self.relay.shutdown();
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("{} connections did not close in time", connections.len());
            connections.shutdown().await;
        }
        info!("Relay stopped");
        Ok(())
    }
}

/// Transport limits matching the relay's frame bound
fn websocket_config(relay: &RelayServer) -> WebSocketConfig {
    let limit = relay.config().max_frame_size;
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limit);
    config.max_frame_size = Some(limit);
    config
}

fn reject(status: StatusCode, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = status;
    response
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    relay: Arc<RelayServer>,
) -> Result<()> {
    let mut path = None;
    let callback = |request: &Request, response: Response| {
        match PathId::from_url_path(request.uri().path()) {
            Ok(id) => {
                path = Some(id);
                Ok(response)
            }
            Err(e) => Err(reject(StatusCode::BAD_REQUEST, e.to_string())),
        }
    };
    let config = websocket_config(&relay);
    let socket = accept_hdr_async_with_config(stream, callback, Some(config))
        .await
        .map_err(|e| DaemonError::Handshake(e.to_string()))?;
    let path = path.ok_or_else(|| DaemonError::InvalidPath("missing path".to_string()))?;

    debug!("WebSocket from {} on path {}", peer, path.short());
    let (sink, stream) = split_socket(socket);
    relay.serve(path, sink, stream).await;
    Ok(())
}
