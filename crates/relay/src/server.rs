//! Relay server context shared by all connection tasks

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{Sink, Stream};
use tokio::sync::watch;
use tracing::info;

use signalcraft_core::{CloseCode, PathId, RelayConfig, TaskSelector};
use signalcraft_crypto::ServerKeys;

use crate::connection::Connection;
use crate::registry::{ConnectionId, PathRegistry};
use crate::transport::{Frame, TransportError};
use crate::Result;

pub struct RelayServer {
    config: RelayConfig,
    keys: Arc<ServerKeys>,
    registry: PathRegistry,
    next_id: AtomicU64,
    active: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    /// Build a server using the task policy named in `config`
    pub fn new(config: RelayConfig, keys: ServerKeys) -> Result<Self> {
        let selector: Arc<dyn TaskSelector> = Arc::from(config.task_policy.selector());
        Self::with_selector(config, keys, selector)
    }

    /// Build a server with a custom task selector
    pub fn with_selector(
        config: RelayConfig,
        keys: ServerKeys,
        selector: Arc<dyn TaskSelector>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = PathRegistry::new(selector, config.max_responders);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            keys: Arc::new(keys),
            registry,
            next_id: AtomicU64::new(1),
            active: AtomicUsize::new(0),
            shutdown,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn keys(&self) -> Arc<ServerKeys> {
        self.keys.clone()
    }

    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Connection tasks currently running
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Close every connection with `GoingAway`
    pub fn shutdown(&self) {
        info!(
            "Shutting down relay ({} connections)",
            self.active_connections()
        );
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Serve one client connection on `path` until it closes.
    ///
    /// Returns the close code sent to the client, or `None` when the client
    /// went away first.
    pub async fn serve<Si, St>(self: Arc<Self>, path: PathId, sink: Si, stream: St) -> Option<CloseCode>
    where
        Si: Sink<Frame, Error = TransportError> + Unpin,
        St: Stream<Item = std::result::Result<Frame, TransportError>> + Unpin,
    {
        let id: ConnectionId = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _active = ActiveGuard::new(&self.active);
        Connection::new(self.clone(), id, path, sink, stream)
            .run()
            .await
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
