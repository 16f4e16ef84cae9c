//! Core application state.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::net::{
    DeviceIdentity, DiscoveredPeer, Discovery, Endpoint, Hooks, PeerEvent, TransferDirection,
    TransferError, TransferEvent, TransferEventKind, TransferHandle, TransferId, TransferManager,
    TransferProgress,
};

/// Default capacity for received files collection.
const DEFAULT_RECEIVED_FILES_CAPACITY: usize = 16;

/// A file this node finished receiving.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: Arc<str>,
    pub peer_id: Arc<str>,
    pub size: u64,
    pub received_at: Instant,
}

impl ReceivedFile {
    /// Returns the age of the received file.
    #[inline]
    #[must_use]
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// A running node: sockets, discovery and the transfer manager.
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    endpoint: Endpoint,
    discovery: Arc<Discovery>,
    manager: TransferManager,
    received: Arc<RwLock<Vec<ReceivedFile>>>,
    /// Shutdown signal for graceful termination.
    shutdown: CancellationToken,
}

impl AppState {
    /// Starts a node with the persisted device identity.
    pub async fn start(config: Config, hooks: Option<Hooks>) -> Result<Self> {
        let identity = DeviceIdentity::load_or_create(config.device_name.clone())
            .await
            .context("loading device identity")?;
        Self::start_with_identity(config, identity, hooks).await
    }

    /// Starts a node: binds both sockets, starts discovery and begins
    /// accepting transfers. Without `hooks`, every transfer is accepted
    /// into the configured download directory.
    #[instrument(skip_all, fields(device_id = %identity.device_id))]
    pub async fn start_with_identity(
        config: Config,
        identity: DeviceIdentity,
        hooks: Option<Hooks>,
    ) -> Result<Self> {
        info!("Initializing networking...");

        let endpoint = Endpoint::bind(identity.clone(), &config.net)
            .await
            .context("binding discovery and transfer sockets")?;
        let listener = endpoint
            .take_listener()
            .context("transfer listener already taken")?;

        let discovery = Arc::new(Discovery::new(&endpoint, config.discovery, &config.net));
        discovery.start().context("starting discovery")?;

        let hooks = hooks.unwrap_or_else(|| Hooks::auto_accept(config.transfer.download_dir.clone()));
        let manager = TransferManager::new(identity, config.transfer, discovery.clone(), hooks);

        let state = Self {
            inner: Arc::new(AppStateInner {
                endpoint,
                discovery,
                manager,
                received: Arc::new(RwLock::new(Vec::with_capacity(
                    DEFAULT_RECEIVED_FILES_CAPACITY,
                ))),
                shutdown: CancellationToken::new(),
            }),
        };

        {
            let manager = state.inner.manager.clone();
            tokio::spawn(async move { manager.accept_loop(listener).await });
        }
        state.spawn_received_tracker();

        info!(
            discovery = %state.discovery_addr(),
            transfer = %state.transfer_addr(),
            "Networking initialized successfully"
        );
        Ok(state)
    }

    /// Records completed incoming transfers until shutdown.
    fn spawn_received_tracker(&self) {
        let mut events = self.inner.manager.subscribe();
        let received = self.inner.received.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut incoming = HashMap::new();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => record_received(&mut incoming, &received, event),
                        None => break,
                    },
                }
            }
            debug!("Received-file tracker stopped");
        });
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.inner.endpoint.identity()
    }

    pub fn device_id(&self) -> &str {
        self.inner.endpoint.device_id()
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.inner.endpoint.discovery_addr()
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.inner.endpoint.transfer_addr()
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.inner.discovery
    }

    pub fn transfer_manager(&self) -> &TransferManager {
        &self.inner.manager
    }

    /// Currently known peers.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.inner.discovery.peers()
    }

    pub fn subscribe_peers(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.inner.discovery.subscribe()
    }

    pub fn subscribe_transfers(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.inner.manager.subscribe()
    }

    pub async fn wait_for_peer(&self, device_id: &str, timeout: Duration) -> Option<DiscoveredPeer> {
        self.inner.discovery.wait_for_peer(device_id, timeout).await
    }

    /// Starts one send session per file.
    pub async fn send_files(
        &self,
        peer_id: &str,
        paths: &[PathBuf],
    ) -> Result<Vec<TransferHandle>, TransferError> {
        self.inner.manager.request_send(peer_id, paths).await
    }

    /// Sends `paths` to `peer_id` and waits until every session has ended.
    /// Returns the final progress of each.
    pub async fn send_and_wait(
        &self,
        peer_id: &str,
        paths: &[PathBuf],
    ) -> Result<Vec<TransferProgress>, TransferError> {
        let mut events = self.subscribe_transfers();
        let handles = self.send_files(peer_id, paths).await?;

        let mut pending: HashSet<_> = handles
            .iter()
            .filter(|h| !h.state().is_terminal())
            .map(TransferHandle::id)
            .collect();

        while !pending.is_empty() {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) if event.kind.is_terminal() => {
                        pending.remove(&event.id);
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }

        Ok(handles.iter().map(TransferHandle::progress).collect())
    }

    /// Files received since the node started, oldest first.
    pub fn received_files(&self) -> Vec<ReceivedFile> {
        self.inner.received.read().clone()
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.manager.config().download_dir
    }

    /// Stops discovery, cancels every transfer and stops accepting new ones.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down");
        self.inner.shutdown.cancel();
        self.inner.discovery.stop();
        self.inner.manager.shutdown();
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once [`AppState::shutdown`] has been called.
    pub async fn cancelled(&self) {
        self.inner.shutdown.cancelled().await
    }
}

fn record_received(
    incoming: &mut HashMap<TransferId, ReceivedFile>,
    received: &RwLock<Vec<ReceivedFile>>,
    event: TransferEvent,
) {
    match event.kind {
        TransferEventKind::Requested {
            direction: TransferDirection::Receive,
            peer_id,
            file_name,
            size,
        } => {
            incoming.insert(
                event.id,
                ReceivedFile {
                    name: file_name,
                    peer_id,
                    size,
                    received_at: Instant::now(),
                },
            );
        }
        TransferEventKind::Completed => {
            if let Some(mut file) = incoming.remove(&event.id) {
                info!(name = %file.name, size = file.size, "Received file");
                file.received_at = Instant::now();
                received.write().push(file);
            }
        }
        kind if kind.is_terminal() => {
            incoming.remove(&event.id);
        }
        _ => {}
    }
}
