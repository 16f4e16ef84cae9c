//! Transfer manager: admission control and lifecycle fan-out.
//!
//! Every file moves in its own session over its own TCP connection. The
//! manager resolves peers through discovery, refuses duplicate
//! `(peer, direction, file)` sessions, bounds how many sessions run at once
//! in each direction (excess sessions wait in FIFO order for a slot) and
//! publishes every lifecycle transition to subscribers. Finished sessions
//! stay visible for `finished_retention`, then drop out of the table.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::codec::{ErrorCode, Message};
use super::discovery::Discovery;
use super::endpoint::DeviceIdentity;
use super::error::TransferError;
use super::events::EventBus;
use super::hooks::Hooks;
use super::receiver::run_receiver;
use super::resume::ResumeLedger;
use super::sender::{run_sender, SendJob};
use super::session::{
    until_cancelled, Link, Outcome, PeerRef, Reporter, Session, SessionCommand, SessionState,
    TransferDirection,
};

/// Unique identifier for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u64);

impl TransferId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw u64 value of this transfer ID
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.0)
    }
}

/// Progress information for a transfer
#[derive(Debug, Clone)]
pub struct TransferProgress {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub peer_id: Arc<str>,
    pub file_name: Arc<str>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub state: SessionState,
    pub started_at: Instant,
    pub speed_bps: u64,
    /// Offset this session resumed from; zero for a fresh transfer.
    pub resumed_from: u64,
    /// Why the session failed, once it has.
    pub error: Option<TransferError>,
}

impl TransferProgress {
    pub(crate) fn new(
        transfer_id: TransferId,
        direction: TransferDirection,
        peer_id: Arc<str>,
        file_name: Arc<str>,
        total_bytes: u64,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            peer_id,
            file_name,
            total_bytes,
            transferred_bytes: 0,
            state: SessionState::Idle,
            started_at: Instant::now(),
            speed_bps: 0,
            resumed_from: 0,
            error: None,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = (self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0;
        pct.min(100.0) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Calculates ETA in seconds based on current speed
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.speed_bps == 0 || self.transferred_bytes >= self.total_bytes {
            return None;
        }
        let remaining = self.total_bytes - self.transferred_bytes;
        Some(remaining / self.speed_bps)
    }
}

/// One lifecycle event of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub id: TransferId,
    pub kind: TransferEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEventKind {
    Requested {
        direction: TransferDirection,
        peer_id: Arc<str>,
        file_name: Arc<str>,
        size: u64,
    },
    Accepted,
    Rejected {
        reason: Arc<str>,
    },
    Progress {
        bytes_done: u64,
        total: u64,
    },
    Paused,
    Resumed,
    Completed,
    Failed {
        reason: TransferError,
    },
    Cancelled,
}

impl TransferEventKind {
    /// True for the single event that closes a session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Default chunk size: 1 MiB
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Default progress batch interval in milliseconds
const DEFAULT_PROGRESS_BATCH_MS: u64 = 100;

/// Configuration for transfer manager
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u32,
    /// Chunks the sender may have in flight before it waits for an ACK.
    pub ack_window: usize,
    /// Sessions that may run at once per direction. Sends and receives
    /// draw from separate pools so two peers sending to each other never
    /// wait on one another.
    pub max_concurrent_sessions: usize,
    /// How long a sender waits for the receiver's decision.
    pub request_timeout: Duration,
    /// Bound on every socket write and on waiting for the next frame.
    pub io_timeout: Duration,
    pub ack_timeout: Duration,
    /// How long a final CANCEL or ERROR may take before the socket is closed.
    pub cancel_grace: Duration,
    /// Minimum spacing between progress events of one session.
    pub progress_interval: Duration,
    /// How long a finished session stays queryable by id.
    pub finished_retention: Duration,
    pub download_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_window: 4,
            max_concurrent_sessions: 4,
            request_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_BATCH_MS),
            finished_retention: Duration::from_secs(60),
            download_dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lanshare")
}

/// A handle to a transfer, queued, running or finished.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: TransferId,
    commands: mpsc::UnboundedSender<SessionCommand>,
    progress: Arc<RwLock<TransferProgress>>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Returns false once the session is gone.
    pub fn pause(&self) -> bool {
        self.command(SessionCommand::Pause)
    }

    pub fn resume(&self) -> bool {
        self.command(SessionCommand::Resume)
    }

    pub fn cancel(&self) -> bool {
        self.command(SessionCommand::Cancel)
    }

    /// Current snapshot of the session's progress.
    pub fn progress(&self) -> TransferProgress {
        self.progress.read().clone()
    }

    pub fn state(&self) -> SessionState {
        self.progress.read().state
    }

    fn command(&self, cmd: SessionCommand) -> bool {
        !self.state().is_terminal() && self.commands.send(cmd).is_ok()
    }
}

/// What a session needs from the manager once it runs.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) config: Arc<TransferConfig>,
    pub(crate) identity: DeviceIdentity,
    pub(crate) hooks: Hooks,
    pub(crate) ledger: Arc<ResumeLedger>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    peer_id: Arc<str>,
    direction: TransferDirection,
    /// Canonical path when sending, content id when receiving.
    file: Arc<str>,
}

/// Frees the session key when the session task ends, however it ends.
struct ActiveGuard {
    active: Arc<DashMap<SessionKey, TransferId>>,
    key: SessionKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.remove(&self.key);
    }
}

/// A file checked and ready to offer.
struct LocalFile {
    path: PathBuf,
    name: Arc<str>,
    size: u64,
    key: Arc<str>,
}

/// Manages file transfer sessions
#[derive(Clone)]
pub struct TransferManager {
    ctx: SessionContext,
    discovery: Arc<Discovery>,
    transfers: Arc<DashMap<TransferId, TransferHandle>>,
    active: Arc<DashMap<SessionKey, TransferId>>,
    events: Arc<EventBus<TransferEvent>>,
    send_slots: Arc<Semaphore>,
    receive_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TransferManager {
    pub fn new(
        identity: DeviceIdentity,
        config: TransferConfig,
        discovery: Arc<Discovery>,
        hooks: Hooks,
    ) -> Self {
        let limit = config.max_concurrent_sessions.max(1);
        info!(
            device_id = %identity.device_id,
            max_sessions = config.max_concurrent_sessions,
            chunk_size = config.chunk_size,
            "Transfer manager initialized"
        );

        Self {
            ctx: SessionContext {
                config: Arc::new(config),
                identity,
                hooks,
                ledger: Arc::new(ResumeLedger::new()),
            },
            discovery,
            transfers: Arc::new(DashMap::new()),
            active: Arc::new(DashMap::new()),
            events: Arc::new(EventBus::new()),
            send_slots: Arc::new(Semaphore::new(limit)),
            receive_slots: Arc::new(Semaphore::new(limit)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.ctx.config
    }

    pub fn resume_ledger(&self) -> &ResumeLedger {
        &self.ctx.ledger
    }

    /// Subscribes to lifecycle events of every session.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Starts one send session per file.
    ///
    /// Nothing is started unless every file can be: an unknown peer, a
    /// missing file or a file already being sent to this peer fails the whole
    /// request.
    #[instrument(skip(self, paths), fields(peer = %peer_id, file_count = paths.len()))]
    pub async fn request_send(
        &self,
        peer_id: &str,
        paths: &[PathBuf],
    ) -> Result<Vec<TransferHandle>, TransferError> {
        if self.shutdown.is_cancelled() {
            return Err(TransferError::Shutdown);
        }

        let peer = self
            .discovery
            .get_peer(peer_id)
            .ok_or_else(|| TransferError::PeerUnknown(Arc::from(peer_id)))?;

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            files.push(inspect_file(path).await?);
        }

        let ids: Vec<TransferId> = files.iter().map(|_| TransferId::next()).collect();
        let keys: Vec<SessionKey> = files
            .iter()
            .map(|file| SessionKey {
                peer_id: peer.device_id.clone(),
                direction: TransferDirection::Send,
                file: file.key.clone(),
            })
            .collect();
        self.reserve(&keys, &ids, &files)?;

        let peer_ref = PeerRef {
            device_id: peer.device_id.clone(),
            device_name: peer.device_name.clone(),
            addr: peer.transfer_addr(),
        };

        let mut handles = Vec::with_capacity(files.len());
        for ((file, key), id) in files.into_iter().zip(keys).zip(ids) {
            info!(
                transfer_id = %id,
                file_name = %file.name,
                size = file.size,
                peer = %peer_ref.device_id,
                "Queueing file send"
            );

            let (handle, commands, reporter) = self.register(
                id,
                TransferDirection::Send,
                peer_ref.device_id.clone(),
                file.name.clone(),
                file.size,
            );
            let guard = ActiveGuard {
                active: self.active.clone(),
                key,
            };
            let job = SendJob {
                id,
                peer: peer_ref.clone(),
                path: file.path,
                file_name: file.name,
                size: file.size,
            };

            let ctx = self.ctx.clone();
            let slots = self.send_slots.clone();
            let shutdown = self.shutdown.clone();
            let transfers = self.transfers.clone();
            tokio::spawn(async move {
                let retention = ctx.config.finished_retention;
                let session = async move {
                    let _guard = guard;
                    let mut commands = commands;
                    let mut reporter = reporter;
                    let Some(_permit) = admit(&slots, &mut commands, &shutdown).await else {
                        debug!(transfer_id = %id, "Cancelled while queued");
                        reporter.finish(&Outcome::Cancelled);
                        return;
                    };
                    run_sender(ctx, job, commands, reporter).await;
                };
                session.await;
                retire(&transfers, id, retention).await;
            });

            handles.push(handle);
        }

        Ok(handles)
    }

    /// Claims every key or none of them.
    fn reserve(
        &self,
        keys: &[SessionKey],
        ids: &[TransferId],
        files: &[LocalFile],
    ) -> Result<(), TransferError> {
        for (i, key) in keys.iter().enumerate() {
            match self.active.entry(key.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(ids[i]);
                }
                Entry::Occupied(existing) => {
                    warn!(
                        peer = %key.peer_id,
                        file = %key.file,
                        active = %existing.get(),
                        "Transfer already active"
                    );
                    drop(existing);
                    for claimed in &keys[..i] {
                        self.active.remove(claimed);
                    }
                    return Err(TransferError::PeerBusy(files[i].name.clone()));
                }
            }
        }
        Ok(())
    }

    fn register(
        &self,
        id: TransferId,
        direction: TransferDirection,
        peer_id: Arc<str>,
        file_name: Arc<str>,
        size: u64,
    ) -> (
        TransferHandle,
        mpsc::UnboundedReceiver<SessionCommand>,
        Reporter,
    ) {
        let progress = Arc::new(RwLock::new(TransferProgress::new(
            id, direction, peer_id, file_name, size,
        )));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = TransferHandle {
            id,
            commands: tx,
            progress: progress.clone(),
        };
        self.transfers.insert(id, handle.clone());
        let reporter = Reporter::new(
            id,
            self.events.clone(),
            progress,
            self.ctx.config.progress_interval,
        );
        (handle, rx, reporter)
    }

    /// Handles one inbound connection on the transfer port: reads the
    /// request, applies the busy check and runs a receive session.
    #[instrument(skip(self, stream), fields(remote = %addr))]
    pub async fn on_incoming_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.ctx.config.clone();
        let mut link = Link::new(stream, config.io_timeout);

        let offer = match link.recv_within(config.io_timeout, "TRANSFER_REQUEST").await {
            Ok(Message::TransferRequest(offer)) => offer,
            Ok(other) => {
                warn!(kind = %other.kind(), "Connection did not open with TRANSFER_REQUEST");
                let err = TransferError::violation(format!("expected TRANSFER_REQUEST, got {}", other.kind()));
                refuse(link, &err, config.cancel_grace).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read transfer request");
                if !matches!(e, TransferError::ConnectionLost(_)) {
                    refuse(link, &e, config.cancel_grace).await;
                }
                return;
            }
        };

        if self.shutdown.is_cancelled() {
            refuse(link, &TransferError::Shutdown, config.cancel_grace).await;
            return;
        }

        let peer_id: Arc<str> = Arc::from(offer.sender_id.as_str());
        let key = SessionKey {
            peer_id: peer_id.clone(),
            direction: TransferDirection::Receive,
            file: Arc::from(offer.file_id.as_str()),
        };
        let id = TransferId::next();
        match self.active.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
            Entry::Occupied(existing) => {
                warn!(peer = %peer_id, file = %offer.file_name, active = %existing.get(), "Rejecting duplicate incoming transfer");
                drop(existing);
                let err = TransferError::PeerBusy(Arc::from(offer.file_name.as_str()));
                refuse(link, &err, config.cancel_grace).await;
                return;
            }
        }

        info!(
            transfer_id = %id,
            peer = %peer_id,
            file_name = %offer.file_name,
            size = offer.size,
            "Incoming transfer request"
        );

        let (_handle, commands, reporter) = self.register(
            id,
            TransferDirection::Receive,
            peer_id.clone(),
            Arc::from(offer.file_name.as_str()),
            offer.size,
        );
        let guard = ActiveGuard {
            active: self.active.clone(),
            key,
        };
        let peer = PeerRef {
            device_id: peer_id,
            device_name: Arc::from(offer.sender_name.as_str()),
            addr,
        };

        let ctx = self.ctx.clone();
        let slots = self.receive_slots.clone();
        let shutdown = self.shutdown.clone();
        let transfers = self.transfers.clone();
        tokio::spawn(async move {
            let retention = ctx.config.finished_retention;
            let session = async move {
                let _guard = guard;
                let mut session = Session::new(
                    id,
                    TransferDirection::Receive,
                    link,
                    commands,
                    reporter,
                    ctx.config.clone(),
                );
                let Some(_permit) = admit(&slots, &mut session.commands, &shutdown).await else {
                    debug!(transfer_id = %id, "Cancelled while queued");
                    session.end(Outcome::Cancelled).await;
                    return;
                };
                run_receiver(ctx, session, peer, offer).await;
            };
            session.await;
            retire(&transfers, id, retention).await;
        });
    }

    /// Accepts transfer connections until [`TransferManager::shutdown`].
    pub async fn accept_loop(&self, listener: TcpListener) {
        info!(addr = ?listener.local_addr().ok(), "Accepting transfer connections");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Transfer accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(remote = %addr, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let this = self.clone();
                        tokio::spawn(async move { this.on_incoming_connection(stream, addr).await });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept transfer connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    #[instrument(skip(self), fields(transfer_id = %id))]
    pub fn pause_transfer(&self, id: TransferId) -> bool {
        self.with_handle(id, TransferHandle::pause)
    }

    #[instrument(skip(self), fields(transfer_id = %id))]
    pub fn resume_transfer(&self, id: TransferId) -> bool {
        self.with_handle(id, TransferHandle::resume)
    }

    /// Cancels a queued or running transfer
    #[instrument(skip(self), fields(transfer_id = %id))]
    pub fn cancel_transfer(&self, id: TransferId) -> bool {
        self.with_handle(id, TransferHandle::cancel)
    }

    fn with_handle(&self, id: TransferId, f: impl FnOnce(&TransferHandle) -> bool) -> bool {
        match self.transfers.get(&id) {
            Some(entry) => f(entry.value()),
            None => {
                warn!("Transfer not found");
                false
            }
        }
    }

    pub fn handle(&self, id: TransferId) -> Option<TransferHandle> {
        self.transfers.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns all active transfers
    pub fn active_transfers(&self) -> Vec<TransferProgress> {
        self.transfers
            .iter()
            .map(|entry| entry.value().progress())
            .filter(TransferProgress::is_active)
            .collect()
    }

    /// Returns all transfers (including completed/failed)
    pub fn all_transfers(&self) -> Vec<TransferProgress> {
        self.transfers
            .iter()
            .map(|entry| entry.value().progress())
            .collect()
    }

    /// Returns the progress for a specific transfer
    pub fn get_transfer(&self, id: TransferId) -> Option<TransferProgress> {
        self.transfers.get(&id).map(|entry| entry.value().progress())
    }

    /// Removes every finished transfer now, without waiting out
    /// `finished_retention`.
    pub fn cleanup_finished(&self) {
        self.transfers
            .retain(|_, handle| !handle.state().is_terminal());
    }

    /// Returns the number of active transfers
    pub fn active_transfer_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|entry| !entry.value().state().is_terminal())
            .count()
    }

    /// Stops accepting connections and cancels every session.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!(active = self.active_transfer_count(), "Shutting down transfer manager");
        self.shutdown.cancel();
        for entry in self.transfers.iter() {
            entry.value().cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Waits for a session slot. `None` if the session was cancelled or the
/// manager shut down first.
async fn admit(
    slots: &Arc<Semaphore>,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    shutdown: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        _ = until_cancelled(commands) => None,
        permit = slots.clone().acquire_owned() => permit.ok(),
    }
}

/// Forgets a finished session once `retention` has passed. Handles already
/// given out keep their last snapshot.
async fn retire(transfers: &DashMap<TransferId, TransferHandle>, id: TransferId, retention: Duration) {
    tokio::time::sleep(retention).await;
    if transfers.remove(&id).is_some() {
        debug!(transfer_id = %id, "Finished transfer pruned");
    }
}

/// Answers a connection that will not get a session, then closes it.
async fn refuse(mut link: Link, err: &TransferError, grace: Duration) {
    let code = match err {
        TransferError::Shutdown => ErrorCode::Other,
        other => other.wire_code(),
    };
    link.send_final(
        Message::Error {
            code,
            message: err.to_string(),
        },
        grace,
    )
    .await;
    link.close(grace).await;
}

async fn inspect_file(path: &Path) -> Result<LocalFile, TransferError> {
    let not_found = || TransferError::FileNotFound(path.to_path_buf());
    let canonical = tokio::fs::canonicalize(path).await.map_err(|_| not_found())?;
    let metadata = tokio::fs::metadata(&canonical)
        .await
        .map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }

    let name: Arc<str> = canonical
        .file_name()
        .map(|n| n.to_string_lossy().into())
        .unwrap_or_else(|| Arc::from("unknown"));
    let key: Arc<str> = canonical.to_string_lossy().into();

    Ok(LocalFile {
        path: canonical,
        name,
        size: metadata.len(),
        key,
    })
}
