//! Transfer session state machine shared by the sender and receiver roles.
//!
//! Dispatch is a single transition table, [`transition`], mapping
//! `(role, state, input)` to a [`Step`]. The role loops in
//! [`sender`](super::sender) and [`receiver`](super::receiver) perform the I/O
//! and feed every incoming frame and local command through the table before
//! acting on it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::codec::{FileOffer, FrameCodec, Message, MessageKind};
use super::error::TransferError;
use super::events::EventBus;
use super::transfer::{TransferConfig, TransferEvent, TransferEventKind, TransferId, TransferProgress};

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// State of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, nothing exchanged yet (or still queued for a slot).
    Idle,
    Requested,
    Accepted,
    Rejected,
    Transferring,
    Paused,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    /// Returns true if the session is in a terminal state
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Failed
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Requested => "requested",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The remote side of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub device_id: Arc<str>,
    pub device_name: Arc<str>,
    /// Address of the peer's transfer port (sender) or of the connecting
    /// socket (receiver).
    pub addr: SocketAddr,
}

/// A request to move one file between two peers.
///
/// Immutable once the session has been accepted.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: TransferId,
    pub direction: TransferDirection,
    pub peer: PeerRef,
    pub offer: FileOffer,
}

/// Anything that can drive the state machine forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A frame of the given kind arrived from the peer.
    Frame(MessageKind),
    /// Sender: the request frame was written.
    Start,
    /// Receiver: the local decision function answered.
    Accept,
    Reject,
    /// Sender: `FILE_INFO` was written after acceptance.
    Begin,
    /// All chunks are through (sender) or verified (receiver).
    Finish,
    Pause,
    Resume,
    Cancel,
}

/// What the role loop should do with an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Move to a new state.
    Enter(SessionState),
    /// Valid in the current state; handled without a state change.
    Stay,
    /// A duplicate or late control frame; drop it.
    Ignore,
    /// Unexpected in this state; the session must fail.
    Violation,
}

/// The session transition table.
pub fn transition(role: TransferDirection, state: SessionState, input: Input) -> Step {
    use Input as I;
    use MessageKind as K;
    use SessionState as S;
    use Step::*;

    if state.is_terminal() {
        return Ignore;
    }

    // Rows valid in every non-terminal state, for both roles.
    match input {
        I::Cancel | I::Frame(K::Cancel) => return Enter(S::Cancelled),
        I::Frame(K::Error) => return Enter(S::Failed),
        _ => {}
    }

    // Pause and resume only bite while chunks are moving.
    match (state, input) {
        (S::Transferring, I::Pause | I::Frame(K::Pause)) => return Enter(S::Paused),
        (S::Paused, I::Resume | I::Frame(K::Resume)) => return Enter(S::Transferring),
        (_, I::Pause | I::Frame(K::Pause) | I::Resume | I::Frame(K::Resume)) => return Ignore,
        _ => {}
    }

    match role {
        TransferDirection::Send => match (state, input) {
            (S::Idle, I::Start) => Enter(S::Requested),
            (S::Requested, I::Frame(K::TransferAccept)) => Enter(S::Accepted),
            (S::Requested, I::Frame(K::TransferReject)) => Enter(S::Rejected),
            (S::Accepted | S::Transferring | S::Paused | S::Completing, I::Frame(K::TransferAccept)) => {
                Ignore
            }
            (S::Accepted, I::Begin) => Enter(S::Transferring),
            (S::Transferring | S::Paused, I::Frame(K::Ack)) => Stay,
            (S::Transferring, I::Finish) => Enter(S::Completing),
            (S::Completing, I::Frame(K::Complete)) => Enter(S::Completed),
            _ => Violation,
        },
        TransferDirection::Receive => match (state, input) {
            (S::Idle, I::Frame(K::TransferRequest)) => Enter(S::Requested),
            (
                S::Requested | S::Accepted | S::Transferring | S::Paused | S::Completing,
                I::Frame(K::TransferRequest),
            ) => Ignore,
            (S::Requested, I::Accept) => Enter(S::Accepted),
            (S::Requested, I::Reject) => Enter(S::Rejected),
            (S::Accepted, I::Frame(K::FileInfo)) => Enter(S::Transferring),
            (S::Transferring | S::Paused | S::Completing, I::Frame(K::FileInfo)) => Ignore,
            (S::Transferring | S::Paused, I::Frame(K::Data)) => Stay,
            (S::Transferring | S::Paused, I::Frame(K::Complete)) => Enter(S::Completing),
            (S::Completing, I::Finish) => Enter(S::Completed),
            _ => Violation,
        },
    }
}

/// Local control of a running session, sent through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    Pause,
    Resume,
    Cancel,
}

impl SessionCommand {
    pub(crate) fn input(self) -> Input {
        match self {
            Self::Pause => Input::Pause,
            Self::Resume => Input::Resume,
            Self::Cancel => Input::Cancel,
        }
    }
}

/// Resolves once a `Cancel` arrives or every handle is gone. Other commands
/// are dropped; used while nothing is running yet.
pub(crate) async fn until_cancelled(commands: &mut mpsc::UnboundedReceiver<SessionCommand>) {
    loop {
        match commands.recv().await {
            Some(SessionCommand::Cancel) | None => return,
            Some(_) => continue,
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One framed connection between two peers.
pub struct Link {
    reader: FramedRead<BoxedReader, FrameCodec>,
    writer: FramedWrite<BoxedWriter, FrameCodec>,
    io_timeout: Duration,
}

impl Link {
    pub fn new<S>(stream: S, io_timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: FramedRead::new(Box::new(read), FrameCodec),
            writer: FramedWrite::new(Box::new(write), FrameCodec),
            io_timeout,
        }
    }

    /// Writes one frame, bounded by the I/O timeout.
    pub async fn send(&mut self, msg: Message) -> Result<(), TransferError> {
        let kind = msg.kind();
        match tokio::time::timeout(self.io_timeout, self.writer.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransferError::connection_lost(format!("writing {kind}: {e}"))),
            Err(_) => Err(TransferError::Timeout("socket write")),
        }
    }

    /// Reads the next frame. Cancel-safe; callers bound it with their own
    /// deadline because the right one depends on the state.
    pub async fn recv(&mut self) -> Result<Message, TransferError> {
        match self.reader.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransferError::connection_lost("connection closed by peer")),
        }
    }

    /// Reads the next frame or fails with `Timeout(what)`.
    pub async fn recv_within(
        &mut self,
        limit: Duration,
        what: &'static str,
    ) -> Result<Message, TransferError> {
        tokio::time::timeout(limit, self.recv())
            .await
            .unwrap_or(Err(TransferError::Timeout(what)))
    }

    /// Best-effort final frame, never waiting longer than `grace`.
    pub async fn send_final(&mut self, msg: Message, grace: Duration) {
        let kind = msg.kind();
        match tokio::time::timeout(grace, self.writer.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(kind = %kind, error = %e, "Could not deliver final frame"),
            Err(_) => debug!(kind = %kind, "Peer did not take final frame within grace period"),
        }
    }

    /// Flushes and shuts down the write side.
    pub async fn close(mut self, grace: Duration) {
        let _ = tokio::time::timeout(grace, self.writer.close()).await;
    }
}

/// Publishes lifecycle events and keeps the progress snapshot current.
pub(crate) struct Reporter {
    id: TransferId,
    bus: Arc<EventBus<TransferEvent>>,
    snapshot: Arc<RwLock<TransferProgress>>,
    interval: Duration,
    last_progress: Option<Instant>,
    finished: bool,
}

impl Reporter {
    pub(crate) fn new(
        id: TransferId,
        bus: Arc<EventBus<TransferEvent>>,
        snapshot: Arc<RwLock<TransferProgress>>,
        interval: Duration,
    ) -> Self {
        Self {
            id,
            bus,
            snapshot,
            interval,
            last_progress: None,
            finished: false,
        }
    }

    pub(crate) fn emit(&self, kind: TransferEventKind) {
        self.bus.emit(TransferEvent { id: self.id, kind });
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.snapshot.write().state = state;
    }

    /// Records bytes done. Events are rate limited except for the last one.
    pub(crate) fn progress(&mut self, bytes_done: u64) {
        let total = {
            let mut snap = self.snapshot.write();
            snap.transferred_bytes = bytes_done;
            let elapsed = snap.started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                snap.speed_bps = (bytes_done.saturating_sub(snap.resumed_from) as f64 / elapsed) as u64;
            }
            snap.total_bytes
        };

        let due = self
            .last_progress
            .map_or(true, |at| at.elapsed() >= self.interval);
        if due || bytes_done >= total {
            self.last_progress = Some(Instant::now());
            self.emit(TransferEventKind::Progress {
                bytes_done,
                total,
            });
        }
    }

    pub(crate) fn mark_resumed_from(&self, offset: u64) {
        let mut snap = self.snapshot.write();
        snap.resumed_from = offset;
        snap.transferred_bytes = offset;
        snap.started_at = Instant::now();
    }

    /// Emits the single terminal event for this session.
    pub(crate) fn finish(&mut self, outcome: &Outcome) {
        if self.finished {
            warn!(transfer_id = %self.id, state = %outcome.state(), "Terminal state reported twice; ignoring");
            return;
        }
        self.finished = true;

        {
            let mut snap = self.snapshot.write();
            snap.state = outcome.state();
            snap.error = match outcome {
                Outcome::Failed(err) => Some(err.clone()),
                _ => None,
            };
        }

        let kind = match outcome {
            Outcome::Completed => TransferEventKind::Completed,
            Outcome::Cancelled => TransferEventKind::Cancelled,
            Outcome::Rejected(reason) => TransferEventKind::Rejected {
                reason: reason.clone(),
            },
            Outcome::Failed(reason) => TransferEventKind::Failed {
                reason: reason.clone(),
            },
        };
        self.emit(kind);
    }

    /// Emits `Requested` from the snapshot's description of the transfer.
    pub(crate) fn requested(&self) {
        let snap = self.snapshot.read();
        let kind = TransferEventKind::Requested {
            direction: snap.direction,
            peer_id: snap.peer_id.clone(),
            file_name: snap.file_name.clone(),
            size: snap.total_bytes,
        };
        drop(snap);
        self.emit(kind);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }
}

/// State, link and reporting shared by both role loops.
pub(crate) struct Session {
    pub(crate) id: TransferId,
    pub(crate) role: TransferDirection,
    state: SessionState,
    pub(crate) link: Link,
    pub(crate) commands: mpsc::UnboundedReceiver<SessionCommand>,
    pub(crate) reporter: Reporter,
    pub(crate) config: Arc<TransferConfig>,
    /// Set when the peer ended the session, so nothing more is sent.
    peer_gone: bool,
}

impl Session {
    pub(crate) fn new(
        id: TransferId,
        role: TransferDirection,
        link: Link,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        reporter: Reporter,
        config: Arc<TransferConfig>,
    ) -> Self {
        Self {
            id,
            role,
            state: SessionState::Idle,
            link,
            commands,
            reporter,
            config,
            peer_gone: false,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Looks up `input` in the transition table. Non-terminal targets are
    /// entered immediately; terminal ones are left to [`Session::end`].
    pub(crate) fn apply(&mut self, input: Input) -> Result<Step, TransferError> {
        let step = transition(self.role, self.state, input);
        match step {
            Step::Violation => {
                return Err(TransferError::violation(format!(
                    "{input:?} not allowed while {}",
                    self.state
                )))
            }
            Step::Ignore => {
                debug!(transfer_id = %self.id, state = %self.state, input = ?input, "Ignoring duplicate or late input");
            }
            Step::Enter(next) if !next.is_terminal() => self.enter(next),
            _ => {}
        }
        Ok(step)
    }

    fn enter(&mut self, next: SessionState) {
        let prev = self.state;
        self.state = next;
        self.reporter.set_state(next);
        debug!(transfer_id = %self.id, from = %prev, to = %next, "Session transition");

        match (prev, next) {
            (SessionState::Transferring, SessionState::Paused) => {
                self.reporter.emit(TransferEventKind::Paused)
            }
            (SessionState::Paused, SessionState::Transferring) => {
                self.reporter.emit(TransferEventKind::Resumed)
            }
            (_, SessionState::Requested) => self.reporter.requested(),
            (_, SessionState::Accepted) => self.reporter.emit(TransferEventKind::Accepted),
            _ => {}
        }
    }

    /// Notes that the peer closed the session (CANCEL or ERROR received).
    pub(crate) fn peer_ended(&mut self) {
        self.peer_gone = true;
    }

    /// Enters a terminal state, tells the peer when appropriate, closes the
    /// connection and emits the one terminal event.
    ///
    /// No `ERROR` frame follows a lost connection or a timeout: the peer
    /// sees the connection drop and treats the interruption as resumable.
    pub(crate) async fn end(mut self, outcome: Outcome) -> Outcome {
        let grace = self.config.cancel_grace;
        if !self.peer_gone {
            match &outcome {
                Outcome::Cancelled => self.link.send_final(Message::Cancel, grace).await,
                Outcome::Failed(err) if !err.is_resumable() => {
                    let message = Message::Error {
                        code: err.wire_code(),
                        message: err.to_string(),
                    };
                    self.link.send_final(message, grace).await;
                }
                _ => {}
            }
        }

        self.state = outcome.state();
        match &outcome {
            Outcome::Failed(err) => {
                warn!(transfer_id = %self.id, role = ?self.role, error = %err, "Session failed")
            }
            other => info!(transfer_id = %self.id, role = ?self.role, state = %other.state(), "Session ended"),
        }
        self.reporter.finish(&outcome);
        self.link.close(grace).await;

        outcome
    }

    /// Waits for the next local command or peer frame.
    ///
    /// `deadline` bounds the wait; `what` names the awaited frame in the
    /// resulting `Timeout`.
    pub(crate) async fn next_event(
        &mut self,
        deadline: Option<Instant>,
        what: &'static str,
    ) -> Result<Event, TransferError> {
        let expiry = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            Some(cmd) = self.commands.recv() => Ok(Event::Command(cmd)),
            frame = self.link.recv() => frame.map(Event::Frame),
            _ = expiry => Err(TransferError::Timeout(what)),
        }
    }

    /// Like [`Session::next_event`] but returns `None` instead of waiting.
    pub(crate) async fn poll_event(&mut self) -> Option<Result<Event, TransferError>> {
        tokio::select! {
            biased;
            Some(cmd) = self.commands.recv() => Some(Ok(Event::Command(cmd))),
            frame = self.link.recv() => Some(frame.map(Event::Frame)),
            _ = std::future::ready(()) => None,
        }
    }

    /// Applies a local command; returns the outcome if it ended the session.
    pub(crate) async fn command(&mut self, cmd: SessionCommand) -> Result<Option<Outcome>, TransferError> {
        debug!(transfer_id = %self.id, command = ?cmd, "Local command");
        match self.apply(cmd.input())? {
            Step::Enter(SessionState::Cancelled) => Ok(Some(Outcome::Cancelled)),
            Step::Enter(SessionState::Paused) => {
                self.link.send(Message::Pause).await?;
                Ok(None)
            }
            Step::Enter(SessionState::Transferring) => {
                self.link.send(Message::Resume).await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Runs a peer frame through the table and handles the rows both roles
    /// share: cancel, error, pause, resume and duplicates.
    pub(crate) fn on_frame(&mut self, msg: &Message) -> Result<Control, TransferError> {
        let step = self.apply(Input::Frame(msg.kind()))?;
        match (msg, step) {
            (Message::Cancel, _) => {
                self.peer_ended();
                Ok(Control::Done(Outcome::Cancelled))
            }
            (Message::Error { code, message }, _) => {
                self.peer_ended();
                Ok(Control::Done(Outcome::Failed(TransferError::from_wire(*code, message))))
            }
            (_, Step::Ignore) | (Message::Pause | Message::Resume, _) => Ok(Control::Skip),
            (_, step) => Ok(Control::Handle(step)),
        }
    }
}

/// Something that happened to a session while it waited.
#[derive(Debug)]
pub(crate) enum Event {
    Command(SessionCommand),
    Frame(Message),
}

/// Result of [`Session::on_frame`].
#[derive(Debug)]
pub(crate) enum Control {
    /// Role-specific frame; act on it.
    Handle(Step),
    /// Already handled or a duplicate.
    Skip,
    /// The peer ended the session.
    Done(Outcome),
}

/// How a session finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Rejected(Arc<str>),
    Cancelled,
    Failed(TransferError),
}

impl Outcome {
    pub fn state(&self) -> SessionState {
        match self {
            Self::Completed => SessionState::Completed,
            Self::Rejected(_) => SessionState::Rejected,
            Self::Cancelled => SessionState::Cancelled,
            Self::Failed(_) => SessionState::Failed,
        }
    }
}

impl From<Result<Outcome, TransferError>> for Outcome {
    fn from(result: Result<Outcome, TransferError>) -> Self {
        result.unwrap_or_else(Outcome::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::codec::ErrorCode;
    use MessageKind as K;
    use SessionState as S;
    use TransferDirection::{Receive, Send};

    // ==================== Transition Table Tests ====================

    #[test]
    fn test_sender_happy_path() {
        let steps = [
            (S::Idle, Input::Start, S::Requested),
            (S::Requested, Input::Frame(K::TransferAccept), S::Accepted),
            (S::Accepted, Input::Begin, S::Transferring),
            (S::Transferring, Input::Finish, S::Completing),
            (S::Completing, Input::Frame(K::Complete), S::Completed),
        ];
        for (from, input, to) in steps {
            assert_eq!(transition(Send, from, input), Step::Enter(to), "{from} + {input:?}");
        }
        assert_eq!(transition(Send, S::Transferring, Input::Frame(K::Ack)), Step::Stay);
    }

    #[test]
    fn test_receiver_happy_path() {
        let steps = [
            (S::Idle, Input::Frame(K::TransferRequest), S::Requested),
            (S::Requested, Input::Accept, S::Accepted),
            (S::Accepted, Input::Frame(K::FileInfo), S::Transferring),
            (S::Transferring, Input::Frame(K::Complete), S::Completing),
            (S::Completing, Input::Finish, S::Completed),
        ];
        for (from, input, to) in steps {
            assert_eq!(transition(Receive, from, input), Step::Enter(to), "{from} + {input:?}");
        }
        assert_eq!(transition(Receive, S::Transferring, Input::Frame(K::Data)), Step::Stay);
        assert_eq!(transition(Receive, S::Paused, Input::Frame(K::Data)), Step::Stay);
    }

    #[test]
    fn test_rejection() {
        assert_eq!(
            transition(Send, S::Requested, Input::Frame(K::TransferReject)),
            Step::Enter(S::Rejected)
        );
        assert_eq!(
            transition(Receive, S::Requested, Input::Reject),
            Step::Enter(S::Rejected)
        );
    }

    #[test]
    fn test_cancel_and_error_from_any_live_state() {
        let live = [
            S::Idle,
            S::Requested,
            S::Accepted,
            S::Transferring,
            S::Paused,
            S::Completing,
        ];
        for role in [Send, Receive] {
            for state in live {
                assert_eq!(transition(role, state, Input::Cancel), Step::Enter(S::Cancelled));
                assert_eq!(
                    transition(role, state, Input::Frame(K::Cancel)),
                    Step::Enter(S::Cancelled)
                );
                assert_eq!(
                    transition(role, state, Input::Frame(K::Error)),
                    Step::Enter(S::Failed)
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_absorb_everything() {
        for state in [S::Completed, S::Rejected, S::Cancelled, S::Failed] {
            assert!(state.is_terminal());
            for input in [Input::Cancel, Input::Frame(K::Data), Input::Start] {
                assert_eq!(transition(Send, state, input), Step::Ignore);
                assert_eq!(transition(Receive, state, input), Step::Ignore);
            }
        }
    }

    #[test]
    fn test_pause_resume() {
        for role in [Send, Receive] {
            assert_eq!(transition(role, S::Transferring, Input::Pause), Step::Enter(S::Paused));
            assert_eq!(
                transition(role, S::Transferring, Input::Frame(K::Pause)),
                Step::Enter(S::Paused)
            );
            assert_eq!(transition(role, S::Paused, Input::Pause), Step::Ignore);
            assert_eq!(
                transition(role, S::Paused, Input::Frame(K::Resume)),
                Step::Enter(S::Transferring)
            );
            assert_eq!(transition(role, S::Transferring, Input::Resume), Step::Ignore);
            assert_eq!(transition(role, S::Requested, Input::Pause), Step::Ignore);
        }
    }

    #[test]
    fn test_duplicate_control_frames_are_ignored() {
        assert_eq!(
            transition(Send, S::Transferring, Input::Frame(K::TransferAccept)),
            Step::Ignore
        );
        assert_eq!(
            transition(Receive, S::Transferring, Input::Frame(K::TransferRequest)),
            Step::Ignore
        );
        assert_eq!(
            transition(Receive, S::Paused, Input::Frame(K::FileInfo)),
            Step::Ignore
        );
    }

    #[test]
    fn test_violations() {
        assert_eq!(
            transition(Send, S::Requested, Input::Frame(K::Ack)),
            Step::Violation
        );
        assert_eq!(
            transition(Send, S::Transferring, Input::Frame(K::Data)),
            Step::Violation
        );
        assert_eq!(
            transition(Receive, S::Accepted, Input::Frame(K::Data)),
            Step::Violation
        );
        assert_eq!(
            transition(Receive, S::Transferring, Input::Frame(K::Ack)),
            Step::Violation
        );
        assert_eq!(
            transition(Send, S::Transferring, Input::Frame(K::TransferReject)),
            Step::Violation
        );
    }

    // ==================== Link Tests ====================

    #[tokio::test]
    async fn test_link_exchanges_frames() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = Link::new(a, Duration::from_secs(1));
        let mut right = Link::new(b, Duration::from_secs(1));

        left.send(Message::Ack { seq: 4 }).await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Message::Ack { seq: 4 });

        drop(left);
        assert!(matches!(
            right.recv().await,
            Err(TransferError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_link_recv_within_times_out() {
        let (a, _b) = tokio::io::duplex(64);
        let mut link = Link::new(a, Duration::from_secs(1));
        let err = link
            .recv_within(Duration::from_millis(20), "ACK")
            .await
            .unwrap_err();
        assert_eq!(err, TransferError::Timeout("ACK"));
    }

    // ==================== Session End Tests ====================

    fn test_session(stream: tokio::io::DuplexStream) -> (Session, mpsc::UnboundedReceiver<TransferEvent>) {
        let id = TransferId::next();
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let progress = Arc::new(RwLock::new(TransferProgress::new(
            id,
            Send,
            Arc::from("dev-B"),
            Arc::from("f.bin"),
            10,
        )));
        let reporter = Reporter::new(id, bus, progress, Duration::from_millis(10));
        let (_tx, commands) = mpsc::unbounded_channel();
        let config = Arc::new(TransferConfig {
            cancel_grace: Duration::from_millis(200),
            ..TransferConfig::default()
        });
        let link = Link::new(stream, Duration::from_secs(1));
        (Session::new(id, Send, link, commands, reporter, config), events)
    }

    #[tokio::test]
    async fn test_timeout_closes_without_error_frame() {
        let (a, b) = tokio::io::duplex(1024);
        let (session, mut events) = test_session(a);
        let mut peer = Link::new(b, Duration::from_secs(1));

        session.end(Outcome::Failed(TransferError::Timeout("ACK"))).await;

        assert!(matches!(
            peer.recv().await,
            Err(TransferError::ConnectionLost(_))
        ));
        let event = events.try_recv().unwrap();
        assert_eq!(
            event.kind,
            TransferEventKind::Failed {
                reason: TransferError::Timeout("ACK")
            }
        );
    }

    #[tokio::test]
    async fn test_fatal_failure_reports_error_frame() {
        let (a, b) = tokio::io::duplex(1024);
        let (session, _events) = test_session(a);
        let mut peer = Link::new(b, Duration::from_secs(1));

        session.end(Outcome::Failed(TransferError::IntegrityMismatch)).await;

        assert!(matches!(
            peer.recv().await,
            Ok(Message::Error {
                code: ErrorCode::IntegrityMismatch,
                ..
            })
        ));
        assert!(peer.recv().await.is_err());
    }
}
