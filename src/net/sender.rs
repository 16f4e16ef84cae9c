//! Sender role of a transfer session.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument};

use super::codec::{FileOffer, Message};
use super::error::TransferError;
use super::integrity::{self, ContentHash};
use super::session::{
    until_cancelled, Control, Event, Input, Link, Outcome, PeerRef, Reporter, Session,
    SessionCommand, SessionState, TransferDirection,
};
use super::transfer::{SessionContext, TransferId};

/// One file to push to one peer.
#[derive(Debug, Clone)]
pub(crate) struct SendJob {
    pub(crate) id: TransferId,
    pub(crate) peer: PeerRef,
    pub(crate) path: PathBuf,
    pub(crate) file_name: Arc<str>,
    pub(crate) size: u64,
}

/// Runs a send session to its end and reports the outcome.
#[instrument(skip_all, fields(transfer_id = %job.id, peer = %job.peer.device_id, file = %job.file_name))]
pub(crate) async fn run_sender(
    ctx: SessionContext,
    job: SendJob,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    mut reporter: Reporter,
) -> Outcome {
    let prepared = tokio::select! {
        biased;
        _ = until_cancelled(&mut commands) => Ok(None),
        prepared = prepare(&ctx, &job) => prepared.map(Some),
    };

    let (offer, stream) = match prepared {
        Ok(Some(prepared)) => prepared,
        Ok(None) => {
            let outcome = Outcome::Cancelled;
            reporter.finish(&outcome);
            return outcome;
        }
        Err(err) => {
            let outcome = Outcome::Failed(err);
            reporter.finish(&outcome);
            return outcome;
        }
    };

    let link = Link::new(stream, ctx.config.io_timeout);
    let mut session = Session::new(
        job.id,
        TransferDirection::Send,
        link,
        commands,
        reporter,
        ctx.config.clone(),
    );
    let outcome = exchange(&mut session, &offer, &job.path).await.into();
    session.end(outcome).await
}

/// Hashes the file and connects to the peer.
async fn prepare(ctx: &SessionContext, job: &SendJob) -> Result<(FileOffer, TcpStream), TransferError> {
    let hash = integrity::hash_file(&job.path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => TransferError::FileNotFound(job.path.clone()),
        _ => TransferError::io(e),
    })?;
    debug!(hash = %hash, "Content hash computed");

    let offer = FileOffer {
        file_id: hash.to_hex(),
        file_name: job.file_name.to_string(),
        size: job.size,
        chunk_size: ctx.config.chunk_size,
        hash: Some(hash),
        sender_id: ctx.identity.device_id.to_string(),
        sender_name: ctx.identity.device_name.to_string(),
    };

    let stream = match tokio::time::timeout(ctx.config.io_timeout, TcpStream::connect(job.peer.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransferError::connection_lost(format!(
                "connecting to {}: {e}",
                job.peer.addr
            )))
        }
        Err(_) => return Err(TransferError::Timeout("connect")),
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %job.peer.addr, error = %e, "Failed to set TCP_NODELAY");
    }
    debug!(addr = %job.peer.addr, "Connected to peer");

    Ok((offer, stream))
}

async fn exchange(session: &mut Session, offer: &FileOffer, path: &Path) -> Result<Outcome, TransferError> {
    session
        .link
        .send(Message::TransferRequest(offer.clone()))
        .await?;
    session.apply(Input::Start)?;

    let resume_offset = match await_decision(session).await? {
        Decision::Accepted(offset) => offset,
        Decision::Ended(outcome) => return Ok(outcome),
    };
    check_resume_offset(offer, resume_offset)?;

    let chunk = u64::from(offer.chunk_size);
    let total_chunks = offer.total_chunks();
    let first_seq = resume_offset.div_ceil(chunk);
    session
        .link
        .send(Message::FileInfo {
            start_offset: resume_offset,
            first_seq,
            total_chunks,
        })
        .await?;
    session.apply(Input::Begin)?;

    if resume_offset > 0 {
        info!(offset = resume_offset, first_seq, "Resuming transfer");
        session.reporter.mark_resumed_from(resume_offset);
    }

    let mut file = File::open(path).await.map_err(TransferError::io)?;
    file.seek(std::io::SeekFrom::Start(resume_offset))
        .await
        .map_err(TransferError::io)?;

    if let Some(outcome) = stream_chunks(session, &mut file, offer, first_seq).await? {
        return Ok(outcome);
    }

    let hash = offer
        .hash
        .ok_or_else(|| TransferError::violation("offer has no content hash"))?;
    session.apply(Input::Finish)?;
    session.link.send(Message::Complete { hash }).await?;
    await_confirmation(session, &hash).await
}

enum Decision {
    Accepted(u64),
    Ended(Outcome),
}

async fn await_decision(session: &mut Session) -> Result<Decision, TransferError> {
    let deadline = Instant::now() + session.config.request_timeout;
    loop {
        match session.next_event(Some(deadline), "TRANSFER_ACCEPT").await? {
            Event::Command(cmd) => {
                if let Some(outcome) = session.command(cmd).await? {
                    return Ok(Decision::Ended(outcome));
                }
            }
            Event::Frame(msg) => match session.on_frame(&msg)? {
                Control::Done(outcome) => return Ok(Decision::Ended(outcome)),
                Control::Skip => {}
                Control::Handle(_) => match msg {
                    Message::TransferAccept { resume_offset } => {
                        debug!(resume_offset, "Transfer accepted");
                        return Ok(Decision::Accepted(resume_offset));
                    }
                    Message::TransferReject { reason } => {
                        info!(reason = %reason, "Transfer rejected by peer");
                        return Ok(Decision::Ended(Outcome::Rejected(Arc::from(reason))));
                    }
                    other => {
                        return Err(TransferError::violation(format!(
                            "unexpected {} while awaiting decision",
                            other.kind()
                        )))
                    }
                },
            },
        }
    }
}

/// The receiver may only resume at a chunk boundary or at the very end.
fn check_resume_offset(offer: &FileOffer, offset: u64) -> Result<(), TransferError> {
    let aligned = offset % u64::from(offer.chunk_size) == 0;
    if offset > offer.size || !(aligned || offset == offer.size) {
        return Err(TransferError::violation(format!(
            "resume offset {offset} invalid for size {} and chunk size {}",
            offer.size, offer.chunk_size
        )));
    }
    Ok(())
}

/// Pushes chunks `first_seq..` with at most `ack_window` unacknowledged.
/// Returns `Some` if the session ended before every chunk was acknowledged.
///
/// Each chunk's ACK is due `ack_timeout` after the chunk went out; frames
/// that are ignored along the way do not extend that deadline.
async fn stream_chunks(
    session: &mut Session,
    file: &mut File,
    offer: &FileOffer,
    first_seq: u64,
) -> Result<Option<Outcome>, TransferError> {
    let chunk = u64::from(offer.chunk_size);
    let total_chunks = offer.total_chunks();
    let window = session.config.ack_window.max(1);
    let ack_timeout = session.config.ack_timeout;

    let mut next_seq = first_seq;
    // (seq, ACK deadline) in send order.
    let mut in_flight: VecDeque<(u64, Instant)> = VecDeque::with_capacity(window);

    // A pause after the last ACK still holds COMPLETE back until RESUME.
    while next_seq < total_chunks
        || !in_flight.is_empty()
        || session.state() == SessionState::Paused
    {
        let can_send = session.state() == SessionState::Transferring
            && next_seq < total_chunks
            && in_flight.len() < window;

        let event = if can_send {
            session.poll_event().await
        } else {
            let deadline = in_flight.front().map(|&(_, due)| due);
            Some(session.next_event(deadline, "ACK").await)
        };

        let event = match event {
            Some(event) => event?,
            None => {
                let start = next_seq * chunk;
                let len = chunk.min(offer.size - start) as usize;
                let mut payload = BytesMut::zeroed(len);
                file.read_exact(&mut payload)
                    .await
                    .map_err(TransferError::io)?;
                session
                    .link
                    .send(Message::Data {
                        seq: next_seq,
                        payload: payload.freeze(),
                    })
                    .await?;
                in_flight.push_back((next_seq, Instant::now() + ack_timeout));
                next_seq += 1;
                continue;
            }
        };

        match event {
            Event::Command(cmd) => {
                if let Some(outcome) = session.command(cmd).await? {
                    return Ok(Some(outcome));
                }
            }
            Event::Frame(msg) => match session.on_frame(&msg)? {
                Control::Done(outcome) => return Ok(Some(outcome)),
                Control::Skip => {}
                Control::Handle(_) => match msg {
                    Message::Ack { seq } if in_flight.front().map(|&(s, _)| s) == Some(seq) => {
                        in_flight.pop_front();
                        let done = ((seq + 1) * chunk).min(offer.size);
                        session.reporter.progress(done);
                    }
                    Message::Ack { seq } => {
                        return Err(TransferError::violation(format!(
                            "ACK {seq} out of order, expected {:?}",
                            in_flight.front().map(|&(s, _)| s)
                        )))
                    }
                    other => {
                        return Err(TransferError::violation(format!(
                            "unexpected {} while sending",
                            other.kind()
                        )))
                    }
                },
            },
        }
    }

    Ok(None)
}

/// Waits for the receiver's COMPLETE and checks its hash against ours.
async fn await_confirmation(session: &mut Session, hash: &ContentHash) -> Result<Outcome, TransferError> {
    let deadline = Instant::now() + session.config.io_timeout;
    loop {
        match session.next_event(Some(deadline), "COMPLETE").await? {
            Event::Command(cmd) => {
                if let Some(outcome) = session.command(cmd).await? {
                    return Ok(outcome);
                }
            }
            Event::Frame(msg) => match session.on_frame(&msg)? {
                Control::Done(outcome) => return Ok(outcome),
                Control::Skip => {}
                Control::Handle(_) => match msg {
                    Message::Complete { hash: confirmed } if integrity::compare(&confirmed, hash) => {
                        info!(hash = %hash, "Receiver confirmed content hash");
                        return Ok(Outcome::Completed);
                    }
                    Message::Complete { .. } => return Err(TransferError::IntegrityMismatch),
                    other => {
                        return Err(TransferError::violation(format!(
                            "unexpected {} while completing",
                            other.kind()
                        )))
                    }
                },
            },
        }
    }
}
