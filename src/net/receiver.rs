//! Receiver role of a transfer session.
//!
//! Chunks are written in sequence order and fed through the hash context as
//! they arrive. After every acknowledged chunk the resume ledger records the
//! new offset, so an interrupted download can continue in a later session.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use super::codec::{FileOffer, Message, MessageKind, MAX_CHUNK_SIZE};
use super::error::TransferError;
use super::hooks::Decision;
use super::integrity::{self, ContentHash, StreamingHasher};
use super::resume::{ResumeKey, ResumePoint};
use super::session::{
    Control, Event, Input, Outcome, PeerRef, Session, SessionState, Step, TransferDirection,
    TransferRequest,
};
use super::transfer::SessionContext;

/// The file a session writes into.
struct Destination {
    path: PathBuf,
    key: ResumeKey,
}

/// An open destination positioned where the next chunk goes.
struct Output {
    file: File,
    offset: u64,
    hasher: StreamingHasher,
}

/// Runs a receive session whose `TRANSFER_REQUEST` was already read.
#[instrument(skip_all, fields(transfer_id = %session.id, peer = %peer.device_id, file = %offer.file_name))]
pub(crate) async fn run_receiver(
    ctx: SessionContext,
    mut session: Session,
    peer: PeerRef,
    offer: FileOffer,
) -> Outcome {
    let request = TransferRequest {
        id: session.id,
        direction: TransferDirection::Receive,
        peer,
        offer,
    };

    let mut destination = None;
    let outcome: Outcome = exchange(&ctx, &mut session, &request, &mut destination)
        .await
        .into();

    if let Some(dest) = destination {
        settle_partial(&ctx, &dest, &outcome).await;
    }
    session.end(outcome).await
}

/// Keeps or discards what was written, depending on how the session ended.
async fn settle_partial(ctx: &SessionContext, dest: &Destination, outcome: &Outcome) {
    match outcome {
        Outcome::Completed => {
            ctx.ledger.remove(&dest.key);
            info!(path = %dest.path.display(), "File received");
        }
        Outcome::Failed(err) if err.is_resumable() => {
            let offset = ctx.ledger.get(&dest.key).map(|point| point.offset);
            info!(path = %dest.path.display(), offset = ?offset, "Keeping partial file for resume");
        }
        _ => {
            ctx.ledger.remove(&dest.key);
            match tokio::fs::remove_file(&dest.path).await {
                Ok(()) => debug!(path = %dest.path.display(), "Discarded partial file"),
                Err(e) => warn!(path = %dest.path.display(), error = %e, "Failed to discard partial file"),
            }
        }
    }
}

async fn exchange(
    ctx: &SessionContext,
    session: &mut Session,
    request: &TransferRequest,
    destination: &mut Option<Destination>,
) -> Result<Outcome, TransferError> {
    let offer = &request.offer;
    session.apply(Input::Frame(MessageKind::TransferRequest))?;
    if offer.chunk_size == 0 || offer.chunk_size > MAX_CHUNK_SIZE {
        return Err(TransferError::violation(format!(
            "chunk size {} out of range",
            offer.chunk_size
        )));
    }

    match decide(ctx, session, request).await? {
        Verdict::Decided(Decision::Accept) => {}
        Verdict::Decided(Decision::Reject { reason }) => {
            session.apply(Input::Reject)?;
            session
                .link
                .send(Message::TransferReject {
                    reason: reason.clone(),
                })
                .await?;
            info!(reason = %reason, "Transfer rejected");
            return Ok(Outcome::Rejected(Arc::from(reason)));
        }
        Verdict::Ended(outcome) => return Ok(outcome),
    }
    session.apply(Input::Accept)?;

    let key = ResumeKey::new(request.peer.device_id.clone(), offer.file_id.as_str());
    let (path, mut output) = open_destination(ctx, request, &key).await?;
    *destination = Some(Destination {
        path: path.clone(),
        key: key.clone(),
    });
    ctx.ledger.insert(
        key.clone(),
        ResumePoint {
            path,
            offset: output.offset,
            chunk_size: offer.chunk_size,
        },
    );

    session
        .link
        .send(Message::TransferAccept {
            resume_offset: output.offset,
        })
        .await?;
    if output.offset > 0 {
        info!(offset = output.offset, "Resuming partial download");
        session.reporter.mark_resumed_from(output.offset);
    }

    if let Some(outcome) = await_file_info(session, offer, output.offset).await? {
        return Ok(outcome);
    }

    let declared = match receive_chunks(ctx, session, offer, &key, &mut output).await? {
        Received::Complete(hash) => hash,
        Received::Ended(outcome) => return Ok(outcome),
    };

    output.file.flush().await.map_err(TransferError::io)?;
    output.file.sync_all().await.map_err(TransferError::io)?;
    let Output { file, hasher, .. } = output;
    drop(file);

    let local = hasher.finalize();
    let offered_matches = offer
        .hash
        .map_or(true, |offered| integrity::compare(&offered, &local));
    if !integrity::compare(&declared, &local) || !offered_matches {
        warn!(local = %local, declared = %declared, "Content hash mismatch");
        return Err(TransferError::IntegrityMismatch);
    }

    session.apply(Input::Finish)?;
    session.link.send(Message::Complete { hash: local }).await?;
    Ok(Outcome::Completed)
}

enum Verdict {
    Decided(Decision),
    Ended(Outcome),
}

/// Asks the accept hook while still listening for a CANCEL from either side.
async fn decide(
    ctx: &SessionContext,
    session: &mut Session,
    request: &TransferRequest,
) -> Result<Verdict, TransferError> {
    let hook = ctx.hooks.accept.clone();
    let req = request.clone();
    let decision = tokio::task::spawn_blocking(move || hook.accept_transfer(&req));
    tokio::pin!(decision);

    let deadline = Instant::now() + session.config.request_timeout;
    loop {
        tokio::select! {
            biased;
            decided = &mut decision => {
                let decision = decided.map_err(|e| TransferError::io(format!("accept hook: {e}")))?;
                return Ok(Verdict::Decided(decision));
            }
            event = session.next_event(Some(deadline), "accept decision") => match event? {
                Event::Command(cmd) => {
                    if let Some(outcome) = session.command(cmd).await? {
                        return Ok(Verdict::Ended(outcome));
                    }
                }
                Event::Frame(msg) => match session.on_frame(&msg)? {
                    Control::Done(outcome) => return Ok(Verdict::Ended(outcome)),
                    Control::Skip => {}
                    Control::Handle(_) => {
                        return Err(TransferError::violation(format!(
                            "unexpected {} before decision",
                            msg.kind()
                        )))
                    }
                },
            },
        }
    }
}

/// Opens the destination, resuming a previous partial download if the
/// ledger has one that still matches.
async fn open_destination(
    ctx: &SessionContext,
    request: &TransferRequest,
    key: &ResumeKey,
) -> Result<(PathBuf, Output), TransferError> {
    let offer = &request.offer;

    if let Some(point) = ctx.ledger.get(key) {
        if point.chunk_size == offer.chunk_size && point.offset <= offer.size {
            match reopen(&point).await {
                Ok(output) => return Ok((point.path, output)),
                Err(e) => {
                    warn!(path = %point.path.display(), error = %e, "Cannot resume partial file; starting over")
                }
            }
        }
        ctx.ledger.remove(key);
    }

    let resolver = ctx.hooks.save_path.clone();
    let req = request.clone();
    let path = tokio::task::spawn_blocking(move || resolver.resolve_save_path(&req))
        .await
        .map_err(|e| TransferError::io(format!("save path resolver: {e}")))?
        .map_err(TransferError::io)?;

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .await
        .map_err(TransferError::io)?;
    debug!(path = %path.display(), "Writing new file");

    Ok((
        path,
        Output {
            file,
            offset: 0,
            hasher: StreamingHasher::new(),
        },
    ))
}

async fn reopen(point: &ResumePoint) -> std::io::Result<Output> {
    let hasher = integrity::hash_prefix(&point.path, point.offset).await?;
    let mut file = OpenOptions::new().write(true).open(&point.path).await?;
    file.set_len(point.offset).await?;
    file.seek(SeekFrom::Start(point.offset)).await?;
    Ok(Output {
        file,
        offset: point.offset,
        hasher,
    })
}

/// Waits for FILE_INFO and checks it agrees with what was accepted.
async fn await_file_info(
    session: &mut Session,
    offer: &FileOffer,
    offset: u64,
) -> Result<Option<Outcome>, TransferError> {
    let deadline = Instant::now() + session.config.io_timeout;
    loop {
        match session.next_event(Some(deadline), "FILE_INFO").await? {
            Event::Command(cmd) => {
                if let Some(outcome) = session.command(cmd).await? {
                    return Ok(Some(outcome));
                }
            }
            Event::Frame(msg) => match session.on_frame(&msg)? {
                Control::Done(outcome) => return Ok(Some(outcome)),
                Control::Skip => {}
                Control::Handle(_) => match msg {
                    Message::FileInfo {
                        start_offset,
                        first_seq,
                        total_chunks,
                    } => {
                        let expected_seq = offset.div_ceil(u64::from(offer.chunk_size));
                        if start_offset != offset
                            || first_seq != expected_seq
                            || total_chunks != offer.total_chunks()
                        {
                            return Err(TransferError::violation(format!(
                                "FILE_INFO start {start_offset}/seq {first_seq}/chunks {total_chunks} \
                                 does not match accepted offset {offset}"
                            )));
                        }
                        return Ok(None);
                    }
                    other => {
                        return Err(TransferError::violation(format!(
                            "unexpected {} before FILE_INFO",
                            other.kind()
                        )))
                    }
                },
            },
        }
    }
}

enum Received {
    /// Every chunk arrived; carries the sender's declared hash.
    Complete(ContentHash),
    Ended(Outcome),
}

async fn receive_chunks(
    ctx: &SessionContext,
    session: &mut Session,
    offer: &FileOffer,
    key: &ResumeKey,
    output: &mut Output,
) -> Result<Received, TransferError> {
    let chunk = u64::from(offer.chunk_size);
    let total_chunks = offer.total_chunks();
    let io_timeout = session.config.io_timeout;
    let mut expected = output.offset.div_ceil(chunk);

    loop {
        let deadline =
            (session.state() == SessionState::Transferring).then(|| Instant::now() + io_timeout);
        let msg = match session.next_event(deadline, "DATA").await? {
            Event::Command(cmd) => {
                if let Some(outcome) = session.command(cmd).await? {
                    return Ok(Received::Ended(outcome));
                }
                continue;
            }
            Event::Frame(msg) => msg,
        };

        match session.on_frame(&msg)? {
            Control::Done(outcome) => return Ok(Received::Ended(outcome)),
            Control::Skip => {}
            Control::Handle(Step::Enter(SessionState::Completing)) => {
                let Message::Complete { hash } = msg else {
                    return Err(TransferError::violation("expected COMPLETE"));
                };
                if expected != total_chunks {
                    return Err(TransferError::violation(format!(
                        "COMPLETE after {expected} of {total_chunks} chunks"
                    )));
                }
                return Ok(Received::Complete(hash));
            }
            Control::Handle(_) => {
                let Message::Data { seq, payload } = msg else {
                    return Err(TransferError::violation(format!(
                        "unexpected {} while receiving",
                        msg.kind()
                    )));
                };
                if seq != expected {
                    return Err(TransferError::violation(format!(
                        "DATA seq {seq}, expected {expected}"
                    )));
                }
                if seq >= total_chunks {
                    return Err(TransferError::violation(format!(
                        "DATA seq {seq} beyond last chunk {}",
                        total_chunks.saturating_sub(1)
                    )));
                }
                let want = chunk.min(offer.size - seq * chunk);
                if payload.len() as u64 != want {
                    return Err(TransferError::violation(format!(
                        "DATA seq {seq} carries {} bytes, expected {want}",
                        payload.len()
                    )));
                }

                output
                    .file
                    .write_all(&payload)
                    .await
                    .map_err(TransferError::io)?;
                output.hasher.update(&payload);
                output.offset += want;
                expected += 1;

                session.link.send(Message::Ack { seq }).await?;
                ctx.ledger.advance(key, output.offset);
                session.reporter.progress(output.offset);
            }
        }
    }
}
