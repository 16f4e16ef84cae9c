//! Integration tests: one real node against a peer scripted frame by frame.

mod common;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use common::{announce, connect, offer_for, random_bytes, read_saved, recv, send, terminal_event, Node, RawLink, WAIT};
use lanshare::net::{
    ContentHash, ErrorCode, FileOffer, FrameCodec, Message, SessionState, TransferError,
    TransferEventKind,
};

/// Reads the request a node opens a transfer with.
async fn expect_request(link: &mut RawLink) -> FileOffer {
    match recv(link).await {
        Message::TransferRequest(offer) => offer,
        other => panic!("expected TRANSFER_REQUEST, got {other:?}"),
    }
}

/// Sends a request, retrying while the node still holds the previous session.
async fn request_until_admitted(addr: SocketAddr, offer: &FileOffer) -> (RawLink, u64) {
    for _ in 0..50 {
        let mut link = connect(addr).await;
        send(&mut link, Message::TransferRequest(offer.clone())).await;
        match recv(&mut link).await {
            Message::TransferAccept { resume_offset } => return (link, resume_offset),
            Message::Error {
                code: ErrorCode::Busy,
                ..
            } => tokio::time::sleep(Duration::from_millis(50)).await,
            other => panic!("unexpected reply {other:?}"),
        }
    }
    panic!("node stayed busy");
}

/// Receives DATA until `count` chunks arrived, acknowledging each.
async fn take_chunks(link: &mut RawLink, received: &mut Vec<u8>, next_seq: &mut u64, count: u64) {
    for _ in 0..count {
        match recv(link).await {
            Message::Data { seq, payload } => {
                assert_eq!(seq, *next_seq);
                received.extend_from_slice(&payload);
                send(link, Message::Ack { seq }).await;
                *next_seq += 1;
            }
            other => panic!("expected DATA, got {other:?}"),
        }
    }
}

// ==================== Sender Role ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sender_emits_one_data_frame_per_chunk() {
    let chunk = 64 * 1024;
    let a = Node::start("dev-A", Vec::new(), None, |c| c.transfer.chunk_size = chunk).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let _peer = announce(&a.app, "dev-raw", listener.local_addr().unwrap().port()).await;
    let (path, data) = a.write_file("odd.bin", 3 * chunk as usize + 1000);

    let sender = {
        let app = a.app.clone();
        tokio::spawn(async move { app.send_and_wait("dev-raw", &[path]).await })
    };

    let (stream, _) = listener.accept().await.unwrap();
    let mut link = Framed::new(stream, FrameCodec);
    let offer = expect_request(&mut link).await;
    assert_eq!(offer.size, data.len() as u64);
    assert_eq!(offer.chunk_size, chunk);
    assert_eq!(offer.file_name, "odd.bin");
    assert_eq!(offer.sender_id, "dev-A");
    assert_eq!(offer.hash, Some(ContentHash::of(&data)));

    send(&mut link, Message::TransferAccept { resume_offset: 0 }).await;
    assert_eq!(
        recv(&mut link).await,
        Message::FileInfo {
            start_offset: 0,
            first_seq: 0,
            total_chunks: 4
        }
    );

    let mut received = Vec::new();
    let mut next_seq = 0;
    take_chunks(&mut link, &mut received, &mut next_seq, 4).await;
    let Message::Complete { hash } = recv(&mut link).await else {
        panic!("expected COMPLETE");
    };
    assert_eq!(hash, ContentHash::of(&received));
    send(&mut link, Message::Complete { hash }).await;

    let results = sender.await.unwrap().unwrap();
    assert!(results[0].is_complete(), "{:?}", results[0]);
    assert_eq!(received, data);
    a.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_holds_data_until_resume() {
    let chunk = 16 * 1024;
    let a = Node::start("dev-A", Vec::new(), None, |c| {
        c.transfer.chunk_size = chunk;
        c.transfer.ack_window = 4;
    })
    .await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let _peer = announce(&a.app, "dev-raw", listener.local_addr().unwrap().port()).await;
    let (path, data) = a.write_file("paused.bin", 10 * chunk as usize);
    let mut events = a.app.subscribe_transfers();

    let handles = a.app.send_files("dev-raw", &[path]).await.unwrap();
    let handle = handles[0].clone();

    let (stream, _) = listener.accept().await.unwrap();
    let mut link = Framed::new(stream, FrameCodec);
    expect_request(&mut link).await;
    send(&mut link, Message::TransferAccept { resume_offset: 0 }).await;
    assert!(matches!(recv(&mut link).await, Message::FileInfo { .. }));

    // Pause before acknowledging anything, so at most one window is out.
    let mut received = Vec::new();
    let Message::Data { seq: 0, payload } = recv(&mut link).await else {
        panic!("expected DATA 0");
    };
    received.extend_from_slice(&payload);
    send(&mut link, Message::Pause).await;
    send(&mut link, Message::Ack { seq: 0 }).await;

    let mut next_seq = 1;
    loop {
        match tokio::time::timeout(Duration::from_millis(400), link.next()).await {
            Err(_) => break,
            Ok(Some(Ok(Message::Data { seq, payload }))) => {
                assert_eq!(seq, next_seq);
                received.extend_from_slice(&payload);
                send(&mut link, Message::Ack { seq }).await;
                next_seq += 1;
            }
            Ok(other) => panic!("unexpected while paused: {other:?}"),
        }
    }
    assert!(next_seq <= 4, "sent {next_seq} chunks past the pause");
    assert_eq!(handle.state(), SessionState::Paused);
    let held = handle.progress().transferred_bytes;
    assert_eq!(held, next_seq * u64::from(chunk));

    send(&mut link, Message::Resume).await;
    let remaining = 10 - next_seq;
    take_chunks(&mut link, &mut received, &mut next_seq, remaining).await;
    let Message::Complete { hash } = recv(&mut link).await else {
        panic!("expected COMPLETE");
    };
    send(&mut link, Message::Complete { hash }).await;

    let done = terminal_event(&mut events, Some(handle.id())).await;
    assert_eq!(done.kind, TransferEventKind::Completed);
    assert_eq!(received, data);
    assert_eq!(handle.progress().transferred_bytes, data.len() as u64);
    a.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_confirmation_hash_fails_sender() {
    let a = Node::start("dev-A", Vec::new(), None, |c| c.transfer.chunk_size = 1024).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let _peer = announce(&a.app, "dev-raw", listener.local_addr().unwrap().port()).await;
    let (path, _) = a.write_file("small.bin", 2048);

    let sender = {
        let app = a.app.clone();
        tokio::spawn(async move { app.send_and_wait("dev-raw", &[path]).await })
    };

    let (stream, _) = listener.accept().await.unwrap();
    let mut link = Framed::new(stream, FrameCodec);
    expect_request(&mut link).await;
    send(&mut link, Message::TransferAccept { resume_offset: 0 }).await;
    assert!(matches!(recv(&mut link).await, Message::FileInfo { .. }));
    let mut sink = Vec::new();
    let mut next_seq = 0;
    take_chunks(&mut link, &mut sink, &mut next_seq, 2).await;
    assert!(matches!(recv(&mut link).await, Message::Complete { .. }));
    send(
        &mut link,
        Message::Complete {
            hash: ContentHash::of(b"something else"),
        },
    )
    .await;

    let results = sender.await.unwrap().unwrap();
    assert_eq!(results[0].state, SessionState::Failed);
    assert_eq!(results[0].error, Some(TransferError::IntegrityMismatch));
    assert!(matches!(
        recv(&mut link).await,
        Message::Error {
            code: ErrorCode::IntegrityMismatch,
            ..
        }
    ));
    a.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn withheld_ack_times_out_sender_without_error_frame() {
    let a = Node::start("dev-A", Vec::new(), None, |c| {
        c.transfer.chunk_size = 1024;
        c.transfer.ack_window = 1;
        c.transfer.ack_timeout = Duration::from_millis(600);
    })
    .await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let _peer = announce(&a.app, "dev-raw", listener.local_addr().unwrap().port()).await;
    let (path, _) = a.write_file("stuck.bin", 4096);

    let sender = {
        let app = a.app.clone();
        tokio::spawn(async move { app.send_and_wait("dev-raw", &[path]).await })
    };

    let (stream, _) = listener.accept().await.unwrap();
    let mut link = Framed::new(stream, FrameCodec);
    expect_request(&mut link).await;
    send(&mut link, Message::TransferAccept { resume_offset: 0 }).await;
    assert!(matches!(recv(&mut link).await, Message::FileInfo { .. }));
    assert!(matches!(recv(&mut link).await, Message::Data { seq: 0, .. }));
    let sent_at = Instant::now();

    // Keep the sender busy with ignored duplicates instead of an ACK.
    let mut nudge = tokio::time::interval(Duration::from_millis(100));
    let mut after = Vec::new();
    loop {
        tokio::select! {
            _ = nudge.tick() => {
                let _ = link.send(Message::TransferAccept { resume_offset: 0 }).await;
            }
            frame = link.next() => match frame {
                Some(Ok(msg)) => after.push(msg),
                Some(Err(_)) | None => break,
            },
        }
        assert!(sent_at.elapsed() < WAIT, "sender never gave up on the ACK");
    }
    let waited = sent_at.elapsed();

    let results = sender.await.unwrap().unwrap();
    assert_eq!(results[0].error, Some(TransferError::Timeout("ACK")));
    assert!(waited < Duration::from_secs(3), "gave up after {waited:?}");
    assert!(
        !after.iter().any(|m| matches!(m, Message::Error { .. })),
        "timeout was reported over the wire: {after:?}"
    );
    a.app.shutdown();
}

// ==================== Receiver Role ====================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn out_of_sequence_data_fails_receiver() {
    let b = Node::start("dev-B", Vec::new(), None, |_| {}).await;
    let mut events = b.app.subscribe_transfers();
    let data = random_bytes(4096);
    let offer = offer_for(&data, "seq.bin", 1024, "dev-raw");

    let mut link = connect(b.app.transfer_addr()).await;
    send(&mut link, Message::TransferRequest(offer)).await;
    assert_eq!(recv(&mut link).await, Message::TransferAccept { resume_offset: 0 });
    send(
        &mut link,
        Message::FileInfo {
            start_offset: 0,
            first_seq: 0,
            total_chunks: 4,
        },
    )
    .await;
    send(
        &mut link,
        Message::Data {
            seq: 1,
            payload: data[1024..2048].to_vec().into(),
        },
    )
    .await;

    assert!(matches!(
        recv(&mut link).await,
        Message::Error {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    ));
    let closed = tokio::time::timeout(WAIT, link.next()).await.unwrap();
    assert!(closed.is_none(), "connection still open: {closed:?}");

    let done = terminal_event(&mut events, None).await;
    assert!(
        matches!(
            done.kind,
            TransferEventKind::Failed {
                reason: TransferError::ProtocolViolation(_)
            }
        ),
        "{done:?}"
    );
    assert!(!b.downloads().join("seq.bin").exists());
    assert!(b.app.transfer_manager().resume_ledger().is_empty());
    b.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interrupted_download_resumes_from_last_ack() {
    let b = Node::start("dev-B", Vec::new(), None, |_| {}).await;
    let mut events = b.app.subscribe_transfers();
    let data = random_bytes(4 * 1024);
    let offer = offer_for(&data, "resume.bin", 1024, "dev-raw");

    // First attempt: two chunks, then the connection drops.
    let (mut link, offset) = request_until_admitted(b.app.transfer_addr(), &offer).await;
    assert_eq!(offset, 0);
    send(
        &mut link,
        Message::FileInfo {
            start_offset: 0,
            first_seq: 0,
            total_chunks: 4,
        },
    )
    .await;
    for seq in 0..2u64 {
        let start = seq as usize * 1024;
        send(
            &mut link,
            Message::Data {
                seq,
                payload: data[start..start + 1024].to_vec().into(),
            },
        )
        .await;
        assert_eq!(recv(&mut link).await, Message::Ack { seq });
    }
    drop(link);

    let first = terminal_event(&mut events, None).await;
    assert!(
        matches!(
            first.kind,
            TransferEventKind::Failed {
                reason: TransferError::ConnectionLost(_)
            }
        ),
        "{first:?}"
    );
    assert_eq!(b.app.transfer_manager().resume_ledger().len(), 1);
    assert!(b.downloads().join("resume.bin").exists());

    // Second attempt picks up after the acknowledged chunks.
    let (mut link, offset) = request_until_admitted(b.app.transfer_addr(), &offer).await;
    assert_eq!(offset, 2048);
    send(
        &mut link,
        Message::FileInfo {
            start_offset: 2048,
            first_seq: 2,
            total_chunks: 4,
        },
    )
    .await;
    for seq in 2..4u64 {
        let start = seq as usize * 1024;
        send(
            &mut link,
            Message::Data {
                seq,
                payload: data[start..start + 1024].to_vec().into(),
            },
        )
        .await;
        assert_eq!(recv(&mut link).await, Message::Ack { seq });
    }
    let hash = ContentHash::of(&data);
    send(&mut link, Message::Complete { hash }).await;
    assert_eq!(recv(&mut link).await, Message::Complete { hash });

    let second = terminal_event(&mut events, None).await;
    assert_eq!(second.kind, TransferEventKind::Completed);
    assert_eq!(read_saved(&b.downloads(), "resume.bin"), data);
    assert!(b.app.transfer_manager().resume_ledger().is_empty());
    b.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_sender_leaves_resumable_partial() {
    let b = Node::start("dev-B", Vec::new(), None, |c| {
        c.transfer.io_timeout = Duration::from_millis(500);
    })
    .await;
    let mut events = b.app.subscribe_transfers();
    let data = random_bytes(4 * 1024);
    let offer = offer_for(&data, "stalled.bin", 1024, "dev-raw");

    let mut link = connect(b.app.transfer_addr()).await;
    send(&mut link, Message::TransferRequest(offer)).await;
    assert_eq!(recv(&mut link).await, Message::TransferAccept { resume_offset: 0 });
    send(
        &mut link,
        Message::FileInfo {
            start_offset: 0,
            first_seq: 0,
            total_chunks: 4,
        },
    )
    .await;
    send(
        &mut link,
        Message::Data {
            seq: 0,
            payload: data[..1024].to_vec().into(),
        },
    )
    .await;
    assert_eq!(recv(&mut link).await, Message::Ack { seq: 0 });

    // Go quiet with the connection still open.
    let closed = tokio::time::timeout(WAIT, link.next()).await.unwrap();
    assert!(
        !matches!(closed, Some(Ok(Message::Error { .. }))),
        "timeout was reported over the wire: {closed:?}"
    );

    let done = terminal_event(&mut events, None).await;
    assert_eq!(
        done.kind,
        TransferEventKind::Failed {
            reason: TransferError::Timeout("DATA")
        }
    );
    assert!(b.downloads().join("stalled.bin").exists());
    assert_eq!(b.app.transfer_manager().resume_ledger().len(), 1);
    b.app.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_incoming_request_is_busy() {
    let b = Node::start("dev-B", Vec::new(), None, |_| {}).await;
    let mut events = b.app.subscribe_transfers();
    let data = random_bytes(3000);
    let offer = offer_for(&data, "dup.bin", 1024, "dev-raw");

    let mut first = connect(b.app.transfer_addr()).await;
    send(&mut first, Message::TransferRequest(offer.clone())).await;
    assert_eq!(recv(&mut first).await, Message::TransferAccept { resume_offset: 0 });

    let mut second = connect(b.app.transfer_addr()).await;
    send(&mut second, Message::TransferRequest(offer)).await;
    assert!(matches!(
        recv(&mut second).await,
        Message::Error {
            code: ErrorCode::Busy,
            ..
        }
    ));

    send(&mut first, Message::Cancel).await;
    let done = terminal_event(&mut events, None).await;
    assert_eq!(done.kind, TransferEventKind::Cancelled);
    assert!(!b.downloads().join("dup.bin").exists());
    b.app.shutdown();
}

#[tokio::test]
async fn truncated_request_frame_is_refused() {
    let b = Node::start("dev-B", Vec::new(), None, |_| {}).await;

    let mut stream = TcpStream::connect(b.app.transfer_addr()).await.unwrap();
    // TRANSFER_REQUEST header announcing 100 bytes, followed by only 10.
    stream.write_all(&[0x10, 0, 0, 0, 100]).await.unwrap();
    stream.write_all(&[0u8; 10]).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut link = Framed::new(stream, FrameCodec);
    assert!(matches!(
        recv(&mut link).await,
        Message::Error {
            code: ErrorCode::ProtocolViolation,
            ..
        }
    ));
    assert!(b.app.transfer_manager().all_transfers().is_empty());
    b.app.shutdown();
}
