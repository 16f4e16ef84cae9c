//! Loopback nodes and scripted peers shared by the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use tempfile::TempDir;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use lanshare::net::{
    Announcement, ContentHash, DeviceIdentity, FileOffer, FrameCodec, Hooks, Message, NetConfig,
    TransferEvent, TransferId,
};
use lanshare::{AppState, Config};

pub const WAIT: Duration = Duration::from_secs(10);

/// A running node with its own scratch directory.
pub struct Node {
    pub app: AppState,
    pub dir: TempDir,
}

impl Node {
    pub async fn start(
        id: &str,
        targets: Vec<SocketAddr>,
        hooks: Option<Hooks>,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config {
            net: NetConfig::loopback(targets),
            ..Config::default()
        };
        config.discovery.interval = Duration::from_millis(100);
        config.transfer.download_dir = dir.path().join("downloads");
        config.transfer.chunk_size = 64 * 1024;
        config.transfer.cancel_grace = Duration::from_millis(500);
        tweak(&mut config);

        let identity = DeviceIdentity::new(id, format!("node {id}"));
        let app = AppState::start_with_identity(config, identity, hooks)
            .await
            .unwrap();
        Self { app, dir }
    }

    pub fn downloads(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Writes `len` random bytes to a file in the scratch directory.
    pub fn write_file(&self, name: &str, len: usize) -> (PathBuf, Vec<u8>) {
        let data = random_bytes(len);
        let path = self.dir.path().join(name);
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }
}

/// Starts `A` and `B` and waits until each has discovered the other.
pub async fn pair(tweak: impl Fn(&mut Config)) -> (Node, Node) {
    pair_with_hooks(None, tweak).await
}

pub async fn pair_with_hooks(b_hooks: Option<Hooks>, tweak: impl Fn(&mut Config)) -> (Node, Node) {
    let a = Node::start("dev-A", Vec::new(), None, &tweak).await;
    let b = Node::start("dev-B", vec![a.app.discovery_addr()], b_hooks, &tweak).await;

    assert!(a.app.wait_for_peer("dev-B", WAIT).await.is_some(), "A never saw B");
    assert!(b.app.wait_for_peer("dev-A", WAIT).await.is_some(), "B never saw A");
    (a, b)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Receives events until the terminal one for `id`.
pub async fn terminal_event(
    events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    id: Option<TransferId>,
) -> TransferEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if event.kind.is_terminal() && id.map_or(true, |id| id == event.id) {
                return event;
            }
        }
    })
    .await
    .expect("no terminal event")
}

/// A hand-driven peer speaking the transfer protocol.
pub type RawLink = Framed<TcpStream, FrameCodec>;

pub async fn connect(addr: SocketAddr) -> RawLink {
    Framed::new(TcpStream::connect(addr).await.unwrap(), FrameCodec)
}

pub async fn send(link: &mut RawLink, msg: Message) {
    link.send(msg).await.unwrap();
}

pub async fn recv(link: &mut RawLink) -> Message {
    tokio::time::timeout(WAIT, link.next())
        .await
        .expect("peer went quiet")
        .expect("connection closed")
        .unwrap()
}

pub fn offer_for(data: &[u8], name: &str, chunk_size: u32, sender_id: &str) -> FileOffer {
    let hash = ContentHash::of(data);
    FileOffer {
        file_id: hash.to_hex(),
        file_name: name.to_string(),
        size: data.len() as u64,
        chunk_size,
        hash: Some(hash),
        sender_id: sender_id.to_string(),
        sender_name: format!("raw {sender_id}"),
    }
}

/// Keeps a scripted device announced until dropped.
pub struct Announcer(tokio::task::JoinHandle<()>);

impl Drop for Announcer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Makes `target` see a scripted device whose transfers arrive at
/// `transfer_port`, re-announcing it faster than the liveness window.
pub async fn announce(target: &AppState, device_id: &str, transfer_port: u16) -> Announcer {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let announcement = Announcement {
        device_id: device_id.to_string(),
        device_name: format!("raw {device_id}"),
        discovery_port: socket.local_addr().unwrap().port(),
        transfer_port,
    };
    let frame = Message::Discover(announcement).to_bytes();
    let to = target.discovery_addr();
    let task = tokio::spawn(async move {
        loop {
            let _ = socket.send_to(&frame, to).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    assert!(
        target.wait_for_peer(device_id, WAIT).await.is_some(),
        "scripted peer was not discovered"
    );
    Announcer(task)
}

pub fn read_saved(dir: &Path, name: &str) -> Vec<u8> {
    std::fs::read(dir.join(name)).unwrap()
}
