//! Local network discovery over UDP broadcast.
//!
//! Two background tasks share the discovery socket:
//! - the broadcaster announces this device with `DISCOVER` every interval,
//!   to the broadcast targets and to every peer already known, then evicts
//!   peers that stayed silent for the liveness window;
//! - the listener answers `DISCOVER` with `DISCOVER_RESPONSE` and records
//!   every announcement it hears from another device.
//!
//! [`Discovery::stop`] sends `GOODBYE` to the same destinations, and a
//! listener that hears one drops the sender at once instead of waiting out
//! the liveness window.
//!
//! Peer-set changes are published as [`PeerEvent`]s; readers only ever get
//! copies of the peer set.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::codec::{Announcement, Message};
use super::endpoint::{DeviceIdentity, Endpoint, NetConfig};
use super::events::EventBus;

/// Largest datagram the listener accepts.
const MAX_DATAGRAM: usize = 64 * 1024;

/// Default broadcast interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of missed announcements before a peer is evicted.
pub const DEFAULT_MISSED_CYCLES: u32 = 3;

/// Copies of `GOODBYE` sent to each destination on stop.
const GOODBYE_REPEATS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery service already started")]
    AlreadyStarted,

    #[error("discovery service has been stopped")]
    Stopped,
}

/// Timing of the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryConfig {
    pub interval: Duration,
    pub missed_cycles: u32,
}

impl DiscoveryConfig {
    /// How long a peer may stay silent before it is evicted.
    pub fn liveness(&self) -> Duration {
        self.interval * self.missed_cycles.max(1)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            missed_cycles: DEFAULT_MISSED_CYCLES,
        }
    }
}

/// Information about a discovered peer on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub device_id: Arc<str>,
    pub device_name: Arc<str>,
    /// Source address of the peer's last announcement.
    pub ip: IpAddr,
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// When the peer was last seen.
    pub last_seen: Instant,
}

impl DiscoveredPeer {
    fn from_announcement(ann: &Announcement, ip: IpAddr, now: Instant) -> Self {
        Self {
            device_id: Arc::from(ann.device_id.as_str()),
            device_name: Arc::from(ann.device_name.as_str()),
            ip,
            discovery_port: ann.discovery_port,
            transfer_port: ann.transfer_port,
            last_seen: now,
        }
    }

    #[inline]
    pub fn transfer_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.transfer_port)
    }

    #[inline]
    pub fn discovery_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.discovery_port)
    }

    /// True if everything but `last_seen` matches.
    fn same_attributes(&self, other: &Self) -> bool {
        self.device_name == other.device_name
            && self.ip == other.ip
            && self.discovery_port == other.discovery_port
            && self.transfer_port == other.transfer_port
    }
}

/// Events emitted when the peer set changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A new peer was discovered.
    Added(DiscoveredPeer),
    /// A known peer changed its name, address or ports.
    Updated(DiscoveredPeer),
    /// A peer said goodbye or was not heard from within the liveness window.
    Removed(DiscoveredPeer),
}

impl PeerEvent {
    pub fn peer(&self) -> &DiscoveredPeer {
        match self {
            Self::Added(peer) | Self::Updated(peer) | Self::Removed(peer) => peer,
        }
    }
}

/// The live peer set, keyed by device id.
#[derive(Debug, Default)]
struct PeerTable {
    peers: HashMap<Arc<str>, DiscoveredPeer>,
}

impl PeerTable {
    /// Records an announcement; returns the event it caused, if any.
    fn observe(&mut self, ann: &Announcement, ip: IpAddr, now: Instant) -> Option<PeerEvent> {
        let seen = DiscoveredPeer::from_announcement(ann, ip, now);
        match self.peers.get_mut(ann.device_id.as_str()) {
            Some(known) if known.same_attributes(&seen) => {
                known.last_seen = now;
                None
            }
            Some(known) => {
                *known = seen.clone();
                Some(PeerEvent::Updated(seen))
            }
            None => {
                self.peers.insert(seen.device_id.clone(), seen.clone());
                Some(PeerEvent::Added(seen))
            }
        }
    }

    /// Drops a peer that announced it is going offline.
    fn forget(&mut self, device_id: &str) -> Option<PeerEvent> {
        self.peers.remove(device_id).map(PeerEvent::Removed)
    }

    /// Removes every peer silent for longer than `window`.
    fn evict_stale(&mut self, now: Instant, window: Duration) -> Vec<PeerEvent> {
        let stale: Vec<Arc<str>> = self
            .peers
            .values()
            .filter(|peer| now.saturating_duration_since(peer.last_seen) > window)
            .map(|peer| peer.device_id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .map(PeerEvent::Removed)
            .collect()
    }
}

/// Discovery service: announces this device and tracks the others.
pub struct Discovery {
    identity: DeviceIdentity,
    socket: Arc<UdpSocket>,
    discovery_port: u16,
    transfer_port: u16,
    targets: Vec<SocketAddr>,
    config: DiscoveryConfig,
    peers: RwLock<PeerTable>,
    events: EventBus<PeerEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl Discovery {
    pub fn new(endpoint: &Endpoint, config: DiscoveryConfig, net: &NetConfig) -> Self {
        let discovery_port = endpoint.discovery_addr().port();
        let targets = net
            .broadcast_targets
            .clone()
            .unwrap_or_else(|| default_targets(discovery_port));

        info!(
            device_id = %endpoint.identity().device_id,
            interval_ms = config.interval.as_millis() as u64,
            targets = ?targets,
            "Discovery service initialized"
        );

        Self {
            identity: endpoint.identity().clone(),
            socket: endpoint.udp_socket(),
            discovery_port,
            transfer_port: endpoint.transfer_addr().port(),
            targets,
            config,
            peers: RwLock::new(PeerTable::default()),
            events: EventBus::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the broadcast and listen tasks.
    pub fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        if self.cancel.is_cancelled() {
            return Err(DiscoveryError::Stopped);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyStarted);
        }

        tokio::spawn(self.clone().broadcast_loop());
        tokio::spawn(self.clone().listen_loop());
        Ok(())
    }

    /// Stops both background tasks and, if they were running, says goodbye
    /// to the broadcast targets and every known peer. The peer set is kept
    /// as it was.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Stopping discovery");
        self.cancel.cancel();
        if self.started.load(Ordering::SeqCst) {
            self.say_goodbye();
        }
    }

    /// Best effort: each destination gets `GOODBYE_REPEATS` copies and
    /// nothing waits on the socket.
    fn say_goodbye(&self) {
        let frame = Message::Goodbye(self.announcement()).to_bytes();
        let destinations = self.destinations();
        debug!(destinations = destinations.len(), "Sending GOODBYE");
        for _ in 0..GOODBYE_REPEATS {
            for dest in &destinations {
                if let Err(e) = self.socket.try_send_to(&frame, *dest) {
                    debug!(dest = %dest, error = %e, "Failed to send GOODBYE");
                }
            }
        }
    }

    /// This device's announcement.
    pub fn announcement(&self) -> Announcement {
        Announcement {
            device_id: self.identity.device_id.to_string(),
            device_name: self.identity.device_name.to_string(),
            discovery_port: self.discovery_port,
            transfer_port: self.transfer_port,
        }
    }

    /// Returns a copy of every currently known peer.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.peers.read().peers.values().cloned().collect()
    }

    pub fn get_peer(&self, device_id: &str) -> Option<DiscoveredPeer> {
        self.peers.read().peers.get(device_id).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().peers.len()
    }

    /// Returns true if any peers have been discovered.
    #[inline]
    pub fn has_peers(&self) -> bool {
        self.peer_count() > 0
    }

    /// Subscribes to peer-set changes from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Waits until `device_id` is in the peer set, at most `timeout`.
    pub async fn wait_for_peer(&self, device_id: &str, timeout: Duration) -> Option<DiscoveredPeer> {
        let mut events = self.subscribe();
        if let Some(peer) = self.get_peer(device_id) {
            return Some(peer);
        }

        let wait = async {
            while let Some(event) = events.recv().await {
                if let PeerEvent::Added(peer) | PeerEvent::Updated(peer) = event {
                    if &*peer.device_id == device_id {
                        return Some(peer);
                    }
                }
            }
            None
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    #[instrument(skip(self), fields(device_id = %self.identity.device_id))]
    async fn broadcast_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.announce().await;
            self.sweep(Instant::now());
        }
        debug!("Broadcast loop stopped");
    }

    /// The broadcast targets plus every known peer's discovery address.
    fn destinations(&self) -> Vec<SocketAddr> {
        let mut destinations = self.targets.clone();
        for peer in self.peers() {
            let addr = peer.discovery_addr();
            if !destinations.contains(&addr) {
                destinations.push(addr);
            }
        }
        destinations
    }

    /// Sends DISCOVER to the broadcast targets and every known peer.
    async fn announce(&self) {
        let frame = Message::Discover(self.announcement()).to_bytes();
        for dest in self.destinations() {
            match self.socket.send_to(&frame, dest).await {
                Ok(_) => trace!(dest = %dest, "Sent DISCOVER"),
                Err(e) => debug!(dest = %dest, error = %e, "Failed to send DISCOVER"),
            }
        }
    }

    fn sweep(&self, now: Instant) {
        let removed = self.peers.write().evict_stale(now, self.config.liveness());
        for event in removed {
            info!(peer = %event.peer().device_id, name = %event.peer().device_name, "Peer lost");
            self.events.emit(event);
        }
    }

    #[instrument(skip(self), fields(device_id = %self.identity.device_id))]
    async fn listen_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => self.handle_datagram(&buf[..len], src).await,
                Err(e) => {
                    warn!(error = %e, "Discovery receive failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!("Listen loop stopped");
    }

    async fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let (ann, reply) = match Message::decode(data) {
            Ok(Message::Discover(ann)) => (ann, true),
            Ok(Message::DiscoverResponse(ann)) => (ann, false),
            Ok(Message::Goodbye(ann)) => {
                self.handle_goodbye(&ann, src);
                return;
            }
            Ok(other) => {
                debug!(src = %src, kind = %other.kind(), "Ignoring non-discovery frame");
                return;
            }
            Err(e) => {
                debug!(src = %src, error = %e, "Dropping malformed datagram");
                return;
            }
        };

        if *ann.device_id == *self.identity.device_id {
            trace!("Ignoring own announcement");
            return;
        }

        let event = self.peers.write().observe(&ann, src.ip(), Instant::now());
        if let Some(event) = event {
            match &event {
                PeerEvent::Added(peer) => {
                    info!(peer = %peer.device_id, name = %peer.device_name, addr = %peer.transfer_addr(), "Peer discovered")
                }
                PeerEvent::Updated(peer) => {
                    info!(peer = %peer.device_id, name = %peer.device_name, addr = %peer.transfer_addr(), "Peer updated")
                }
                PeerEvent::Removed(_) => {}
            }
            self.events.emit(event);
        }

        if reply {
            let port = match ann.discovery_port {
                0 => src.port(),
                port => port,
            };
            let dest = SocketAddr::new(src.ip(), port);
            let frame = Message::DiscoverResponse(self.announcement()).to_bytes();
            if let Err(e) = self.socket.send_to(&frame, dest).await {
                debug!(dest = %dest, error = %e, "Failed to send DISCOVER_RESPONSE");
            }
        }
    }

    fn handle_goodbye(&self, ann: &Announcement, src: SocketAddr) {
        if *ann.device_id == *self.identity.device_id {
            return;
        }
        // Repeated copies find the peer already gone and emit nothing.
        let Some(event) = self.peers.write().forget(&ann.device_id) else {
            trace!(src = %src, peer = %ann.device_id, "GOODBYE from unknown peer");
            return;
        };
        info!(peer = %event.peer().device_id, name = %event.peer().device_name, "Peer went offline");
        self.events.emit(event);
    }
}

/// Limited broadcast plus the /24 directed broadcast of the primary
/// local address, when one can be found.
fn default_targets(port: u16) -> Vec<SocketAddr> {
    let mut targets = vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port)];
    if let Some(local) = primary_ipv4() {
        let directed = SocketAddr::new(IpAddr::V4(directed_broadcast(local)), port);
        if !targets.contains(&directed) {
            targets.push(directed);
        }
    }
    targets
}

/// The address the OS would route outbound traffic from. No packet is sent.
fn primary_ipv4() -> Option<Ipv4Addr> {
    let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect((Ipv4Addr::new(10, 255, 255, 255), 1)).ok()?;
    match probe.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

fn directed_broadcast(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}
