//! Device identity and the two listening sockets.
//!
//! # Device Identity
//!
//! Each device has a random identifier stored at
//! `~/.config/lanshare/device_id`. It persists across restarts so peers keep
//! recognising the device, and so interrupted downloads from it can resume.
//!
//! # Sockets
//!
//! [`Endpoint::bind`] opens the UDP discovery socket (address reuse and
//! broadcast enabled through `socket2`) and the TCP transfer listener. A bind
//! failure on either is fatal and reported to the caller.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rand::RngCore;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, instrument};

/// Default configuration directory name
const CONFIG_DIR: &str = "lanshare";

/// Device id filename
const DEVICE_ID_FILE: &str = "device_id";

/// Environment variable overriding the configuration directory.
pub const CONFIG_DIR_ENV: &str = "LANSHARE_CONFIG_DIR";

pub const DEFAULT_DISCOVERY_PORT: u16 = 45678;
pub const DEFAULT_TRANSFER_PORT: u16 = 45679;

/// Cached config directory path
static CONFIG_DIR_CACHE: OnceCell<PathBuf> = OnceCell::new();

/// Errors that can occur during endpoint operations
#[derive(Error, Debug, Clone)]
pub enum EndpointError {
    /// Failed to create or access the configuration directory
    #[error("failed to access configuration directory: {0}")]
    ConfigDir(Arc<str>),

    /// Failed to read or write the device id
    #[error("failed to persist device id: {0}")]
    IdentityPersistence(Arc<str>),

    /// A listening socket could not be bound
    #[error("failed to bind {what} socket on {addr}: {reason}")]
    Bind {
        what: &'static str,
        addr: SocketAddr,
        reason: Arc<str>,
    },
}

impl EndpointError {
    /// Creates a new config dir error with an `Arc<str>` message
    #[inline]
    fn config_dir(msg: impl Into<String>) -> Self {
        Self::ConfigDir(Arc::from(msg.into()))
    }

    #[inline]
    fn identity(msg: impl Into<String>) -> Self {
        Self::IdentityPersistence(Arc::from(msg.into()))
    }

    #[inline]
    fn bind(what: &'static str, addr: SocketAddr, err: std::io::Error) -> Self {
        Self::Bind {
            what,
            addr,
            reason: Arc::from(err.to_string()),
        }
    }
}

/// Who this device is on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: Arc<str>,
    pub device_name: Arc<str>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<Arc<str>>, device_name: impl Into<Arc<str>>) -> Self {
        Self {
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }

    /// Loads the persisted device id from the config directory, creating it
    /// on first run. `name` overrides the host name.
    pub async fn load_or_create(name: Option<String>) -> Result<Self, EndpointError> {
        let dir = config_dir()?;
        Self::load_or_create_in(&dir, name).await
    }

    /// Like [`DeviceIdentity::load_or_create`] with an explicit directory.
    #[instrument(skip(name))]
    pub async fn load_or_create_in(dir: &Path, name: Option<String>) -> Result<Self, EndpointError> {
        let path = dir.join(DEVICE_ID_FILE);

        let device_id = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if is_valid_device_id(contents.trim()) => {
                debug!(path = %path.display(), "Loaded existing device id");
                contents.trim().to_owned()
            }
            Ok(_) => return Err(EndpointError::identity(format!("{} is corrupt", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = generate_device_id();
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| EndpointError::config_dir(format!("{}: {e}", dir.display())))?;
                tokio::fs::write(&path, format!("{id}\n"))
                    .await
                    .map_err(|e| EndpointError::identity(format!("{}: {e}", path.display())))?;
                info!(path = %path.display(), "Generated and saved new device identity");
                id
            }
            Err(e) => return Err(EndpointError::identity(format!("{}: {e}", path.display()))),
        };

        let device_name = name.unwrap_or_else(default_device_name);
        info!(device_id = %device_id, device_name = %device_name, "Device identity loaded");
        Ok(Self::new(device_id, device_name))
    }
}

/// Gets the path to the configuration directory (cached).
///
/// Respects `LANSHARE_CONFIG_DIR` for running several instances on one
/// machine.
pub fn config_dir() -> Result<PathBuf, EndpointError> {
    CONFIG_DIR_CACHE
        .get_or_try_init(|| {
            if let Ok(custom_dir) = std::env::var(CONFIG_DIR_ENV) {
                return Ok(PathBuf::from(custom_dir));
            }

            dirs::config_dir()
                .map(|p| p.join(CONFIG_DIR))
                .ok_or_else(|| EndpointError::config_dir("could not determine config directory"))
        })
        .cloned()
}

fn generate_device_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "lanshare-device".to_owned())
}

/// Addresses and ports the endpoint binds.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub bind_addr: IpAddr,
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// Where DISCOVER is broadcast; `None` picks the limited broadcast
    /// address plus the /24 directed broadcast of the local address.
    pub broadcast_targets: Option<Vec<SocketAddr>>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            broadcast_targets: None,
        }
    }
}

impl NetConfig {
    /// Loopback on ephemeral ports with explicit targets, for tests and
    /// several instances on one host.
    pub fn loopback(targets: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            discovery_port: 0,
            transfer_port: 0,
            broadcast_targets: Some(targets),
        }
    }
}

/// The device's identity and bound sockets.
#[derive(Debug)]
pub struct Endpoint {
    identity: DeviceIdentity,
    udp: Arc<UdpSocket>,
    /// Taken once by whoever runs the accept loop.
    listener: Mutex<Option<TcpListener>>,
    discovery_addr: SocketAddr,
    transfer_addr: SocketAddr,
}

impl Endpoint {
    /// Binds both sockets.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Bind`] if either port is unavailable.
    #[instrument(skip(identity), fields(device_id = %identity.device_id))]
    pub async fn bind(identity: DeviceIdentity, config: &NetConfig) -> Result<Self, EndpointError> {
        let udp_addr = SocketAddr::new(config.bind_addr, config.discovery_port);
        let udp = bind_discovery_socket(udp_addr).map_err(|e| EndpointError::bind("discovery", udp_addr, e))?;
        let discovery_addr = udp
            .local_addr()
            .map_err(|e| EndpointError::bind("discovery", udp_addr, e))?;

        let tcp_addr = SocketAddr::new(config.bind_addr, config.transfer_port);
        let listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|e| EndpointError::bind("transfer", tcp_addr, e))?;
        let transfer_addr = listener
            .local_addr()
            .map_err(|e| EndpointError::bind("transfer", tcp_addr, e))?;

        info!(
            discovery = %discovery_addr,
            transfer = %transfer_addr,
            "Endpoint bound"
        );

        Ok(Self {
            identity,
            udp: Arc::new(udp),
            listener: Mutex::new(Some(listener)),
            discovery_addr,
            transfer_addr,
        })
    }

    #[inline]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    #[inline]
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    /// Takes the transfer listener. Returns `None` after the first call.
    pub fn take_listener(&self) -> Option<TcpListener> {
        self.listener.lock().take()
    }

    /// Bound discovery address (actual port when 0 was requested).
    #[inline]
    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    #[inline]
    pub fn transfer_addr(&self) -> SocketAddr {
        self.transfer_addr
    }
}

fn bind_discovery_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}
