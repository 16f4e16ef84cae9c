//! Networking for lanshare.
//!
//! - **Endpoint**: device identity and the two listening sockets
//! - **Discovery**: UDP broadcast announcements and the live peer set
//! - **Codec**: the frame format shared by discovery and transfers
//! - **Session**: the per-transfer state machine, run by the sender and
//!   receiver roles over one TCP connection
//! - **Transfer**: the manager that admits, tracks and reports sessions
//! - **Integrity**: SHA-256 content hashes
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lanshare::net::{DeviceIdentity, Discovery, DiscoveryConfig, Endpoint, Hooks, NetConfig, TransferConfig, TransferManager};
//!
//! let net = NetConfig::default();
//! let identity = DeviceIdentity::load_or_create(None).await?;
//! let endpoint = Endpoint::bind(identity.clone(), &net).await?;
//!
//! let discovery = Arc::new(Discovery::new(&endpoint, DiscoveryConfig::default(), &net));
//! discovery.start()?;
//!
//! let config = TransferConfig::default();
//! let hooks = Hooks::auto_accept(config.download_dir.clone());
//! let manager = TransferManager::new(identity, config, discovery, hooks);
//! ```

pub mod codec;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod hooks;
pub mod integrity;
mod receiver;
pub mod resume;
mod sender;
pub mod session;
pub mod transfer;

pub use codec::{Announcement, CodecError, ErrorCode, FileOffer, FrameCodec, Message, MessageKind};
pub use discovery::{DiscoveredPeer, Discovery, DiscoveryConfig, DiscoveryError, PeerEvent};
pub use endpoint::{DeviceIdentity, Endpoint, EndpointError, NetConfig};
pub use error::TransferError;
pub use hooks::{AcceptTransfer, AutoAccept, Decision, DownloadDir, Hooks, ResolveSavePath};
pub use integrity::ContentHash;
pub use resume::{ResumeKey, ResumeLedger, ResumePoint};
pub use session::{SessionState, TransferDirection, TransferRequest};
pub use transfer::{
    TransferConfig, TransferEvent, TransferEventKind, TransferHandle, TransferId, TransferManager,
    TransferProgress,
};
