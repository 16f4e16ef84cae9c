//! Error taxonomy for transfer sessions and the transfer manager.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use super::codec::{CodecError, ErrorCode};

/// Errors that end a transfer session or refuse to start one.
///
/// Values are `Clone` so they can be carried inside lifecycle events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("malformed frame: {0}")]
    MalformedFrame(Arc<str>),

    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    #[error("protocol violation: {0}")]
    ProtocolViolation(Arc<str>),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("peer unknown: {0}")]
    PeerUnknown(Arc<str>),

    #[error("peer busy: a transfer of {0} is already active")]
    PeerBusy(Arc<str>),

    #[error("integrity mismatch: content hash does not match")]
    IntegrityMismatch,

    #[error("connection lost: {0}")]
    ConnectionLost(Arc<str>),

    #[error("i/o failure: {0}")]
    IoFailure(Arc<str>),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    /// The peer reported an error this side has no more specific variant for.
    #[error("peer reported error: {0}")]
    Remote(Arc<str>),

    #[error("transfer manager is shut down")]
    Shutdown,
}

impl TransferError {
    #[inline]
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(Arc::from(msg.into()))
    }

    #[inline]
    pub fn io(err: impl std::fmt::Display) -> Self {
        Self::IoFailure(Arc::from(err.to_string()))
    }

    #[inline]
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(Arc::from(msg.into()))
    }

    /// True for interruptions that leave a partial download worth resuming.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout(_))
    }

    /// Code sent to the peer in an `ERROR` frame for this failure.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::IntegrityMismatch => ErrorCode::IntegrityMismatch,
            Self::ProtocolViolation(_) | Self::MalformedFrame(_) | Self::UnknownMessageType(_) => {
                ErrorCode::ProtocolViolation
            }
            Self::IoFailure(_) | Self::FileNotFound(_) => ErrorCode::IoFailure,
            Self::PeerBusy(_) => ErrorCode::Busy,
            _ => ErrorCode::Other,
        }
    }

    /// Maps an `ERROR` frame received from the peer.
    pub fn from_wire(code: ErrorCode, message: &str) -> Self {
        match code {
            ErrorCode::IntegrityMismatch => Self::IntegrityMismatch,
            ErrorCode::ProtocolViolation => Self::violation(format!("peer: {message}")),
            ErrorCode::IoFailure => Self::IoFailure(Arc::from(format!("peer: {message}"))),
            ErrorCode::Busy => Self::PeerBusy(Arc::from(message)),
            ErrorCode::Other => Self::Remote(Arc::from(message)),
        }
    }
}

impl From<CodecError> for TransferError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedFrame(msg) => Self::MalformedFrame(msg),
            CodecError::UnknownMessageType(tag) => Self::UnknownMessageType(tag),
            CodecError::Io(msg) => Self::ConnectionLost(msg),
        }
    }
}
