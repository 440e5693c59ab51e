//! Error taxonomy.
//!
//! Connectivity errors are fatal to a relay connection, handshake errors are
//! surfaced to the initiator, transfer errors abort a single session and
//! storage errors are resolved by wiping the persisted store.

use thiserror::Error;

/// Relay admission and socket-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectivityError {
    #[error("connection not allowed from {0}")]
    NotAllowed(String),
    #[error("origin '{0}' is not allowed")]
    OriginNotAllowed(String),
    #[error("relay is at capacity ({0} connections)")]
    AtCapacity(usize),
    #[error("relay connection closed")]
    Closed,
    #[error("failed to reach relay at {url} after {attempts} attempts: {reason}")]
    Unreachable {
        url: String,
        attempts: u32,
        reason: String,
    },
}

/// Failures while negotiating a transfer and a direct peer channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("file transfer request timed out")]
    RequestTimeout,
    #[error("file transfer was rejected")]
    TransferRejected,
    #[error("peer connection failed after {attempts} attempts")]
    ConnectionFailed { attempts: u32 },
    #[error("a request to {0} is already pending")]
    AlreadyPending(String),
    #[error("handshake cancelled")]
    Cancelled,
    #[error("relay unavailable")]
    RelayUnavailable,
    #[error("relay error: {0}")]
    Relay(String),
}

/// Failures that abort one transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk processing error: {0}")]
    ChunkProcessing(String),
    #[error("data channel is not available")]
    ChannelUnavailable,
    #[error("file size {size} exceeds the maximum allowed size of {max} bytes")]
    Oversize { size: u64, max: u64 },
    #[error("another transfer is already active")]
    Busy,
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of the durable session store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("persisted transfer state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("invalid session id '{0}'")]
    InvalidSessionId(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the peer capability interface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel closed")]
    Closed,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

/// Any error a client-side operation can end with.
#[derive(Debug, Error)]
pub enum LanshareError {
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl LanshareError {
    /// Stable machine-readable code used in error-log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Connectivity(_) => "CONNECTIVITY_ERROR",
            Self::Handshake(HandshakeError::RequestTimeout) => "REQUEST_TIMEOUT",
            Self::Handshake(HandshakeError::TransferRejected) => "TRANSFER_REJECTED",
            Self::Handshake(HandshakeError::ConnectionFailed { .. }) => "CONNECTION_FAILED",
            Self::Handshake(_) => "HANDSHAKE_ERROR",
            Self::Transfer(TransferError::ChunkProcessing(_)) => "CHUNK_PROCESSING_ERROR",
            Self::Transfer(TransferError::Oversize { .. }) => "FILE_TOO_LARGE",
            Self::Transfer(TransferError::ChecksumMismatch { .. }) => "CHECKSUM_MISMATCH",
            Self::Transfer(_) => "FILE_SEND_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Channel(_) => "DATA_CHANNEL_ERROR",
        }
    }
}
