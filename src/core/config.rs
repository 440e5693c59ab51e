//! Centralized configuration constants for lanshare.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame header width, message
//! tags) stay in their respective modules.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in KiB when `TRANSFER_CHUNK_SIZE` is not set.
pub const DEFAULT_CHUNK_SIZE_KIB: usize = 1024;

/// Smallest chunk size accepted (16 KiB). Smaller values are raised to this.
pub const MIN_CHUNK_SIZE: usize = 16 * 1024;

/// Largest chunk size accepted (16 MiB). Must stay below
/// [`SCTP_MAX_MESSAGE_SIZE`] minus framing overhead.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Files at or above this size are refused before any handshake starts.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Outbound buffer threshold for the data channel (512 KiB).
///
/// No chunk is sent while `buffered_amount` exceeds this value; the same
/// value is installed as the channel's low-buffer threshold so the
/// low-buffer callback fires exactly when sending may continue.
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = 512 * 1024;

/// While paused on backpressure, re-read `buffered_amount` at this interval
/// even if no low-buffer callback arrives.
pub const BACKPRESSURE_RECHECK: Duration = Duration::from_secs(1);

// ── Handshake ────────────────────────────────────────────────────────────────

/// Time a `file-request` may wait for `file-accepted` / `file-rejected`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Time one connection attempt may take to reach an open data channel.
pub const CONNECTION_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between failed connection attempts.
pub const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Connection attempts before the handshake fails with `ConnectionFailed`.
pub const CONNECTION_MAX_ATTEMPTS: u32 = 3;

// ── Connection / Network ─────────────────────────────────────────────────────

/// Label of the single file-transfer data channel.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

/// Retransmissions per message on the ordered, partially reliable channel.
pub const DATA_CHANNEL_MAX_RETRANSMITS: u16 = 3;

/// SCTP max message size advertised and used for sending.
/// Leaves room for the largest chunk plus its metadata header.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 17 * 1024 * 1024;

// ── Liveness ─────────────────────────────────────────────────────────────────

/// Relay → client WebSocket ping interval.
pub const RELAY_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Client → relay `ping` message interval (also drives status events).
pub const CLIENT_PING_INTERVAL: Duration = Duration::from_secs(5);

/// Attempts to (re)connect to the relay before giving up.
pub const RELAY_CONNECT_MAX_ATTEMPTS: u32 = 3;

/// Delay between relay connection attempts.
pub const RELAY_CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

// ── Relay ────────────────────────────────────────────────────────────────────

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;
pub const DEFAULT_SECRET_KEY: &str = "development_secret";

/// Longest display name the relay stores; longer nicknames are truncated.
pub const MAX_NICKNAME_LEN: usize = 64;

/// Length of the generated base-36 device id.
pub const DEVICE_ID_LEN: usize = 6;

// ── Storage ──────────────────────────────────────────────────────────────────

/// Persisted sessions older than this are purged on load (not configurable).
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

// ── Diagnostics ──────────────────────────────────────────────────────────────

/// Transfer-log entries retained in memory.
pub const MAX_TRANSFER_LOGS: usize = 50;

/// Error-log entries retained in memory.
pub const MAX_ERROR_LOGS: usize = 100;

/// Convert a chunk size given in KiB to bytes, clamped to
/// [`MIN_CHUNK_SIZE`]..=[`MAX_CHUNK_SIZE`].
pub fn chunk_size_from_kib(kib: usize) -> usize {
    kib.saturating_mul(1024).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Whether the relay runs behind a trusted proxy or on a developer machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentMode {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for DeploymentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "test" => Ok(Self::Development),
            other => Err(anyhow::anyhow!("unknown deployment mode '{other}'")),
        }
    }
}

/// Runtime configuration of the signaling relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    /// Allowed `Origin` values. Empty means any origin.
    pub cors_origins: Vec<String>,
    /// Placeholder; nothing is signed or encrypted with it.
    pub secret_key: String,
    pub mode: DeploymentMode,
    pub ping_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            cors_origins: Vec::new(),
            secret_key: DEFAULT_SECRET_KEY.to_string(),
            mode: DeploymentMode::Development,
            ping_interval: RELAY_PING_INTERVAL,
        }
    }
}

/// Handshake timing. Production code uses [`HandshakeTimings::default`];
/// tests shrink it.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeTimings {
    pub request_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl Default for HandshakeTimings {
    fn default() -> Self {
        Self {
            request_timeout: REQUEST_TIMEOUT,
            attempt_timeout: CONNECTION_ATTEMPT_TIMEOUT,
            retry_delay: CONNECTION_RETRY_DELAY,
            max_attempts: CONNECTION_MAX_ATTEMPTS,
        }
    }
}

/// Client-side transfer settings.
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Chunk size in bytes.
    pub chunk_size: usize,
    pub buffered_amount_threshold: usize,
}

impl TransferConfig {
    pub fn from_kib(kib: usize) -> Self {
        Self {
            chunk_size: chunk_size_from_kib(kib),
            ..Self::default()
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: chunk_size_from_kib(DEFAULT_CHUNK_SIZE_KIB),
            buffered_amount_threshold: BUFFERED_AMOUNT_LOW_THRESHOLD,
        }
    }
}
