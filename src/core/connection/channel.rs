//! Peer capability interface.
//!
//! The handshake coordinator and the transfer pipeline only talk to peers
//! through these traits. [`super::webrtc`] implements them over webrtc-rs;
//! tests use the in-memory double in `mock`.

use crate::core::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// The open file-transfer data channel to one peer.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// Notified whenever the buffered amount drops to the low threshold.
    fn buffered_amount_low(&self) -> Arc<Notify>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Asynchronous events of one peer connection.
#[derive(Clone)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to trickle to the remote side.
    LocalCandidate(Value),
    ChannelOpen(Arc<dyn PeerChannel>),
    Message(Bytes),
    ChannelClosed,
    Failed,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::ChannelOpen(_) => f.write_str("ChannelOpen"),
            Self::Message(b) => write!(f, "Message({} bytes)", b.len()),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::Failed => f.write_str("Failed"),
        }
    }
}

/// One negotiated peer connection. Session descriptions and candidates are
/// opaque JSON, exactly as carried by the relay.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the data channel and return the local offer.
    async fn create_offer(&self) -> Result<Value, ChannelError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value, ChannelError>;

    async fn set_answer(&self, answer: Value) -> Result<(), ChannelError>;

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), ChannelError>;

    /// Release the connection and any data channel.
    async fn close(&self);
}

/// Creates peer connections that report through `events`.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ChannelError>;
}

/// Whether a candidate (JSON `{candidate: "..."}` or a bare candidate
/// string) is a host candidate, i.e. a local-network address.
pub fn is_host_candidate(candidate: &Value) -> bool {
    let line = match candidate {
        Value::String(s) => s.as_str(),
        Value::Object(map) => match map.get("candidate").and_then(Value::as_str) {
            Some(s) => s,
            None => return false,
        },
        _ => return false,
    };
    let mut fields = line.split_whitespace();
    while let Some(field) = fields.next() {
        if field == "typ" {
            return fields.next() == Some("host");
        }
    }
    false
}
