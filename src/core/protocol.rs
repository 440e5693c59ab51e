//! Relay wire protocol.
//!
//! JSON text frames discriminated by a `type` field. Messages a device sends
//! to the relay are [`ClientMessage`]; messages the relay sends to a device
//! are [`ServerMessage`]. Session descriptions and ICE candidates are carried
//! as opaque JSON so they pass through the relay unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Device as seen by other devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub connected: bool,
}

/// Device → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    SetNickname {
        nickname: String,
    },
    Offer {
        offer: Value,
        target_device: String,
    },
    Answer {
        answer: Value,
        target_device: String,
    },
    IceCandidate {
        candidate: Value,
        target_device: String,
    },
    FileRequest {
        target_device: String,
        file_name: String,
        file_size: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_chunk_index: Option<u32>,
    },
    FileAccept {
        source_device: String,
    },
    FileReject {
        source_device: String,
    },
    Ping,
}

/// Relay → device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    DeviceDiscovered {
        device: DeviceInfo,
    },
    DeviceDisconnected {
        device_id: String,
    },
    Offer {
        offer: Value,
        target_device: String,
        source_device: String,
    },
    Answer {
        answer: Value,
        target_device: String,
        source_device: String,
    },
    IceCandidate {
        candidate: Value,
        target_device: String,
        source_device: String,
    },
    FileRequest {
        file_name: String,
        file_size: u64,
        source_device: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_chunk_index: Option<u32>,
    },
    FileRequestSent {
        target_device: String,
        file_name: String,
    },
    FileAccepted {
        target_device: String,
    },
    FileRejected {
        target_device: String,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerMessage {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeviceDiscovered { .. } => "device-discovered",
            Self::DeviceDisconnected { .. } => "device-disconnected",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::FileRequest { .. } => "file-request",
            Self::FileRequestSent { .. } => "file-request-sent",
            Self::FileAccepted { .. } => "file-accepted",
            Self::FileRejected { .. } => "file-rejected",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SetNickname { .. } => "set-nickname",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::FileRequest { .. } => "file-request",
            Self::FileAccept { .. } => "file-accept",
            Self::FileReject { .. } => "file-reject",
            Self::Ping => "ping",
        }
    }
}
