//! Chunk wire frame.
//!
//! ```text
//! [u32 LE: metadata length][metadata: UTF-8 JSON][payload]
//! ```
//!
//! Metadata is `{"index": n, "isLast": bool}`; the terminal chunk may also
//! carry `"checksum"`, the lowercase hex SHA3-256 of the whole file.

use crate::core::error::TransferError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};

const LEN_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMeta {
    pub index: u32,
    pub is_last: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ChunkMeta {
    pub fn new(index: u32, is_last: bool) -> Self {
        Self {
            index,
            is_last,
            checksum: None,
        }
    }
}

pub fn encode_frame(meta: &ChunkMeta, payload: &[u8]) -> Result<Bytes, TransferError> {
    let json =
        serde_json::to_vec(meta).map_err(|e| TransferError::ChunkProcessing(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + json.len() + payload.len());
    buf.put_u32_le(json.len() as u32);
    buf.put_slice(&json);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split a frame into metadata and payload. The payload is a zero-copy slice
/// of `frame`.
pub fn decode_frame(frame: &Bytes) -> Result<(ChunkMeta, Bytes), TransferError> {
    if frame.len() < LEN_PREFIX {
        return Err(TransferError::ChunkProcessing(format!(
            "frame of {} bytes is shorter than its length prefix",
            frame.len()
        )));
    }
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&frame[..LEN_PREFIX]);
    let meta_len = u32::from_le_bytes(prefix) as usize;
    let meta_end = LEN_PREFIX
        .checked_add(meta_len)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| {
            TransferError::ChunkProcessing(format!(
                "metadata length {meta_len} exceeds frame of {} bytes",
                frame.len()
            ))
        })?;
    let meta: ChunkMeta = serde_json::from_slice(&frame[LEN_PREFIX..meta_end])
        .map_err(|e| TransferError::ChunkProcessing(e.to_string()))?;
    Ok((meta, frame.slice(meta_end..)))
}

/// Lowercase hex SHA3-256.
pub fn hex_digest(hasher: Sha3_256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hex_digest(hasher)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_is_length_prefixed_json() {
        let frame = encode_frame(&ChunkMeta::new(7, false), b"xyz").unwrap();
        let meta_json = br#"{"index":7,"isLast":false}"#;
        assert_eq!(&frame[..4], &(meta_json.len() as u32).to_le_bytes());
        assert_eq!(&frame[4..4 + meta_json.len()], meta_json);
        assert_eq!(&frame[4 + meta_json.len()..], b"xyz");
    }

    #[test]
    fn decode_recovers_meta_and_payload() {
        let meta = ChunkMeta {
            index: 3,
            is_last: true,
            checksum: Some("ab".into()),
        };
        let frame = encode_frame(&meta, &[]).unwrap();
        let (decoded, payload) = decode_frame(&frame).unwrap();
        assert_eq!(decoded, meta);
        assert!(payload.is_empty());
    }

    #[test]
    fn accepts_frames_from_browser_peers() {
        let meta = br#"{"index":0,"isLast":true}"#;
        let mut raw = (meta.len() as u32).to_le_bytes().to_vec();
        raw.extend_from_slice(meta);
        raw.extend_from_slice(b"hi");
        let (decoded, payload) = decode_frame(&Bytes::from(raw)).unwrap();
        assert_eq!(decoded, ChunkMeta::new(0, true));
        assert_eq!(&payload[..], b"hi");
    }

    #[test]
    fn malformed_frames_are_chunk_processing_errors() {
        for raw in [
            vec![1u8, 0],
            vec![200, 0, 0, 0, b'{'],
            {
                let mut v = 3u32.to_le_bytes().to_vec();
                v.extend_from_slice(b"{{{");
                v
            },
        ] {
            let err = decode_frame(&Bytes::from(raw)).unwrap_err();
            assert!(matches!(err, TransferError::ChunkProcessing(_)));
        }
    }

    #[test]
    fn checksum_is_sha3_256_hex() {
        assert_eq!(
            checksum(b""),
            "a7ffc6f8bf1ed76651c14756a061d662f580ff4de43b49fa82d80a4b80f8434a"
        );
    }
}
