//! Chunk reassembly for one incoming file.
//!
//! Payloads are kept in an index-ordered map; a revisited index overwrites
//! the earlier payload and the running byte total is corrected. The file is
//! complete once the terminal chunk has been seen and the accumulated size
//! reaches the declared size.

use super::chunk::{checksum, decode_frame};
use crate::core::error::TransferError;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// What one accepted frame produced.
#[derive(Debug)]
pub struct Accepted {
    pub index: u32,
    pub payload: Bytes,
    pub duplicate: bool,
    /// The whole file, once the last chunk completes it.
    pub assembled: Option<Bytes>,
}

#[derive(Debug)]
pub struct ChunkReceiver {
    file_name: String,
    file_size: u64,
    chunks: BTreeMap<u32, Bytes>,
    received: u64,
    seen_last: bool,
    expected_checksum: Option<String>,
}

impl ChunkReceiver {
    pub fn new(file_name: impl Into<String>, file_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            file_size,
            chunks: BTreeMap::new(),
            received: 0,
            seen_last: false,
            expected_checksum: None,
        }
    }

    /// Resume from chunks recovered from the session store.
    pub fn restore(file_name: impl Into<String>, file_size: u64, chunks: BTreeMap<u32, Bytes>) -> Self {
        let received = chunks.values().map(|c| c.len() as u64).sum();
        Self {
            chunks,
            received,
            ..Self::new(file_name, file_size)
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn received_bytes(&self) -> u64 {
        self.received
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Fraction of declared bytes received, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return if self.seen_last { 1.0 } else { 0.0 };
        }
        (self.received as f64 / self.file_size as f64).min(1.0)
    }

    pub fn accept(&mut self, frame: &Bytes) -> Result<Accepted, TransferError> {
        let (meta, payload) = decode_frame(frame)?;

        let len = payload.len() as u64;
        let duplicate = match self.chunks.insert(meta.index, payload.clone()) {
            Some(old) => {
                debug!(event = "duplicate_chunk", file = %self.file_name, index = meta.index);
                self.received = self.received - old.len() as u64 + len;
                true
            }
            None => {
                self.received += len;
                false
            }
        };

        if meta.is_last {
            self.seen_last = true;
            if meta.checksum.is_some() {
                self.expected_checksum = meta.checksum;
            }
        }

        let assembled = if self.seen_last && self.received >= self.file_size {
            Some(self.assemble()?)
        } else {
            if meta.is_last {
                warn!(
                    event = "terminal_chunk_short",
                    file = %self.file_name,
                    received = self.received,
                    expected = self.file_size,
                    "Last chunk arrived before all bytes"
                );
            }
            None
        };

        Ok(Accepted {
            index: meta.index,
            payload,
            duplicate,
            assembled,
        })
    }

    fn assemble(&mut self) -> Result<Bytes, TransferError> {
        let mut out = BytesMut::with_capacity(self.received as usize);
        for chunk in self.chunks.values().filter(|c| !c.is_empty()) {
            out.extend_from_slice(chunk);
        }
        let file = out.freeze();
        self.chunks.clear();
        self.received = 0;

        if let Some(expected) = self.expected_checksum.take() {
            let actual = checksum(&file);
            if actual != expected {
                return Err(TransferError::ChecksumMismatch { expected, actual });
            }
        }
        Ok(file)
    }
}
