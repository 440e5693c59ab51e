//! Transfer session state shared by the sender, the receiver and the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Chunks needed for `file_size` bytes. An empty file still has one (empty,
/// terminal) chunk.
pub fn total_chunks(file_size: u64, chunk_size: usize) -> u32 {
    let chunk = chunk_size.max(1) as u64;
    file_size.div_ceil(chunk).max(1) as u32
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSession {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub target_device: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: u64,
    /// Highest chunk index delivered so far; `None` before the first chunk.
    pub last_chunk_index: Option<u32>,
    pub total_chunks: u32,
    pub completed: bool,
    /// Lowercase hex SHA3-256 of the whole file; empty until computed.
    #[serde(default)]
    pub checksum: String,
}

impl TransferSession {
    pub fn new(
        file_name: impl Into<String>,
        file_size: u64,
        target_device: impl Into<String>,
        chunk_size: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            file_size,
            target_device: target_device.into(),
            start_time: now_ms(),
            last_chunk_index: None,
            total_chunks: total_chunks(file_size, chunk_size),
            completed: false,
            checksum: String::new(),
        }
    }

    /// First chunk index still to send.
    pub fn next_index(&self) -> u32 {
        self.last_chunk_index.map_or(0, |i| i + 1)
    }

    pub fn record_chunk(&mut self, index: u32) {
        self.last_chunk_index = Some(self.last_chunk_index.map_or(index, |i| i.max(index)));
        if index + 1 >= self.total_chunks {
            self.completed = true;
        }
    }

    /// Fraction of chunks delivered, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        f64::from(self.next_index().min(self.total_chunks)) / f64::from(self.total_chunks)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

/// Everything persisted about one session, minus raw chunk buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    #[serde(flatten)]
    pub session: TransferSession,
    pub direction: Direction,
    /// Sparse presence map of delivered chunk indices.
    #[serde(default)]
    pub chunks_present: BTreeSet<u32>,
    pub resumable: bool,
    /// Peer that sent the file (receiver side).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_device: Option<String>,
}

impl TransferState {
    pub fn new(session: TransferSession, direction: Direction) -> Self {
        Self {
            session,
            direction,
            chunks_present: BTreeSet::new(),
            resumable: true,
            source_device: None,
        }
    }

    pub fn mark_chunk(&mut self, index: u32) {
        self.chunks_present.insert(index);
        self.session.record_chunk(index);
    }

    /// Receiver-side bookkeeping. The receiver does not know the sender's
    /// chunk size, so completion is left to reassembly.
    pub fn mark_received(&mut self, index: u32) {
        self.chunks_present.insert(index);
        let last = &mut self.session.last_chunk_index;
        *last = Some(last.map_or(index, |i| i.max(index)));
    }

    /// Eligible for restoration at `now_ms` given its last update.
    pub fn is_restorable(&self, last_update: u64, now_ms: u64, max_age: Duration) -> bool {
        self.resumable
            && !self.session.completed
            && now_ms.saturating_sub(last_update) <= max_age.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_counts() {
        assert_eq!(total_chunks(0, 16), 1);
        assert_eq!(total_chunks(15, 16), 1);
        assert_eq!(total_chunks(16, 16), 1);
        assert_eq!(total_chunks(17, 16), 2);
        assert_eq!(total_chunks(16 * 10 + 37, 16), 13);
    }

    #[test]
    fn session_tracks_progress_and_completion() {
        let mut s = TransferSession::new("a.bin", 40, "dev", 16);
        assert_eq!(s.total_chunks, 3);
        assert_eq!(s.next_index(), 0);
        s.record_chunk(0);
        s.record_chunk(1);
        assert_eq!(s.next_index(), 2);
        assert!(!s.completed);
        assert!((s.progress() - 2.0 / 3.0).abs() < 1e-9);
        s.record_chunk(2);
        assert!(s.completed);
        assert_eq!(s.progress(), 1.0);
    }

    #[test]
    fn restorable_only_when_fresh_incomplete_and_resumable() {
        let day = Duration::from_secs(24 * 3600);
        let mut state = TransferState::new(TransferSession::new("f", 100, "d", 16), Direction::Send);
        let now = 10 * day.as_millis() as u64;
        assert!(state.is_restorable(now - 1000, now, day));
        assert!(!state.is_restorable(now - day.as_millis() as u64 - 1, now, day));
        state.resumable = false;
        assert!(!state.is_restorable(now, now, day));
        state.resumable = true;
        state.session.completed = true;
        assert!(!state.is_restorable(now, now, day));
    }

    #[test]
    fn state_serializes_flat_camel_case() {
        let state = TransferState::new(TransferSession::new("f", 1, "d", 16), Direction::Receive);
        let v = serde_json::to_value(&state).unwrap();
        assert_eq!(v["fileName"], "f");
        assert_eq!(v["direction"], "receive");
        assert!(v["lastChunkIndex"].is_null());
    }
}
