//! Resumable session store.
//!
//! Layout under the store root:
//!
//! ```text
//! transfers.json                 session id -> { state, chunks, lastUpdate }
//! chunks/<session-id>/<n>.bin    raw received chunk buffers
//! ```
//!
//! The index is rewritten atomically on every save. Chunk buffers are one
//! file each so saving chunk `n` never rewrites earlier ones. An index that
//! does not parse wipes the whole store.

use crate::core::config::SESSION_MAX_AGE;
use crate::core::error::StorageError;
use crate::core::session::{Direction, TransferState};
use crate::utils::atomic_write::atomic_write;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "transfers.json";
const CHUNKS_DIR: &str = "chunks";
const MAX_SESSION_ID_LEN: usize = 64;

/// Session ids name directories under `chunks/`, so only ASCII letters,
/// digits and `-` are accepted.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransfer {
    pub state: TransferState,
    /// Indices of raw buffers saved under `chunks/<id>/`.
    #[serde(default)]
    pub chunks: BTreeSet<u32>,
    pub last_update: u64,
}

#[derive(Debug)]
pub struct SessionStore {
    root: PathBuf,
    entries: BTreeMap<String, StoredTransfer>,
}

impl SessionStore {
    /// An empty store rooted at `root`. Nothing is read until [`load`].
    ///
    /// [`load`]: SessionStore::load
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn chunk_dir(&self, session_id: &str) -> Result<PathBuf, StorageError> {
        if !is_valid_session_id(session_id) {
            return Err(StorageError::InvalidSessionId(session_id.to_string()));
        }
        Ok(self.root.join(CHUNKS_DIR).join(session_id))
    }

    fn chunk_path(&self, session_id: &str, index: u32) -> Result<PathBuf, StorageError> {
        Ok(self.chunk_dir(session_id)?.join(format!("{index}.bin")))
    }

    /// Read the index, purge stale or completed sessions, and return the
    /// number of sessions kept.
    pub fn load(&mut self, now_ms: u64) -> Result<usize, StorageError> {
        let path = self.index_path();
        self.entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<BTreeMap<String, StoredTransfer>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(
                        event = "session_store_corrupt",
                        path = %path.display(),
                        error = %e,
                        "Persisted transfers unreadable, starting fresh"
                    );
                    self.wipe()?;
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.state.is_restorable(e.last_update, now_ms, SESSION_MAX_AGE))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.entries.remove(id);
            self.remove_chunks(id)?;
        }
        if !stale.is_empty() {
            self.flush()?;
        }

        info!(
            event = "session_store_loaded",
            kept = self.entries.len(),
            purged = stale.len(),
        );
        Ok(self.entries.len())
    }

    /// Drop every entry and delete the whole store directory content.
    pub fn wipe(&mut self) -> Result<(), StorageError> {
        self.entries.clear();
        let chunks = self.root.join(CHUNKS_DIR);
        if chunks.exists() {
            std::fs::remove_dir_all(&chunks)?;
        }
        let index = self.index_path();
        if index.exists() {
            std::fs::remove_file(&index)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        let content = serde_json::to_vec_pretty(&self.entries)?;
        atomic_write(&self.index_path(), &content)?;
        Ok(())
    }

    fn remove_chunks(&self, session_id: &str) -> Result<(), StorageError> {
        // No buffers can exist under an id that never maps to a directory.
        let Ok(dir) = self.chunk_dir(session_id) else {
            return Ok(());
        };
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Insert or replace the state of a session, stamped with `now_ms`.
    pub fn save(&mut self, state: &TransferState, now_ms: u64) -> Result<(), StorageError> {
        let id = state.session.id.clone();
        let entry = self.entries.entry(id).or_insert_with(|| StoredTransfer {
            state: state.clone(),
            chunks: BTreeSet::new(),
            last_update: now_ms,
        });
        entry.state = state.clone();
        entry.last_update = now_ms;
        self.flush()
    }

    /// Persist one raw received chunk buffer for a saved session.
    pub fn save_chunk(
        &mut self,
        session_id: &str,
        index: u32,
        data: &[u8],
        now_ms: u64,
    ) -> Result<(), StorageError> {
        atomic_write(&self.chunk_path(session_id, index)?, data)?;
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.chunks.insert(index);
            entry.last_update = now_ms;
        }
        debug!(event = "chunk_persisted", session = %session_id, index);
        Ok(())
    }

    /// Read back every saved chunk buffer of a session.
    pub fn load_chunks(&self, session_id: &str) -> Result<BTreeMap<u32, Bytes>, StorageError> {
        let mut out = BTreeMap::new();
        let Some(entry) = self.entries.get(session_id) else {
            return Ok(out);
        };
        for &index in &entry.chunks {
            let data = std::fs::read(self.chunk_path(session_id, index)?)?;
            out.insert(index, Bytes::from(data));
        }
        Ok(out)
    }

    pub fn remove(&mut self, session_id: &str) -> Result<(), StorageError> {
        let existed = self.entries.remove(session_id).is_some();
        self.remove_chunks(session_id)?;
        if existed {
            self.flush()?;
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Option<&StoredTransfer> {
        self.entries.get(session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoredTransfer> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent incomplete outbound session for (`target`, `file_name`).
    pub fn find_resumable(&self, target: &str, file_name: &str) -> Option<&TransferState> {
        self.entries
            .values()
            .filter(|e| {
                let s = &e.state;
                s.direction == Direction::Send
                    && s.resumable
                    && !s.session.completed
                    && s.session.target_device == target
                    && s.session.file_name == file_name
            })
            .max_by_key(|e| e.last_update)
            .map(|e| &e.state)
    }
}
