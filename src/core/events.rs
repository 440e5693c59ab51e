//! Event fan-out.
//!
//! One [`Topic`] per event kind. Subscribing is additive; publishing calls
//! every current subscriber synchronously on the publisher's task, so
//! subscribers must not block.

use crate::core::config::{MAX_ERROR_LOGS, MAX_TRANSFER_LOGS};
use crate::core::protocol::DeviceInfo;
use crate::core::session::{now_ms, Direction};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Topic<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Topic<T> {
    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber<T>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, f: impl Fn(&T) + Send + Sync + 'static) {
        self.lock().push(Arc::new(f));
    }

    pub fn publish(&self, value: &T) {
        // Snapshot so a subscriber may subscribe again without deadlocking.
        let subscribers: Vec<_> = self.lock().clone();
        for s in subscribers {
            s(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }
}

/// Incoming transfer offer shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRequestEvent {
    pub source_device: String,
    pub file_name: String,
    pub file_size: u64,
    pub session_id: Option<String>,
    pub last_chunk_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub session_id: String,
    pub file_name: String,
    /// In `[0, 1]`.
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeedEvent {
    pub session_id: String,
    pub bytes_per_second: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub connected: bool,
    pub peer_count: usize,
    /// Milliseconds since the Unix epoch; `None` before the first ping.
    pub last_ping: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferLog {
    pub timestamp: u64,
    pub direction: Direction,
    pub peer: String,
    pub file_name: String,
    pub file_size: u64,
    pub outcome: TransferOutcome,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorLog {
    pub timestamp: u64,
    pub code: &'static str,
    pub message: String,
    pub context: Option<String>,
}

impl ErrorLog {
    pub fn new(code: &'static str, message: impl Into<String>, context: Option<String>) -> Self {
        Self {
            timestamp: now_ms(),
            code,
            message: message.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTransfer {
    pub session_id: String,
    pub file_name: String,
    pub direction: Direction,
    pub progress: f64,
}

/// Typed topics plus bounded diagnostic history.
#[derive(Default)]
pub struct EventBus {
    pub device_discovered: Topic<DeviceInfo>,
    pub device_disconnected: Topic<String>,
    pub transfer_progress: Topic<ProgressEvent>,
    pub transfer_speed: Topic<SpeedEvent>,
    pub file_request: Topic<FileRequestEvent>,
    pub status: Topic<SystemStatus>,
    pub transfer_log: Topic<TransferLog>,
    pub error_log: Topic<ErrorLog>,
    pub active_transfers: Topic<Vec<ActiveTransfer>>,
    transfer_history: Mutex<VecDeque<TransferLog>>,
    error_history: Mutex<VecDeque<ErrorLog>>,
}

fn push_bounded<T>(history: &Mutex<VecDeque<T>>, value: T, cap: usize) {
    let mut h = history.lock().unwrap_or_else(|e| e.into_inner());
    h.push_back(value);
    while h.len() > cap {
        h.pop_front();
    }
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log_transfer(&self, log: TransferLog) {
        push_bounded(&self.transfer_history, log.clone(), MAX_TRANSFER_LOGS);
        self.transfer_log.publish(&log);
    }

    pub fn log_error(&self, log: ErrorLog) {
        push_bounded(&self.error_history, log.clone(), MAX_ERROR_LOGS);
        self.error_log.publish(&log);
    }

    /// Most recent first.
    pub fn transfer_history(&self) -> Vec<TransferLog> {
        let h = self.transfer_history.lock().unwrap_or_else(|e| e.into_inner());
        h.iter().rev().cloned().collect()
    }

    /// Most recent first.
    pub fn error_history(&self) -> Vec<ErrorLog> {
        let h = self.error_history.lock().unwrap_or_else(|e| e.into_inner());
        h.iter().rev().cloned().collect()
    }
}
