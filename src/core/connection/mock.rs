//! In-memory peer connection double with an instrumented data channel and
//! scripted per-attempt outcomes.

use super::channel::{PeerChannel, PeerConnection, PeerConnector, PeerEvent};
use crate::core::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

pub struct MockChannel {
    sent: Mutex<Vec<Bytes>>,
    /// Buffered amount observed at each send.
    buffered_at_send: Mutex<Vec<usize>>,
    buffered: AtomicUsize,
    low: Arc<Notify>,
    open: AtomicBool,
    /// Fail sends after this many succeeded.
    fail_after: Mutex<Option<usize>>,
}

impl Default for MockChannel {
    fn default() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            buffered_at_send: Mutex::new(Vec::new()),
            buffered: AtomicUsize::new(0),
            low: Arc::new(Notify::new()),
            open: AtomicBool::new(true),
            fail_after: Mutex::new(None),
        }
    }
}

impl MockChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }

    pub fn buffered_at_send(&self) -> Vec<usize> {
        self.buffered_at_send.lock().unwrap().clone()
    }

    pub fn set_buffered(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
    }

    /// Drain the buffer and fire the low-buffer callback.
    pub fn drain(&self) {
        self.buffered.store(0, Ordering::SeqCst);
        self.low.notify_waiters();
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn fail_after(&self, sends: usize) {
        *self.fail_after.lock().unwrap() = Some(sends);
    }
}

#[async_trait]
impl PeerChannel for MockChannel {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        let mut sent = self.sent.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if sent.len() >= limit {
                self.open.store(false, Ordering::SeqCst);
                return Err(ChannelError::Closed);
            }
        }
        self.buffered_at_send
            .lock()
            .unwrap()
            .push(self.buffered.load(Ordering::SeqCst));
        sent.push(data);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        self.low.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.set_open(false);
    }
}

/// What a connection attempt does once an offer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Open,
    Fail,
    /// Never reaches open; the attempt times out.
    Hang,
}

pub struct MockConnection {
    events: mpsc::UnboundedSender<PeerEvent>,
    outcome: Outcome,
    pub channel: Arc<MockChannel>,
    pub answers: Mutex<Vec<Value>>,
    pub candidates: Mutex<Vec<Value>>,
    pub closed: AtomicBool,
}

impl MockConnection {
    fn settle(&self) {
        match self.outcome {
            Outcome::Open => {
                let _ = self.events.send(PeerEvent::LocalCandidate(json!({
                    "candidate": "candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host"
                })));
                let _ = self.events.send(PeerEvent::LocalCandidate(json!({
                    "candidate": "candidate:2 1 udp 1694498815 203.0.113.9 50000 typ srflx"
                })));
                let _ = self
                    .events
                    .send(PeerEvent::ChannelOpen(self.channel.clone() as Arc<dyn PeerChannel>));
            }
            Outcome::Fail => {
                let _ = self.events.send(PeerEvent::Failed);
            }
            Outcome::Hang => {}
        }
    }

    /// Simulate an inbound frame from the remote peer.
    pub fn deliver(&self, data: Bytes) {
        let _ = self.events.send(PeerEvent::Message(data));
    }

    pub fn drop_channel(&self) {
        self.channel.set_open(false);
        let _ = self.events.send(PeerEvent::ChannelClosed);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<Value, ChannelError> {
        self.settle();
        Ok(json!({"type": "offer", "sdp": "mock-offer"}))
    }

    async fn accept_offer(&self, _offer: Value) -> Result<Value, ChannelError> {
        self.settle();
        Ok(json!({"type": "answer", "sdp": "mock-answer"}))
    }

    async fn set_answer(&self, answer: Value) -> Result<(), ChannelError> {
        self.answers.lock().unwrap().push(answer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), ChannelError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.channel.set_open(false);
    }
}

#[derive(Default)]
pub struct MockConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicU32,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockConnector {
    /// Attempts follow `script`, then default to [`Outcome::Open`].
    pub fn scripted(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Open);
        let conn = Arc::new(MockConnection {
            events,
            outcome,
            channel: MockChannel::new(),
            answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.connections.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}
