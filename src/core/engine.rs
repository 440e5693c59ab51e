//! Transfer engine: the client-side facade.
//!
//! Binds the relay session, the [`HandshakeCoordinator`], the chunk pipeline,
//! the [`SessionStore`] and the [`EventBus`]. Relay messages and peer link
//! events are dispatched by [`Engine::run`]; sends are driven by
//! [`Engine::send_file`] / [`Engine::send_queue`] on the caller's task.

use crate::core::config::{
    HandshakeTimings, TransferConfig, CLIENT_PING_INTERVAL, MAX_FILE_SIZE,
};
use crate::core::connection::{PeerChannel, PeerConnector};
use crate::core::error::{HandshakeError, LanshareError, StorageError, TransferError};
use crate::core::events::{
    ActiveTransfer, ErrorLog, EventBus, FileRequestEvent, ProgressEvent, SpeedEvent, SystemStatus,
    TransferLog, TransferOutcome,
};
use crate::core::handshake::{HandshakeCoordinator, LinkEvent, TransferRequest};
use crate::core::persistence::{is_valid_session_id, SessionStore};
use crate::core::pipeline::receiver::ChunkReceiver;
use crate::core::pipeline::sender::{compute_checksum, send_chunks, wait_for_buffer};
use crate::core::protocol::{ClientMessage, DeviceInfo, ServerMessage};
use crate::core::session::{now_ms, total_chunks, Direction, TransferSession, TransferState};
use crate::utils::atomic_write::atomic_write;
use crate::utils::sos::SignalOfStop;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Minimum window between two speed samples.
const SPEED_SAMPLE: Duration = Duration::from_secs(1);

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Collaborators ────────────────────────────────────────────────────────────

/// Where completed incoming files go.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Store `data` under (a sanitized form of) `file_name`; returns the final
    /// location.
    async fn deliver(&self, file_name: &str, data: Bytes) -> anyhow::Result<PathBuf>;
}

/// Writes received files into a directory without overwriting.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

/// Strip path components and control characters from a remote file name.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "download".to_string()
    } else {
        cleaned.to_string()
    }
}

/// `dir/name`, or `dir/stem (n).ext` for the first free `n`.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
        _ => (name, ""),
    };
    (1u32..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn deliver(&self, file_name: &str, data: Bytes) -> anyhow::Result<PathBuf> {
        let dir = self.dir.clone();
        let name = sanitize_file_name(file_name);
        tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            let path = unique_path(&dir, &name);
            atomic_write(&path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
            Ok(path)
        })
        .await
        .context("sink task panicked")?
    }
}

/// Decides whether an interrupted outbound session should be continued.
pub trait ResumePolicy: Send + Sync {
    fn resume(&self, previous: &TransferState) -> bool;
}

pub struct AlwaysResume;

impl ResumePolicy for AlwaysResume {
    fn resume(&self, _previous: &TransferState) -> bool {
        true
    }
}

pub struct NeverResume;

impl ResumePolicy for NeverResume {
    fn resume(&self, _previous: &TransferState) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub transfer: TransferConfig,
    pub timings: HandshakeTimings,
    /// Accept every incoming request below the size cap.
    pub auto_accept: bool,
    /// Persist progress so interrupted transfers can continue.
    pub resume_enabled: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            timings: HandshakeTimings::default(),
            auto_accept: false,
            resume_enabled: true,
        }
    }
}

// ── Internal state ───────────────────────────────────────────────────────────

struct SpeedMeter {
    since: Instant,
    bytes: u64,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            since: Instant::now(),
            bytes: 0,
        }
    }

    /// Bytes per second over the last window, once the window is full.
    fn record(&mut self, n: usize) -> Option<f64> {
        self.bytes += n as u64;
        let elapsed = self.since.elapsed();
        if elapsed < SPEED_SAMPLE {
            return None;
        }
        let rate = self.bytes as f64 / elapsed.as_secs_f64();
        self.since = Instant::now();
        self.bytes = 0;
        Some(rate)
    }
}

/// An unanswered request, stamped on arrival so it can expire with the
/// requester's own timeout.
struct PendingOffer {
    offer: FileRequestEvent,
    received: tokio::time::Instant,
}

struct Incoming {
    state: TransferState,
    receiver: ChunkReceiver,
    /// Set once this transfer's data channel has opened; closes of earlier
    /// channels are ignored until then.
    linked: bool,
    started: Instant,
    speed: SpeedMeter,
}

enum FrameOutcome {
    Progress(ProgressEvent, Option<SpeedEvent>),
    Done(Incoming, Bytes),
    Failed(Incoming, TransferError),
    /// Frame dropped; the session keeps waiting for the next one.
    Skipped(String, TransferError),
}

/// Clears the busy flag when the send ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct Engine {
    relay: mpsc::UnboundedSender<ClientMessage>,
    coordinator: Arc<HandshakeCoordinator>,
    store: Mutex<SessionStore>,
    events: Arc<EventBus>,
    sink: Arc<dyn ArtifactSink>,
    resume: Arc<dyn ResumePolicy>,
    options: EngineOptions,
    peers: Mutex<HashMap<String, DeviceInfo>>,
    peers_changed: Notify,
    /// Requests waiting for a local decision, keyed by source device.
    offers: Mutex<HashMap<String, PendingOffer>>,
    incoming: Mutex<HashMap<String, Incoming>>,
    active: Mutex<HashMap<String, ActiveTransfer>>,
    sending: AtomicBool,
    connected: AtomicBool,
    last_ping: Mutex<Option<u64>>,
}

impl Engine {
    /// Build an engine over an established relay session. `store` should
    /// already be loaded.
    pub fn new(
        relay: mpsc::UnboundedSender<ClientMessage>,
        connector: Arc<dyn PeerConnector>,
        store: SessionStore,
        sink: Arc<dyn ArtifactSink>,
        resume: Arc<dyn ResumePolicy>,
        options: EngineOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (coordinator, links) =
            HandshakeCoordinator::new(relay.clone(), connector, options.timings);
        let engine = Arc::new(Self {
            relay,
            coordinator,
            store: Mutex::new(store),
            events: EventBus::new(),
            sink,
            resume,
            options,
            peers: Mutex::new(HashMap::new()),
            peers_changed: Notify::new(),
            offers: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            sending: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            last_ping: Mutex::new(None),
        });
        (engine, links)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn peers(&self) -> Vec<DeviceInfo> {
        let mut peers: Vec<_> = guard(&self.peers).values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    /// A discovered device whose id or name matches `query`.
    pub fn find_peer(&self, query: &str) -> Option<DeviceInfo> {
        let peers = guard(&self.peers);
        peers.get(query).cloned().or_else(|| {
            peers
                .values()
                .find(|d| d.name.eq_ignore_ascii_case(query))
                .cloned()
        })
    }

    /// Wait until a device matching `query` has been discovered.
    pub async fn wait_for_peer(&self, query: &str, limit: Duration) -> Option<DeviceInfo> {
        let wait = async {
            loop {
                let notified = self.peers_changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(device) = self.find_peer(query) {
                    return device;
                }
                notified.await;
            }
        };
        tokio::time::timeout(limit, wait).await.ok()
    }

    /// Requests still awaiting an answer. Expired ones are dropped.
    pub fn pending_offers(&self) -> Vec<FileRequestEvent> {
        let limit = self.options.timings.request_timeout;
        let mut offers = guard(&self.offers);
        offers.retain(|_, p| p.received.elapsed() < limit);
        offers.values().map(|p| p.offer.clone()).collect()
    }

    /// Take the request from `source` if the requester is still waiting on it.
    fn take_offer(&self, source: &str) -> Option<FileRequestEvent> {
        let pending = guard(&self.offers).remove(source)?;
        if pending.received.elapsed() >= self.options.timings.request_timeout {
            warn!(
                event = "offer_expired",
                source = %source,
                file = %pending.offer.file_name,
                "Request outlived the requester's timeout"
            );
            let err = LanshareError::from(HandshakeError::RequestTimeout);
            self.events.log_error(ErrorLog::new(
                err.code(),
                err.to_string(),
                Some(pending.offer.file_name),
            ));
            return None;
        }
        Some(pending.offer)
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            connected: self.connected.load(Ordering::Acquire),
            peer_count: guard(&self.peers).len(),
            last_ping: *guard(&self.last_ping),
        }
    }

    fn publish_status(&self) {
        self.events.status.publish(&self.status());
    }

    fn set_active(&self, entry: Option<ActiveTransfer>, session_id: &str) {
        let snapshot: Vec<ActiveTransfer> = {
            let mut active = guard(&self.active);
            match entry {
                Some(entry) => {
                    active.insert(session_id.to_string(), entry);
                }
                None => {
                    active.remove(session_id);
                }
            }
            active.values().cloned().collect()
        };
        self.events.active_transfers.publish(&snapshot);
    }

    fn send_relay(&self, msg: ClientMessage) {
        if self.relay.send(msg).is_err() {
            warn!(event = "relay_gone", "Relay session is closed");
        }
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut SessionStore) -> Result<T, StorageError>,
    ) -> Option<T> {
        if !self.options.resume_enabled {
            return None;
        }
        match f(&mut guard(&self.store)) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(event = "session_store_failure", error = %e);
                self.events
                    .log_error(ErrorLog::new("STORAGE_ERROR", e.to_string(), None));
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_outcome(
        &self,
        direction: Direction,
        peer: &str,
        file_name: &str,
        file_size: u64,
        started: Instant,
        outcome: TransferOutcome,
        error: Option<String>,
    ) {
        self.events.log_transfer(TransferLog {
            timestamp: now_ms(),
            direction,
            peer: peer.to_string(),
            file_name: file_name.to_string(),
            file_size,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
        });
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Send one file to `target`.
    ///
    /// Files at or above the size cap fail before anything reaches the
    /// relay. Only one send runs at a time.
    pub async fn send_file(self: &Arc<Self>, path: &Path, target: &str) -> Result<(), LanshareError> {
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(TransferError::from)?
            .len();
        if file_size >= MAX_FILE_SIZE {
            warn!(event = "file_too_large", path = %path.display(), size = file_size);
            let err = LanshareError::from(TransferError::Oversize {
                size: file_size,
                max: MAX_FILE_SIZE,
            });
            self.events.log_error(ErrorLog::new(
                err.code(),
                err.to_string(),
                Some(path.display().to_string()),
            ));
            return Err(err);
        }

        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransferError::Busy.into());
        }
        let _busy = BusyGuard(&self.sending);

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        let started = Instant::now();
        let result = self.run_send(path, target, &file_name, file_size).await;

        match &result {
            Ok(()) => {
                info!(event = "file_sent", file = %file_name, target = %target, size = file_size);
                self.log_outcome(
                    Direction::Send,
                    target,
                    &file_name,
                    file_size,
                    started,
                    TransferOutcome::Completed,
                    None,
                );
            }
            Err(e) => {
                error!(event = "file_send_failure", file = %file_name, target = %target, error = %e);
                let outcome = match e {
                    LanshareError::Handshake(HandshakeError::TransferRejected) => {
                        TransferOutcome::Rejected
                    }
                    _ => TransferOutcome::Failed,
                };
                self.log_outcome(
                    Direction::Send,
                    target,
                    &file_name,
                    file_size,
                    started,
                    outcome,
                    Some(e.to_string()),
                );
                self.events
                    .log_error(ErrorLog::new(e.code(), e.to_string(), Some(file_name.clone())));
            }
        }
        result
    }

    /// Pick up an interrupted session for this file, if allowed.
    fn resumable_session(
        &self,
        target: &str,
        file_name: &str,
        file_size: u64,
        checksum: &str,
    ) -> Option<TransferSession> {
        if !self.options.resume_enabled {
            return None;
        }
        let mut store = guard(&self.store);
        let previous = store.find_resumable(target, file_name)?.clone();
        let chunks = total_chunks(file_size, self.options.transfer.chunk_size);
        let same_file = previous.session.file_size == file_size
            && previous.session.total_chunks == chunks
            && previous.session.checksum == checksum;
        if same_file && self.resume.resume(&previous) {
            info!(
                event = "transfer_resumed",
                session = %previous.session.id,
                from_chunk = previous.session.next_index(),
            );
            return Some(previous.session);
        }
        debug!(event = "stale_session_dropped", session = %previous.session.id);
        if let Err(e) = store.remove(&previous.session.id) {
            warn!(event = "session_store_failure", error = %e);
        }
        None
    }

    async fn run_send(
        self: &Arc<Self>,
        path: &Path,
        target: &str,
        file_name: &str,
        file_size: u64,
    ) -> Result<(), LanshareError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(TransferError::from)?;
        let checksum = compute_checksum(&mut file).await?;

        let mut session = self
            .resumable_session(target, file_name, file_size, &checksum)
            .unwrap_or_else(|| {
                let mut s =
                    TransferSession::new(file_name, file_size, target, self.options.transfer.chunk_size);
                s.checksum = checksum.clone();
                s
            });
        let session_id = session.id.clone();
        let mut state = TransferState::new(session.clone(), Direction::Send);
        self.with_store(|s| s.save(&state, now_ms()));
        self.set_active(
            Some(ActiveTransfer {
                session_id: session_id.clone(),
                file_name: file_name.to_string(),
                direction: Direction::Send,
                progress: session.progress(),
            }),
            &session_id,
        );

        let result = async {
            let request = TransferRequest {
                target: target.to_string(),
                file_name: file_name.to_string(),
                file_size,
                session_id: Some(session_id.clone()),
                last_chunk_index: session.last_chunk_index,
            };
            if let Err(e) = self.coordinator.request_transfer(request).await {
                if e == HandshakeError::TransferRejected {
                    self.with_store(|s| s.remove(&session_id));
                }
                return Err(LanshareError::from(e));
            }

            let channel = self.coordinator.connect(target).await?;
            self.pump_file(channel.as_ref(), &mut file, &mut session, &mut state)
                .await?;

            // Let the peer drain the tail before the connection is released.
            let drained = tokio::time::timeout(
                self.options.timings.attempt_timeout,
                wait_for_buffer(channel.as_ref(), 0),
            )
            .await;
            if !matches!(drained, Ok(Ok(()))) {
                warn!(event = "drain_incomplete", session = %session_id);
            }
            Ok::<(), LanshareError>(())
        }
        .await;

        self.coordinator.close_peer(target).await;
        self.set_active(None, &session_id);
        if result.is_ok() {
            self.with_store(|s| s.remove(&session_id));
        }
        result
    }

    async fn pump_file(
        &self,
        channel: &dyn PeerChannel,
        file: &mut tokio::fs::File,
        session: &mut TransferSession,
        state: &mut TransferState,
    ) -> Result<(), TransferError> {
        let mut speed = SpeedMeter::new();
        send_chunks(channel, file, session, &self.options.transfer, |s, n| {
            state.session = s.clone();
            if let Some(index) = s.last_chunk_index {
                state.chunks_present.insert(index);
            }
            self.with_store(|store| store.save(state, now_ms()));
            self.events.transfer_progress.publish(&ProgressEvent {
                session_id: s.id.clone(),
                file_name: s.file_name.clone(),
                progress: s.progress(),
            });
            if let Some(bytes_per_second) = speed.record(n) {
                self.events.transfer_speed.publish(&SpeedEvent {
                    session_id: s.id.clone(),
                    bytes_per_second,
                });
            }
        })
        .await
    }

    /// Send files one after another. A failure is recorded for that entry
    /// and the queue moves on.
    pub async fn send_queue(
        self: &Arc<Self>,
        paths: &[PathBuf],
        target: &str,
    ) -> Vec<(PathBuf, Result<(), LanshareError>)> {
        let mut results = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            info!(event = "queue_next", position = i + 1, total = paths.len(), path = %path.display());
            let result = self.send_file(path, target).await;
            results.push((path.clone(), result));
        }
        results
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    fn on_file_request(&self, offer: FileRequestEvent) {
        let source = offer.source_device.clone();
        if offer.file_size >= MAX_FILE_SIZE {
            warn!(event = "incoming_too_large", source = %source, size = offer.file_size);
            self.send_relay(ClientMessage::FileReject {
                source_device: source.clone(),
            });
            self.log_outcome(
                Direction::Receive,
                &source,
                &offer.file_name,
                offer.file_size,
                Instant::now(),
                TransferOutcome::Rejected,
                Some("file too large".into()),
            );
            return;
        }

        info!(
            event = "incoming_request",
            source = %source,
            file = %offer.file_name,
            size = offer.file_size,
            resume_from = ?offer.last_chunk_index,
        );
        guard(&self.offers).insert(
            source.clone(),
            PendingOffer {
                offer: offer.clone(),
                received: tokio::time::Instant::now(),
            },
        );
        self.events.file_request.publish(&offer);
        if self.options.auto_accept {
            self.accept_incoming(&source);
        }
    }

    /// Accept the pending request from `source`. Returns `false` if there is
    /// none or the requester has already given up on it.
    pub fn accept_incoming(&self, source: &str) -> bool {
        let Some(offer) = self.take_offer(source) else {
            return false;
        };
        let (state, receiver) = self.prepare_receive(&offer);
        let session_id = state.session.id.clone();
        self.with_store(|s| s.save(&state, now_ms()));

        guard(&self.incoming).insert(
            source.to_string(),
            Incoming {
                receiver,
                state,
                linked: false,
                started: Instant::now(),
                speed: SpeedMeter::new(),
            },
        );
        self.send_relay(ClientMessage::FileAccept {
            source_device: source.to_string(),
        });
        self.set_active(
            Some(ActiveTransfer {
                session_id: session_id.clone(),
                file_name: offer.file_name.clone(),
                direction: Direction::Receive,
                progress: 0.0,
            }),
            &session_id,
        );
        info!(event = "incoming_accepted", source = %source, file = %offer.file_name);
        true
    }

    /// Fresh or restored receive state for an accepted offer.
    fn prepare_receive(&self, offer: &FileRequestEvent) -> (TransferState, ChunkReceiver) {
        let session_id = match offer.session_id.as_deref() {
            Some(id) if is_valid_session_id(id) => id.to_string(),
            Some(id) => {
                warn!(
                    event = "session_id_rejected",
                    source = %offer.source_device,
                    session = %id,
                    "Ignoring malformed session id, starting a fresh session"
                );
                Uuid::new_v4().to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let restored = self
            .with_store(|store| {
                let Some(previous) = store.get(&session_id).map(|e| e.state.clone()) else {
                    return Ok(None);
                };
                let matches = previous.direction == Direction::Receive
                    && previous.session.file_name == offer.file_name
                    && previous.session.file_size == offer.file_size;
                if !matches || offer.last_chunk_index.is_none() {
                    store.remove(&session_id)?;
                    return Ok(None);
                }
                let chunks = store.load_chunks(&session_id)?;
                Ok(Some((previous, chunks)))
            })
            .flatten();

        if let Some((state, chunks)) = restored {
            info!(
                event = "receive_resumed",
                session = %session_id,
                chunks = chunks.len(),
            );
            let receiver = ChunkReceiver::restore(&offer.file_name, offer.file_size, chunks);
            return (state, receiver);
        }
        if offer.last_chunk_index.is_some() {
            warn!(
                event = "resume_state_missing",
                session = %session_id,
                "Sender resumes a session this device has no chunks for"
            );
        }

        let mut session = TransferSession::new(
            &offer.file_name,
            offer.file_size,
            &offer.source_device,
            self.options.transfer.chunk_size,
        );
        session.id = session_id;
        let mut state = TransferState::new(session, Direction::Receive);
        state.source_device = Some(offer.source_device.clone());
        (state, ChunkReceiver::new(&offer.file_name, offer.file_size))
    }

    /// Decline the pending request from `source`.
    pub fn reject_incoming(&self, source: &str) -> bool {
        let Some(offer) = self.take_offer(source) else {
            return false;
        };
        self.send_relay(ClientMessage::FileReject {
            source_device: source.to_string(),
        });
        self.log_outcome(
            Direction::Receive,
            source,
            &offer.file_name,
            offer.file_size,
            Instant::now(),
            TransferOutcome::Rejected,
            None,
        );
        info!(event = "incoming_rejected", source = %source, file = %offer.file_name);
        true
    }

    async fn on_frame(&self, peer: &str, data: Bytes) {
        let outcome = {
            let mut incoming = guard(&self.incoming);
            let Some(entry) = incoming.get_mut(peer) else {
                debug!(event = "unexpected_frame", peer = %peer, len = data.len());
                return;
            };
            match entry.receiver.accept(&data) {
                Ok(accepted) => {
                    let id = entry.state.session.id.clone();
                    entry.state.mark_received(accepted.index);
                    if !accepted.payload.is_empty() {
                        self.with_store(|s| {
                            s.save_chunk(&id, accepted.index, &accepted.payload, now_ms())
                        });
                    }
                    let speed = entry.speed.record(accepted.payload.len());
                    match accepted.assembled {
                        Some(file) => match incoming.remove(peer) {
                            Some(done) => FrameOutcome::Done(done, file),
                            None => return,
                        },
                        None => {
                            self.with_store(|s| s.save(&entry.state, now_ms()));
                            FrameOutcome::Progress(
                                ProgressEvent {
                                    session_id: id.clone(),
                                    file_name: entry.state.session.file_name.clone(),
                                    progress: entry.receiver.progress(),
                                },
                                speed.map(|bytes_per_second| SpeedEvent {
                                    session_id: id,
                                    bytes_per_second,
                                }),
                            )
                        }
                    }
                }
                Err(e @ TransferError::ChunkProcessing(_)) => {
                    FrameOutcome::Skipped(entry.state.session.file_name.clone(), e)
                }
                Err(e) => match incoming.remove(peer) {
                    Some(failed) => FrameOutcome::Failed(failed, e),
                    None => return,
                },
            }
        };

        match outcome {
            FrameOutcome::Progress(progress, speed) => {
                self.events.transfer_progress.publish(&progress);
                if let Some(speed) = speed {
                    self.events.transfer_speed.publish(&speed);
                }
            }
            FrameOutcome::Done(done, file) => self.finish_receive(peer, done, file).await,
            FrameOutcome::Skipped(file_name, e) => {
                warn!(event = "chunk_skipped", peer = %peer, file = %file_name, error = %e);
                let err = LanshareError::from(e);
                self.events
                    .log_error(ErrorLog::new(err.code(), err.to_string(), Some(file_name)));
            }
            FrameOutcome::Failed(failed, e) => {
                let session_id = failed.state.session.id.clone();
                // A corrupted file cannot be resumed into.
                if matches!(e, TransferError::ChecksumMismatch { .. }) {
                    self.with_store(|s| s.remove(&session_id));
                }
                self.fail_receive(peer, failed, LanshareError::from(e));
            }
        }
    }

    async fn finish_receive(&self, peer: &str, done: Incoming, file: Bytes) {
        let session = &done.state.session;
        self.events.transfer_progress.publish(&ProgressEvent {
            session_id: session.id.clone(),
            file_name: session.file_name.clone(),
            progress: 1.0,
        });
        match self.sink.deliver(&session.file_name, file).await {
            Ok(path) => {
                info!(
                    event = "file_received",
                    file = %session.file_name,
                    source = %peer,
                    path = %path.display(),
                );
                self.with_store(|s| s.remove(&session.id));
                self.set_active(None, &session.id);
                self.log_outcome(
                    Direction::Receive,
                    peer,
                    &session.file_name,
                    session.file_size,
                    done.started,
                    TransferOutcome::Completed,
                    None,
                );
            }
            Err(e) => {
                error!(event = "file_store_failure", file = %session.file_name, error = %e);
                let err = LanshareError::from(TransferError::Io(std::io::Error::other(e.to_string())));
                self.fail_receive(peer, done, err);
            }
        }
    }

    fn fail_receive(&self, peer: &str, failed: Incoming, err: LanshareError) {
        let session = &failed.state.session;
        warn!(event = "file_receive_failure", file = %session.file_name, source = %peer, error = %err);
        self.set_active(None, &session.id);
        self.log_outcome(
            Direction::Receive,
            peer,
            &session.file_name,
            session.file_size,
            failed.started,
            TransferOutcome::Failed,
            Some(err.to_string()),
        );
        self.events.log_error(ErrorLog::new(
            err.code(),
            err.to_string(),
            Some(session.file_name.clone()),
        ));
    }

    // ── Dispatch ─────────────────────────────────────────────────────────────

    pub async fn handle_server(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::DeviceDiscovered { device } => {
                debug!(event = "peer_discovered", device = %device.id, name = %device.name);
                guard(&self.peers).insert(device.id.clone(), device.clone());
                self.peers_changed.notify_waiters();
                self.events.device_discovered.publish(&device);
            }
            ServerMessage::DeviceDisconnected { device_id } => {
                debug!(event = "peer_lost", device = %device_id);
                guard(&self.peers).remove(&device_id);
                guard(&self.offers).remove(&device_id);
                self.peers_changed.notify_waiters();
                self.events.device_disconnected.publish(&device_id);
                self.coordinator.close_peer(&device_id).await;
            }
            ServerMessage::Offer {
                offer,
                source_device,
                ..
            } => {
                if let Err(e) = self.coordinator.handle_offer(&source_device, offer).await {
                    warn!(event = "offer_failure", source = %source_device, error = %e);
                    let err = LanshareError::from(e);
                    self.events
                        .log_error(ErrorLog::new(err.code(), err.to_string(), Some(source_device)));
                }
            }
            ServerMessage::Answer {
                answer,
                source_device,
                ..
            } => self.coordinator.handle_answer(&source_device, answer).await,
            ServerMessage::IceCandidate {
                candidate,
                source_device,
                ..
            } => self.coordinator.handle_ice(&source_device, candidate).await,
            ServerMessage::FileRequest {
                file_name,
                file_size,
                source_device,
                session_id,
                last_chunk_index,
            } => self.on_file_request(FileRequestEvent {
                source_device,
                file_name,
                file_size,
                session_id,
                last_chunk_index,
            }),
            ServerMessage::FileRequestSent {
                target_device,
                file_name,
            } => debug!(event = "request_delivered", target = %target_device, file = %file_name),
            ServerMessage::FileAccepted { target_device } => {
                self.coordinator.resolve(&target_device, Ok(()));
            }
            ServerMessage::FileRejected { target_device } => {
                self.coordinator
                    .resolve(&target_device, Err(HandshakeError::TransferRejected));
            }
            ServerMessage::Error { message } => {
                warn!(event = "relay_error", message = %message);
                self.events
                    .log_error(ErrorLog::new("RELAY_ERROR", message.clone(), None));
                self.coordinator.fail_pending(HandshakeError::Relay(message));
            }
            ServerMessage::Pong => {
                *guard(&self.last_ping) = Some(now_ms());
            }
        }
    }

    pub async fn handle_link(&self, event: LinkEvent) {
        match event {
            LinkEvent::Opened { peer, .. } => {
                if let Some(entry) = guard(&self.incoming).get_mut(&peer) {
                    entry.linked = true;
                }
                debug!(event = "link_opened", peer = %peer);
            }
            LinkEvent::Frame { peer, data } => self.on_frame(&peer, data).await,
            LinkEvent::Closed { peer } => {
                let interrupted = {
                    let mut incoming = guard(&self.incoming);
                    match incoming.get(&peer) {
                        Some(entry) if entry.linked => incoming.remove(&peer),
                        _ => None,
                    }
                };
                if let Some(entry) = interrupted {
                    // Persisted chunks stay so the sender can resume.
                    self.fail_receive(
                        &peer,
                        entry,
                        LanshareError::from(TransferError::ChannelUnavailable),
                    );
                }
                debug!(event = "link_closed", peer = %peer);
            }
        }
    }

    /// Dispatch relay messages and link events, ping the relay and publish
    /// status until the relay session ends or `sos` fires.
    pub async fn run(
        self: Arc<Self>,
        mut relay: mpsc::UnboundedReceiver<ServerMessage>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
        sos: SignalOfStop,
    ) {
        let mut ping = tokio::time::interval(CLIENT_PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.publish_status();

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                msg = relay.recv() => match msg {
                    Some(msg) => self.handle_server(msg).await,
                    None => {
                        warn!(event = "relay_lost", "Relay session ended");
                        break;
                    }
                },
                Some(event) = links.recv() => self.handle_link(event).await,
                _ = ping.tick() => {
                    self.send_relay(ClientMessage::Ping);
                    self.publish_status();
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        let failed = self.coordinator.fail_pending(HandshakeError::RelayUnavailable);
        if failed > 0 {
            debug!(event = "pending_requests_failed", count = failed);
        }
        self.coordinator.shutdown().await;
        self.publish_status();
        info!(event = "engine_stopped");
    }
}
