//! Peer handshake coordinator.
//!
//! Drives the `file-request` → `file-accepted`/`file-rejected` exchange and
//! the offer/answer/ICE negotiation of a direct data channel, all through
//! the relay. Every open channel, inbound frame and channel loss is reported
//! as a [`LinkEvent`].

use crate::core::config::HandshakeTimings;
use crate::core::connection::{
    is_host_candidate, PeerChannel, PeerConnection, PeerConnector, PeerEvent,
};
use crate::core::error::HandshakeError;
use crate::core::protocol::ClientMessage;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Peer channel lifecycle as seen by the transfer engine.
#[derive(Clone)]
pub enum LinkEvent {
    Opened {
        peer: String,
        channel: Arc<dyn PeerChannel>,
    },
    Frame {
        peer: String,
        data: Bytes,
    },
    Closed {
        peer: String,
    },
}

/// Parameters of an outbound `file-request`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub target: String,
    pub file_name: String,
    pub file_size: u64,
    pub session_id: Option<String>,
    pub last_chunk_index: Option<u32>,
}

type Reply = Result<(), HandshakeError>;
type OpenWaiter = oneshot::Sender<Option<Arc<dyn PeerChannel>>>;

struct PeerLink {
    generation: u64,
    connection: Arc<dyn PeerConnection>,
    /// Set while an initiator waits for the channel to open.
    opened: Option<OpenWaiter>,
    /// Local candidates are held until our offer or answer is on the relay.
    signaled: bool,
    held: Vec<Value>,
}

pub struct HandshakeCoordinator {
    relay: mpsc::UnboundedSender<ClientMessage>,
    connector: Arc<dyn PeerConnector>,
    timings: HandshakeTimings,
    /// Outbound requests awaiting accept/reject, keyed by target device.
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    peers: Mutex<HashMap<String, PeerLink>>,
    generation: AtomicU64,
    links: mpsc::UnboundedSender<LinkEvent>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl HandshakeCoordinator {
    pub fn new(
        relay: mpsc::UnboundedSender<ClientMessage>,
        connector: Arc<dyn PeerConnector>,
        timings: HandshakeTimings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (links, link_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            relay,
            connector,
            timings,
            pending: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            links,
        });
        (this, link_rx)
    }

    fn send_relay(&self, msg: ClientMessage) -> Result<(), HandshakeError> {
        self.relay
            .send(msg)
            .map_err(|_| HandshakeError::RelayUnavailable)
    }

    // ── Transfer negotiation ─────────────────────────────────────────────

    /// Send a `file-request` and wait for the target's decision.
    ///
    /// At most one request per target is outstanding. Resolves exactly once:
    /// accepted, [`HandshakeError::TransferRejected`], or
    /// [`HandshakeError::RequestTimeout`] after the request timeout, in which
    /// case the pending entry is removed.
    pub async fn request_transfer(&self, req: TransferRequest) -> Result<(), HandshakeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = guard(&self.pending);
            if pending.contains_key(&req.target) {
                return Err(HandshakeError::AlreadyPending(req.target));
            }
            pending.insert(req.target.clone(), tx);
        }

        let sent = self.send_relay(ClientMessage::FileRequest {
            target_device: req.target.clone(),
            file_name: req.file_name.clone(),
            file_size: req.file_size,
            session_id: req.session_id.clone(),
            last_chunk_index: req.last_chunk_index,
        });
        if let Err(e) = sent {
            guard(&self.pending).remove(&req.target);
            return Err(e);
        }
        info!(
            event = "transfer_requested",
            target = %req.target,
            file = %req.file_name,
            size = req.file_size,
            resume_from = ?req.last_chunk_index,
        );

        match timeout(self.timings.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(HandshakeError::Cancelled),
            Err(_) => {
                guard(&self.pending).remove(&req.target);
                warn!(event = "transfer_request_timeout", target = %req.target);
                Err(HandshakeError::RequestTimeout)
            }
        }
    }

    /// Resolve the pending request to `target`. Returns `false` if none.
    pub fn resolve(&self, target: &str, reply: Reply) -> bool {
        match guard(&self.pending).remove(target) {
            Some(tx) => tx.send(reply).is_ok(),
            None => {
                debug!(event = "unsolicited_transfer_reply", target = %target);
                false
            }
        }
    }

    /// Fail every pending request, e.g. on a relay `error`.
    pub fn fail_pending(&self, err: HandshakeError) -> usize {
        let drained: Vec<_> = guard(&self.pending).drain().collect();
        let n = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(err.clone()));
        }
        n
    }

    pub fn pending_count(&self) -> usize {
        guard(&self.pending).len()
    }

    pub fn has_pending(&self, target: &str) -> bool {
        guard(&self.pending).contains_key(target)
    }

    // ── Channel establishment ────────────────────────────────────────────

    /// Establish a data channel to `target`, retrying whole attempts.
    pub async fn connect(self: &Arc<Self>, target: &str) -> Result<Arc<dyn PeerChannel>, HandshakeError> {
        let max = self.timings.max_attempts.max(1);
        for attempt in 1..=max {
            match timeout(self.timings.attempt_timeout, self.attempt(target)).await {
                Ok(Ok(channel)) => {
                    info!(event = "peer_channel_open", target = %target, attempt);
                    return Ok(channel);
                }
                Ok(Err(reason)) => {
                    warn!(event = "peer_connect_attempt_failed", target = %target, attempt, reason = %reason);
                }
                Err(_) => {
                    warn!(event = "peer_connect_attempt_timeout", target = %target, attempt);
                }
            }
            self.close_peer(target).await;
            if attempt < max {
                sleep(self.timings.retry_delay).await;
            }
        }
        Err(HandshakeError::ConnectionFailed { attempts: max })
    }

    async fn attempt(self: &Arc<Self>, target: &str) -> Result<Arc<dyn PeerChannel>, String> {
        let (open_tx, open_rx) = oneshot::channel();
        let connection = self.open_link(target, Some(open_tx)).await?;
        let offer = connection.create_offer().await.map_err(|e| e.to_string())?;
        self.signal(
            target,
            ClientMessage::Offer {
                offer,
                target_device: target.to_string(),
            },
        )
        .map_err(|e| e.to_string())?;
        match open_rx.await {
            Ok(Some(channel)) => Ok(channel),
            Ok(None) => Err("peer connection failed".into()),
            Err(_) => Err("peer connection released".into()),
        }
    }

    /// Create a connection for `peer`, replacing any previous one, and start
    /// pumping its events.
    async fn open_link(
        self: &Arc<Self>,
        peer: &str,
        opened: Option<OpenWaiter>,
    ) -> Result<Arc<dyn PeerConnection>, String> {
        self.close_peer(peer).await;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = self
            .connector
            .connect(events_tx)
            .await
            .map_err(|e| e.to_string())?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        guard(&self.peers).insert(
            peer.to_string(),
            PeerLink {
                generation,
                connection: connection.clone(),
                opened,
                signaled: false,
                held: Vec::new(),
            },
        );
        tokio::spawn(Arc::clone(self).pump(peer.to_string(), generation, events_rx));
        Ok(connection)
    }

    /// Send the offer or answer for `peer`, then any candidates held back.
    fn signal(&self, peer: &str, msg: ClientMessage) -> Result<(), HandshakeError> {
        let mut peers = guard(&self.peers);
        self.send_relay(msg)?;
        if let Some(link) = peers.get_mut(peer) {
            link.signaled = true;
            for candidate in link.held.drain(..) {
                let _ = self.send_relay(ClientMessage::IceCandidate {
                    candidate,
                    target_device: peer.to_string(),
                });
            }
        }
        Ok(())
    }

    fn is_current(&self, peer: &str, generation: u64) -> bool {
        guard(&self.peers)
            .get(peer)
            .is_some_and(|l| l.generation == generation)
    }

    async fn pump(
        self: Arc<Self>,
        peer: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.is_current(&peer, generation) {
                break;
            }
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    if !is_host_candidate(&candidate) {
                        continue;
                    }
                    let mut peers = guard(&self.peers);
                    let Some(link) = peers.get_mut(&peer) else { break };
                    if link.signaled {
                        let _ = self.send_relay(ClientMessage::IceCandidate {
                            candidate,
                            target_device: peer.clone(),
                        });
                    } else {
                        link.held.push(candidate);
                    }
                }
                PeerEvent::ChannelOpen(channel) => {
                    let waiter = guard(&self.peers)
                        .get_mut(&peer)
                        .and_then(|l| l.opened.take());
                    if let Some(waiter) = waiter {
                        let _ = waiter.send(Some(channel.clone()));
                    }
                    let _ = self.links.send(LinkEvent::Opened {
                        peer: peer.clone(),
                        channel,
                    });
                }
                PeerEvent::Message(data) => {
                    let _ = self.links.send(LinkEvent::Frame {
                        peer: peer.clone(),
                        data,
                    });
                }
                PeerEvent::ChannelClosed | PeerEvent::Failed => {
                    let waiter = guard(&self.peers)
                        .get_mut(&peer)
                        .and_then(|l| l.opened.take());
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(None);
                        }
                        None => {
                            let _ = self.links.send(LinkEvent::Closed { peer: peer.clone() });
                        }
                    }
                }
            }
        }
    }

    /// Responder path: answer an inbound offer.
    pub async fn handle_offer(self: &Arc<Self>, source: &str, offer: Value) -> Result<(), HandshakeError> {
        let connection = self
            .open_link(source, None)
            .await
            .map_err(|_| HandshakeError::ConnectionFailed { attempts: 1 })?;
        let answer = match connection.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(event = "offer_rejected", source = %source, error = %e);
                self.close_peer(source).await;
                return Err(HandshakeError::ConnectionFailed { attempts: 1 });
            }
        };
        self.signal(
            source,
            ClientMessage::Answer {
                answer,
                target_device: source.to_string(),
            },
        )?;
        debug!(event = "answer_sent", target = %source);
        Ok(())
    }

    fn connection(&self, peer: &str) -> Option<Arc<dyn PeerConnection>> {
        guard(&self.peers).get(peer).map(|l| l.connection.clone())
    }

    pub async fn handle_answer(&self, source: &str, answer: Value) {
        let Some(connection) = self.connection(source) else {
            debug!(event = "answer_without_connection", source = %source);
            return;
        };
        if let Err(e) = connection.set_answer(answer).await {
            warn!(event = "answer_rejected", source = %source, error = %e);
        }
    }

    /// Apply a remote candidate. Non-host candidates are dropped.
    pub async fn handle_ice(&self, source: &str, candidate: Value) {
        if !is_host_candidate(&candidate) {
            debug!(event = "remote_candidate_filtered", source = %source);
            return;
        }
        let Some(connection) = self.connection(source) else {
            return;
        };
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!(event = "remote_candidate_rejected", source = %source, error = %e);
        }
    }

    /// Release the connection to `peer`, if any.
    pub async fn close_peer(&self, peer: &str) {
        let link = guard(&self.peers).remove(peer);
        if let Some(link) = link {
            if let Some(waiter) = link.opened {
                let _ = waiter.send(None);
            }
            link.connection.close().await;
            debug!(event = "peer_released", peer = %peer);
        }
    }

    /// Cancel pending requests and release every connection.
    pub async fn shutdown(&self) {
        guard(&self.pending).clear();
        let links: Vec<_> = guard(&self.peers).drain().collect();
        for (_, link) in links {
            link.connection.close().await;
        }
    }
}
