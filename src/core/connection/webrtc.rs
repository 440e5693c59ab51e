//! Peer capability interface over webrtc-rs.
//!
//! Host candidates only: no STUN or TURN servers are configured and
//! non-host candidates are never trickled, so connectivity stays on the
//! local network. One ordered, partially reliable data channel carries the
//! chunk frames.

use super::channel::{is_host_candidate, PeerChannel, PeerConnection, PeerConnector, PeerEvent};
use crate::core::config::{
    BUFFERED_AMOUNT_LOW_THRESHOLD, DATA_CHANNEL_LABEL, DATA_CHANNEL_MAX_RETRANSMITS,
    SCTP_MAX_MESSAGE_SIZE,
};
use crate::core::error::ChannelError;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

fn negotiation(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Negotiation(e.to_string())
}

fn create_webrtc_api() -> Result<API, ChannelError> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me).map_err(negotiation)?;

    // The default 64 KiB SCTP cap is below the smallest configurable chunk
    // plus its header; raise it to fit the largest one.
    let mut se = SettingEngine::default();
    se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

/// Advertise our receive limit so the remote side does not fall back to
/// 64 KiB messages.
fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
    if !desc.sdp.contains("a=max-message-size:") {
        desc.sdp
            .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
    }
    desc
}

fn to_json(desc: RTCSessionDescription) -> Result<Value, ChannelError> {
    serde_json::to_value(inject_max_message_size(desc)).map_err(negotiation)
}

fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ChannelError> {
    serde_json::from_value(value).map_err(negotiation)
}

/// Creates host-only webrtc-rs peer connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcConnector;

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, ChannelError> {
        let api = create_webrtc_api()?;
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: Vec::new(),
                ..Default::default()
            })
            .await
            .map_err(negotiation)?,
        );

        {
            let events = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |s| {
                let events = events.clone();
                Box::pin(async move {
                    match s {
                        RTCPeerConnectionState::Connected => {
                            info!(event = "webrtc_connected", "WebRTC connection established");
                        }
                        RTCPeerConnectionState::Failed => {
                            error!(event = "webrtc_failed", "WebRTC connection failed");
                            let _ = events.send(PeerEvent::Failed);
                        }
                        RTCPeerConnectionState::Disconnected => {
                            warn!(
                                event = "webrtc_disconnected",
                                "WebRTC transient disconnect (ICE may recover)"
                            );
                        }
                        RTCPeerConnectionState::Closed => {
                            info!(event = "webrtc_closed", "WebRTC connection closed");
                        }
                        _ => {}
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(c) = c else { return };
                    let init = match c.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(event = "ice_candidate_encode_failure", error = %e);
                            return;
                        }
                    };
                    match serde_json::to_value(&init) {
                        Ok(value) if is_host_candidate(&value) => {
                            let _ = events.send(PeerEvent::LocalCandidate(value));
                        }
                        Ok(_) => {
                            debug!(event = "ice_candidate_filtered", candidate = %init.candidate);
                        }
                        Err(e) => warn!(event = "ice_candidate_encode_failure", error = %e),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        warn!(event = "unexpected_data_channel", label = %dc.label());
                        return;
                    }
                    attach_channel(dc, events).await;
                })
            }));
        }

        Ok(Arc::new(WebRtcConnection {
            pc,
            events,
            remote_set: AtomicBool::new(false),
            queued_candidates: Mutex::new(Vec::new()),
        }))
    }
}

/// Wire data channel callbacks into `events`.
async fn attach_channel(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<PeerEvent>) {
    let low = Arc::new(Notify::new());
    dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
        .await;
    {
        let low = low.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let low = low.clone();
            Box::pin(async move {
                low.notify_waiters();
            })
        }))
        .await;
    }

    let channel: Arc<dyn PeerChannel> = Arc::new(WebRtcChannel {
        dc: dc.clone(),
        low,
    });
    let opened = Arc::new(AtomicBool::new(false));

    {
        let events = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::Message(msg.data));
            })
        }));
    }
    {
        let events = events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                info!(event = "data_channel_closed", "Data channel closed");
                let _ = events.send(PeerEvent::ChannelClosed);
            })
        }));
    }
    {
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let channel = channel.clone();
            let opened = opened.clone();
            Box::pin(async move {
                if opened.swap(true, Ordering::SeqCst) {
                    return;
                }
                info!(event = "data_channel_open", label = %label, "Data channel open");
                let _ = events.send(PeerEvent::ChannelOpen(channel));
            })
        }));
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    remote_set: AtomicBool,
    /// Remote candidates that arrived before the remote description.
    queued_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl WebRtcConnection {
    async fn remote_description_applied(&self) {
        self.remote_set.store(true, Ordering::SeqCst);
        let queued = std::mem::take(
            &mut *self
                .queued_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for candidate in queued {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!(event = "ice_candidate_rejected", error = %e);
            }
        }
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<Value, ChannelError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            max_retransmits: Some(DATA_CHANNEL_MAX_RETRANSMITS),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(negotiation)?;
        attach_channel(dc, self.events.clone()).await;

        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        to_json(offer)
    }

    async fn accept_offer(&self, offer: Value) -> Result<Value, ChannelError> {
        let desc: RTCSessionDescription = from_json(offer)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;
        self.remote_description_applied().await;

        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        to_json(answer)
    }

    async fn set_answer(&self, answer: Value) -> Result<(), ChannelError> {
        let desc: RTCSessionDescription = from_json(answer)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation)?;
        self.remote_description_applied().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), ChannelError> {
        let init: RTCIceCandidateInit = from_json(candidate)?;
        if !self.remote_set.load(Ordering::SeqCst) {
            self.queued_candidates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "webrtc_close_failure", error = %e);
        }
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    low: Arc<Notify>,
}

#[async_trait]
impl PeerChannel for WebRtcChannel {
    async fn send(&self, data: Bytes) -> Result<(), ChannelError> {
        let state = self.dc.ready_state();
        if state != RTCDataChannelState::Open {
            warn!(
                event = "send_channel_not_open",
                ?state,
                "Attempted send on non-open data channel"
            );
            return Err(ChannelError::NotOpen);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn buffered_amount_low(&self) -> Arc<Notify> {
        self.low.clone()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(event = "data_channel_close_failure", error = %e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_is_advertised_once() {
        let desc: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({"type": "offer", "sdp": "v=0\r\n"}))
                .unwrap();
        let once = inject_max_message_size(desc);
        let twice = inject_max_message_size(once.clone());
        assert_eq!(once.sdp, twice.sdp);
        assert!(once
            .sdp
            .contains(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}")));
    }
}
